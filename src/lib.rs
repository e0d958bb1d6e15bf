#![allow(async_fn_in_trait)]

//! An async DHCPv4 server for relay-forwarded requests.
//!
//! The server answers only requests coming through a DHCP relay agent. It does
//! not allocate addresses from a pool; the mapping from a client MAC address to
//! its IP and subnet configuration lives in an external control store and is
//! mirrored into an in-memory cache. Clients unknown to the store are recorded
//! as staging candidates and left without a reply until an operator assigns
//! them an address out of band.
//!
//! This module implements the wire codec: the fixed BOOTP header and the DHCP
//! options region. The remaining modules build the server on top of it:
//! [`server`] for request classification, [`cache`] for the in-memory index,
//! [`store`] for the control store abstraction, [`reconciler`] for the single
//! writer applying store changes, and [`io`] for the UDP plumbing.

use core::fmt;
use core::net::Ipv4Addr;
use core::str::{self, FromStr, Utf8Error};

use num_enum::TryFromPrimitive;

pub mod cache;
pub mod io;
pub mod reconciler;
pub mod server;
pub mod store;

#[derive(Debug)]
pub enum Error {
    DataUnderflow,
    BufferOverflow,
    MissingCookie,
    InvalidOp,
    InvalidHtype,
    InvalidHlen,
    InvalidMessageType,
    InvalidMac,
    InvalidUtf8Str(Utf8Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataUnderflow => write!(f, "Data underflow"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
            Self::MissingCookie => write!(f, "Magic cookie not matched"),
            Self::InvalidOp => write!(f, "Invalid BOOTP op"),
            Self::InvalidHtype => write!(f, "Invalid hardware address type"),
            Self::InvalidHlen => write!(f, "Invalid hardware address length"),
            Self::InvalidMessageType => write!(f, "Invalid DHCP message type"),
            Self::InvalidMac => write!(f, "Invalid MAC address"),
            Self::InvalidUtf8Str(err) => write!(f, "Invalid UTF-8 string: {}", err),
        }
    }
}

impl std::error::Error for Error {}

///
/// DHCP Message Type.
///
/// The semantics of the message types are described in RFC 2131 (Table 2) and
/// their numeric values in Section 9.6 of RFC 2132; the leasequery values are
/// from RFC 4388.
///
#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
    LeaseQuery = 10,
    LeaseUnassigned = 11,
    LeaseUnknown = 12,
    LeaseActive = 13,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
            Self::LeaseQuery => "LEASEQUERY",
            Self::LeaseUnassigned => "LEASEUNASSIGNED",
            Self::LeaseUnknown => "LEASEUNKNOWN",
            Self::LeaseActive => "LEASEACTIVE",
        };

        write!(f, "{}", name)
    }
}

/// An Ethernet MAC address in its canonical form.
///
/// `Display` renders the canonical lower-case `xx:xx:xx:xx:xx:xx` notation and
/// `FromStr` accepts hex pairs of either case. The type is the key of both
/// in-memory maps and of the control store rows.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;

        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Mac {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0; 6];
        let mut parts = s.split(':');

        for octet in &mut octets {
            let part = parts.next().ok_or(Error::InvalidMac)?;
            if part.len() != 2 {
                return Err(Error::InvalidMac);
            }

            *octet = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac)?;
        }

        if parts.next().is_some() {
            return Err(Error::InvalidMac);
        }

        Ok(Self(octets))
    }
}

/// DHCP packet structure: the fixed BOOTP header plus the decoded options.
///
/// The DHCP message type option is hoisted into its own field during decoding
/// and re-emitted first during encoding; `options` holds the remaining options
/// in wire order, with `Pad` bytes dropped.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Packet<'a> {
    pub reply: bool,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    /// Server host name, trimmed at the first NUL.
    pub sname: &'a [u8],
    /// Boot file name, trimmed at the first NUL.
    pub file: &'a [u8],
    pub message_type: Option<MessageType>,
    pub options: Vec<DhcpOption<'a>>,
}

impl<'a> Packet<'a> {
    pub const COOKIE: [u8; 4] = [99, 130, 83, 99];

    /// The broadcast bit of the `flags` field.
    pub const F_BROADCAST: u16 = 0x8000;

    /// Encoded packets are zero-padded to this length.
    pub const MIN_PACKET_SIZE: usize = 576;

    const BOOT_REQUEST: u8 = 1; // From client
    const BOOT_REPLY: u8 = 2; // From server

    const HTYPE_ETHERNET: u8 = 1;
    const MAC_LEN: u8 = 6;

    const SNAME_SIZE: usize = 64;
    const FILE_SIZE: usize = 128;

    const END: u8 = 255;
    const PAD: u8 = 0;

    pub fn new_request(mac: Mac, xid: u32, message_type: MessageType) -> Self {
        let mut chaddr = [0; 16];
        chaddr[..6].copy_from_slice(&mac.octets());

        Self {
            reply: false,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: &[],
            file: &[],
            message_type: Some(message_type),
            options: Vec::new(),
        }
    }

    /// Creates a reply to this request.
    ///
    /// `xid`, `chaddr`, `hops` and `giaddr` are carried over from the request;
    /// `flags` is zeroed, so the broadcast flag of the client is ignored.
    pub fn new_reply<'b>(
        &self,
        message_type: MessageType,
        yiaddr: Ipv4Addr,
        siaddr: Ipv4Addr,
        options: Vec<DhcpOption<'b>>,
    ) -> Packet<'b> {
        Packet {
            reply: true,
            hops: self.hops,
            xid: self.xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr,
            siaddr,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: &[],
            file: &[],
            message_type: Some(message_type),
            options,
        }
    }

    /// The client hardware address in its canonical form.
    ///
    /// Valid because decoding rejects packets with `htype` other than Ethernet
    /// or `hlen` other than 6.
    pub fn mac(&self) -> Mac {
        let mut octets = [0; 6];
        octets.copy_from_slice(&self.chaddr[..6]);

        Mac(octets)
    }

    /// The Relay Agent Information option, if present.
    pub fn relay_agent_info(&self) -> Option<RelayAgentInformation<'a>> {
        self.options.iter().find_map(|option| {
            if let DhcpOption::RelayAgentInformation(rai) = option {
                Some(*rai)
            } else {
                None
            }
        })
    }

    /// Parses the packet from a byte slice
    pub fn decode(data: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(data);

        let op = bytes.byte()?;
        let reply = match op {
            Self::BOOT_REQUEST => false,
            Self::BOOT_REPLY => true,
            _ => Err(Error::InvalidOp)?,
        };

        if bytes.byte()? != Self::HTYPE_ETHERNET {
            Err(Error::InvalidHtype)?;
        }

        if bytes.byte()? != Self::MAC_LEN {
            Err(Error::InvalidHlen)?;
        }

        let hops = bytes.byte()?;
        let xid = u32::from_be_bytes(bytes.arr()?);
        let secs = u16::from_be_bytes(bytes.arr()?);
        let flags = u16::from_be_bytes(bytes.arr()?);
        let ciaddr = bytes.arr::<4>()?.into();
        let yiaddr = bytes.arr::<4>()?.into();
        let siaddr = bytes.arr::<4>()?.into();
        let giaddr = bytes.arr::<4>()?.into();
        let chaddr = bytes.arr::<16>()?;
        let sname = trim_nul(bytes.slice(Self::SNAME_SIZE)?);
        let file = trim_nul(bytes.slice(Self::FILE_SIZE)?);

        let mut message_type = None;
        let mut options = Vec::new();

        if !bytes.is_empty() {
            if bytes.arr::<4>()? != Self::COOKIE {
                Err(Error::MissingCookie)?;
            }

            while !bytes.is_empty() {
                let code = bytes.byte()?;
                if code == Self::END {
                    break;
                }

                if code == Self::PAD {
                    continue;
                }

                let len = bytes.byte()? as usize;
                let option = DhcpOption::parse(code, bytes.slice(len)?)?;

                if let DhcpOption::MessageType(mt) = option {
                    message_type = Some(mt);
                } else {
                    options.push(option);
                }
            }
        }

        Ok(Self {
            reply,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            message_type,
            options,
        })
    }

    /// Encodes the packet into the provided buf slice
    ///
    /// The magic cookie and the `End` option are emitted whenever the packet
    /// has a message type or any option; the message type is always emitted
    /// first. The output is zero-padded to [`Self::MIN_PACKET_SIZE`].
    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        if self.sname.len() > Self::SNAME_SIZE || self.file.len() > Self::FILE_SIZE {
            Err(Error::BufferOverflow)?;
        }

        let mut bytes = BytesOut::new(buf);

        bytes
            .byte(if self.reply {
                Self::BOOT_REPLY
            } else {
                Self::BOOT_REQUEST
            })?
            .byte(Self::HTYPE_ETHERNET)?
            .byte(Self::MAC_LEN)?
            .byte(self.hops)?
            .push(&u32::to_be_bytes(self.xid))?
            .push(&u16::to_be_bytes(self.secs))?
            .push(&u16::to_be_bytes(self.flags))?
            .push(&self.ciaddr.octets())?
            .push(&self.yiaddr.octets())?
            .push(&self.siaddr.octets())?
            .push(&self.giaddr.octets())?
            .push(&self.chaddr)?;

        bytes.push(self.sname)?;
        for _ in self.sname.len()..Self::SNAME_SIZE {
            bytes.byte(0)?;
        }

        bytes.push(self.file)?;
        for _ in self.file.len()..Self::FILE_SIZE {
            bytes.byte(0)?;
        }

        if self.message_type.is_some() || !self.options.is_empty() {
            bytes.push(&Self::COOKIE)?;

            if let Some(mt) = self.message_type {
                DhcpOption::MessageType(mt).encode(&mut bytes)?;
            }

            for option in &self.options {
                option.encode(&mut bytes)?;
            }

            bytes.byte(Self::END)?;
        }

        while bytes.len() < Self::MIN_PACKET_SIZE {
            bytes.byte(Self::PAD)?;
        }

        let len = bytes.len();

        Ok(&buf[..len])
    }
}

/// A single DHCP option.
///
/// Option codes without a dedicated variant survive decoding and re-encoding
/// unchanged as [`DhcpOption::Unrecognized`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DhcpOption<'a> {
    MessageType(MessageType),
    SubnetMask(Ipv4Addr),
    Router(Ipv4Addrs<'a>),
    DomainNameServers(Ipv4Addrs<'a>),
    NtpServers(Ipv4Addrs<'a>),
    IpAddressLeaseTime(u32),
    RenewalTime(u32),
    RebindingTime(u32),
    HostName(&'a str),
    ParameterRequestList(&'a [u8]),
    ServerIdentifier(Ipv4Addr),
    RelayAgentInformation(RelayAgentInformation<'a>),
    Unrecognized(u8, &'a [u8]),
}

impl<'a> DhcpOption<'a> {
    fn parse(code: u8, data: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(data);

        let option = match code {
            DHCP_MESSAGE_TYPE => Self::MessageType(
                MessageType::try_from_primitive(bytes.remaining_byte()?)
                    .map_err(|_| Error::InvalidMessageType)?,
            ),
            SUBNET_MASK => Self::SubnetMask(bytes.remaining_arr()?.into()),
            ROUTER => Self::Router(Ipv4Addrs::parse(bytes.remaining())?),
            DOMAIN_NAME_SERVER => Self::DomainNameServers(Ipv4Addrs::parse(bytes.remaining())?),
            NTP_SERVERS => Self::NtpServers(Ipv4Addrs::parse(bytes.remaining())?),
            IP_ADDRESS_LEASE_TIME => {
                Self::IpAddressLeaseTime(u32::from_be_bytes(bytes.remaining_arr()?))
            }
            RENEWAL_TIME => Self::RenewalTime(u32::from_be_bytes(bytes.remaining_arr()?)),
            REBINDING_TIME => Self::RebindingTime(u32::from_be_bytes(bytes.remaining_arr()?)),
            HOST_NAME => {
                Self::HostName(str::from_utf8(bytes.remaining()).map_err(Error::InvalidUtf8Str)?)
            }
            PARAMETER_REQUEST_LIST => Self::ParameterRequestList(bytes.remaining()),
            SERVER_IDENTIFIER => Self::ServerIdentifier(bytes.remaining_arr()?.into()),
            RELAY_AGENT_INFORMATION => {
                Self::RelayAgentInformation(RelayAgentInformation::new(bytes.remaining()))
            }
            _ => Self::Unrecognized(code, bytes.remaining()),
        };

        Ok(option)
    }

    fn encode(&self, out: &mut BytesOut) -> Result<(), Error> {
        out.byte(self.code())?;

        self.data(|data| {
            if data.len() > u8::MAX as usize {
                Err(Error::BufferOverflow)?;
            }

            out.byte(data.len() as _)?;
            out.push(data)?;

            Ok(())
        })
    }

    pub const fn code(&self) -> u8 {
        match self {
            Self::MessageType(_) => DHCP_MESSAGE_TYPE,
            Self::SubnetMask(_) => SUBNET_MASK,
            Self::Router(_) => ROUTER,
            Self::DomainNameServers(_) => DOMAIN_NAME_SERVER,
            Self::NtpServers(_) => NTP_SERVERS,
            Self::IpAddressLeaseTime(_) => IP_ADDRESS_LEASE_TIME,
            Self::RenewalTime(_) => RENEWAL_TIME,
            Self::RebindingTime(_) => REBINDING_TIME,
            Self::HostName(_) => HOST_NAME,
            Self::ParameterRequestList(_) => PARAMETER_REQUEST_LIST,
            Self::ServerIdentifier(_) => SERVER_IDENTIFIER,
            Self::RelayAgentInformation(_) => RELAY_AGENT_INFORMATION,
            Self::Unrecognized(code, _) => *code,
        }
    }

    fn data(&self, mut f: impl FnMut(&[u8]) -> Result<(), Error>) -> Result<(), Error> {
        match self {
            Self::MessageType(mt) => f(&[*mt as _]),
            Self::SubnetMask(addr) | Self::ServerIdentifier(addr) => f(&addr.octets()),
            Self::Router(addrs) | Self::DomainNameServers(addrs) | Self::NtpServers(addrs) => {
                let mut data = [0; 255];
                let mut len = 0;

                for addr in addrs.iter() {
                    if len + 4 > data.len() {
                        Err(Error::BufferOverflow)?;
                    }

                    data[len..len + 4].copy_from_slice(&addr.octets());
                    len += 4;
                }

                f(&data[..len])
            }
            Self::IpAddressLeaseTime(secs) | Self::RenewalTime(secs) | Self::RebindingTime(secs) => {
                f(&secs.to_be_bytes())
            }
            Self::HostName(name) => f(name.as_bytes()),
            Self::ParameterRequestList(prl) => f(prl),
            Self::RelayAgentInformation(rai) => f(rai.raw()),
            Self::Unrecognized(_, data) => f(data),
        }
    }
}

/// An ordered list of IPv4 addresses, either borrowed from the wire or from
/// decoded data.
#[derive(Copy, Clone, Debug)]
pub struct Ipv4Addrs<'a>(Ipv4AddrsInner<'a>);

impl<'a> Ipv4Addrs<'a> {
    pub const fn new(addrs: &'a [Ipv4Addr]) -> Self {
        Self(Ipv4AddrsInner::DataSlice(addrs))
    }

    fn parse(data: &'a [u8]) -> Result<Self, Error> {
        if data.is_empty() || data.len() % 4 != 0 {
            Err(Error::DataUnderflow)
        } else {
            Ok(Self(Ipv4AddrsInner::ByteSlice(data)))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + 'a {
        self.0.iter()
    }
}

impl PartialEq for Ipv4Addrs<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for Ipv4Addrs<'_> {}

#[derive(Copy, Clone, Debug)]
enum Ipv4AddrsInner<'a> {
    ByteSlice(&'a [u8]),
    DataSlice(&'a [Ipv4Addr]),
}

impl<'a> Ipv4AddrsInner<'a> {
    fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + 'a {
        match self {
            Self::ByteSlice(data) => EitherIterator::First(
                data.chunks_exact(4)
                    .map(|octets| Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])),
            ),
            Self::DataSlice(data) => EitherIterator::Second(data.iter().cloned()),
        }
    }
}

/// The raw payload of the Relay Agent Information option (code 82).
///
/// The payload is a nested TLV region; only the Circuit ID and Remote ID
/// sub-options are given accessors, everything else is carried opaquely so the
/// option round-trips unchanged.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RelayAgentInformation<'a>(&'a [u8]);

impl<'a> RelayAgentInformation<'a> {
    pub const CIRCUIT_ID: u8 = 1;
    pub const REMOTE_ID: u8 = 2;

    pub const fn new(raw: &'a [u8]) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> &'a [u8] {
        self.0
    }

    pub fn circuit_id(&self) -> Option<&'a [u8]> {
        self.sub_option(Self::CIRCUIT_ID)
    }

    pub fn remote_id(&self) -> Option<&'a [u8]> {
        self.sub_option(Self::REMOTE_ID)
    }

    fn sub_option(&self, code: u8) -> Option<&'a [u8]> {
        let mut offset = 0;

        while offset + 2 <= self.0.len() {
            let sub_code = self.0[offset];
            let len = self.0[offset + 1] as usize;
            offset += 2;

            if offset + len > self.0.len() {
                break;
            }

            if sub_code == code {
                return Some(&self.0[offset..offset + len]);
            }

            offset += len;
        }

        None
    }
}

enum EitherIterator<F, S> {
    First(F),
    Second(S),
}

impl<F, S> Iterator for EitherIterator<F, S>
where
    F: Iterator,
    S: Iterator<Item = F::Item>,
{
    type Item = F::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::First(iter) => iter.next(),
            Self::Second(iter) => iter.next(),
        }
    }
}

fn trim_nul(data: &[u8]) -> &[u8] {
    match data.iter().position(|byte| *byte == 0) {
        Some(index) => &data[..index],
        None => data,
    }
}

struct BytesIn<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BytesIn<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset == self.data.len()
    }

    pub fn byte(&mut self) -> Result<u8, Error> {
        self.arr::<1>().map(|arr| arr[0])
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.data.len() - self.offset {
            Err(Error::DataUnderflow)
        } else {
            let data = &self.data[self.offset..self.offset + len];
            self.offset += len;

            Ok(data)
        }
    }

    pub fn arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let slice = self.slice(N)?;

        let mut data = [0; N];
        data.copy_from_slice(slice);

        Ok(data)
    }

    pub fn remaining(&mut self) -> &'a [u8] {
        let data = &self.data[self.offset..];
        self.offset = self.data.len();

        data
    }

    pub fn remaining_byte(&mut self) -> Result<u8, Error> {
        Ok(self.remaining_arr::<1>()?[0])
    }

    pub fn remaining_arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.data.len() - self.offset != N {
            Err(Error::DataUnderflow)
        } else {
            self.arr::<N>()
        }
    }
}

struct BytesOut<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> BytesOut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn byte(&mut self, data: u8) -> Result<&mut Self, Error> {
        self.push(&[data])
    }

    pub fn push(&mut self, data: &[u8]) -> Result<&mut Self, Error> {
        if data.len() > self.buf.len() - self.offset {
            Err(Error::BufferOverflow)
        } else {
            self.buf[self.offset..self.offset + data.len()].copy_from_slice(data);
            self.offset += data.len();

            Ok(self)
        }
    }
}

// DHCP options
const SUBNET_MASK: u8 = 1;
const ROUTER: u8 = 3;
const DOMAIN_NAME_SERVER: u8 = 6;
const HOST_NAME: u8 = 12;
const NTP_SERVERS: u8 = 42;

// DHCP extensions
const IP_ADDRESS_LEASE_TIME: u8 = 51;
const DHCP_MESSAGE_TYPE: u8 = 53;
const SERVER_IDENTIFIER: u8 = 54;
const PARAMETER_REQUEST_LIST: u8 = 55;
const RENEWAL_TIME: u8 = 58;
const REBINDING_TIME: u8 = 59;
const RELAY_AGENT_INFORMATION: u8 = 82;

#[cfg(test)]
mod test {
    use super::*;

    fn raw_discover() -> Vec<u8> {
        let mut data = Vec::new();

        // op, htype, hlen, hops
        data.extend_from_slice(&[1, 1, 6, 1]);
        // xid
        data.extend_from_slice(&0xcafebabe_u32.to_be_bytes());
        // secs, flags
        data.extend_from_slice(&[0, 7, 0x80, 0]);
        // ciaddr, yiaddr, siaddr
        data.extend_from_slice(&[0; 12]);
        // giaddr
        data.extend_from_slice(&[10, 0, 0, 1]);
        // chaddr
        data.extend_from_slice(&[0xde, 0x12, 0x44, 0x4c, 0xbb, 0x48]);
        data.extend_from_slice(&[0; 10]);
        // sname, file
        data.extend_from_slice(&[0; 64]);
        data.extend_from_slice(&[0; 128]);

        data.extend_from_slice(&Packet::COOKIE);
        // message type
        data.extend_from_slice(&[53, 1, 1]);
        // pad in the middle
        data.push(0);
        // host name
        data.extend_from_slice(&[12, 4]);
        data.extend_from_slice(b"knot");
        // parameter request list
        data.extend_from_slice(&[55, 3, 1, 3, 6]);
        // relay agent information: circuit id "c7", remote id "r"
        data.extend_from_slice(&[82, 9, 1, 2, b'c', b'7', 2, 1, b'r', 200, 0]);
        // unknown option
        data.extend_from_slice(&[250, 2, 0xab, 0xcd]);
        data.push(255);

        data
    }

    #[test]
    fn decode_request() {
        let data = raw_discover();
        let packet = Packet::decode(&data).unwrap();

        assert!(!packet.reply);
        assert_eq!(packet.hops, 1);
        assert_eq!(packet.xid, 0xcafebabe);
        assert_eq!(packet.secs, 7);
        assert_eq!(packet.flags, Packet::F_BROADCAST);
        assert_eq!(packet.giaddr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(packet.mac().to_string(), "de:12:44:4c:bb:48");
        assert_eq!(packet.message_type, Some(MessageType::Discover));

        assert_eq!(packet.options.len(), 4);
        assert!(matches!(packet.options[0], DhcpOption::HostName("knot")));
        assert!(matches!(
            packet.options[1],
            DhcpOption::ParameterRequestList(&[1, 3, 6])
        ));
        assert!(matches!(
            packet.options[3],
            DhcpOption::Unrecognized(250, &[0xab, 0xcd])
        ));
    }

    #[test]
    fn relay_agent_sub_options() {
        let data = raw_discover();
        let packet = Packet::decode(&data).unwrap();

        let rai = packet.relay_agent_info().unwrap();
        assert_eq!(rai.circuit_id(), Some(&b"c7"[..]));
        assert_eq!(rai.remote_id(), Some(&b"r"[..]));

        // Truncated sub-option value does not walk out of the payload
        let truncated = RelayAgentInformation::new(&[1, 5, b'x']);
        assert_eq!(truncated.circuit_id(), None);
    }

    #[test]
    fn roundtrip() {
        let data = raw_discover();
        let packet = Packet::decode(&data).unwrap();

        let mut buf = [0; 1500];
        let encoded = packet.encode(&mut buf).unwrap();
        let decoded = Packet::decode(encoded).unwrap();

        assert_eq!(decoded, packet);
    }

    #[test]
    fn framing() {
        let packet = Packet::new_request(
            Mac([0xde, 0x12, 0x44, 0x4c, 0xbb, 0x48]),
            42,
            MessageType::Discover,
        );

        let mut buf = [0; 1500];
        let encoded = packet.encode(&mut buf).unwrap();

        assert!(encoded.len() >= Packet::MIN_PACKET_SIZE);
        assert_eq!(encoded[236..240], Packet::COOKIE);

        // The message type goes first, the last option byte is End
        assert_eq!(encoded[240..243], [53, 1, 1]);
        let end = encoded.iter().rposition(|byte| *byte != 0).unwrap();
        assert_eq!(encoded[end], 255);
    }

    #[test]
    fn reply_zeroes_broadcast_flag() {
        let data = raw_discover();
        let request = Packet::decode(&data).unwrap();

        let reply = request.new_reply(
            MessageType::Offer,
            Ipv4Addr::new(192, 168, 7, 2),
            Ipv4Addr::new(192, 168, 7, 1),
            Vec::new(),
        );

        assert!(reply.reply);
        assert_eq!(reply.flags, 0);
        assert_eq!(reply.xid, request.xid);
        assert_eq!(reply.hops, request.hops);
        assert_eq!(reply.giaddr, request.giaddr);
        assert_eq!(reply.chaddr, request.chaddr);
    }

    #[test]
    fn header_only_packet() {
        let data = raw_discover();
        let packet = Packet::decode(&data[..236]).unwrap();

        assert_eq!(packet.message_type, None);
        assert!(packet.options.is_empty());
    }

    #[test]
    fn malformed_packets() {
        let data = raw_discover();

        // Truncated header
        assert!(matches!(
            Packet::decode(&data[..100]),
            Err(Error::DataUnderflow)
        ));

        // Wrong magic cookie
        let mut bad = data.clone();
        bad[236] = 0;
        assert!(matches!(Packet::decode(&bad), Err(Error::MissingCookie)));

        // Truncated option value
        let mut bad = data.clone();
        bad.truncate(246);
        assert!(matches!(Packet::decode(&bad), Err(Error::DataUnderflow)));

        // Non-Ethernet hardware address
        let mut bad = data.clone();
        bad[1] = 6;
        assert!(matches!(Packet::decode(&bad), Err(Error::InvalidHtype)));

        let mut bad = data.clone();
        bad[2] = 16;
        assert!(matches!(Packet::decode(&bad), Err(Error::InvalidHlen)));

        let mut bad = data;
        bad[0] = 3;
        assert!(matches!(Packet::decode(&bad), Err(Error::InvalidOp)));
    }

    #[test]
    fn mac_parse_and_format() {
        let mac: Mac = "DE:12:44:4C:BB:48".parse().unwrap();
        assert_eq!(mac, Mac([0xde, 0x12, 0x44, 0x4c, 0xbb, 0x48]));
        assert_eq!(mac.to_string(), "de:12:44:4c:bb:48");

        assert!("de:12:44:4c:bb".parse::<Mac>().is_err());
        assert!("de:12:44:4c:bb:48:00".parse::<Mac>().is_err());
        assert!("de-12-44-4c-bb-48".parse::<Mac>().is_err());
        assert!("de:12:44:4c:bb:4".parse::<Mac>().is_err());
    }
}
