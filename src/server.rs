//! Request classification and reply synthesis.
//!
//! This module is pure: it looks at a decoded packet, the UDP peer and the
//! cache, and produces a [`Verdict`]. The io layer turns the verdict into
//! side effects (reconciler tasks, the optimistic staging mark, the actual
//! datagram).

use core::fmt;
use core::net::{IpAddr, Ipv4Addr};
use core::slice;

use crate::cache::{ActiveEntry, CacheInner};
use crate::{DhcpOption, Ipv4Addrs, Mac, MessageType, Packet};

/// Why a request produced no reply and no staging attempt.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DropReason {
    /// The server is shutting down.
    Stopping,
    /// Forward BOOTP replies are not handled.
    NotBootRequest,
    /// No DHCP message type, or one other than DISCOVER/REQUEST.
    NotDhcpRequest,
    /// `hops` is zero; only relayed requests are served.
    NotRelayed,
    /// The datagram did not arrive over IPv4.
    NonIpv4Peer,
    /// The MAC is staged and waits for an operator assignment.
    AwaitingAssignment,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopping => write!(f, "server is stopping"),
            Self::NotBootRequest => write!(f, "not a BOOTP request"),
            Self::NotDhcpRequest => write!(f, "not a DISCOVER or REQUEST"),
            Self::NotRelayed => write!(f, "not relayed"),
            Self::NonIpv4Peer => write!(f, "peer is not IPv4"),
            Self::AwaitingAssignment => write!(f, "awaiting assignment"),
        }
    }
}

/// What to do with an incoming request.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Verdict {
    Drop(DropReason),
    /// Unknown MAC (or known MAC behind a new relay): record it as a staging
    /// candidate and stay silent.
    Stage { mac: Mac, relay_ip: Ipv4Addr },
    /// The MAC has an assignment served by this relay: answer.
    Lease {
        mac: Mac,
        relay_ip: Ipv4Addr,
        kind: MessageType,
        entry: ActiveEntry,
    },
}

/// Classifies a relayed request against the cache.
///
/// The relay address is `giaddr` when set, with the UDP source host as a
/// fallback for relays that forward without filling it in.
pub fn classify(stopping: bool, request: &Packet<'_>, peer: IpAddr, cache: &CacheInner) -> Verdict {
    if stopping {
        return Verdict::Drop(DropReason::Stopping);
    }

    if request.reply {
        return Verdict::Drop(DropReason::NotBootRequest);
    }

    let message_type = match request.message_type {
        Some(mt @ (MessageType::Discover | MessageType::Request)) => mt,
        _ => return Verdict::Drop(DropReason::NotDhcpRequest),
    };

    if request.hops == 0 {
        return Verdict::Drop(DropReason::NotRelayed);
    }

    let peer_ip = match peer {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => return Verdict::Drop(DropReason::NonIpv4Peer),
    };

    let relay_ip = if request.giaddr.is_unspecified() {
        peer_ip
    } else {
        request.giaddr
    };

    let mac = request.mac();

    if let Some(entry) = cache.active(mac) {
        if entry.relay_ip == relay_ip {
            let kind = if matches!(message_type, MessageType::Discover) {
                MessageType::Offer
            } else {
                MessageType::Ack
            };

            Verdict::Lease {
                mac,
                relay_ip,
                kind,
                entry: entry.clone(),
            }
        } else if cache.staging(mac).is_some() {
            // The relay moved and re-staging is already underway
            Verdict::Drop(DropReason::AwaitingAssignment)
        } else {
            Verdict::Stage { mac, relay_ip }
        }
    } else if cache.staging(mac).is_some() {
        Verdict::Drop(DropReason::AwaitingAssignment)
    } else {
        Verdict::Stage { mac, relay_ip }
    }
}

/// Builds the OFFER/ACK for an active entry.
///
/// `server_addr` is the listener's advertised address (or the server-wide
/// default); when absent, `siaddr` stays unspecified and no Server Identifier
/// is emitted.
pub fn make_reply<'o>(
    request: &Packet<'_>,
    kind: MessageType,
    entry: &'o ActiveEntry,
    server_addr: Option<Ipv4Addr>,
) -> Packet<'o> {
    let mut options = Vec::new();

    options.push(DhcpOption::SubnetMask(entry.netmask));

    if let Some(router_ip) = entry.router_ip.as_ref() {
        options.push(DhcpOption::Router(Ipv4Addrs::new(slice::from_ref(
            router_ip,
        ))));
    }

    if !entry.dns_ips.is_empty() {
        options.push(DhcpOption::DomainNameServers(Ipv4Addrs::new(
            &entry.dns_ips,
        )));
    }

    if !entry.ntp_ips.is_empty() {
        options.push(DhcpOption::NtpServers(Ipv4Addrs::new(&entry.ntp_ips)));
    }

    options.push(DhcpOption::IpAddressLeaseTime(entry.lease_secs));

    if let Some(server_addr) = server_addr {
        options.push(DhcpOption::ServerIdentifier(server_addr));
    }

    request.new_reply(
        kind,
        entry.ip_addr,
        server_addr.unwrap_or(Ipv4Addr::UNSPECIFIED),
        options,
    )
}
