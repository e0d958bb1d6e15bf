//! The control store abstraction.
//!
//! The authoritative `(MAC, profile, assignment)` data lives in a relational
//! store outside of this crate. The server only needs the small query surface
//! captured by [`ControlStore`], plus the pub/sub notification channel
//! captured by [`Notifications`], through which operator mutations reach the
//! running server. A production backend would implement these traits on top
//! of e.g. Postgres `LISTEN/NOTIFY`; the in-tree [`mem`] implementation backs
//! tests and demos.

use core::fmt;
use core::net::Ipv4Addr;
use core::str::FromStr;
use core::time::Duration;

use crate::Mac;

pub mod mem;

pub type OwnerId = i64;
pub type ProfileId = i64;

/// The notification channel the server subscribes to by default.
pub const DEFAULT_CHANNEL: &str = "dhcp_control";

/// A wall-clock instant in seconds since the Unix epoch.
///
/// The server never interprets it, it is only passed through to the store for
/// the `lease_date` and `create_date` columns.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Timestamp(pub i64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An IPv4 network in CIDR notation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    pub const fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, InvalidNet> {
        if prefix > 32 {
            Err(InvalidNet)
        } else {
            Ok(Self { addr, prefix })
        }
    }

    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    pub const fn netmask(&self) -> Ipv4Addr {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        };

        let [a, b, c, d] = mask.to_be_bytes();

        Ipv4Addr::new(a, b, c, d)
    }

    pub const fn broadcast(&self) -> Ipv4Addr {
        let [a, b, c, d] = self.netmask().octets();
        let mask = u32::from_be_bytes([a, b, c, d]);
        let [e, f, g, h] = self.addr.octets();
        let addr = u32::from_be_bytes([e, f, g, h]);

        let [i, j, k, l] = (addr | !mask).to_be_bytes();

        Ipv4Addr::new(i, j, k, l)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Net {
    type Err = InvalidNet;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or(InvalidNet)?;

        Self::new(
            addr.parse().map_err(|_| InvalidNet)?,
            prefix.parse().map_err(|_| InvalidNet)?,
        )
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct InvalidNet;

impl fmt::Display for InvalidNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid IPv4 network")
    }
}

impl std::error::Error for InvalidNet {}

/// One row of the `owner` join `profile` projection the server works with.
///
/// A row with `ip_addr = None` is a staging candidate, anything else is an
/// active assignment.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OwnerRow {
    pub id: OwnerId,
    pub mac_addr: Mac,
    pub ip_addr: Option<Ipv4Addr>,
    pub relay_ip: Ipv4Addr,
    pub network_addr: Ipv4Net,
    pub router_ip: Option<Ipv4Addr>,
    pub dns_ips: Vec<Ipv4Addr>,
    pub ntp_ips: Vec<Ipv4Addr>,
    pub lease_time: Duration,
}

/// The result of inserting a staging row for an unknown MAC.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StagingOutcome {
    /// A new owner row was created with the returned id.
    Created(OwnerId),
    /// No profile serves the relay the request came from.
    NoProfile,
    /// A row for this `(profile, MAC)` already exists; a concurrent request
    /// won the insert race.
    AlreadyPresent,
}

/// The query surface of the control store.
///
/// The reconciler holds one implementation instance for the lifetime of its
/// loop; it is the only task issuing writes.
pub trait ControlStore {
    type Error: fmt::Debug + fmt::Display;

    /// Fetches the full owner projection, ordered by modification date
    /// ascending, so that later rows win when a MAC occurs more than once.
    async fn load_owners(&mut self) -> Result<Vec<OwnerRow>, Self::Error>;

    /// Inserts an unassigned owner row for `mac` under the profile serving
    /// `relay_ip`, in a single transaction returning the new row id.
    async fn create_staging(
        &mut self,
        at: Timestamp,
        mac: Mac,
        relay_ip: Ipv4Addr,
    ) -> Result<StagingOutcome, Self::Error>;

    /// Stamps the lease date of an owner row.
    async fn touch_lease(&mut self, at: Timestamp, owner: OwnerId) -> Result<(), Self::Error>;

    /// Re-reads a single owner row, `None` when it no longer exists.
    async fn owner(&mut self, owner: OwnerId) -> Result<Option<OwnerRow>, Self::Error>;

    /// Re-reads all owner rows of a profile, ordered by modification date
    /// ascending.
    async fn profile_owners(&mut self, profile: ProfileId)
        -> Result<Vec<OwnerRow>, Self::Error>;
}

impl<T> ControlStore for &mut T
where
    T: ControlStore,
{
    type Error = T::Error;

    async fn load_owners(&mut self) -> Result<Vec<OwnerRow>, Self::Error> {
        (**self).load_owners().await
    }

    async fn create_staging(
        &mut self,
        at: Timestamp,
        mac: Mac,
        relay_ip: Ipv4Addr,
    ) -> Result<StagingOutcome, Self::Error> {
        (**self).create_staging(at, mac, relay_ip).await
    }

    async fn touch_lease(&mut self, at: Timestamp, owner: OwnerId) -> Result<(), Self::Error> {
        (**self).touch_lease(at, owner).await
    }

    async fn owner(&mut self, owner: OwnerId) -> Result<Option<OwnerRow>, Self::Error> {
        (**self).owner(owner).await
    }

    async fn profile_owners(
        &mut self,
        profile: ProfileId,
    ) -> Result<Vec<OwnerRow>, Self::Error> {
        (**self).profile_owners(profile).await
    }
}

/// The notification side of the control store.
///
/// A dedicated long-lived connection listening on the store's pub/sub channel
/// (see [`DEFAULT_CHANNEL`]). `recv` yields raw payload strings; `Ok(None)`
/// means the channel was closed and the subscriber should exit.
pub trait Notifications {
    type Error: fmt::Debug + fmt::Display;

    async fn recv(&mut self) -> Result<Option<String>, Self::Error>;
}

/// A parsed control notification.
///
/// The wire payload is a single line of the form `<ACTION> <ARG>`, with MACs
/// as six lower-case hex pairs and ids as decimal integers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Notification {
    ReloadOwner(OwnerId),
    ReloadProfile(ProfileId),
    RemoveStaging(Mac),
    RemoveActive(Mac),
}

impl Notification {
    pub fn parse(payload: &str) -> Result<Self, InvalidNotification> {
        let (action, arg) = payload
            .split_once(' ')
            .ok_or(InvalidNotification::MissingArgument)?;

        let notification = match action {
            "RELOAD_ITEM" => Self::ReloadOwner(parse_id(arg)?),
            "RELOAD_PROFILE" => Self::ReloadProfile(parse_id(arg)?),
            "REMOVE_STAGING" => Self::RemoveStaging(parse_mac(arg)?),
            "REMOVE_ACTIVE" => Self::RemoveActive(parse_mac(arg)?),
            _ => Err(InvalidNotification::UnknownAction)?,
        };

        Ok(notification)
    }
}

fn parse_id(arg: &str) -> Result<i64, InvalidNotification> {
    arg.parse().map_err(|_| InvalidNotification::InvalidArgument)
}

fn parse_mac(arg: &str) -> Result<Mac, InvalidNotification> {
    // Normalizes upper-case payloads even though the grammar asks for lower
    arg.to_ascii_lowercase()
        .parse()
        .map_err(|_| InvalidNotification::InvalidArgument)
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InvalidNotification {
    MissingArgument,
    UnknownAction,
    InvalidArgument,
}

impl fmt::Display for InvalidNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingArgument => write!(f, "Missing argument"),
            Self::UnknownAction => write!(f, "Unknown action"),
            Self::InvalidArgument => write!(f, "Invalid argument"),
        }
    }
}

impl std::error::Error for InvalidNotification {}
