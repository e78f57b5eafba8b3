//! IPv4 addresses, prefixes, wildcards and IP spaces.

use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// IPv4 address stored as a big-endian `u32`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Ip(u32);

impl Ip {
    pub const ZERO: Ip = Ip(0);
    pub const MAX: Ip = Ip(u32::MAX);

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn from_octets(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(u32::from_be_bytes([a, b, c, d]))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl FromStr for Ip {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let addr = Ipv4Addr::from_str(s.trim()).map_err(|_| Error::InvalidIp(s.to_string()))?;
        Ok(Ip(u32::from(addr)))
    }
}

impl Display for Ip {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Ipv4Addr::from(self.0))
    }
}

impl From<Ip> for String {
    fn from(ip: Ip) -> Self {
        ip.to_string()
    }
}

impl TryFrom<String> for Ip {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Network prefix `ip/len`. The address is canonicalized to the network address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Prefix {
    ip: Ip,
    len: u8,
}

impl Prefix {
    pub const ANY: Prefix = Prefix { ip: Ip::ZERO, len: 0 };

    pub fn new(ip: Ip, len: u8) -> Result<Self> {
        if len > 32 {
            return Err(Error::InvalidPrefix(format!("{}/{}", ip, len)));
        }
        Ok(Self {
            ip: Ip(ip.0 & Self::mask(len)),
            len,
        })
    }

    pub fn host(ip: Ip) -> Self {
        Self { ip, len: 32 }
    }

    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    fn mask(len: u8) -> u32 {
        if len == 0 {
            0
        } else {
            u32::MAX << (32 - len as u32)
        }
    }

    pub fn ip(&self) -> Ip {
        self.ip
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn start(&self) -> Ip {
        self.ip
    }

    pub fn end(&self) -> Ip {
        Ip(self.ip.0 | !Self::mask(self.len))
    }

    pub fn contains(&self, ip: Ip) -> bool {
        ip.0 & Self::mask(self.len) == self.ip.0
    }

    pub fn to_wildcard(&self) -> IpWildcard {
        IpWildcard::new(self.ip, !Self::mask(self.len))
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPrefix(s.to_string());
        match s.trim().split_once('/') {
            Some((ip, len)) => {
                let ip = ip.parse::<Ip>().map_err(|_| invalid())?;
                let len = len.parse::<u8>().map_err(|_| invalid())?;
                Prefix::new(ip, len).map_err(|_| invalid())
            }
            None => Ok(Prefix::host(s.parse().map_err(|_| invalid())?)),
        }
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.len)
    }
}

impl From<Prefix> for String {
    fn from(prefix: Prefix) -> Self {
        prefix.to_string()
    }
}

impl TryFrom<String> for Prefix {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// An address together with a mask of don't-care bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct IpWildcard {
    ip: Ip,
    wildcard: u32,
}

impl IpWildcard {
    pub const ANY: IpWildcard = IpWildcard {
        ip: Ip::ZERO,
        wildcard: u32::MAX,
    };

    pub fn new(ip: Ip, wildcard: u32) -> Self {
        Self {
            ip: Ip(ip.0 & !wildcard),
            wildcard,
        }
    }

    pub fn ip(&self) -> Ip {
        self.ip
    }

    /// Mask of don't-care bits.
    pub fn wildcard(&self) -> u32 {
        self.wildcard
    }

    pub fn contains(&self, ip: Ip) -> bool {
        ip.0 & !self.wildcard == self.ip.0
    }
}

impl From<Prefix> for IpWildcard {
    fn from(prefix: Prefix) -> Self {
        prefix.to_wildcard()
    }
}

impl From<Ip> for IpWildcard {
    fn from(ip: Ip) -> Self {
        IpWildcard::new(ip, 0)
    }
}

impl Display for IpWildcard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, Ip(self.wildcard))
    }
}

/// A set of IPv4 addresses.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum IpSpace {
    Empty,
    Universe,
    Wildcard(IpWildcard),
    Union(Vec<IpSpace>),
    /// Addresses in the first space that are not in the second one.
    Difference(Box<IpSpace>, Box<IpSpace>),
}

impl IpSpace {
    pub fn ip(ip: Ip) -> Self {
        IpSpace::Wildcard(ip.into())
    }

    pub fn prefix(prefix: Prefix) -> Self {
        if prefix.len() == 0 {
            IpSpace::Universe
        } else {
            IpSpace::Wildcard(prefix.into())
        }
    }

    pub fn union(spaces: impl IntoIterator<Item = IpSpace>) -> Self {
        let spaces: Vec<IpSpace> = spaces
            .into_iter()
            .filter(|s| !matches!(s, IpSpace::Empty))
            .collect();
        match spaces.len() {
            0 => IpSpace::Empty,
            1 => spaces.into_iter().next().unwrap_or(IpSpace::Empty),
            _ => IpSpace::Union(spaces),
        }
    }

    pub fn difference(self, other: IpSpace) -> Self {
        match (&self, &other) {
            (IpSpace::Empty, _) => IpSpace::Empty,
            (_, IpSpace::Empty) => self,
            _ => IpSpace::Difference(Box::new(self), Box::new(other)),
        }
    }

    pub fn contains(&self, ip: Ip) -> bool {
        match self {
            IpSpace::Empty => false,
            IpSpace::Universe => true,
            IpSpace::Wildcard(w) => w.contains(ip),
            IpSpace::Union(spaces) => spaces.iter().any(|s| s.contains(ip)),
            IpSpace::Difference(a, b) => a.contains(ip) && !b.contains(ip),
        }
    }
}

impl From<Prefix> for IpSpace {
    fn from(prefix: Prefix) -> Self {
        IpSpace::prefix(prefix)
    }
}

impl From<Ip> for IpSpace {
    fn from(ip: Ip) -> Self {
        IpSpace::ip(ip)
    }
}
