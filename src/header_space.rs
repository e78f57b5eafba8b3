//! Packet header constraints.
//!
//! A [`HeaderSpace`] is an immutable boolean tree whose leaves constrain a
//! single header field. [`HeaderSpaceBuilder`] produces the conventional
//! shape where every field has a whitelist and a blacklist.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::flow::{Flow, TcpFlags};
use crate::ip::IpSpace;

/// Well-known IP protocol numbers.
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// Integer-valued header fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum HeaderField {
    IpProtocol,
    DstIp,
    SrcIp,
    DstPort,
    SrcPort,
    IcmpCode,
    IcmpType,
    Dscp,
    Ecn,
    FragmentOffset,
    PacketLength,
}

impl HeaderField {
    pub const ALL: [HeaderField; 11] = [
        HeaderField::IpProtocol,
        HeaderField::DstIp,
        HeaderField::SrcIp,
        HeaderField::DstPort,
        HeaderField::SrcPort,
        HeaderField::IcmpCode,
        HeaderField::IcmpType,
        HeaderField::Dscp,
        HeaderField::Ecn,
        HeaderField::FragmentOffset,
        HeaderField::PacketLength,
    ];

    /// Width of the field in bits.
    pub const fn width(self) -> u32 {
        match self {
            HeaderField::IpProtocol => 8,
            HeaderField::DstIp | HeaderField::SrcIp => 32,
            HeaderField::DstPort | HeaderField::SrcPort => 16,
            HeaderField::IcmpCode | HeaderField::IcmpType => 8,
            HeaderField::Dscp => 6,
            HeaderField::Ecn => 2,
            HeaderField::FragmentOffset => 13,
            HeaderField::PacketLength => 16,
        }
    }

    pub const fn max_value(self) -> u64 {
        (1u64 << self.width()) - 1
    }

    pub const fn name(self) -> &'static str {
        match self {
            HeaderField::IpProtocol => "ipProtocol",
            HeaderField::DstIp => "dstIp",
            HeaderField::SrcIp => "srcIp",
            HeaderField::DstPort => "dstPort",
            HeaderField::SrcPort => "srcPort",
            HeaderField::IcmpCode => "icmpCode",
            HeaderField::IcmpType => "icmpType",
            HeaderField::Dscp => "dscp",
            HeaderField::Ecn => "ecn",
            HeaderField::FragmentOffset => "fragmentOffset",
            HeaderField::PacketLength => "packetLength",
        }
    }
}

impl Display for HeaderField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Inclusive integer range.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SubRange {
    pub start: u32,
    pub end: u32,
}

impl SubRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn singleton(value: u32) -> Self {
        Self::new(value, value)
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, value: u32) -> bool {
        self.start <= value && value <= self.end
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum TcpFlag {
    Ack,
    Cwr,
    Ece,
    Fin,
    Psh,
    Rst,
    Syn,
    Urg,
}

impl TcpFlag {
    pub const ALL: [TcpFlag; 8] = [
        TcpFlag::Ack,
        TcpFlag::Cwr,
        TcpFlag::Ece,
        TcpFlag::Fin,
        TcpFlag::Psh,
        TcpFlag::Rst,
        TcpFlag::Syn,
        TcpFlag::Urg,
    ];
}

/// Required values for a subset of the TCP flags.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TcpFlagsMatch {
    pub flags: BTreeMap<TcpFlag, bool>,
}

impl TcpFlagsMatch {
    pub fn with(mut self, flag: TcpFlag, value: bool) -> Self {
        self.flags.insert(flag, value);
        self
    }

    pub fn matches(&self, flags: &TcpFlags) -> bool {
        self.flags.iter().all(|(&flag, &value)| flags.get(flag) == value)
    }
}

/// Constraint on a single header field.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum FieldMatch {
    SrcIp(IpSpace),
    DstIp(IpSpace),
    SrcOrDstIp(IpSpace),
    /// Field value lies in one of the ranges.
    Ranges(HeaderField, Vec<SubRange>),
    /// Field value is one of the enumerated values.
    Values(HeaderField, BTreeSet<u32>),
    SrcOrDstPort(Vec<SubRange>),
    /// Flags satisfy one of the matches.
    TcpFlags(Vec<TcpFlagsMatch>),
}

impl FieldMatch {
    pub fn matches(&self, flow: &Flow) -> bool {
        match self {
            FieldMatch::SrcIp(space) => space.contains(flow.src_ip),
            FieldMatch::DstIp(space) => space.contains(flow.dst_ip),
            FieldMatch::SrcOrDstIp(space) => space.contains(flow.src_ip) || space.contains(flow.dst_ip),
            FieldMatch::Ranges(field, ranges) => {
                let value = flow.field(*field);
                ranges.iter().any(|r| r.contains(value))
            }
            FieldMatch::Values(field, values) => values.contains(&flow.field(*field)),
            FieldMatch::SrcOrDstPort(ranges) => ranges
                .iter()
                .any(|r| r.contains(flow.src_port as u32) || r.contains(flow.dst_port as u32)),
            FieldMatch::TcpFlags(matches) => matches.iter().any(|m| m.matches(&flow.tcp_flags)),
        }
    }
}

/// Boolean tree over field constraints.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum HeaderSpace {
    #[default]
    Any,
    Field(FieldMatch),
    And(Vec<HeaderSpace>),
    Or(Vec<HeaderSpace>),
    Not(Box<HeaderSpace>),
}

impl HeaderSpace {
    pub fn builder() -> HeaderSpaceBuilder {
        HeaderSpaceBuilder::default()
    }

    pub fn none() -> Self {
        HeaderSpace::Not(Box::new(HeaderSpace::Any))
    }

    pub fn and(self, other: HeaderSpace) -> Self {
        match (self, other) {
            (HeaderSpace::Any, x) | (x, HeaderSpace::Any) => x,
            (HeaderSpace::And(mut xs), HeaderSpace::And(ys)) => {
                xs.extend(ys);
                HeaderSpace::And(xs)
            }
            (HeaderSpace::And(mut xs), y) => {
                xs.push(y);
                HeaderSpace::And(xs)
            }
            (x, y) => HeaderSpace::And(vec![x, y]),
        }
    }

    pub fn or(self, other: HeaderSpace) -> Self {
        match (self, other) {
            (HeaderSpace::Any, _) | (_, HeaderSpace::Any) => HeaderSpace::Any,
            (HeaderSpace::Or(mut xs), HeaderSpace::Or(ys)) => {
                xs.extend(ys);
                HeaderSpace::Or(xs)
            }
            (HeaderSpace::Or(mut xs), y) => {
                xs.push(y);
                HeaderSpace::Or(xs)
            }
            (x, y) => HeaderSpace::Or(vec![x, y]),
        }
    }

    /// Concrete evaluation against a flow.
    pub fn matches(&self, flow: &Flow) -> bool {
        match self {
            HeaderSpace::Any => true,
            HeaderSpace::Field(m) => m.matches(flow),
            HeaderSpace::And(xs) => xs.iter().all(|x| x.matches(flow)),
            HeaderSpace::Or(xs) => xs.iter().any(|x| x.matches(flow)),
            HeaderSpace::Not(x) => !x.matches(flow),
        }
    }
}

impl std::ops::Not for HeaderSpace {
    type Output = HeaderSpace;

    fn not(self) -> Self::Output {
        match self {
            HeaderSpace::Not(x) => *x,
            x => HeaderSpace::Not(Box::new(x)),
        }
    }
}

impl From<FieldMatch> for HeaderSpace {
    fn from(m: FieldMatch) -> Self {
        HeaderSpace::Field(m)
    }
}

/// Builds a header space as "every whitelist matches and no blacklist matches".
#[derive(Debug, Clone, Default)]
pub struct HeaderSpaceBuilder {
    whitelist: Vec<FieldMatch>,
    blacklist: Vec<FieldMatch>,
}

impl HeaderSpaceBuilder {
    fn allow(mut self, m: FieldMatch) -> Self {
        self.whitelist.push(m);
        self
    }

    fn deny(mut self, m: FieldMatch) -> Self {
        self.blacklist.push(m);
        self
    }

    pub fn src_ips(self, space: impl Into<IpSpace>) -> Self {
        self.allow(FieldMatch::SrcIp(space.into()))
    }
    pub fn not_src_ips(self, space: impl Into<IpSpace>) -> Self {
        self.deny(FieldMatch::SrcIp(space.into()))
    }
    pub fn dst_ips(self, space: impl Into<IpSpace>) -> Self {
        self.allow(FieldMatch::DstIp(space.into()))
    }
    pub fn not_dst_ips(self, space: impl Into<IpSpace>) -> Self {
        self.deny(FieldMatch::DstIp(space.into()))
    }
    pub fn src_or_dst_ips(self, space: impl Into<IpSpace>) -> Self {
        self.allow(FieldMatch::SrcOrDstIp(space.into()))
    }

    pub fn src_ports(self, ranges: impl IntoIterator<Item = SubRange>) -> Self {
        self.allow(FieldMatch::Ranges(HeaderField::SrcPort, ranges.into_iter().collect()))
    }
    pub fn not_src_ports(self, ranges: impl IntoIterator<Item = SubRange>) -> Self {
        self.deny(FieldMatch::Ranges(HeaderField::SrcPort, ranges.into_iter().collect()))
    }
    pub fn dst_ports(self, ranges: impl IntoIterator<Item = SubRange>) -> Self {
        self.allow(FieldMatch::Ranges(HeaderField::DstPort, ranges.into_iter().collect()))
    }
    pub fn not_dst_ports(self, ranges: impl IntoIterator<Item = SubRange>) -> Self {
        self.deny(FieldMatch::Ranges(HeaderField::DstPort, ranges.into_iter().collect()))
    }
    pub fn src_or_dst_ports(self, ranges: impl IntoIterator<Item = SubRange>) -> Self {
        self.allow(FieldMatch::SrcOrDstPort(ranges.into_iter().collect()))
    }

    pub fn ip_protocols(self, protocols: impl IntoIterator<Item = u8>) -> Self {
        let values = protocols.into_iter().map(u32::from).collect();
        self.allow(FieldMatch::Values(HeaderField::IpProtocol, values))
    }
    pub fn not_ip_protocols(self, protocols: impl IntoIterator<Item = u8>) -> Self {
        let values = protocols.into_iter().map(u32::from).collect();
        self.deny(FieldMatch::Values(HeaderField::IpProtocol, values))
    }

    pub fn icmp_types(self, ranges: impl IntoIterator<Item = SubRange>) -> Self {
        self.allow(FieldMatch::Ranges(HeaderField::IcmpType, ranges.into_iter().collect()))
    }
    pub fn icmp_codes(self, ranges: impl IntoIterator<Item = SubRange>) -> Self {
        self.allow(FieldMatch::Ranges(HeaderField::IcmpCode, ranges.into_iter().collect()))
    }
    pub fn dscps(self, values: impl IntoIterator<Item = u8>) -> Self {
        let values = values.into_iter().map(u32::from).collect();
        self.allow(FieldMatch::Values(HeaderField::Dscp, values))
    }
    pub fn ecns(self, values: impl IntoIterator<Item = u8>) -> Self {
        let values = values.into_iter().map(u32::from).collect();
        self.allow(FieldMatch::Values(HeaderField::Ecn, values))
    }
    pub fn fragment_offsets(self, ranges: impl IntoIterator<Item = SubRange>) -> Self {
        self.allow(FieldMatch::Ranges(HeaderField::FragmentOffset, ranges.into_iter().collect()))
    }
    pub fn packet_lengths(self, ranges: impl IntoIterator<Item = SubRange>) -> Self {
        self.allow(FieldMatch::Ranges(HeaderField::PacketLength, ranges.into_iter().collect()))
    }
    pub fn tcp_flags(self, matches: impl IntoIterator<Item = TcpFlagsMatch>) -> Self {
        self.allow(FieldMatch::TcpFlags(matches.into_iter().collect()))
    }

    pub fn build(self) -> HeaderSpace {
        let positives = self.whitelist.into_iter().map(HeaderSpace::Field);
        let negatives = self.blacklist.into_iter().map(|m| !HeaderSpace::Field(m));
        positives.chain(negatives).fold(HeaderSpace::Any, HeaderSpace::and)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::ip::{Ip, Prefix};

    fn flow(src: &str, dst: &str, protocol: u8, dst_port: u16) -> Flow {
        Flow {
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            ip_protocol: protocol,
            dst_port,
            ..Flow::default()
        }
    }

    #[test]
    fn test_builder_whitelist_blacklist() {
        let hs = HeaderSpace::builder()
            .src_ips(Prefix::parse("10.0.0.0/8").unwrap())
            .not_src_ips(Prefix::parse("10.1.0.0/16").unwrap())
            .ip_protocols([protocol::TCP])
            .dst_ports([SubRange::new(22, 23)])
            .build();

        assert!(hs.matches(&flow("10.2.0.1", "1.1.1.1", protocol::TCP, 22)));
        assert!(!hs.matches(&flow("10.1.0.1", "1.1.1.1", protocol::TCP, 22)));
        assert!(!hs.matches(&flow("10.2.0.1", "1.1.1.1", protocol::UDP, 22)));
        assert!(!hs.matches(&flow("10.2.0.1", "1.1.1.1", protocol::TCP, 80)));
    }

    #[test]
    fn test_empty_builder_is_any() {
        assert_eq!(HeaderSpace::builder().build(), HeaderSpace::Any);
    }

    #[test]
    fn test_combinators() {
        let a = HeaderSpace::builder().dst_ips(Ip::from_octets(1, 1, 1, 1)).build();
        let b = HeaderSpace::builder().dst_ips(Ip::from_octets(2, 2, 2, 2)).build();
        let either = a.clone().or(b.clone());
        let f = flow("0.0.0.0", "2.2.2.2", 0, 0);

        assert!(either.matches(&f));
        assert!(!a.clone().and(b).matches(&f));
        assert!((!a.clone()).matches(&f));
        assert_eq!(!!a.clone(), a);
        assert!(!HeaderSpace::none().matches(&f));
    }

    #[test]
    fn test_tcp_flags() {
        let syn_only = TcpFlagsMatch::default()
            .with(TcpFlag::Syn, true)
            .with(TcpFlag::Ack, false);
        let hs = HeaderSpace::builder().tcp_flags([syn_only]).build();

        let mut f = flow("0.0.0.0", "0.0.0.0", protocol::TCP, 0);
        assert!(!hs.matches(&f));
        f.tcp_flags.syn = true;
        assert!(hs.matches(&f));
        f.tcp_flags.ack = true;
        assert!(!hs.matches(&f));
    }
}
