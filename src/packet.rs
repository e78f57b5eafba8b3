//! Bit-vector encoding of packet headers.
//!
//! A [`BddPacket`] owns the BDD manager and a fixed allocation of variables to
//! header fields. Every predicate in an analysis is built from the same
//! packet, so predicates from different packets must never be combined (see
//! [`BddPacket::check_compatible`]).
//!
//! Variables are allocated MSB first, in this order:
//!
//! ```text
//! ipProtocol(8) dstIp(32) srcIp(32) dstPort(16) srcPort(16) icmpCode(8) icmpType(8)
//! ack cwr ece fin psh rst syn urg  dscp(6) ecn(2) fragmentOffset(13) packetLength(16)
//! source(12) transited(1)
//! ```
//!
//! The last two are not header bits: `source` records which interface a
//! packet entered the current device through, and `transited` records
//! whether the packet passed through a required transit node.

use std::collections::{BTreeMap, HashSet};

use log::debug;

use crate::bdd::Bdd;
use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::header_space::{FieldMatch, HeaderField, HeaderSpace, SubRange, TcpFlag};
use crate::ip::{Ip, IpSpace, IpWildcard, Prefix};
use crate::reference::Ref;

/// Width of the source-interface field.
pub const SOURCE_BITS: u32 = 12;

/// An unsigned integer encoded by consecutive BDD variables, MSB first.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BddInteger {
    first_var: u32,
    width: u32,
}

impl BddInteger {
    pub fn new(first_var: u32, width: u32) -> Self {
        assert!(width > 0 && width <= 32);
        Self { first_var, width }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn max_value(&self) -> u64 {
        (1u64 << self.width) - 1
    }

    /// BDD variable of bit `i`, where bit `0` is the most significant one.
    pub fn var(&self, i: u32) -> u32 {
        debug_assert!(i < self.width);
        self.first_var + i
    }

    pub fn vars(&self) -> Vec<u32> {
        (0..self.width).map(|i| self.var(i)).collect()
    }

    fn bit(&self, value: u64, i: u32) -> bool {
        (value >> (self.width - 1 - i)) & 1 == 1
    }

    /// Exactly `value`.
    pub fn value(&self, bdd: &Bdd, value: u64) -> Ref {
        if value > self.max_value() {
            return bdd.zero();
        }
        self.masked(bdd, value, self.max_value())
    }

    /// Bits selected by `care` equal the corresponding bits of `value`.
    pub fn masked(&self, bdd: &Bdd, value: u64, care: u64) -> Ref {
        let literals = (0..self.width).filter(|&i| self.bit(care, i)).map(|i| {
            let v = self.var(i) as i32;
            if self.bit(value, i) {
                v
            } else {
                -v
            }
        });
        bdd.mk_cube(literals)
    }

    /// The top `len` bits equal those of `value`.
    pub fn prefix(&self, bdd: &Bdd, value: u64, len: u32) -> Ref {
        let len = len.min(self.width);
        let care = if len == 0 {
            0
        } else {
            self.max_value() ^ ((1u64 << (self.width - len)) - 1)
        };
        self.masked(bdd, value, care)
    }

    pub fn geq(&self, bdd: &Bdd, value: u64) -> Ref {
        if value == 0 {
            return bdd.one();
        }
        if value > self.max_value() {
            return bdd.zero();
        }
        // Built bottom-up: the least significant bit has the deepest variable.
        let mut res = bdd.one();
        for i in (0..self.width).rev() {
            res = if self.bit(value, i) {
                bdd.mk_node(self.var(i), bdd.zero(), res)
            } else {
                bdd.mk_node(self.var(i), res, bdd.one())
            };
        }
        res
    }

    pub fn leq(&self, bdd: &Bdd, value: u64) -> Ref {
        if value >= self.max_value() {
            return bdd.one();
        }
        let mut res = bdd.one();
        for i in (0..self.width).rev() {
            res = if self.bit(value, i) {
                bdd.mk_node(self.var(i), bdd.one(), res)
            } else {
                bdd.mk_node(self.var(i), res, bdd.zero())
            };
        }
        res
    }

    /// Inclusive range `start..=end`.
    pub fn range(&self, bdd: &Bdd, start: u64, end: u64) -> Ref {
        if start > end {
            return bdd.zero();
        }
        if start == end {
            return self.value(bdd, start);
        }
        bdd.apply_and(self.geq(bdd, start), self.leq(bdd, end))
    }

    /// Read the value of this integer from an assignment.
    pub fn decode(&self, assignment: impl Fn(u32) -> bool) -> u64 {
        (0..self.width).fold(0u64, |acc, i| (acc << 1) | assignment(self.var(i)) as u64)
    }
}

/// Shared variable allocation for one analysis session.
pub struct BddPacket {
    bdd: Bdd,
    fields: BTreeMap<HeaderField, BddInteger>,
    tcp_flags: BTreeMap<TcpFlag, u32>,
    source: BddInteger,
    transited: u32,
    num_header_vars: u32,
    num_vars: u32,
}

impl std::fmt::Debug for BddPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BddPacket")
            .field("num_vars", &self.num_vars)
            .field("bdd", &self.bdd)
            .finish()
    }
}

impl Default for BddPacket {
    fn default() -> Self {
        Self::new(16)
    }
}

impl BddPacket {
    pub fn new(table_bits: usize) -> Self {
        let mut next_var = 1;
        let mut alloc = |width: u32| {
            let integer = BddInteger::new(next_var, width);
            next_var += width;
            integer
        };

        let mut fields = BTreeMap::new();
        for field in [
            HeaderField::IpProtocol,
            HeaderField::DstIp,
            HeaderField::SrcIp,
            HeaderField::DstPort,
            HeaderField::SrcPort,
            HeaderField::IcmpCode,
            HeaderField::IcmpType,
        ] {
            fields.insert(field, alloc(field.width()));
        }
        let mut tcp_flags = BTreeMap::new();
        for flag in TcpFlag::ALL {
            tcp_flags.insert(flag, alloc(1).var(0));
        }
        for field in [
            HeaderField::Dscp,
            HeaderField::Ecn,
            HeaderField::FragmentOffset,
            HeaderField::PacketLength,
        ] {
            fields.insert(field, alloc(field.width()));
        }
        let source = alloc(SOURCE_BITS);
        let transited = alloc(1).var(0);
        let num_vars = transited;
        let num_header_vars = source.var(0) - 1;

        debug!("Allocated packet with {} variables", num_vars);

        Self {
            bdd: Bdd::new(table_bits),
            fields,
            tcp_flags,
            source,
            transited,
            num_header_vars,
            num_vars,
        }
    }

    pub fn bdd(&self) -> &Bdd {
        &self.bdd
    }

    pub fn num_vars(&self) -> u32 {
        self.num_vars
    }

    pub fn num_header_vars(&self) -> u32 {
        self.num_header_vars
    }

    /// Functions are only comparable within one packet instance.
    pub fn check_compatible(&self, other: &BddPacket) -> Result<()> {
        if std::ptr::eq(self, other) {
            Ok(())
        } else {
            Err(Error::IncompatiblePacket)
        }
    }

    pub fn field(&self, field: HeaderField) -> BddInteger {
        self.fields[&field]
    }

    pub fn src_ip(&self) -> BddInteger {
        self.field(HeaderField::SrcIp)
    }
    pub fn dst_ip(&self) -> BddInteger {
        self.field(HeaderField::DstIp)
    }
    pub fn src_port(&self) -> BddInteger {
        self.field(HeaderField::SrcPort)
    }
    pub fn dst_port(&self) -> BddInteger {
        self.field(HeaderField::DstPort)
    }
    pub fn ip_protocol(&self) -> BddInteger {
        self.field(HeaderField::IpProtocol)
    }

    pub fn tcp_flag(&self, flag: TcpFlag) -> Ref {
        self.bdd.mk_var(self.tcp_flags[&flag])
    }

    /// Source-interface field (non-header state).
    pub fn source(&self) -> BddInteger {
        self.source
    }

    pub fn transited_var(&self) -> u32 {
        self.transited
    }

    pub fn transited(&self) -> Ref {
        self.bdd.mk_var(self.transited)
    }

    /// Variables that do not belong to the packet header.
    pub fn state_vars(&self) -> Vec<u32> {
        let mut vars = self.source.vars();
        vars.push(self.transited);
        vars
    }

    /// Project `f` onto the header bits.
    pub fn erase_state(&self, f: Ref) -> Ref {
        self.bdd.exists(f, &self.state_vars())
    }

    /// Human-readable name of a variable, e.g. `dstIp[3]`.
    pub fn var_name(&self, var: u32) -> String {
        for (field, integer) in &self.fields {
            if (integer.first_var..integer.first_var + integer.width).contains(&var) {
                return format!("{}[{}]", field, var - integer.first_var);
            }
        }
        for (flag, &v) in &self.tcp_flags {
            if v == var {
                return format!("tcp{:?}", flag);
            }
        }
        if (self.source.first_var..self.source.first_var + SOURCE_BITS).contains(&var) {
            return format!("source[{}]", var - self.source.first_var);
        }
        if var == self.transited {
            return "transited".to_string();
        }
        format!("x{}", var)
    }

    pub fn ip(&self, field: HeaderField, ip: Ip) -> Ref {
        self.field(field).value(&self.bdd, ip.as_u32() as u64)
    }

    pub fn prefix(&self, field: HeaderField, prefix: Prefix) -> Ref {
        self.field(field)
            .prefix(&self.bdd, prefix.ip().as_u32() as u64, prefix.len() as u32)
    }

    pub fn wildcard(&self, field: HeaderField, wildcard: &IpWildcard) -> Ref {
        let care = !wildcard.wildcard() as u64;
        self.field(field)
            .masked(&self.bdd, wildcard.ip().as_u32() as u64, care)
    }

    pub fn ip_space(&self, field: HeaderField, space: &IpSpace) -> Ref {
        match space {
            IpSpace::Empty => self.bdd.zero(),
            IpSpace::Universe => self.bdd.one(),
            IpSpace::Wildcard(w) => self.wildcard(field, w),
            IpSpace::Union(spaces) => {
                let parts: Vec<Ref> = spaces.iter().map(|s| self.ip_space(field, s)).collect();
                self.bdd.apply_or_many(parts)
            }
            IpSpace::Difference(a, b) => {
                let a = self.ip_space(field, a);
                let b = self.ip_space(field, b);
                self.bdd.apply_diff(a, b)
            }
        }
    }

    fn ranges(&self, field: HeaderField, ranges: &[SubRange]) -> Ref {
        let integer = self.field(field);
        let parts: Vec<Ref> = ranges
            .iter()
            .map(|r| integer.range(&self.bdd, r.start as u64, r.end as u64))
            .collect();
        self.bdd.apply_or_many(parts)
    }

    pub fn field_match(&self, m: &FieldMatch) -> Ref {
        match m {
            FieldMatch::SrcIp(space) => self.ip_space(HeaderField::SrcIp, space),
            FieldMatch::DstIp(space) => self.ip_space(HeaderField::DstIp, space),
            FieldMatch::SrcOrDstIp(space) => {
                let src = self.ip_space(HeaderField::SrcIp, space);
                let dst = self.ip_space(HeaderField::DstIp, space);
                self.bdd.apply_or(src, dst)
            }
            FieldMatch::Ranges(field, ranges) => self.ranges(*field, ranges),
            FieldMatch::Values(field, values) => {
                let integer = self.field(*field);
                let parts: Vec<Ref> = values
                    .iter()
                    .map(|&v| integer.value(&self.bdd, v as u64))
                    .collect();
                self.bdd.apply_or_many(parts)
            }
            FieldMatch::SrcOrDstPort(ranges) => {
                let src = self.ranges(HeaderField::SrcPort, ranges);
                let dst = self.ranges(HeaderField::DstPort, ranges);
                self.bdd.apply_or(src, dst)
            }
            FieldMatch::TcpFlags(matches) => {
                let parts: Vec<Ref> = matches
                    .iter()
                    .map(|m| {
                        let literals = m.flags.iter().map(|(flag, &value)| {
                            let v = self.tcp_flags[flag] as i32;
                            if value {
                                v
                            } else {
                                -v
                            }
                        });
                        self.bdd.mk_cube(literals)
                    })
                    .collect();
                self.bdd.apply_or_many(parts)
            }
        }
    }

    /// Compile a header space into a predicate.
    pub fn header_space(&self, hs: &HeaderSpace) -> Ref {
        match hs {
            HeaderSpace::Any => self.bdd.one(),
            HeaderSpace::Field(m) => self.field_match(m),
            HeaderSpace::And(xs) => {
                let parts: Vec<Ref> = xs.iter().map(|x| self.header_space(x)).collect();
                self.bdd.apply_and_many(parts)
            }
            HeaderSpace::Or(xs) => {
                let parts: Vec<Ref> = xs.iter().map(|x| self.header_space(x)).collect();
                self.bdd.apply_or_many(parts)
            }
            HeaderSpace::Not(x) => -self.header_space(x),
        }
    }

    /// Decode the header of a (partial) model. Unassigned bits read as zero.
    pub fn decode(&self, model: &[i32]) -> Flow {
        let positive: HashSet<u32> = model.iter().filter(|&&lit| lit > 0).map(|&lit| lit as u32).collect();
        let assignment = |v: u32| positive.contains(&v);

        let mut flow = Flow::default();
        for (&field, integer) in &self.fields {
            flow.set_field(field, integer.decode(assignment) as u32);
        }
        for (&flag, &v) in &self.tcp_flags {
            flow.tcp_flags.set(flag, assignment(v));
        }
        flow
    }

    /// A minimal-commitment witness of `f`, if any.
    pub fn witness(&self, f: Ref) -> Option<Flow> {
        self.bdd.one_sat(f).map(|model| self.decode(&model))
    }

    /// The predicate satisfied exactly by the header of `flow`.
    pub fn flow_predicate(&self, flow: &Flow) -> Ref {
        let mut literals = Vec::new();
        for (&field, integer) in &self.fields {
            let value = flow.field(field) as u64;
            for i in 0..integer.width {
                let v = integer.var(i) as i32;
                literals.push(if integer.bit(value, i) { v } else { -v });
            }
        }
        for (&flag, &v) in &self.tcp_flags {
            literals.push(if flow.tcp_flags.get(flag) { v as i32 } else { -(v as i32) });
        }
        self.bdd.mk_cube(literals)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::header_space::protocol;

    #[test]
    fn test_variable_order() {
        let packet = BddPacket::default();

        assert_eq!(packet.ip_protocol().var(0), 1);
        assert_eq!(packet.dst_ip().var(0), 9);
        assert_eq!(packet.src_ip().var(0), 41);
        assert_eq!(packet.dst_port().var(0), 73);
        assert_eq!(packet.src_port().var(0), 89);
        assert_eq!(packet.field(HeaderField::IcmpCode).var(0), 105);
        assert_eq!(packet.field(HeaderField::IcmpType).var(0), 113);
        assert_eq!(packet.tcp_flags[&TcpFlag::Ack], 121);
        assert_eq!(packet.tcp_flags[&TcpFlag::Urg], 128);
        assert_eq!(packet.field(HeaderField::Dscp).var(0), 129);
        assert_eq!(packet.field(HeaderField::Ecn).var(0), 135);
        assert_eq!(packet.field(HeaderField::FragmentOffset).var(0), 137);
        assert_eq!(packet.field(HeaderField::PacketLength).var(0), 150);
        assert_eq!(packet.num_header_vars(), 165);
        assert_eq!(packet.source().var(0), 166);
        assert_eq!(packet.transited_var(), 178);
        assert_eq!(packet.num_vars(), 178);
    }

    #[test]
    fn test_range_counts() {
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let port = packet.dst_port();

        let r = port.range(bdd, 1000, 1999);
        let expected = num_bigint::BigUint::from(1000u32) << (packet.num_vars() - 16) as usize;
        assert_eq!(bdd.sat_count(r, packet.num_vars() as usize), expected);

        assert_eq!(port.range(bdd, 0, 65535), bdd.one());
        assert_eq!(port.range(bdd, 5, 4), bdd.zero());
        assert_eq!(port.range(bdd, 80, 80), port.value(bdd, 80));
        assert_eq!(port.value(bdd, 1 << 16), bdd.zero());
    }

    #[test]
    fn test_leq_geq_boundaries() {
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let proto = packet.ip_protocol();

        for v in [0u64, 1, 6, 17, 128, 254, 255] {
            let leq = proto.leq(bdd, v);
            let geq = proto.geq(bdd, v);
            for x in [0u64, 1, 5, 6, 7, 17, 18, 127, 128, 200, 255] {
                let assignment = |var: u32| proto.vars().contains(&var) && proto.bit(x, var - 1);
                assert_eq!(bdd.eval(leq, assignment), x <= v, "{} <= {}", x, v);
                assert_eq!(bdd.eval(geq, assignment), x >= v, "{} >= {}", x, v);
            }
        }
    }

    #[test]
    fn test_prefix_and_witness() {
        let packet = BddPacket::default();
        let hs = HeaderSpace::builder()
            .dst_ips(Prefix::parse("10.0.0.0/8").unwrap())
            .ip_protocols([protocol::TCP])
            .dst_ports([SubRange::new(22, 22)])
            .build();
        let f = packet.header_space(&hs);

        let flow = packet.witness(f).unwrap();
        assert_eq!(flow.dst_ip, Ip::from_octets(10, 0, 0, 0));
        assert_eq!(flow.ip_protocol, protocol::TCP);
        assert_eq!(flow.dst_port, 22);
        assert!(hs.matches(&flow));

        assert!(packet.bdd().is_implies(packet.flow_predicate(&flow), f));
    }

    #[test]
    fn test_ip_space_difference() {
        let packet = BddPacket::default();
        let space = IpSpace::prefix(Prefix::parse("10.0.0.0/8").unwrap())
            .difference(IpSpace::ip(Ip::from_octets(10, 0, 0, 0)));
        let f = packet.ip_space(HeaderField::SrcIp, &space);

        let flow = packet.witness(f).unwrap();
        assert_eq!(flow.src_ip, Ip::from_octets(10, 0, 0, 1));
    }

    #[test]
    fn test_erase_state() {
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let dst = packet.ip(HeaderField::DstIp, Ip::from_octets(1, 2, 3, 4));
        let f = bdd.apply_and_many([dst, packet.transited(), packet.source().value(bdd, 3)]);

        assert_eq!(packet.erase_state(f), dst);
    }

    #[test]
    fn test_incompatible_packets() {
        let a = BddPacket::default();
        let b = BddPacket::default();
        assert!(a.check_compatible(&a).is_ok());
        assert_eq!(a.check_compatible(&b), Err(Error::IncompatiblePacket));

        let shared = std::sync::Arc::new(BddPacket::default());
        let alias = std::sync::Arc::clone(&shared);
        assert!(alias.check_compatible(&shared).is_ok());
        assert!(shared.check_compatible(&a).is_err());
    }

    #[test]
    fn test_var_names() {
        let packet = BddPacket::default();
        assert_eq!(packet.var_name(1), "ipProtocol[0]");
        assert_eq!(packet.var_name(12), "dstIp[3]");
        assert_eq!(packet.var_name(127), "tcpSyn");
        assert_eq!(packet.var_name(178), "transited");
    }
}
