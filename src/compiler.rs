//! Symbolic compilation of ACLs.
//!
//! An [`AclCompiler`] is created per device. It validates the reference graph
//! between the device's ACLs up front (undefined references and cycles are
//! errors), and then compiles ACLs lazily, memoizing every ACL by name so that
//! diamond-shaped references are compiled once.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::acl::{AclLine, AclLineMatchExpr, IpAccessList, LineAction};
use crate::error::{Error, Result};
use crate::packet::{BddPacket, SOURCE_BITS};
use crate::reference::Ref;

/// Assigns each interface of a device a value of the packet's source field.
///
/// Interfaces are numbered `1..=n` in name order. Value `0` stands for
/// packets originated by the device itself.
#[derive(Debug, Clone)]
pub struct SourceManager {
    hostname: String,
    values: BTreeMap<String, u32>,
}

impl SourceManager {
    pub const ORIGINATING: u32 = 0;

    pub fn new<S: AsRef<str>>(hostname: &str, interfaces: impl IntoIterator<Item = S>) -> Result<Self> {
        let names: BTreeSet<String> = interfaces.into_iter().map(|s| s.as_ref().to_string()).collect();
        let max = (1usize << SOURCE_BITS) - 1;
        if names.len() > max {
            return Err(Error::TooManyInterfaces {
                node: hostname.to_string(),
                count: names.len(),
                max,
            });
        }
        let values = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i as u32 + 1))
            .collect();
        Ok(Self {
            hostname: hostname.to_string(),
            values,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn value(&self, interface: &str) -> Option<u32> {
        self.values.get(interface).copied()
    }

    pub fn interface(&self, value: u32) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, &v)| v == value)
            .map(|(name, _)| name.as_str())
    }

    /// Packets that entered through `interface`.
    pub fn entered_through(&self, packet: &BddPacket, interface: &str) -> Result<Ref> {
        match self.value(interface) {
            Some(v) => Ok(packet.source().value(packet.bdd(), v as u64)),
            None => Err(Error::UndefinedInterface {
                node: self.hostname.clone(),
                interface: interface.to_string(),
            }),
        }
    }

    /// Packets originated by the device.
    pub fn originating(&self, packet: &BddPacket) -> Ref {
        packet.source().value(packet.bdd(), Self::ORIGINATING as u64)
    }

    /// Packets that entered through any of the named interfaces.
    ///
    /// Names that are not interfaces of this device match nothing.
    pub fn match_src_interfaces(&self, packet: &BddPacket, interfaces: &BTreeSet<String>) -> Ref {
        let parts: Vec<Ref> = interfaces
            .iter()
            .filter_map(|name| match self.value(name) {
                Some(v) => Some(packet.source().value(packet.bdd(), v as u64)),
                None => {
                    debug!("Ignoring unknown source interface {} on {}", name, self.hostname);
                    None
                }
            })
            .collect();
        packet.bdd().apply_or_many(parts)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CompiledLine {
    pub action: LineAction,
    /// Packets matched by the line in isolation.
    pub matched: Ref,
    /// Packets for which this line is the first match.
    pub reached: Ref,
}

/// BDD form of an ACL.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompiledAcl {
    pub name: String,
    pub lines: Vec<CompiledLine>,
    pub permit: Ref,
    pub deny: Ref,
}

/// Per-device ACL compiler.
pub struct AclCompiler<'a> {
    packet: &'a BddPacket,
    hostname: &'a str,
    acls: &'a BTreeMap<String, IpAccessList>,
    sources: &'a SourceManager,
    cache: BTreeMap<String, CompiledAcl>,
}

impl<'a> AclCompiler<'a> {
    pub fn new(
        packet: &'a BddPacket,
        hostname: &'a str,
        acls: &'a BTreeMap<String, IpAccessList>,
        sources: &'a SourceManager,
    ) -> Result<Self> {
        check_references(hostname, acls)?;
        Ok(Self {
            packet,
            hostname,
            acls,
            sources,
            cache: BTreeMap::new(),
        })
    }

    pub fn packet(&self) -> &'a BddPacket {
        self.packet
    }

    pub fn compile_expr(&mut self, expr: &AclLineMatchExpr) -> Ref {
        let packet = self.packet;
        let acls = self.acls;
        let bdd = packet.bdd();
        match expr {
            AclLineMatchExpr::True => bdd.one(),
            AclLineMatchExpr::False => bdd.zero(),
            AclLineMatchExpr::MatchHeaderSpace(hs) => packet.header_space(hs),
            AclLineMatchExpr::MatchSrcInterface(names) => self.sources.match_src_interfaces(packet, names),
            AclLineMatchExpr::OriginatingFromDevice => self.sources.originating(packet),
            // References were validated when the compiler was created.
            AclLineMatchExpr::PermittedByAcl(name) => match acls.get(name) {
                Some(acl) => self.compile_list(acl).permit,
                None => bdd.zero(),
            },
            AclLineMatchExpr::And(es) => {
                let mut res = bdd.one();
                for e in es {
                    let r = self.compile_expr(e);
                    res = bdd.apply_and(res, r);
                }
                res
            }
            AclLineMatchExpr::Or(es) => {
                let mut res = bdd.zero();
                for e in es {
                    let r = self.compile_expr(e);
                    res = bdd.apply_or(res, r);
                }
                res
            }
            AclLineMatchExpr::Not(e) => -self.compile_expr(e),
        }
    }

    /// Compile a named ACL of this device.
    pub fn compile(&mut self, name: &str) -> Result<CompiledAcl> {
        let acls = self.acls;
        match acls.get(name) {
            Some(acl) => Ok(self.compile_list(acl)),
            None => Err(Error::UndefinedAclReference {
                hostname: self.hostname.to_string(),
                acl: name.to_string(),
                reference: name.to_string(),
            }),
        }
    }

    pub fn permit(&mut self, name: &str) -> Result<Ref> {
        Ok(self.compile(name)?.permit)
    }

    fn compile_list(&mut self, acl: &IpAccessList) -> CompiledAcl {
        if let Some(compiled) = self.cache.get(&acl.name) {
            return compiled.clone();
        }
        debug!("Compiling ACL {} on {}", acl.name, self.hostname);

        let compiled = self.compile_lines(&acl.name, &acl.lines);
        self.cache.insert(acl.name.clone(), compiled.clone());
        compiled
    }

    /// Compile lines with first-match semantics and an implicit trailing deny.
    ///
    /// The result is not memoized, so this also serves specialized or
    /// truncated line lists.
    pub fn compile_lines(&mut self, name: &str, lines: &[AclLine]) -> CompiledAcl {
        let packet = self.packet;
        let bdd = packet.bdd();
        let mut seen = bdd.zero();
        let mut permit = bdd.zero();
        let mut compiled = Vec::with_capacity(lines.len());

        for line in lines {
            let matched = self.compile_expr(&line.match_expr);
            let reached = bdd.apply_diff(matched, seen);
            if line.action == LineAction::Permit {
                permit = bdd.apply_or(permit, reached);
            }
            seen = bdd.apply_or(seen, matched);
            compiled.push(CompiledLine {
                action: line.action,
                matched,
                reached,
            });
        }

        CompiledAcl {
            name: name.to_string(),
            lines: compiled,
            permit,
            deny: -permit,
        }
    }
}

/// Validate the reference graph between the ACLs of one device.
///
/// Walks the dependency map depth-first in name order, keeping the current
/// path on a stack. A back edge yields the cycle, starting and ending with the
/// same ACL.
pub fn check_references(hostname: &str, acls: &BTreeMap<String, IpAccessList>) -> Result<()> {
    let deps: BTreeMap<&str, BTreeSet<&str>> = acls
        .iter()
        .map(|(name, acl)| (name.as_str(), acl.references()))
        .collect();

    for (&acl, refs) in &deps {
        for &reference in refs {
            if !deps.contains_key(reference) {
                return Err(Error::UndefinedAclReference {
                    hostname: hostname.to_string(),
                    acl: acl.to_string(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    let mut done = BTreeSet::new();
    for &root in deps.keys() {
        if done.contains(root) {
            continue;
        }
        // Explicit stack of (node, remaining successors).
        let mut path: Vec<&str> = vec![root];
        let mut stack: Vec<Vec<&str>> = vec![deps[root].iter().rev().copied().collect()];

        while let Some(successors) = stack.last_mut() {
            match successors.pop() {
                Some(next) => {
                    if let Some(pos) = path.iter().position(|&n| n == next) {
                        let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                        cycle.push(next.to_string());
                        return Err(Error::CyclicAclReference {
                            hostname: hostname.to_string(),
                            cycle,
                        });
                    }
                    if !done.contains(next) {
                        path.push(next);
                        stack.push(deps[next].iter().rev().copied().collect());
                    }
                }
                None => {
                    stack.pop();
                    if let Some(node) = path.pop() {
                        done.insert(node);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Simplifies ACLs with respect to a constraint on the packets of interest.
///
/// Header-space matches that are disjoint from the constraint become
/// `False`, and those implied by it become `True`. Packets inside the
/// constraint get the same decision from the specialized ACL.
pub struct AclSpecializer<'a> {
    packet: &'a BddPacket,
    constraint: Ref,
}

impl<'a> AclSpecializer<'a> {
    pub fn new(packet: &'a BddPacket, constraint: Ref) -> Self {
        Self { packet, constraint }
    }

    pub fn specialize_expr(&self, expr: &AclLineMatchExpr) -> AclLineMatchExpr {
        let bdd = self.packet.bdd();
        match expr {
            AclLineMatchExpr::MatchHeaderSpace(hs) => {
                let f = self.packet.header_space(hs);
                if !bdd.and_sat(f, self.constraint) {
                    AclLineMatchExpr::False
                } else if bdd.is_implies(self.constraint, f) {
                    AclLineMatchExpr::True
                } else {
                    expr.clone()
                }
            }
            AclLineMatchExpr::And(es) => {
                let mut out = Vec::new();
                for e in es {
                    match self.specialize_expr(e) {
                        AclLineMatchExpr::True => {}
                        AclLineMatchExpr::False => return AclLineMatchExpr::False,
                        e => out.push(e),
                    }
                }
                match out.len() {
                    0 => AclLineMatchExpr::True,
                    1 => out.swap_remove(0),
                    _ => AclLineMatchExpr::And(out),
                }
            }
            AclLineMatchExpr::Or(es) => {
                let mut out = Vec::new();
                for e in es {
                    match self.specialize_expr(e) {
                        AclLineMatchExpr::False => {}
                        AclLineMatchExpr::True => return AclLineMatchExpr::True,
                        e => out.push(e),
                    }
                }
                match out.len() {
                    0 => AclLineMatchExpr::False,
                    1 => out.swap_remove(0),
                    _ => AclLineMatchExpr::Or(out),
                }
            }
            AclLineMatchExpr::Not(e) => self.specialize_expr(e).negate(),
            _ => expr.clone(),
        }
    }

    pub fn specialize(&self, acl: &IpAccessList) -> IpAccessList {
        let lines = acl
            .lines
            .iter()
            .map(|line| AclLine::new(line.name.clone(), self.specialize_expr(&line.match_expr), line.action))
            .collect();
        IpAccessList::new(acl.name.clone(), lines)
    }

    /// Specialize lines `0..=last` of `name` and every ACL it depends on.
    pub fn specialize_upto(
        &self,
        acls: &BTreeMap<String, IpAccessList>,
        name: &str,
        last: usize,
    ) -> BTreeMap<String, IpAccessList> {
        let mut out = BTreeMap::new();
        let mut queue = vec![name];
        while let Some(current) = queue.pop() {
            if out.contains_key(current) {
                continue;
            }
            let Some(acl) = acls.get(current) else {
                continue;
            };
            let mut specialized = self.specialize(acl);
            if current == name {
                specialized.lines.truncate(last + 1);
            }
            queue.extend(acl.references());
            out.insert(current.to_string(), specialized);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::acl::AclLine;
    use crate::header_space::HeaderSpace;
    use crate::ip::{Ip, Prefix};

    fn src(prefix: &str) -> AclLineMatchExpr {
        AclLineMatchExpr::header_space(HeaderSpace::builder().src_ips(Prefix::parse(prefix).unwrap()).build())
    }

    fn acl_map(acls: Vec<IpAccessList>) -> BTreeMap<String, IpAccessList> {
        acls.into_iter().map(|a| (a.name.clone(), a)).collect()
    }

    #[test]
    fn test_first_match_compilation() {
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let sources = SourceManager::new("r1", ["eth0"]).unwrap();
        let acls = acl_map(vec![IpAccessList::new(
            "A",
            vec![
                AclLine::deny("d", src("10.1.0.0/16")),
                AclLine::permit("p", src("10.0.0.0/8")),
            ],
        )]);
        let mut compiler = AclCompiler::new(&packet, "r1", &acls, &sources).unwrap();
        let compiled = compiler.compile("A").unwrap();

        let ten = packet.header_space(&HeaderSpace::builder().src_ips(Prefix::parse("10.0.0.0/8").unwrap()).build());
        let ten_one = packet.header_space(
            &HeaderSpace::builder()
                .src_ips(Prefix::parse("10.1.0.0/16").unwrap())
                .build(),
        );
        assert_eq!(compiled.permit, bdd.apply_diff(ten, ten_one));
        assert_eq!(compiled.deny, -compiled.permit);
        assert_eq!(compiled.lines[1].matched, ten);
        assert_eq!(compiled.lines[1].reached, compiled.permit);
    }

    #[test]
    fn test_default_deny() {
        let packet = BddPacket::default();
        let sources = SourceManager::new("r1", Vec::<String>::new()).unwrap();
        let acls = acl_map(vec![IpAccessList::new("empty", vec![])]);
        let mut compiler = AclCompiler::new(&packet, "r1", &acls, &sources).unwrap();
        assert_eq!(compiler.permit("empty").unwrap(), packet.bdd().zero());
    }

    #[test]
    fn test_permitted_by_acl_diamond() {
        let packet = BddPacket::default();
        let sources = SourceManager::new("r1", ["eth0"]).unwrap();
        let acls = acl_map(vec![
            IpAccessList::new("base", vec![AclLine::permit("p", src("10.0.0.0/8"))]),
            IpAccessList::new("left", vec![AclLine::permit("p", AclLineMatchExpr::permitted_by("base"))]),
            IpAccessList::new("right", vec![AclLine::permit("p", AclLineMatchExpr::permitted_by("base"))]),
            IpAccessList::new(
                "top",
                vec![AclLine::permit(
                    "p",
                    AclLineMatchExpr::And(vec![
                        AclLineMatchExpr::permitted_by("left"),
                        AclLineMatchExpr::permitted_by("right"),
                    ]),
                )],
            ),
        ]);
        let mut compiler = AclCompiler::new(&packet, "r1", &acls, &sources).unwrap();
        let top = compiler.permit("top").unwrap();
        let base = compiler.permit("base").unwrap();
        assert_eq!(top, base);
    }

    #[test]
    fn test_cycle_is_reported() {
        let acls = acl_map(vec![
            IpAccessList::new("a", vec![AclLine::permit("p", AclLineMatchExpr::permitted_by("b"))]),
            IpAccessList::new("b", vec![AclLine::permit("p", AclLineMatchExpr::permitted_by("c"))]),
            IpAccessList::new("c", vec![AclLine::permit("p", AclLineMatchExpr::permitted_by("a"))]),
        ]);
        let err = check_references("r1", &acls).unwrap_err();
        assert_eq!(
            err,
            Error::CyclicAclReference {
                hostname: "r1".to_string(),
                cycle: vec!["a".to_string(), "b".to_string(), "c".to_string(), "a".to_string()],
            }
        );
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let acls = acl_map(vec![IpAccessList::new(
            "a",
            vec![AclLine::permit("p", AclLineMatchExpr::permitted_by("a"))],
        )]);
        assert!(matches!(
            check_references("r1", &acls),
            Err(Error::CyclicAclReference { cycle, .. }) if cycle == vec!["a".to_string(), "a".to_string()]
        ));
    }

    #[test]
    fn test_undefined_reference() {
        let acls = acl_map(vec![IpAccessList::new(
            "a",
            vec![AclLine::permit("p", AclLineMatchExpr::permitted_by("missing"))],
        )]);
        assert_eq!(
            check_references("r1", &acls),
            Err(Error::UndefinedAclReference {
                hostname: "r1".to_string(),
                acl: "a".to_string(),
                reference: "missing".to_string(),
            })
        );
    }

    #[test]
    fn test_source_manager() {
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let sources = SourceManager::new("r1", ["eth1", "eth0"]).unwrap();

        assert_eq!(sources.value("eth0"), Some(1));
        assert_eq!(sources.value("eth1"), Some(2));
        assert_eq!(sources.interface(2), Some("eth1"));

        let names = BTreeSet::from(["eth0".to_string(), "bogus".to_string()]);
        let m = sources.match_src_interfaces(&packet, &names);
        assert_eq!(m, sources.entered_through(&packet, "eth0").unwrap());
        assert!(!bdd.and_sat(m, sources.originating(&packet)));
        assert!(matches!(
            sources.entered_through(&packet, "eth9"),
            Err(Error::UndefinedInterface { .. })
        ));

        let too_many: Vec<String> = (0..4096).map(|i| format!("eth{}", i)).collect();
        assert!(matches!(
            SourceManager::new("big", too_many),
            Err(Error::TooManyInterfaces { count: 4096, .. })
        ));
    }

    #[test]
    fn test_specializer() {
        let packet = BddPacket::default();
        let bdd = packet.bdd();
        let sources = SourceManager::new("r1", ["eth0"]).unwrap();
        let acls = acl_map(vec![
            IpAccessList::new("inner", vec![AclLine::permit("p", src("10.0.0.0/8"))]),
            IpAccessList::new(
                "outer",
                vec![
                    AclLine::deny("d", src("192.168.0.0/16")),
                    AclLine::permit("p", AclLineMatchExpr::permitted_by("inner")),
                    AclLine::permit("tail", AclLineMatchExpr::True),
                ],
            ),
            IpAccessList::new("unrelated", vec![]),
        ]);
        let constraint = packet.header_space(
            &HeaderSpace::builder()
                .src_ips(Prefix::parse("10.1.0.0/16").unwrap())
                .build(),
        );

        let specializer = AclSpecializer::new(&packet, constraint);
        let specialized = specializer.specialize_upto(&acls, "outer", 1);

        assert_eq!(specialized.len(), 2);
        let outer = &specialized["outer"];
        assert_eq!(outer.lines.len(), 2);
        assert_eq!(outer.lines[0].match_expr, AclLineMatchExpr::False);
        assert_eq!(specialized["inner"].lines[0].match_expr, AclLineMatchExpr::True);

        // Within the constraint, decisions are unchanged.
        let mut original = AclCompiler::new(&packet, "r1", &acls, &sources).unwrap();
        let mut special = AclCompiler::new(&packet, "r1", &specialized, &sources).unwrap();
        let a = bdd.apply_and(original.permit("outer").unwrap(), constraint);
        let b = bdd.apply_and(special.permit("outer").unwrap(), constraint);
        assert_eq!(a, b);

        let point = packet.ip(crate::header_space::HeaderField::SrcIp, Ip::from_octets(10, 1, 2, 3));
        assert!(bdd.is_implies(point, b));
    }
}
