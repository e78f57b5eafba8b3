//! Access control lists and their match expressions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::header_space::HeaderSpace;

/// Boolean predicate of a single ACL line.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AclLineMatchExpr {
    True,
    False,
    MatchHeaderSpace(HeaderSpace),
    /// Packet entered the device through one of the named interfaces.
    MatchSrcInterface(BTreeSet<String>),
    /// Packet was originated by the device itself.
    OriginatingFromDevice,
    /// Packet is permitted by another ACL of the same device.
    PermittedByAcl(String),
    And(Vec<AclLineMatchExpr>),
    Or(Vec<AclLineMatchExpr>),
    Not(Box<AclLineMatchExpr>),
}

impl AclLineMatchExpr {
    pub fn header_space(hs: HeaderSpace) -> Self {
        AclLineMatchExpr::MatchHeaderSpace(hs)
    }

    pub fn src_interfaces<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        AclLineMatchExpr::MatchSrcInterface(names.into_iter().map(Into::into).collect())
    }

    pub fn permitted_by(acl: impl Into<String>) -> Self {
        AclLineMatchExpr::PermittedByAcl(acl.into())
    }

    pub fn negate(self) -> Self {
        match self {
            AclLineMatchExpr::Not(e) => *e,
            AclLineMatchExpr::True => AclLineMatchExpr::False,
            AclLineMatchExpr::False => AclLineMatchExpr::True,
            e => AclLineMatchExpr::Not(Box::new(e)),
        }
    }

    /// Names of ACLs referenced through [`AclLineMatchExpr::PermittedByAcl`].
    pub fn collect_references<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            AclLineMatchExpr::PermittedByAcl(name) => {
                out.insert(name.as_str());
            }
            AclLineMatchExpr::And(es) | AclLineMatchExpr::Or(es) => {
                for e in es {
                    e.collect_references(out);
                }
            }
            AclLineMatchExpr::Not(e) => e.collect_references(out),
            _ => {}
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineAction {
    Permit,
    Deny,
}

impl Display for LineAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LineAction::Permit => f.write_str("PERMIT"),
            LineAction::Deny => f.write_str("DENY"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct AclLine {
    pub name: String,
    pub match_expr: AclLineMatchExpr,
    pub action: LineAction,
}

impl AclLine {
    pub fn new(name: impl Into<String>, match_expr: AclLineMatchExpr, action: LineAction) -> Self {
        Self {
            name: name.into(),
            match_expr,
            action,
        }
    }

    pub fn permit(name: impl Into<String>, match_expr: AclLineMatchExpr) -> Self {
        Self::new(name, match_expr, LineAction::Permit)
    }

    pub fn deny(name: impl Into<String>, match_expr: AclLineMatchExpr) -> Self {
        Self::new(name, match_expr, LineAction::Deny)
    }
}

/// Ordered list of lines with an implicit trailing deny.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IpAccessList {
    pub name: String,
    pub lines: Vec<AclLine>,
}

/// Outcome of running a concrete flow through an ACL.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FilterResult {
    pub action: LineAction,
    /// Index of the first matching line, `None` for the implicit deny.
    pub line: Option<usize>,
}

impl IpAccessList {
    pub fn new(name: impl Into<String>, lines: Vec<AclLine>) -> Self {
        Self {
            name: name.into(),
            lines,
        }
    }

    pub fn references(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for line in &self.lines {
            line.match_expr.collect_references(&mut out);
        }
        out
    }

    /// Line-by-line evaluation: the first matching line decides.
    ///
    /// `src_interface` is `None` for packets originated by the device.
    /// References to other ACLs are looked up in `acls`; an undefined one
    /// matches nothing and a reference back into the current chain fails with
    /// [`Error::CyclicAclReference`].
    pub fn filter<'a>(
        &'a self,
        hostname: &str,
        flow: &Flow,
        src_interface: Option<&str>,
        acls: &'a BTreeMap<String, IpAccessList>,
    ) -> Result<FilterResult> {
        let mut env = Env {
            hostname,
            flow,
            src_interface,
            acls,
            path: vec![self.name.as_str()],
        };
        self.first_match(&mut env)
    }

    fn first_match<'a>(&'a self, env: &mut Env<'a, '_>) -> Result<FilterResult> {
        for (i, line) in self.lines.iter().enumerate() {
            if env.evaluate(&line.match_expr)? {
                return Ok(FilterResult {
                    action: line.action,
                    line: Some(i),
                });
            }
        }
        Ok(FilterResult {
            action: LineAction::Deny,
            line: None,
        })
    }
}

/// Concrete evaluation context; `path` is the chain of ACLs being evaluated.
struct Env<'a, 'f> {
    hostname: &'f str,
    flow: &'f Flow,
    src_interface: Option<&'f str>,
    acls: &'a BTreeMap<String, IpAccessList>,
    path: Vec<&'a str>,
}

impl<'a> Env<'a, '_> {
    fn evaluate(&mut self, expr: &'a AclLineMatchExpr) -> Result<bool> {
        Ok(match expr {
            AclLineMatchExpr::True => true,
            AclLineMatchExpr::False => false,
            AclLineMatchExpr::MatchHeaderSpace(hs) => hs.matches(self.flow),
            AclLineMatchExpr::MatchSrcInterface(names) => self.src_interface.is_some_and(|i| names.contains(i)),
            AclLineMatchExpr::OriginatingFromDevice => self.src_interface.is_none(),
            AclLineMatchExpr::PermittedByAcl(name) => {
                if let Some(pos) = self.path.iter().position(|&n| n == name.as_str()) {
                    let mut cycle: Vec<String> = self.path[pos..].iter().map(|s| s.to_string()).collect();
                    cycle.push(name.clone());
                    return Err(Error::CyclicAclReference {
                        hostname: self.hostname.to_string(),
                        cycle,
                    });
                }
                let acls = self.acls;
                let Some(acl) = acls.get(name) else {
                    return Ok(false);
                };
                self.path.push(name.as_str());
                let result = acl.first_match(self);
                self.path.pop();
                result?.action == LineAction::Permit
            }
            AclLineMatchExpr::And(es) => {
                for e in es {
                    if !self.evaluate(e)? {
                        return Ok(false);
                    }
                }
                true
            }
            AclLineMatchExpr::Or(es) => {
                for e in es {
                    if self.evaluate(e)? {
                        return Ok(true);
                    }
                }
                false
            }
            AclLineMatchExpr::Not(e) => !self.evaluate(e)?,
        })
    }
}
