//! BDD to DOT (Graphviz) conversion.
//!
//! Terminal nodes are squares at the bottom, decision nodes are grouped by
//! variable level, high edges are solid, low edges are dashed, and
//! complemented low edges are dotted with a hollow arrowhead.
//!
//! # Examples
//!
//! ```
//! use netbdd::bdd::Bdd;
//!
//! let bdd = Bdd::default();
//! let x1 = bdd.mk_var(1);
//! let x2 = bdd.mk_var(2);
//! let f = bdd.apply_and(x1, x2);
//!
//! let dot = bdd.to_dot(&[f], |v| format!("x{}", v)).unwrap();
//! assert!(dot.starts_with("graph {"));
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::bdd::Bdd;
use crate::reference::Ref;

impl Bdd {
    /// Render the BDDs rooted at `roots`, labelling decision nodes with `namer`.
    ///
    /// [`BddPacket::var_name`](crate::packet::BddPacket::var_name) is a good
    /// namer for header-space predicates.
    pub fn to_dot<F>(&self, roots: &[Ref], namer: F) -> Result<String, std::fmt::Error>
    where
        F: Fn(u32) -> String,
    {
        let mut dot = String::new();
        writeln!(dot, "graph {{")?;
        writeln!(dot, "node [shape=circle];")?;

        writeln!(dot, "{{ rank=sink")?;
        writeln!(dot, "0 [shape=square, label=\"0\"];")?;
        writeln!(dot, "1 [shape=square, label=\"1\"];")?;
        writeln!(dot, "}}")?;

        let all_nodes = self.descendants(roots.iter().copied());

        let mut levels = BTreeMap::<u32, Vec<(usize, Ref, Ref)>>::new();
        for &id in all_nodes.iter() {
            if id == 1 {
                continue;
            }
            let (variable, low, high) = self.raw_node(id);
            levels.entry(variable).or_default().push((id, low, high));
        }

        for (&variable, level) in levels.iter() {
            writeln!(dot, "{{ rank=same")?;
            for &(id, _, _) in level.iter() {
                writeln!(dot, "{} [label=\"{}\"];", id, namer(variable))?;
            }
            writeln!(dot, "}}")?;
        }

        for level in levels.values() {
            for &(id, low, high) in level.iter() {
                debug_assert!(!high.is_negated());
                writeln!(dot, "{} -- {} [style=solid];", id, high.index())?;

                if low == Ref::ZERO {
                    writeln!(dot, "{} -- 0 [style=dashed];", id)?;
                } else if low.is_negated() {
                    writeln!(
                        dot,
                        "{} -- {} [style=dotted, dir=forward, arrowhead=odot];",
                        id,
                        low.index()
                    )?;
                } else {
                    writeln!(dot, "{} -- {} [style=dashed];", id, low.index())?;
                }
            }
        }

        writeln!(dot, "{{ rank=source")?;
        for (i, root) in roots.iter().enumerate() {
            writeln!(dot, "r{} [shape=rect, label=\"{}\"];", i, root)?;
        }
        writeln!(dot, "}}")?;

        for (i, &root) in roots.iter().enumerate() {
            if root == Ref::ZERO {
                writeln!(dot, "r{} -- 0;", i)?;
            } else if root.is_negated() {
                writeln!(dot, "r{} -- {} [dir=forward, arrowhead=odot];", i, root.index())?;
            } else {
                writeln!(dot, "r{} -- {};", i, root.index())?;
            }
        }

        writeln!(dot, "}}")?;
        Ok(dot)
    }
}
