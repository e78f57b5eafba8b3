//! The BDD manager.
//!
//! All nodes live in one hash-consed [`Table`], so every boolean function over
//! the fixed variable order has exactly one [`Ref`] (modulo the complement
//! bit). Variables are 1-based and ordered by index: variable `1` is closest
//! to the root.
//!
//! Unlike a single-threaded manager, [`Bdd`] keeps its node table and caches
//! behind a [`Mutex`], so one manager can back predicates that are read by
//! several solver threads. Every public operation takes the lock once and
//! runs the whole recursive algorithm on the unlocked [`Manager`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::cache::Cache;
use crate::reference::Ref;
use crate::table::Table;
use crate::utils::{pairing3, MyHash};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Node {
    variable: u32,
    low: Ref,
    high: Ref,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            variable: 0,
            low: Ref::ZERO,
            high: Ref::ZERO,
        }
    }
}

impl MyHash for Node {
    fn hash(&self) -> u64 {
        pairing3(
            self.variable as u64,
            self.low.as_lit() as u64,
            self.high.as_lit() as u64,
        )
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
enum OpKey {
    Ite(Ref, Ref, Ref),
    Exists(Ref, Ref),
}

impl MyHash for OpKey {
    fn hash(&self) -> u64 {
        match *self {
            OpKey::Ite(f, g, h) => pairing3(MyHash::hash(&f), MyHash::hash(&g), MyHash::hash(&h)),
            OpKey::Exists(f, vars) => pairing3(0, MyHash::hash(&f), MyHash::hash(&vars)),
        }
    }
}

pub(crate) struct Manager {
    storage: Table<Node>,
    cache: Cache<OpKey, Ref>,
}

impl Manager {
    fn new(storage_bits: usize) -> Self {
        let mut storage = Table::new(storage_bits);

        // Allocate the terminal node:
        let one = storage.add(Node::default());
        assert_eq!(one, 1); // Make sure the terminal node is (1).

        Self {
            storage,
            cache: Cache::new(storage_bits.min(16)),
        }
    }

    fn variable(&self, node: Ref) -> u32 {
        self.storage.value(node.index()).variable
    }

    pub(crate) fn low_node(&self, node: Ref) -> Ref {
        let low = self.storage.value(node.index()).low;
        if node.is_negated() {
            -low
        } else {
            low
        }
    }

    pub(crate) fn high_node(&self, node: Ref) -> Ref {
        let high = self.storage.value(node.index()).high;
        if node.is_negated() {
            -high
        } else {
            high
        }
    }

    fn is_terminal(&self, node: Ref) -> bool {
        node.index() == Ref::ONE.index()
    }

    fn mk_node(&mut self, v: u32, low: Ref, high: Ref) -> Ref {
        assert_ne!(v, 0, "Variable index should not be zero");

        // Handle canonicity
        if high.is_negated() {
            return -self.mk_node(v, -low, -high);
        }

        // Handle duplicates
        if low == high {
            return low;
        }

        let i = self.storage.put(Node {
            variable: v,
            low,
            high,
        });
        Ref::positive(i as u32)
    }

    fn top_cofactors(&self, node: Ref, v: u32) -> (Ref, Ref) {
        if self.is_terminal(node) || v < self.variable(node) {
            return (node, node);
        }
        debug_assert_eq!(v, self.variable(node));
        (self.low_node(node), self.high_node(node))
    }

    fn apply_ite(&mut self, f: Ref, g: Ref, h: Ref) -> Ref {
        // Base cases:
        //   ite(1,G,H) => G
        //   ite(0,G,H) => H
        if f == Ref::ONE {
            return g;
        }
        if f == Ref::ZERO {
            return h;
        }

        // More base cases:
        //   ite(F,G,G) => G
        //   ite(F,1,0) => F
        //   ite(F,0,1) => ~F
        //   ite(F,1,~F) => 1
        //   ite(F,F,1) => 1
        //   ite(F,~F,0) => 0
        //   ite(F,0,F) => F
        if g == h {
            return g;
        }
        if g == Ref::ONE && h == Ref::ZERO {
            return f;
        }
        if g == Ref::ZERO && h == Ref::ONE {
            return -f;
        }
        if g == Ref::ONE && h == -f {
            return Ref::ONE;
        }
        if g == f && h == Ref::ONE {
            return Ref::ONE;
        }
        if g == -f && h == Ref::ZERO {
            return Ref::ZERO;
        }
        if g == Ref::ZERO && h == f {
            return f;
        }

        // Standard triples:
        //   ite(F,F,H) => ite(F,1,H)
        //   ite(F,G,F) => ite(F,G,0)
        //   ite(F,~F,H) => ite(F,0,H)
        //   ite(F,G,~F) => ite(F,G,1)
        if g == f {
            return self.apply_ite(f, Ref::ONE, h);
        }
        if h == f {
            return self.apply_ite(f, g, Ref::ZERO);
        }
        if g == -f {
            return self.apply_ite(f, Ref::ZERO, h);
        }
        if h == -f {
            return self.apply_ite(f, g, Ref::ONE);
        }

        let i = self.variable(f);
        let j = self.variable(g);
        let k = self.variable(h);

        // Equivalent pairs (choose the one with the lowest top variable):
        //   ite(F,1,H) == ite(H,1,F) == F ∨ H
        //   ite(F,G,0) == ite(G,F,0) == F ∧ G
        //   ite(F,G,1) == ite(~G,~F,1) == F -> G
        //   ite(F,0,H) == ite(~H,0,~F) == ~F ∧ H
        //   ite(F,G,~G) == ite(G,F,~F)
        if g == Ref::ONE && k < i {
            return self.apply_ite(h, Ref::ONE, f);
        }
        if h == Ref::ZERO && j < i {
            return self.apply_ite(g, f, Ref::ZERO);
        }
        if h == Ref::ONE && j < i {
            return self.apply_ite(-g, -f, Ref::ONE);
        }
        if g == Ref::ZERO && k < i {
            return self.apply_ite(-h, Ref::ZERO, -f);
        }
        if g == -h && j < i {
            return self.apply_ite(g, f, -f);
        }

        // Make sure the first two pointers (f and g) are regular (not negated)
        let (mut f, mut g, mut h) = (f, g, h);

        // ite(~F,G,H) => ite(F,H,G)
        if f.is_negated() {
            f = -f;
            std::mem::swap(&mut g, &mut h);
        }

        // ite(F,~G,H) => ~ite(F,G,~H)
        let mut n = false;
        if g.is_negated() {
            n = true;
            g = -g;
            h = -h;
        }

        let key = OpKey::Ite(f, g, h);
        if let Some(res) = self.cache.get(&key) {
            return if n { -res } else { res };
        }

        // Determine the top variable:
        let mut m = self.variable(f);
        for x in [g, h] {
            if !self.is_terminal(x) {
                m = m.min(self.variable(x));
            }
        }
        assert_ne!(m, 0);

        let (f0, f1) = self.top_cofactors(f, m);
        let (g0, g1) = self.top_cofactors(g, m);
        let (h0, h1) = self.top_cofactors(h, m);

        let e = self.apply_ite(f0, g0, h0);
        let t = self.apply_ite(f1, g1, h1);

        let res = self.mk_node(m, e, t);
        self.cache.insert(key, res);

        if n {
            -res
        } else {
            res
        }
    }

    /// Existential quantification of `f` over the variables of the positive cube `vars`.
    fn exists(&mut self, f: Ref, vars: Ref) -> Ref {
        if self.is_terminal(f) || vars == Ref::ONE {
            return f;
        }

        let v = self.variable(f);

        // Skip quantified variables that are above the top of `f`:
        let mut vars = vars;
        while vars != Ref::ONE && self.variable(vars) < v {
            vars = self.high_node(vars);
        }
        if vars == Ref::ONE {
            return f;
        }

        let key = OpKey::Exists(f, vars);
        if let Some(res) = self.cache.get(&key) {
            return res;
        }

        let (f0, f1) = self.top_cofactors(f, v);
        let res = if self.variable(vars) == v {
            let rest = self.high_node(vars);
            let low = self.exists(f0, rest);
            if low == Ref::ONE {
                Ref::ONE
            } else {
                let high = self.exists(f1, rest);
                self.apply_ite(low, Ref::ONE, high)
            }
        } else {
            let low = self.exists(f0, vars);
            let high = self.exists(f1, vars);
            self.mk_node(v, low, high)
        };

        self.cache.insert(key, res);
        res
    }

    fn restrict(
        &mut self,
        f: Ref,
        values: &BTreeMap<u32, bool>,
        cache: &mut std::collections::HashMap<Ref, Ref>,
    ) -> Ref {
        if self.is_terminal(f) || values.is_empty() {
            return f;
        }
        if let Some(&res) = cache.get(&f) {
            return res;
        }

        let i = self.variable(f);
        let res = match values.get(&i) {
            // `i` needs to be assigned true
            Some(true) => {
                let high = self.high_node(f);
                self.restrict(high, values, cache)
            }
            // `i` needs to be assigned false
            Some(false) => {
                let low = self.low_node(f);
                self.restrict(low, values, cache)
            }
            // `i` does not need to be assigned
            None => {
                let (f0, f1) = (self.low_node(f), self.high_node(f));
                let low = self.restrict(f0, values, cache);
                let high = self.restrict(f1, values, cache);
                self.mk_node(i, low, high)
            }
        };
        cache.insert(f, res);
        res
    }

    fn descendants(&self, nodes: impl IntoIterator<Item = Ref>) -> HashSet<usize> {
        let mut visited = HashSet::new();
        visited.insert(Ref::ONE.index());
        let mut queue = VecDeque::from_iter(nodes);

        while let Some(node) = queue.pop_front() {
            let i = node.index();
            if visited.insert(i) {
                queue.push_back(self.low_node(node));
                queue.push_back(self.high_node(node));
            }
        }

        visited
    }

    pub(crate) fn top_variable(&self, node: Ref) -> Option<u32> {
        if self.is_terminal(node) {
            None
        } else {
            Some(self.variable(node))
        }
    }
}

/// Thread-safe BDD manager.
pub struct Bdd {
    inner: Mutex<Manager>,
}

impl Bdd {
    pub fn new(storage_bits: usize) -> Self {
        assert!(
            storage_bits <= 31,
            "Storage bits should be in the range 0..=31"
        );
        Self {
            inner: Mutex::new(Manager::new(storage_bits)),
        }
    }

    pub(crate) fn manager(&self) -> MutexGuard<'_, Manager> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Bdd {
    fn default() -> Self {
        Bdd::new(16)
    }
}

impl Debug for Bdd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let manager = self.manager();
        f.debug_struct("Bdd")
            .field("size", &manager.storage.size())
            .field("buckets", &manager.storage.num_buckets())
            .field("cache_size", &manager.cache.len())
            .finish()
    }
}

impl Bdd {
    pub fn zero(&self) -> Ref {
        Ref::ZERO
    }
    pub fn one(&self) -> Ref {
        Ref::ONE
    }

    pub fn is_zero(&self, node: Ref) -> bool {
        node == Ref::ZERO
    }
    pub fn is_one(&self, node: Ref) -> bool {
        node == Ref::ONE
    }
    pub fn is_terminal(&self, node: Ref) -> bool {
        self.is_zero(node) || self.is_one(node)
    }

    /// Number of decision nodes allocated so far.
    pub fn num_nodes(&self) -> usize {
        self.manager().storage.size() - 1
    }

    /// Cache hits and misses of the computed table.
    pub fn cache_stats(&self) -> (usize, usize) {
        let manager = self.manager();
        (manager.cache.hits(), manager.cache.misses())
    }

    /// Top variable of `node`, `0` for terminals.
    pub fn variable(&self, node: Ref) -> u32 {
        self.manager().top_variable(node).unwrap_or(0)
    }

    pub fn low_node(&self, node: Ref) -> Ref {
        self.manager().low_node(node)
    }
    pub fn high_node(&self, node: Ref) -> Ref {
        self.manager().high_node(node)
    }

    pub fn mk_node(&self, v: u32, low: Ref, high: Ref) -> Ref {
        debug!("mk(v = {}, low = {}, high = {})", v, low, high);
        self.manager().mk_node(v, low, high)
    }

    pub fn mk_var(&self, v: u32) -> Ref {
        assert_ne!(v, 0, "Variable index should not be zero");
        self.mk_node(v, Ref::ZERO, Ref::ONE)
    }

    /// Conjunction of DIMACS-style literals.
    pub fn mk_cube(&self, literals: impl IntoIterator<Item = i32>) -> Ref {
        let mut literals = literals.into_iter().collect::<Vec<_>>();
        literals.sort_by_key(|&v| std::cmp::Reverse(v.unsigned_abs()));
        debug!("cube(literals = {:?})", literals);
        let mut manager = self.manager();
        let mut current = Ref::ONE;
        for lit in literals {
            assert_ne!(lit, 0, "Variable index should not be zero");
            let v = lit.unsigned_abs();
            current = if lit < 0 {
                manager.mk_node(v, current, Ref::ZERO)
            } else {
                manager.mk_node(v, Ref::ZERO, current)
            };
        }
        current
    }

    /// Disjunction of DIMACS-style literals.
    pub fn mk_clause(&self, literals: impl IntoIterator<Item = i32>) -> Ref {
        -self.mk_cube(literals.into_iter().map(|lit| -lit))
    }

    /// Apply the ITE operation to the arguments.
    ///
    /// ```text
    /// ITE(x, y, z) = (x ∧ y) ∨ (¬x ∧ z)
    /// ```
    ///
    /// # Examples
    ///
    /// ```
    /// use netbdd::bdd::Bdd;
    ///
    /// let bdd = Bdd::default();
    /// let x = bdd.mk_var(1);
    /// let y = bdd.mk_var(2);
    /// let z = bdd.mk_var(3);
    /// let f = bdd.apply_ite(x, y, z);
    /// let x_and_y = bdd.apply_and(x, y);
    /// let not_x_and_z = bdd.apply_and(-x, z);
    /// assert_eq!(f, bdd.apply_or(x_and_y, not_x_and_z));
    /// ```
    pub fn apply_ite(&self, f: Ref, g: Ref, h: Ref) -> Ref {
        debug!("apply_ite(f = {}, g = {}, h = {})", f, g, h);
        self.manager().apply_ite(f, g, h)
    }

    pub fn apply_not(&self, f: Ref) -> Ref {
        -f
    }

    pub fn apply_and(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, v, Ref::ZERO)
    }

    pub fn apply_or(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, Ref::ONE, v)
    }

    pub fn apply_xor(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, -v, v)
    }

    pub fn apply_eq(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, v, -v)
    }

    pub fn apply_imply(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, v, Ref::ONE)
    }

    /// Set difference: `u ∧ ¬v`.
    pub fn apply_diff(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, -v, Ref::ZERO)
    }

    pub fn apply_and_many(&self, nodes: impl IntoIterator<Item = Ref>) -> Ref {
        let mut manager = self.manager();
        let mut res = Ref::ONE;
        for node in nodes {
            res = manager.apply_ite(res, node, Ref::ZERO);
            if res == Ref::ZERO {
                break;
            }
        }
        res
    }

    pub fn apply_or_many(&self, nodes: impl IntoIterator<Item = Ref>) -> Ref {
        let mut manager = self.manager();
        let mut res = Ref::ZERO;
        for node in nodes {
            res = manager.apply_ite(res, Ref::ONE, node);
            if res == Ref::ONE {
                break;
            }
        }
        res
    }

    /// Whether `u ∧ v` is satisfiable.
    pub fn and_sat(&self, u: Ref, v: Ref) -> bool {
        !self.is_zero(self.apply_and(u, v))
    }

    pub fn is_implies(&self, f: Ref, g: Ref) -> bool {
        debug!("is_implies(f = {}, g = {})", f, g);
        self.is_zero(self.apply_diff(f, g))
    }

    /// Existentially quantify `f` over all `vars`.
    pub fn exists(&self, f: Ref, vars: &[u32]) -> Ref {
        debug!("exists(f = {}, vars = {:?})", f, vars);
        let cube = self.mk_cube(vars.iter().map(|&v| v as i32));
        self.manager().exists(f, cube)
    }

    /// Cofactor `f` by a partial assignment.
    pub fn restrict(&self, f: Ref, values: &BTreeMap<u32, bool>) -> Ref {
        debug!("restrict(f = {}, values = {:?})", f, values);
        let mut cache = std::collections::HashMap::new();
        self.manager().restrict(f, values, &mut cache)
    }

    pub fn descendants(&self, nodes: impl IntoIterator<Item = Ref>) -> HashSet<usize> {
        self.manager().descendants(nodes)
    }

    /// Raw `(variable, low, high)` triple of the node stored at `index`.
    pub(crate) fn raw_node(&self, index: usize) -> (u32, Ref, Ref) {
        let node = *self.manager().storage.value(index);
        (node.variable, node.low, node.high)
    }

    pub fn size(&self, f: Ref) -> u64 {
        self.descendants([f]).len() as u64
    }

    pub fn to_bracket_string(&self, node: Ref) -> String {
        if self.is_zero(node) {
            return "(0)".to_string();
        } else if self.is_one(node) {
            return "(1)".to_string();
        }

        let v = self.variable(node);
        let low = self.low_node(node);
        let high = self.high_node(node);

        format!(
            "{}:(x{}, {}, {})",
            node,
            v,
            self.to_bracket_string(high),
            self.to_bracket_string(low)
        )
    }
}
