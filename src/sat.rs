use std::collections::HashMap;

use num_bigint::BigUint;

use crate::bdd::Bdd;
use crate::reference::Ref;

impl Bdd {
    /// Returns one satisfying assignment for the BDD, if any exists.
    ///
    /// The assignment is a vector of DIMACS-style literals along a single
    /// path, so variables that do not appear on the path are left out. The
    /// walk prefers the low branch, which yields the numerically smallest
    /// values for MSB-first encoded integers.
    ///
    /// Returns `None` if the BDD represents the constant false function.
    pub fn one_sat(&self, node: Ref) -> Option<Vec<i32>> {
        if self.is_zero(node) {
            return None;
        }

        let manager = self.manager();
        let mut path = Vec::new();
        let mut current = node;

        // Walk down the BDD, always picking a satisfying branch
        while let Some(var) = manager.top_variable(current) {
            let low = manager.low_node(current);
            let high = manager.high_node(current);

            if low != Ref::ZERO {
                path.push(-(var as i32));
                current = low;
            } else {
                path.push(var as i32);
                current = high;
            }
        }
        debug_assert_eq!(current, Ref::ONE);

        Some(path)
    }

    /// Evaluate `node` under a total assignment.
    pub fn eval(&self, node: Ref, assignment: impl Fn(u32) -> bool) -> bool {
        let manager = self.manager();
        let mut current = node;
        while let Some(var) = manager.top_variable(current) {
            current = if assignment(var) {
                manager.high_node(current)
            } else {
                manager.low_node(current)
            };
        }
        current == Ref::ONE
    }

    /// Number of satisfying assignments over variables `1..=num_vars`.
    pub fn sat_count(&self, node: Ref, num_vars: usize) -> BigUint {
        let mut cache = HashMap::new();
        let max = BigUint::from(2u32).pow(num_vars as u32);
        self._sat_count(node, &max, &mut cache)
    }

    fn _sat_count(&self, node: Ref, max: &BigUint, cache: &mut HashMap<Ref, BigUint>) -> BigUint {
        if self.is_zero(node) {
            return BigUint::ZERO;
        } else if self.is_one(node) {
            return max.clone();
        }

        if let Some(count) = cache.get(&node) {
            return count.clone();
        }

        let (_, low, high) = self.raw_node(node.index());

        let count_low = self._sat_count(low, max, cache);
        let count_high = self._sat_count(high, max, cache);

        let count: BigUint = (count_low + count_high) >> 1;
        let count = if node.is_negated() { max - count } else { count };

        cache.insert(node, count.clone());
        count
    }
}
