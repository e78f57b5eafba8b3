//! Hashing helpers shared by the node table and the operation caches.

use crate::reference::Ref;

/// Szudzik's elegant pairing, with wrap-around on overflow.
fn pair(a: u64, b: u64) -> u64 {
    let (hi, lo) = if a < b { (b, a) } else { (a, a.wrapping_add(b)) };
    hi.wrapping_mul(hi).wrapping_add(lo)
}

/// Folds three values into one; used to hash `(var, low, high)` triples.
pub fn pairing3(a: u64, b: u64, c: u64) -> u64 {
    pair(pair(a, b), c)
}

/// Hash used for bucket selection in [`Table`](crate::table::Table).
///
/// Distinct small inputs map to distinct outputs.
pub trait MyHash {
    fn hash(&self) -> u64;
}

impl MyHash for Ref {
    fn hash(&self) -> u64 {
        // Complemented edges get distinct literals.
        self.as_lit() as u64
    }
}

impl MyHash for (u64, u64) {
    fn hash(&self) -> u64 {
        pair(self.0, self.1)
    }
}

impl MyHash for (u64, u64, u64) {
    fn hash(&self) -> u64 {
        pairing3(self.0, self.1, self.2)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_pair_enumerates_grid() {
        let mut seen: Vec<u64> = (0..5).flat_map(|a| (0..5).map(move |b| pair(a, b))).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
        assert_eq!(pair(0, 4), 16);
        assert_eq!(pair(4, 0), 20);
    }

    #[test]
    fn test_triples_differ_by_order() {
        assert_ne!(pairing3(1, 2, 3), pairing3(3, 2, 1));
        assert_ne!(MyHash::hash(&(1u64, 2u64)), MyHash::hash(&(2u64, 1u64)));
    }

    #[test]
    fn test_ref_hash_distinguishes_sign() {
        let r = Ref::positive(7);
        assert_ne!(MyHash::hash(&r), MyHash::hash(&-r));
    }
}
