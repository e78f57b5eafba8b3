use std::fmt::{Display, Formatter};
use std::ops::Neg;

/// Handle to a BDD node, possibly complemented.
///
/// The sign encodes the complement bit: `-r` denotes the negation of the
/// function `r` points to. Index `1` is the terminal node, so the constant
/// `true` is `+1` and `false` is `-1`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Ref(i32);

impl Ref {
    pub const ONE: Ref = Ref(1);
    pub const ZERO: Ref = Ref(-1);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn positive(index: u32) -> Self {
        Self(index as i32)
    }

    pub const fn is_negated(&self) -> bool {
        self.0 < 0
    }

    pub const fn negate(self) -> Self {
        Self(-self.0)
    }

    /// Return the internal representation of the reference.
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Return the index of the referenced node.
    pub const fn index(self) -> usize {
        self.0.unsigned_abs() as usize
    }

    pub(crate) fn as_lit(self) -> u32 {
        signed_to_lit(self.0)
    }
}

impl Neg for Ref {
    type Output = Self;

    fn neg(self) -> Self::Output {
        self.negate()
    }
}

impl Display for Ref {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}",
            if self.is_negated() { "~" } else { "" },
            self.index()
        )
    }
}

pub(crate) fn signed_to_lit(value: i32) -> u32 {
    (value.unsigned_abs() << 1) + (value < 0) as u32
}
