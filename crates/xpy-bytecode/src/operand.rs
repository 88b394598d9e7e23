//! Bytecode operands

use serde::{Deserialize, Serialize};

/// Index into the code unit's local variables (parameters first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct LocalIndex(pub u16);

impl LocalIndex {
    /// Create a new local index
    #[inline]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> u16 {
        self.0
    }
}

impl From<u16> for LocalIndex {
    fn from(index: u16) -> Self {
        Self(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_index() {
        let l = LocalIndex::new(5);
        assert_eq!(l.index(), 5);
        assert_eq!(LocalIndex::from(5), l);
    }
}
