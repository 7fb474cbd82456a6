use std::fmt::{Display, Formatter};

/// Handle to a presence condition stored in a [`FeatureBdd`][crate::bdd::FeatureBdd].
///
/// Regions are canonical: two handles obtained from the same manager are equal
/// iff they denote the same set of configurations. The two terminals have fixed
/// indices, so testing a region for unsatisfiability never needs the manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Region(u32);

impl Region {
    /// The empty set of configurations.
    pub const FALSE: Region = Region(0);
    /// The universal set of configurations.
    pub const TRUE: Region = Region(1);

    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Return the index of the underlying node.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_terminal(self) -> bool {
        self.0 <= 1
    }

    pub const fn is_false(self) -> bool {
        self.0 == Self::FALSE.0
    }

    pub const fn is_true(self) -> bool {
        self.0 == Self::TRUE.0
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Region::FALSE => write!(f, "FALSE"),
            Region::TRUE => write!(f, "TRUE"),
            Region(i) => write!(f, "@{}", i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminals() {
        assert!(Region::FALSE.is_terminal());
        assert!(Region::TRUE.is_terminal());
        assert!(Region::FALSE.is_false());
        assert!(Region::TRUE.is_true());
        assert!(!Region::new(5).is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(Region::FALSE.to_string(), "FALSE");
        assert_eq!(Region::TRUE.to_string(), "TRUE");
        assert_eq!(Region::new(7).to_string(), "@7");
    }
}
