use serde::{Deserialize, Serialize};

/// Position of an entry in the replicated log. Index 0 means "before the first entry".
pub type LogIndex = u64;

/// Election epoch. Starts at 0 and only ever increases.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "term-{}", self.0)
    }
}

/// Identity of a cluster member or client endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        PeerId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_next_increments() {
        assert_eq!(Term(0).next(), Term(1));
        assert_eq!(Term(41).next().value(), 42);
    }

    #[test]
    fn term_ordering() {
        assert!(Term(1) < Term(2));
        assert!(Term(3) > Term(2));
        assert!(Term(2) >= Term(2));
        assert_eq!(Term::default(), Term::ZERO);
    }

    #[test]
    fn display_formats() {
        assert_eq!(Term(7).to_string(), "term-7");
        assert_eq!(PeerId(3).to_string(), "node-3");
    }
}
