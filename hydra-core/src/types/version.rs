//! Log positions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in the mutation log.
///
/// `segment_id` identifies the changelog, `record_id` is the 0-based offset of a
/// record inside it. Versions order lexicographically by `(segment_id, record_id)`,
/// which is exactly log order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version {
    /// Changelog identifier.
    pub segment_id: u64,
    /// Offset of the record inside the changelog.
    pub record_id: u64,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(segment_id: u64, record_id: u64) -> Self {
        Self {
            segment_id,
            record_id,
        }
    }

    /// The version of the next record in the same segment.
    #[must_use]
    pub const fn advance(self) -> Self {
        Self::new(self.segment_id, self.record_id + 1)
    }

    /// The first version of the following segment.
    #[must_use]
    pub const fn rotate(self) -> Self {
        Self::new(self.segment_id + 1, 0)
    }

    /// Check if this version is before another.
    pub fn is_before(&self, other: &Version) -> bool {
        self < other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1, 100);
        let v2 = Version::new(1, 200);
        let v3 = Version::new(2, 0);

        assert!(v1.is_before(&v2));
        assert!(v2.is_before(&v3));
        assert!(v1.is_before(&v3));
        assert!(!v2.is_before(&v1));
        assert!(!v3.is_before(&v3));
    }

    #[test]
    fn advance_and_rotate() {
        let v = Version::new(3, 7);
        assert_eq!(v.advance(), Version::new(3, 8));
        assert_eq!(v.rotate(), Version::new(4, 0));
    }

    #[test]
    fn display() {
        assert_eq!(Version::new(2, 15).to_string(), "2:15");
    }
}
