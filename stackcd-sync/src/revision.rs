//! Short commit identifiers used as change tokens.

use std::fmt;

/// Length of a [`Revision`] in hex characters.
pub const REVISION_LEN: usize = 8;

/// First 8 lowercase hex characters of a commit id.
///
/// Opaque: compare for equality, never treat as a full hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    pub fn from_oid(oid: git2::Oid) -> Self {
        let mut hex = oid.to_string();
        hex.truncate(REVISION_LEN);
        Self(hex)
    }

    /// Accepts exactly 8 lowercase hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == REVISION_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
