//! Client library version parsing.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// One dot separated component of a version string.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionPart {
    /// Numeric component such as `5`.
    Number(u64),
    /// Non-numeric component such as `0rc1`.
    Text(String),
}

impl Display for VersionPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Parsed library version.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LibraryVersion {
    parts: Vec<VersionPart>,
}

impl LibraryVersion {
    /// Parses a version string.
    ///
    /// Returns `None` for blank input and for placeholder versions made up of
    /// zeros only (`0`, `0.0`, `0.0.0`, `0.0.0.0`).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let parts: Vec<VersionPart> = raw
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_or_else(|_| VersionPart::Text(part.to_owned()), VersionPart::Number)
            })
            .collect();
        let is_null = parts.len() <= 4 && parts.iter().all(|p| *p == VersionPart::Number(0));
        if is_null {
            return None;
        }
        Some(Self { parts })
    }

    /// Returns the individual components.
    #[must_use]
    pub fn as_tuple(&self) -> &[VersionPart] {
        &self.parts
    }

    /// Returns `true` when the numeric prefix of this version is at least `minimum`.
    ///
    /// Comparison stops at the first non-numeric component, which is treated as
    /// lower than any number.
    #[must_use]
    pub fn at_least(&self, minimum: &[u64]) -> bool {
        for (idx, want) in minimum.iter().enumerate() {
            let have = match self.parts.get(idx) {
                Some(VersionPart::Number(n)) => *n,
                Some(VersionPart::Text(_)) => return false,
                None => 0,
            };
            match have.cmp(want) {
                Ordering::Greater => return true,
                Ordering::Less => return false,
                Ordering::Equal => {}
            }
        }
        true
    }
}

impl Display for LibraryVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.parts {
            if !first {
                f.write_str(".")?;
            }
            first = false;
            Display::fmt(part, f)?;
        }
        Ok(())
    }
}
