//! Source-address authorization against a fixed allow-list.
//!
//! The allow-list is parsed once at startup and immutable afterwards. Two
//! entry forms are supported:
//!
//! | Pattern      | Matches                                          |
//! |--------------|--------------------------------------------------|
//! | `"10.0.0.7"` | Exactly that address.                            |
//! | `"10.0.0.*"` | Any address starting with `10.0.0.` (dotted prefix). |
//!
//! An empty list rejects every candidate. Authorization runs before any
//! outbound connect is attempted; a rejected peer never becomes a session.

use crate::error::BridgeError;

/// One parsed allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowEntry {
    /// Literal address, compared for equality.
    Literal(String),
    /// Dotted prefix (stored including the trailing dot) from a
    /// `<prefix>.*` pattern.
    Prefix(String),
}

/// Immutable set of authorized source addresses.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: Vec<AllowEntry>,
}

impl AllowList {
    /// Parse raw config strings into an allow-list.
    ///
    /// Entries ending in `.*` with a non-empty prefix become prefix
    /// entries; everything else is taken literally.
    pub fn parse(raw: &[String]) -> Self {
        let entries = raw
            .iter()
            .map(|e| match e.strip_suffix(".*") {
                Some(prefix) if !prefix.is_empty() => {
                    AllowEntry::Prefix(format!("{prefix}."))
                }
                _ => AllowEntry::Literal(e.clone()),
            })
            .collect();
        Self { entries }
    }

    /// Check whether `candidate` may open a session.
    ///
    /// True iff the candidate equals a literal entry or starts with a
    /// wildcard entry's dotted prefix. False for the empty list regardless
    /// of input. Pure, no side effects.
    pub fn is_authorized(&self, candidate: &str) -> bool {
        self.entries.iter().any(|entry| match entry {
            AllowEntry::Literal(addr) => candidate == addr,
            AllowEntry::Prefix(prefix) => candidate.starts_with(prefix.as_str()),
        })
    }

    /// Gate form of [`AllowList::is_authorized`]: `Ok(())` for an
    /// authorized candidate, otherwise an error naming the denied address.
    pub fn check(&self, candidate: &str) -> Result<(), BridgeError> {
        if self.is_authorized(candidate) {
            Ok(())
        } else {
            Err(BridgeError::AuthorizationDenied(candidate.to_string()))
        }
    }

    /// Number of parsed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are configured (every candidate is rejected).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
