//! Session model: randomly generated ids and the relay link state machine.

use rand::Rng;
use std::fmt;

/// Per-session identifier: a 6-digit zero-padded numeric string.
///
/// Randomly generated and not guaranteed unique; a collision only affects
/// log correlation, never correctness.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
        Self(format!("{n:06}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate the process-wide instance identifier: a 4-digit zero-padded
/// numeric string shared by every listener's log output.
pub fn instance_id() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("{n:04}")
}

/// Relay link lifecycle. Transitions only move forward:
/// Pending (outbound connect in flight) → Active (forwarding both ways)
/// → Closed (terminal). The relay loop checks this before any forward
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Pending,
    Active,
    Closed,
}
