//! portbridge-core: Shared library for the portbridge forwarding proxy.
//!
//! Provides the error taxonomy, the allow-list address authorizer, and the
//! session model (ids, link states) used by the server binary.

pub mod authorizer;
pub mod error;
pub mod session;

// Re-export commonly used items at crate root.
pub use authorizer::{AllowEntry, AllowList};
pub use error::{BridgeError, BridgeResult};
pub use session::{instance_id, LinkState, SessionId};
