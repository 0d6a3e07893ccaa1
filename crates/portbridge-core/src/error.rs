use thiserror::Error;

/// Errors produced by the forwarding proxy.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The source address is not on the allow-list. Expected; never logged
    /// at error level.
    #[error("authorization denied for {0}")]
    AuthorizationDenied(String),

    /// Unexpected I/O failure; tears down the affected session only.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The initial outbound connect timed out on a restart-trigger port.
    /// Terminal: the supervisor layer exits the process with status 1.
    #[error("backend unreachable on restart-trigger port {port}")]
    BackendUnreachable { port: u16 },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("target discovery failed: {0}")]
    DiscoveryFailed(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
