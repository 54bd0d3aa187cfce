use thiserror::Error;

/// Image CRI shim error types
#[derive(Error, Debug)]
pub enum ShimError {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing runtime socket could not be reached (retryable)
    #[error("Connection error: {socket} - {message}")]
    Connection { socket: String, message: String },

    /// Backing runtime socket refused us for lack of permission (never retried)
    #[error("Permission denied: {socket} - {message}")]
    PermissionDenied { socket: String, message: String },

    /// Neither CRI protocol version answered the capability probe
    #[error("Version negotiation failed: {0}")]
    Negotiation(String),

    /// Registry tag probe failed
    #[error("Registry probe error: {registry} - {message}")]
    Probe { registry: String, message: String },

    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    Reference(String),

    /// Listening socket could not be bound or prepared
    #[error("Socket error: {0}")]
    Socket(String),

    /// An image service was already registered on this server
    #[error("image service already registered")]
    AlreadyRegistered,

    /// A server stage was requested out of order
    #[error("Out of order: expected {expected}, server is {actual}")]
    OutOfOrder {
        expected: &'static str,
        actual: &'static str,
    },

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// gRPC communication error
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ShimError {
    /// Whether the failure may clear up on its own (socket not created yet,
    /// runtime not listening yet). Permission problems are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, ShimError::Connection { .. } | ShimError::Timeout(_))
    }
}

impl From<serde_yaml::Error> for ShimError {
    fn from(err: serde_yaml::Error) -> Self {
        ShimError::Serialization(err.to_string())
    }
}

/// Result type alias for shim operations
pub type Result<T> = std::result::Result<T, ShimError>;
