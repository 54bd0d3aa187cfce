//! Image CRI Shim Core - shared types.
//!
//! Error taxonomy, configuration model, image reference normalization and
//! the registry credential store used by the shim server.

pub mod auth;
pub mod config;
pub mod error;
pub mod reference;

// Re-export commonly used types
pub use auth::{AuthStore, RegistryCredential, RegistryWithPriority, ShimAuthConfig};
pub use config::{AllowListConfig, CacheConfig, ShimConfig, SocketPermissions};
pub use error::{Result, ShimError};
pub use reference::ImageReference;

/// Image CRI shim version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
