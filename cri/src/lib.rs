//! Image CRI Shim - CRI ImageService proxy.
//!
//! Sits between the kubelet and the real container runtime:
//! - Image references are rewritten toward a mirror registry
//! - Mirror credentials are injected into pulls
//! - Everything else is forwarded to the runtime untouched

pub mod allowlist;
pub mod api;
pub mod cache;
pub mod client;
pub mod error;
pub mod image_service;
pub mod registry;
pub mod rewrite;
pub mod server;

/// Generated CRI protobuf types.
pub mod cri_api {
    pub mod v1 {
        tonic::include_proto!("runtime.v1");
    }

    pub mod v1alpha2 {
        tonic::include_proto!("runtime.v1alpha2");
    }
}
