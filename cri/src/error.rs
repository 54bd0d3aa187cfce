//! CRI-specific error conversions.

use image_cri_shim_core::ShimError;
use tonic::Status;

/// Convert a ShimError to a gRPC Status.
///
/// Only used where the shim answers on its own; statuses returned by the
/// backing runtime are forwarded untouched.
pub fn shim_error_to_status(err: ShimError) -> Status {
    match err {
        ShimError::Connection { socket, message } => {
            Status::unavailable(format!("backing runtime {}: {}", socket, message))
        }
        ShimError::PermissionDenied { socket, message } => {
            Status::permission_denied(format!("backing runtime {}: {}", socket, message))
        }
        ShimError::Negotiation(msg) => Status::unavailable(msg),
        ShimError::Probe { registry, message } => {
            Status::unavailable(format!("{}: {}", registry, message))
        }
        ShimError::Reference(msg) => Status::invalid_argument(msg),
        ShimError::Timeout(msg) => Status::deadline_exceeded(msg),
        ShimError::Config(msg) => Status::failed_precondition(msg),
        ShimError::Grpc(status) => status,
        ShimError::Io(e) => Status::internal(e.to_string()),
        other => Status::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_maps_to_unavailable() {
        let err = ShimError::Connection {
            socket: "/run/containerd/containerd.sock".to_string(),
            message: "not connected".to_string(),
        };
        let status = shim_error_to_status(err);
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("containerd.sock"));
    }

    #[test]
    fn test_permission_denied_maps_to_permission_denied() {
        let err = ShimError::PermissionDenied {
            socket: "/run/crio/crio.sock".to_string(),
            message: "EACCES".to_string(),
        };
        assert_eq!(
            shim_error_to_status(err).code(),
            tonic::Code::PermissionDenied
        );
    }

    #[test]
    fn test_reference_error_maps_to_invalid_argument() {
        let err = ShimError::Reference("bad@@@".to_string());
        assert_eq!(
            shim_error_to_status(err).code(),
            tonic::Code::InvalidArgument
        );
    }

    #[test]
    fn test_timeout_maps_to_deadline_exceeded() {
        let err = ShimError::Timeout("probe".to_string());
        assert_eq!(
            shim_error_to_status(err).code(),
            tonic::Code::DeadlineExceeded
        );
    }

    #[test]
    fn test_grpc_status_passthrough() {
        let err = ShimError::Grpc(Status::not_found("image missing"));
        let status = shim_error_to_status(err);
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "image missing");
    }

    #[test]
    fn test_other_maps_to_internal() {
        assert_eq!(
            shim_error_to_status(ShimError::AlreadyRegistered).code(),
            tonic::Code::Internal
        );
    }
}
