//! Shim socket server.
//!
//! Owns the shim's listening socket through a fixed sequence of stages:
//! bind, apply permissions, negotiate the CRI version with the backing
//! runtime, register the matching image service, serve, stop. Calling a
//! stage out of order is an error.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use image_cri_shim_core::error::{Result, ShimError};
use image_cri_shim_core::SocketPermissions;

use crate::api::{NegotiatedVersion, V1Alpha2, V1};
use crate::client::RuntimeClient;
use crate::cri_api::v1::image_service_server::ImageServiceServer as V1ImageServiceServer;
use crate::cri_api::v1alpha2::image_service_server::ImageServiceServer as V1Alpha2ImageServiceServer;
use crate::image_service::ImageServiceAdapter;
use crate::rewrite::ReferenceRewriter;

/// How long `start` waits for the socket to accept connections.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle stage of the shim socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unbound,
    Bound,
    Permissioned,
    Serving,
    Stopped,
}

impl SocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketState::Unbound => "Unbound",
            SocketState::Bound => "Bound",
            SocketState::Permissioned => "Permissioned",
            SocketState::Serving => "Serving",
            SocketState::Stopped => "Stopped",
        }
    }
}

/// Socket server options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Absolute path of the listening socket.
    pub socket: PathBuf,
    /// Applied right after bind when set.
    pub permissions: Option<SocketPermissions>,
}

enum RegisteredService {
    V1(V1ImageServiceServer<ImageServiceAdapter<V1>>),
    V1Alpha2(V1Alpha2ImageServiceServer<ImageServiceAdapter<V1Alpha2>>),
}

type ServeHandle = JoinHandle<std::result::Result<(), tonic::transport::Error>>;

/// CRI image shim server.
pub struct ShimServer {
    options: ServerOptions,
    state: SocketState,
    listener: Option<std::os::unix::net::UnixListener>,
    version: NegotiatedVersion,
    service: Option<RegisteredService>,
    shutdown: Option<oneshot::Sender<()>>,
    serving: Option<ServeHandle>,
}

impl ShimServer {
    pub fn new(options: ServerOptions) -> Result<Self> {
        if options.socket.as_os_str().is_empty() {
            return Err(ShimError::Config("no shim socket configured".to_string()));
        }
        if !options.socket.is_absolute() {
            return Err(ShimError::Config(format!(
                "shim socket {} must be an absolute path",
                options.socket.display()
            )));
        }
        Ok(Self {
            options,
            state: SocketState::Unbound,
            listener: None,
            version: NegotiatedVersion::Unset,
            service: None,
            shutdown: None,
            serving: None,
        })
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn socket(&self) -> &Path {
        &self.options.socket
    }

    pub fn version(&self) -> NegotiatedVersion {
        self.version
    }

    /// Bind the listening socket.
    ///
    /// A socket file nobody listens on is replaced; one with a live peer is
    /// left alone and reported as an error.
    pub fn bind(&mut self) -> Result<()> {
        self.expect_state(&[SocketState::Unbound], "Unbound")?;
        let socket = self.options.socket.clone();

        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ShimError::Socket(format!(
                    "failed to create socket directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        if socket.symlink_metadata().is_ok() {
            if std::os::unix::net::UnixStream::connect(&socket).is_ok() {
                return Err(ShimError::Socket(format!(
                    "{} is in use by a running process",
                    socket.display()
                )));
            }
            tracing::info!(socket = %socket.display(), "Removing stale socket");
            std::fs::remove_file(&socket).map_err(|e| {
                ShimError::Socket(format!(
                    "failed to remove stale socket {}: {}",
                    socket.display(),
                    e
                ))
            })?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket).map_err(|e| {
            ShimError::Socket(format!("failed to bind {}: {}", socket.display(), e))
        })?;
        listener.set_nonblocking(true)?;
        self.listener = Some(listener);
        self.state = SocketState::Bound;
        tracing::info!(socket = %socket.display(), "Shim socket bound");

        if let Some(permissions) = self.options.permissions {
            self.apply_permissions(permissions)?;
        }
        Ok(())
    }

    /// Set ownership and mode of the bound socket.
    pub fn apply_permissions(&mut self, permissions: SocketPermissions) -> Result<()> {
        self.expect_state(&[SocketState::Bound, SocketState::Permissioned], "Bound")?;
        let socket = &self.options.socket;

        std::os::unix::fs::chown(socket, Some(permissions.uid), Some(permissions.gid)).map_err(
            |e| {
                ShimError::Socket(format!(
                    "failed to chown {} to {}:{}: {}",
                    socket.display(),
                    permissions.uid,
                    permissions.gid,
                    e
                ))
            },
        )?;
        std::fs::set_permissions(socket, std::fs::Permissions::from_mode(permissions.mode))
            .map_err(|e| {
                ShimError::Socket(format!(
                    "failed to chmod {} to {:o}: {}",
                    socket.display(),
                    permissions.mode,
                    e
                ))
            })?;

        self.state = SocketState::Permissioned;
        tracing::info!(
            socket = %socket.display(),
            uid = permissions.uid,
            gid = permissions.gid,
            mode = %format!("{:o}", permissions.mode),
            "Socket permissions applied"
        );
        Ok(())
    }

    /// Probe the backing runtime for its CRI version. The first successful
    /// result is kept for the lifetime of the server.
    pub async fn negotiate(
        &mut self,
        client: &RuntimeClient,
        timeout: Duration,
    ) -> Result<NegotiatedVersion> {
        if self.version != NegotiatedVersion::Unset {
            return Ok(self.version);
        }
        let version = client.negotiate(timeout).await?;
        self.version = version;
        tracing::info!(version = %version, "Negotiated CRI image service version");
        Ok(version)
    }

    /// Register the image service matching the negotiated version. Only
    /// one registration is allowed.
    pub fn register_image_service(
        &mut self,
        client: Arc<RuntimeClient>,
        rewriter: Arc<ReferenceRewriter>,
    ) -> Result<()> {
        if self.service.is_some() {
            return Err(ShimError::AlreadyRegistered);
        }
        let service = match self.version {
            NegotiatedVersion::Unset => {
                return Err(ShimError::Negotiation(
                    "CRI version has not been negotiated".to_string(),
                ))
            }
            NegotiatedVersion::V1 => RegisteredService::V1(V1ImageServiceServer::new(
                ImageServiceAdapter::new(V1, client, rewriter),
            )),
            NegotiatedVersion::V1Alpha2 => RegisteredService::V1Alpha2(
                V1Alpha2ImageServiceServer::new(ImageServiceAdapter::new(
                    V1Alpha2, client, rewriter,
                )),
            ),
        };
        self.service = Some(service);
        tracing::info!(version = %self.version, "Registered image service");
        Ok(())
    }

    /// Serve in the background. Returns once the socket accepts connections.
    pub async fn start(&mut self) -> Result<()> {
        self.expect_state(&[SocketState::Bound, SocketState::Permissioned], "Bound")?;
        let Some(service) = &self.service else {
            return Err(ShimError::Config(
                "no image service registered".to_string(),
            ));
        };
        let listener = self
            .listener
            .take()
            .ok_or_else(|| ShimError::Socket("listener is gone".to_string()))?;
        let incoming = UnixListenerStream::new(tokio::net::UnixListener::from_std(listener)?);

        let (tx, rx) = oneshot::channel::<()>();
        let shutdown = async move {
            let _ = rx.await;
        };
        let handle = match service {
            RegisteredService::V1(svc) => {
                let router = Server::builder().add_service(svc.clone());
                tokio::spawn(router.serve_with_incoming_shutdown(incoming, shutdown))
            }
            RegisteredService::V1Alpha2(svc) => {
                let router = Server::builder().add_service(svc.clone());
                tokio::spawn(router.serve_with_incoming_shutdown(incoming, shutdown))
            }
        };
        self.shutdown = Some(tx);
        self.serving = Some(handle);

        wait_until_reachable(&self.options.socket, HEALTH_PROBE_TIMEOUT).await?;
        self.state = SocketState::Serving;
        tracing::info!(
            socket = %self.options.socket.display(),
            version = %self.version,
            "Shim server listening"
        );
        Ok(())
    }

    /// Drain in-flight RPCs, then close the listener and remove the socket.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            SocketState::Unbound | SocketState::Stopped => return Ok(()),
            SocketState::Serving => {
                if let Some(tx) = self.shutdown.take() {
                    let _ = tx.send(());
                }
                if let Some(handle) = self.serving.take() {
                    match handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(error = %e, "Server exited with error"),
                        Err(e) => tracing::warn!(error = %e, "Server task failed"),
                    }
                }
            }
            SocketState::Bound | SocketState::Permissioned => {
                self.listener = None;
            }
        }

        if let Err(e) = std::fs::remove_file(&self.options.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    socket = %self.options.socket.display(),
                    error = %e,
                    "Failed to remove socket"
                );
            }
        }
        self.state = SocketState::Stopped;
        tracing::info!(socket = %self.options.socket.display(), "Shim server stopped");
        Ok(())
    }

    fn expect_state(&self, allowed: &[SocketState], expected: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ShimError::OutOfOrder {
                expected,
                actual: self.state.as_str(),
            })
        }
    }
}

async fn wait_until_reachable(socket: &Path, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(socket).await {
            Ok(_) => return Ok(()),
            Err(e) if Instant::now() >= deadline => {
                return Err(ShimError::Timeout(format!(
                    "{} not reachable after {:?}: {}",
                    socket.display(),
                    timeout,
                    e
                )))
            }
            Err(_) => tokio::time::sleep(HEALTH_PROBE_INTERVAL).await,
        }
    }
}
