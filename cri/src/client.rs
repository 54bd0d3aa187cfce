//! Backing runtime client.
//!
//! Owns the gRPC channel to the real container runtime's socket. Dials are
//! classified into transient failures (socket missing, nobody listening) and
//! fatal ones (permission denied); with `wait` set, transient failures are
//! retried until the runtime comes up.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Request};
use tower::service_fn;

use image_cri_shim_core::error::{Result, ShimError};
use image_cri_shim_core::SocketPermissions;

use crate::api::{CriApi, NegotiatedVersion, RuntimeVersion, V1Alpha2, V1};

/// Delay between dial attempts while waiting for the runtime socket.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on a single dial, including the HTTP/2 handshake.
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between capability probes while the runtime reports Unavailable.
const NEGOTIATION_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Ownership and mode of the backing runtime socket, observed at dial time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSocket {
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only.
    pub mode: u32,
}

impl PeerSocket {
    pub fn inspect(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & 0o7777,
        })
    }

    pub fn permissions(&self) -> SocketPermissions {
        SocketPermissions {
            uid: self.uid,
            gid: self.gid,
            mode: self.mode,
        }
    }
}

/// Callback fired after every successful dial of the runtime socket.
pub type DialHook = Arc<dyn Fn(&PeerSocket) + Send + Sync>;

/// Dial behaviour.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Keep retrying while the socket is missing or refusing connections.
    pub wait: bool,
    pub retry_interval: Duration,
    pub dial_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            wait: false,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// gRPC client of the backing container runtime.
pub struct RuntimeClient {
    socket: PathBuf,
    options: ConnectOptions,
    hook: Option<DialHook>,
    channel: RwLock<Option<Channel>>,
    ready: AtomicBool,
}

impl std::fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("socket", &self.socket)
            .field("options", &self.options)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl RuntimeClient {
    /// Create an unconnected client; call [`RuntimeClient::connect`] next.
    pub fn new(socket: impl Into<PathBuf>, options: ConnectOptions) -> Self {
        Self {
            socket: socket.into(),
            options,
            hook: None,
            channel: RwLock::new(None),
            ready: AtomicBool::new(false),
        }
    }

    pub fn with_dial_hook(mut self, hook: DialHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Dial the runtime socket, retrying transient failures when `wait` is set.
    pub async fn connect(&self) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.dial().await {
                Ok(channel) => {
                    self.install(channel);
                    tracing::info!(
                        socket = %self.socket.display(),
                        attempts,
                        "Connected to backing runtime"
                    );
                    return Ok(());
                }
                Err(e) if self.options.wait && e.is_transient() => {
                    if attempts == 1 {
                        tracing::warn!(
                            socket = %self.socket.display(),
                            error = %e,
                            "Backing runtime not available yet, waiting"
                        );
                    } else {
                        tracing::debug!(attempts, error = %e, "Backing runtime still unavailable");
                    }
                    tokio::time::sleep(self.options.retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current channel, or a connection error if the client never connected.
    pub fn channel(&self) -> Result<Channel> {
        self.channel.read().clone().ok_or_else(|| ShimError::Connection {
            socket: self.socket.display().to_string(),
            message: "not connected".to_string(),
        })
    }

    /// Verify the runtime socket still accepts connections.
    ///
    /// With `reconnect`, a dead connection is re-dialed once; without it
    /// the check fails immediately.
    pub async fn check_connection(&self, reconnect: bool) -> Result<()> {
        if self.is_ready() && UnixStream::connect(&self.socket).await.is_ok() {
            return Ok(());
        }
        self.ready.store(false, Ordering::Release);

        if !reconnect {
            return Err(ShimError::Connection {
                socket: self.socket.display().to_string(),
                message: "connection is not ready".to_string(),
            });
        }

        tracing::info!(socket = %self.socket.display(), "Reconnecting to backing runtime");
        let channel = self.dial().await?;
        self.install(channel);
        Ok(())
    }

    /// Find the CRI version the runtime serves: v1 first, then v1alpha2.
    pub async fn negotiate(&self, timeout: Duration) -> Result<NegotiatedVersion> {
        match tokio::time::timeout(timeout, self.probe_versions()).await {
            Ok(result) => result,
            Err(_) => Err(ShimError::Negotiation(format!(
                "no CRI image service answered within {:?}",
                timeout
            ))),
        }
    }

    async fn probe_versions(&self) -> Result<NegotiatedVersion> {
        loop {
            let channel = self.channel()?;
            match V1.image_fs_info(channel.clone(), Request::new(Default::default())).await {
                Ok(_) => return Ok(NegotiatedVersion::V1),
                Err(status) if status.code() == Code::Unimplemented => {
                    tracing::debug!("Runtime does not implement CRI v1, trying v1alpha2");
                }
                Err(status) if status.code() == Code::Unavailable => {
                    tracing::debug!(error = %status, "Runtime unavailable during negotiation");
                    tokio::time::sleep(NEGOTIATION_RETRY_INTERVAL).await;
                    continue;
                }
                Err(status) => {
                    return Err(ShimError::Negotiation(format!(
                        "v1 probe failed: {}",
                        status
                    )))
                }
            }

            return match V1Alpha2
                .image_fs_info(channel, Request::new(Default::default()))
                .await
            {
                Ok(_) => Ok(NegotiatedVersion::V1Alpha2),
                Err(status) => Err(ShimError::Negotiation(format!(
                    "runtime serves neither v1 nor v1alpha2: {}",
                    status
                ))),
            };
        }
    }

    /// RuntimeService.Version, v1 first, then v1alpha2.
    pub async fn version(&self) -> Result<RuntimeVersion> {
        let channel = self.channel()?;
        match V1.version(channel.clone()).await {
            Ok(version) => Ok(version),
            Err(status) => {
                tracing::debug!(error = %status, "v1 Version failed, trying v1alpha2");
                Ok(V1Alpha2.version(channel).await?)
            }
        }
    }

    fn install(&self, channel: Channel) {
        *self.channel.write() = Some(channel);
        self.ready.store(true, Ordering::Release);
    }

    async fn dial(&self) -> Result<Channel> {
        // A plain connect first, so that permission problems are told apart
        // from a runtime that is not up yet.
        UnixStream::connect(&self.socket)
            .await
            .map_err(|e| classify_dial_error(&self.socket, &e))?;

        let socket = self.socket.clone();
        let hook = self.hook.clone();
        let endpoint = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| ShimError::Config(e.to_string()))?
            .connect_timeout(self.options.dial_timeout);

        let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            let hook = hook.clone();
            async move {
                let stream = UnixStream::connect(&socket).await?;
                if let Some(hook) = hook {
                    match PeerSocket::inspect(&socket) {
                        Ok(peer) => hook(&peer),
                        Err(e) => tracing::debug!(error = %e, "Failed to stat runtime socket"),
                    }
                }
                Ok::<_, std::io::Error>(stream)
            }
        }));

        match tokio::time::timeout(self.options.dial_timeout, connect).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(ShimError::Connection {
                socket: self.socket.display().to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ShimError::Timeout(format!(
                "dialing {} took longer than {:?}",
                self.socket.display(),
                self.options.dial_timeout
            ))),
        }
    }
}

/// Permission problems are fatal; anything else may clear up on its own.
fn classify_dial_error(socket: &Path, err: &std::io::Error) -> ShimError {
    let socket = socket.display().to_string();
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => ShimError::PermissionDenied {
            socket,
            message: err.to_string(),
        },
        _ => ShimError::Connection {
            socket,
            message: err.to_string(),
        },
    }
}
