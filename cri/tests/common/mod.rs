//! Shared fixtures: fake backing runtimes served over Unix sockets and a
//! shim wired against them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;

use image_cri_shim::allowlist::AllowList;
use image_cri_shim::cache::RewriteCache;
use image_cri_shim::client::{ConnectOptions, RuntimeClient};
use image_cri_shim::cri_api::{v1, v1alpha2};
use image_cri_shim::registry::TagLister;
use image_cri_shim::rewrite::ReferenceRewriter;
use image_cri_shim::server::{ServerOptions, ShimServer};
use image_cri_shim_core::error::{Result, ShimError};
use image_cri_shim_core::{AuthStore, RegistryCredential, RegistryWithPriority, ShimAuthConfig};

pub const MIRROR: &str = "sealos.hub:5000";
pub const ONLINE: &str = "registry.example.com";
pub const LOCAL_DIGEST: &str =
    "sha256:4bf3f1a5c8e2d7b6a9f0e1d2c3b4a5968778695a4b3c2d1e0f9e8d7c6b5a4938";

/// One PullImage as seen by the fake runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    pub image: String,
    pub auth: Option<(String, String)>,
    pub sandbox_config: Vec<u8>,
}

/// Everything the fake runtime received.
#[derive(Default)]
pub struct Recorder {
    pub images: Vec<(String, Vec<String>)>,
    pub pulls: Mutex<Vec<PulledImage>>,
    pub statuses: Mutex<Vec<String>>,
    pub removals: Mutex<Vec<String>>,
    pub fs_info_calls: AtomicUsize,
}

impl Recorder {
    pub fn with_images(images: Vec<(String, Vec<String>)>) -> Self {
        Self {
            images,
            ..Default::default()
        }
    }

    pub fn pulls(&self) -> Vec<PulledImage> {
        self.pulls.lock().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }

    pub fn removals(&self) -> Vec<String> {
        self.removals.lock().clone()
    }

    pub fn fs_info_calls(&self) -> usize {
        self.fs_info_calls.load(Ordering::SeqCst)
    }
}

macro_rules! fake_runtime {
    ($name:ident, $module:ident) => {
        #[derive(Clone)]
        pub struct $name(pub Arc<Recorder>);

        #[tonic::async_trait]
        impl $module::image_service_server::ImageService for $name {
            async fn list_images(
                &self,
                _request: Request<$module::ListImagesRequest>,
            ) -> std::result::Result<Response<$module::ListImagesResponse>, Status> {
                let images = self
                    .0
                    .images
                    .iter()
                    .map(|(id, digests)| $module::Image {
                        id: id.clone(),
                        repo_digests: digests.clone(),
                        ..Default::default()
                    })
                    .collect();
                Ok(Response::new($module::ListImagesResponse { images }))
            }

            async fn image_status(
                &self,
                request: Request<$module::ImageStatusRequest>,
            ) -> std::result::Result<Response<$module::ImageStatusResponse>, Status> {
                let image = request
                    .into_inner()
                    .image
                    .map(|spec| spec.image)
                    .unwrap_or_default();
                self.0.statuses.lock().push(image.clone());
                Ok(Response::new($module::ImageStatusResponse {
                    image: Some($module::Image {
                        id: image,
                        ..Default::default()
                    }),
                    info: Default::default(),
                }))
            }

            async fn pull_image(
                &self,
                request: Request<$module::PullImageRequest>,
            ) -> std::result::Result<Response<$module::PullImageResponse>, Status> {
                let request = request.into_inner();
                let image = request.image.map(|spec| spec.image).unwrap_or_default();
                self.0.pulls.lock().push(PulledImage {
                    image: image.clone(),
                    auth: request.auth.map(|auth| (auth.username, auth.password)),
                    sandbox_config: request.sandbox_config,
                });
                if image.contains("missing") {
                    return Err(Status::not_found(format!("{} not found", image)));
                }
                Ok(Response::new($module::PullImageResponse { image_ref: image }))
            }

            async fn remove_image(
                &self,
                request: Request<$module::RemoveImageRequest>,
            ) -> std::result::Result<Response<$module::RemoveImageResponse>, Status> {
                let image = request
                    .into_inner()
                    .image
                    .map(|spec| spec.image)
                    .unwrap_or_default();
                self.0.removals.lock().push(image);
                Ok(Response::new($module::RemoveImageResponse {}))
            }

            async fn image_fs_info(
                &self,
                _request: Request<$module::ImageFsInfoRequest>,
            ) -> std::result::Result<Response<$module::ImageFsInfoResponse>, Status> {
                self.0.fs_info_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Response::new($module::ImageFsInfoResponse::default()))
            }
        }

        #[tonic::async_trait]
        impl $module::runtime_service_server::RuntimeService for $name {
            async fn version(
                &self,
                _request: Request<$module::VersionRequest>,
            ) -> std::result::Result<Response<$module::VersionResponse>, Status> {
                Ok(Response::new($module::VersionResponse {
                    version: "0.1.0".to_string(),
                    runtime_name: "fake".to_string(),
                    runtime_version: "1.0.0".to_string(),
                    runtime_api_version: stringify!($module).to_string(),
                }))
            }
        }
    };
}

fake_runtime!(FakeV1Runtime, v1);
fake_runtime!(FakeV1Alpha2Runtime, v1alpha2);

/// CRI versions a fake runtime serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serves {
    V1,
    V1Alpha2,
    Nothing,
}

/// Serve a fake runtime on `socket`.
pub fn spawn_runtime(socket: &Path, serves: Serves, recorder: Arc<Recorder>) {
    let listener = UnixListener::bind(socket).unwrap();
    let incoming = UnixListenerStream::new(listener);
    match serves {
        Serves::V1 => {
            let fake = FakeV1Runtime(recorder);
            tokio::spawn(
                Server::builder()
                    .add_service(v1::image_service_server::ImageServiceServer::new(
                        fake.clone(),
                    ))
                    .add_service(v1::runtime_service_server::RuntimeServiceServer::new(fake))
                    .serve_with_incoming(incoming),
            );
        }
        Serves::V1Alpha2 => {
            let fake = FakeV1Alpha2Runtime(recorder);
            tokio::spawn(
                Server::builder()
                    .add_service(v1alpha2::image_service_server::ImageServiceServer::new(
                        fake.clone(),
                    ))
                    .add_service(
                        v1alpha2::runtime_service_server::RuntimeServiceServer::new(fake),
                    )
                    .serve_with_incoming(incoming),
            );
        }
        Serves::Nothing => {
            // Only the v1 runtime service, so every image RPC is unimplemented.
            let fake = FakeV1Runtime(recorder);
            tokio::spawn(
                Server::builder()
                    .add_service(v1::runtime_service_server::RuntimeServiceServer::new(fake))
                    .serve_with_incoming(incoming),
            );
        }
    }
}

/// gRPC channel over a Unix socket.
pub async fn channel(socket: &Path) -> Channel {
    let socket = socket.to_path_buf();
    Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(socket.clone())))
        .await
        .unwrap()
}

/// Tag lister answering from a fixed table and counting calls per domain.
#[derive(Default)]
pub struct FakeLister {
    tags: HashMap<(String, String), Vec<String>>,
    failing: HashSet<String>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeLister {
    pub fn with_tag(mut self, domain: &str, repository: &str, tag: &str) -> Self {
        self.tags
            .entry((domain.to_string(), repository.to_string()))
            .or_default()
            .push(tag.to_string());
        self
    }

    pub fn failing(mut self, domain: &str) -> Self {
        self.failing.insert(domain.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, domain: &str) -> usize {
        self.calls.lock().iter().filter(|(d, _)| d == domain).count()
    }
}

#[async_trait]
impl TagLister for FakeLister {
    async fn tags(&self, registry: &RegistryWithPriority, repository: &str) -> Result<Vec<String>> {
        self.calls
            .lock()
            .push((registry.domain.clone(), repository.to_string()));
        if self.failing.contains(&registry.domain) {
            return Err(ShimError::Probe {
                registry: registry.domain.clone(),
                message: "connection reset".to_string(),
            });
        }
        Ok(self
            .tags
            .get(&(registry.domain.clone(), repository.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Mirror with credentials at priority 1000, one online registry at 500.
pub fn auth_store() -> Arc<AuthStore> {
    let mut config = ShimAuthConfig {
        offline_priority: 1000,
        mirror_domain: Some(MIRROR.to_string()),
        ..Default::default()
    };
    config.offline_configs.insert(
        MIRROR.to_string(),
        RegistryCredential::new(MIRROR, "admin", "passw0rd"),
    );
    config.cri_configs.insert(
        ONLINE.to_string(),
        RegistryCredential::new(ONLINE, "robot", "s3cret"),
    );
    config.cri_priorities.insert(ONLINE.to_string(), 500);
    Arc::new(AuthStore::new(config))
}

/// A shim serving in front of a fake runtime.
pub struct Shim {
    pub server: ShimServer,
    pub socket: PathBuf,
    pub client: Arc<RuntimeClient>,
    pub rewriter: Arc<ReferenceRewriter>,
}

pub struct ShimSetup<'a> {
    pub dir: &'a Path,
    pub runtime_socket: &'a Path,
    pub lister: Arc<FakeLister>,
    pub allow_list: Vec<String>,
}

impl ShimSetup<'_> {
    pub async fn start(self) -> Shim {
        let client = Arc::new(RuntimeClient::new(
            self.runtime_socket,
            ConnectOptions::default(),
        ));
        client.connect().await.unwrap();

        let allow_list = Arc::new(AllowList::new());
        allow_list.replace(self.allow_list.into_iter().collect());
        let rewriter = Arc::new(ReferenceRewriter::new(
            auth_store(),
            allow_list,
            self.lister,
            RewriteCache::new(64, Duration::from_secs(60)),
        ));

        let socket = self.dir.join("shim").join("image-cri-shim.sock");
        let mut server = ShimServer::new(ServerOptions {
            socket: socket.clone(),
            permissions: None,
        })
        .unwrap();
        server.bind().unwrap();
        server
            .negotiate(&client, Duration::from_secs(5))
            .await
            .unwrap();
        server
            .register_image_service(client.clone(), rewriter.clone())
            .unwrap();
        server.start().await.unwrap();

        Shim {
            server,
            socket,
            client,
            rewriter,
        }
    }
}
