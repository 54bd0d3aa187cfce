//! CRI protocol versions.
//!
//! The v1 and v1alpha2 image services are wire-identical apart from their
//! package name, but generate distinct Rust types. [`CriApi`] abstracts over
//! the generated messages and clients so that a single adapter serves both.

use std::fmt::Debug;

use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use image_cri_shim_core::RegistryCredential;

use crate::cri_api::{v1, v1alpha2};

/// CRI API version spoken by the backing runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiatedVersion {
    /// Negotiation has not run yet.
    #[default]
    Unset,
    V1,
    V1Alpha2,
}

impl std::fmt::Display for NegotiatedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiatedVersion::Unset => write!(f, "unset"),
            NegotiatedVersion::V1 => write!(f, "v1"),
            NegotiatedVersion::V1Alpha2 => write!(f, "v1alpha2"),
        }
    }
}

/// Runtime identification returned by `RuntimeService.Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeVersion {
    pub version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub runtime_api_version: String,
}

/// A request whose `image` field the shim may rewrite.
pub trait ImageRequest: Debug + Send + 'static {
    fn image(&self) -> Option<&str>;
    fn set_image(&mut self, image: String);
}

/// A pull request that may carry registry credentials.
pub trait PullRequest: ImageRequest {
    fn has_auth(&self) -> bool;
    fn set_auth(&mut self, credential: &RegistryCredential);
}

/// One CRI protocol version: its message types and client calls.
#[tonic::async_trait]
pub trait CriApi: Copy + Send + Sync + 'static {
    const VERSION: NegotiatedVersion;

    type ListImagesRequest: Debug + Send + 'static;
    type ListImagesResponse: Send + 'static;
    type ImageStatusRequest: ImageRequest;
    type ImageStatusResponse: Send + 'static;
    type PullImageRequest: PullRequest;
    type PullImageResponse: Send + 'static;
    type RemoveImageRequest: ImageRequest;
    type RemoveImageResponse: Send + 'static;
    type ImageFsInfoRequest: Debug + Default + Send + 'static;
    type ImageFsInfoResponse: Send + 'static;

    async fn list_images(
        &self,
        channel: Channel,
        request: Request<Self::ListImagesRequest>,
    ) -> Result<Response<Self::ListImagesResponse>, Status>;

    async fn image_status(
        &self,
        channel: Channel,
        request: Request<Self::ImageStatusRequest>,
    ) -> Result<Response<Self::ImageStatusResponse>, Status>;

    async fn pull_image(
        &self,
        channel: Channel,
        request: Request<Self::PullImageRequest>,
    ) -> Result<Response<Self::PullImageResponse>, Status>;

    async fn remove_image(
        &self,
        channel: Channel,
        request: Request<Self::RemoveImageRequest>,
    ) -> Result<Response<Self::RemoveImageResponse>, Status>;

    async fn image_fs_info(
        &self,
        channel: Channel,
        request: Request<Self::ImageFsInfoRequest>,
    ) -> Result<Response<Self::ImageFsInfoResponse>, Status>;

    /// Image IDs and repo digests of every image the runtime holds.
    async fn local_image_ids(&self, channel: Channel) -> Result<Vec<String>, Status>;

    async fn version(&self, channel: Channel) -> Result<RuntimeVersion, Status>;
}

/// CRI `runtime.v1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct V1;

/// CRI `runtime.v1alpha2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct V1Alpha2;

macro_rules! cri_api_impl {
    ($api:ident, $module:ident, $version:expr) => {
        impl ImageRequest for $module::ImageStatusRequest {
            fn image(&self) -> Option<&str> {
                self.image.as_ref().map(|spec| spec.image.as_str())
            }

            fn set_image(&mut self, image: String) {
                if let Some(spec) = self.image.as_mut() {
                    spec.image = image;
                }
            }
        }

        impl ImageRequest for $module::RemoveImageRequest {
            fn image(&self) -> Option<&str> {
                self.image.as_ref().map(|spec| spec.image.as_str())
            }

            fn set_image(&mut self, image: String) {
                if let Some(spec) = self.image.as_mut() {
                    spec.image = image;
                }
            }
        }

        impl ImageRequest for $module::PullImageRequest {
            fn image(&self) -> Option<&str> {
                self.image.as_ref().map(|spec| spec.image.as_str())
            }

            fn set_image(&mut self, image: String) {
                if let Some(spec) = self.image.as_mut() {
                    spec.image = image;
                }
            }
        }

        impl PullRequest for $module::PullImageRequest {
            fn has_auth(&self) -> bool {
                self.auth.is_some()
            }

            fn set_auth(&mut self, credential: &RegistryCredential) {
                self.auth = Some($module::AuthConfig {
                    username: credential.username.clone(),
                    password: credential.password.clone(),
                    server_address: credential.domain.clone(),
                    ..Default::default()
                });
            }
        }

        #[tonic::async_trait]
        impl CriApi for $api {
            const VERSION: NegotiatedVersion = $version;

            type ListImagesRequest = $module::ListImagesRequest;
            type ListImagesResponse = $module::ListImagesResponse;
            type ImageStatusRequest = $module::ImageStatusRequest;
            type ImageStatusResponse = $module::ImageStatusResponse;
            type PullImageRequest = $module::PullImageRequest;
            type PullImageResponse = $module::PullImageResponse;
            type RemoveImageRequest = $module::RemoveImageRequest;
            type RemoveImageResponse = $module::RemoveImageResponse;
            type ImageFsInfoRequest = $module::ImageFsInfoRequest;
            type ImageFsInfoResponse = $module::ImageFsInfoResponse;

            async fn list_images(
                &self,
                channel: Channel,
                request: Request<Self::ListImagesRequest>,
            ) -> Result<Response<Self::ListImagesResponse>, Status> {
                $module::image_service_client::ImageServiceClient::new(channel)
                    .list_images(request)
                    .await
            }

            async fn image_status(
                &self,
                channel: Channel,
                request: Request<Self::ImageStatusRequest>,
            ) -> Result<Response<Self::ImageStatusResponse>, Status> {
                $module::image_service_client::ImageServiceClient::new(channel)
                    .image_status(request)
                    .await
            }

            async fn pull_image(
                &self,
                channel: Channel,
                request: Request<Self::PullImageRequest>,
            ) -> Result<Response<Self::PullImageResponse>, Status> {
                $module::image_service_client::ImageServiceClient::new(channel)
                    .pull_image(request)
                    .await
            }

            async fn remove_image(
                &self,
                channel: Channel,
                request: Request<Self::RemoveImageRequest>,
            ) -> Result<Response<Self::RemoveImageResponse>, Status> {
                $module::image_service_client::ImageServiceClient::new(channel)
                    .remove_image(request)
                    .await
            }

            async fn image_fs_info(
                &self,
                channel: Channel,
                request: Request<Self::ImageFsInfoRequest>,
            ) -> Result<Response<Self::ImageFsInfoResponse>, Status> {
                $module::image_service_client::ImageServiceClient::new(channel)
                    .image_fs_info(request)
                    .await
            }

            async fn local_image_ids(&self, channel: Channel) -> Result<Vec<String>, Status> {
                let response = $module::image_service_client::ImageServiceClient::new(channel)
                    .list_images(Request::new($module::ListImagesRequest::default()))
                    .await?
                    .into_inner();
                Ok(response
                    .images
                    .into_iter()
                    .flat_map(|image| std::iter::once(image.id).chain(image.repo_digests))
                    .collect())
            }

            async fn version(&self, channel: Channel) -> Result<RuntimeVersion, Status> {
                let response = $module::runtime_service_client::RuntimeServiceClient::new(channel)
                    .version(Request::new($module::VersionRequest {
                        version: stringify!($module).to_string(),
                    }))
                    .await?
                    .into_inner();
                Ok(RuntimeVersion {
                    version: response.version,
                    runtime_name: response.runtime_name,
                    runtime_version: response.runtime_version,
                    runtime_api_version: response.runtime_api_version,
                })
            }
        }
    };
}

cri_api_impl!(V1, v1, NegotiatedVersion::V1);
cri_api_impl!(V1Alpha2, v1alpha2, NegotiatedVersion::V1Alpha2);
