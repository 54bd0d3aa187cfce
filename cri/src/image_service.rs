//! CRI ImageService adapter.
//!
//! Receives image RPCs from the kubelet, rewrites image references where
//! needed and forwards everything to the backing runtime. Responses and
//! errors from the runtime are returned untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use image_cri_shim_core::error::Result;

use crate::api::{CriApi, ImageRequest, PullRequest, V1Alpha2, V1};
use crate::client::RuntimeClient;
use crate::cri_api::{v1, v1alpha2};
use crate::error::shim_error_to_status;
use crate::rewrite::{LocalImages, ReferenceRewriter, RewriteAction};

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// ImageService implementation for one CRI protocol version.
pub struct ImageServiceAdapter<A: CriApi> {
    api: A,
    client: Arc<RuntimeClient>,
    rewriter: Arc<ReferenceRewriter>,
}

impl<A: CriApi> ImageServiceAdapter<A> {
    pub fn new(api: A, client: Arc<RuntimeClient>, rewriter: Arc<ReferenceRewriter>) -> Self {
        Self {
            api,
            client,
            rewriter,
        }
    }

    fn channel(&self) -> std::result::Result<Channel, Status> {
        self.client.channel().map_err(shim_error_to_status)
    }

    async fn rewrite_image<R: ImageRequest>(&self, action: RewriteAction, request: &mut R) {
        let Some(image) = request.image().map(str::to_string) else {
            return;
        };
        let local = RuntimeImages {
            api: self.api,
            client: &self.client,
        };
        let outcome = self.rewriter.rewrite(action, &image, &local).await;
        if outcome.replaced {
            request.set_image(outcome.image);
        }
    }

    async fn handle_list_images(
        &self,
        request: Request<A::ListImagesRequest>,
    ) -> std::result::Result<Response<A::ListImagesResponse>, Status> {
        tracing::debug!(version = %A::VERSION, "ListImages");
        let timeout = grpc_timeout(&request);
        let channel = self.channel()?;
        self.api
            .list_images(channel, outbound(request.into_inner(), timeout))
            .await
    }

    async fn handle_image_status(
        &self,
        request: Request<A::ImageStatusRequest>,
    ) -> std::result::Result<Response<A::ImageStatusResponse>, Status> {
        let timeout = grpc_timeout(&request);
        let mut message = request.into_inner();
        tracing::debug!(version = %A::VERSION, image = ?message.image(), "ImageStatus");

        self.rewrite_image(RewriteAction::ImageStatus, &mut message)
            .await;
        let channel = self.channel()?;
        self.api
            .image_status(channel, outbound(message, timeout))
            .await
    }

    async fn handle_pull_image(
        &self,
        request: Request<A::PullImageRequest>,
    ) -> std::result::Result<Response<A::PullImageResponse>, Status> {
        let timeout = grpc_timeout(&request);
        let mut message = request.into_inner();
        tracing::debug!(version = %A::VERSION, image = ?message.image(), "PullImage");

        self.rewrite_image(RewriteAction::PullImage, &mut message)
            .await;
        if !message.has_auth() {
            let credential = message
                .image()
                .and_then(|image| self.rewriter.credential_for_pull(image))
                .cloned();
            if let Some(credential) = credential {
                tracing::debug!(registry = %credential.domain, "Injecting registry credential");
                message.set_auth(&credential);
            }
        }

        let channel = self.channel()?;
        self.api.pull_image(channel, outbound(message, timeout)).await
    }

    async fn handle_remove_image(
        &self,
        request: Request<A::RemoveImageRequest>,
    ) -> std::result::Result<Response<A::RemoveImageResponse>, Status> {
        let timeout = grpc_timeout(&request);
        let mut message = request.into_inner();
        tracing::debug!(version = %A::VERSION, image = ?message.image(), "RemoveImage");

        self.rewrite_image(RewriteAction::RemoveImage, &mut message)
            .await;
        let channel = self.channel()?;
        self.api
            .remove_image(channel, outbound(message, timeout))
            .await
    }

    async fn handle_image_fs_info(
        &self,
        request: Request<A::ImageFsInfoRequest>,
    ) -> std::result::Result<Response<A::ImageFsInfoResponse>, Status> {
        tracing::debug!(version = %A::VERSION, "ImageFsInfo");
        let timeout = grpc_timeout(&request);
        let channel = self.channel()?;
        self.api
            .image_fs_info(channel, outbound(request.into_inner(), timeout))
            .await
    }
}

/// Local image lookup through the backing runtime's ListImages.
struct RuntimeImages<'a, A: CriApi> {
    api: A,
    client: &'a RuntimeClient,
}

#[async_trait]
impl<A: CriApi> LocalImages for RuntimeImages<'_, A> {
    async fn image_ids(&self) -> Result<Vec<String>> {
        let channel = self.client.channel()?;
        Ok(self.api.local_image_ids(channel).await?)
    }
}

fn grpc_timeout<T>(request: &Request<T>) -> Option<MetadataValue<Ascii>> {
    request.metadata().get(GRPC_TIMEOUT_HEADER).cloned()
}

/// Build the backend request, carrying over the caller's deadline.
fn outbound<T>(message: T, timeout: Option<MetadataValue<Ascii>>) -> Request<T> {
    let mut request = Request::new(message);
    if let Some(timeout) = timeout {
        request.metadata_mut().insert(GRPC_TIMEOUT_HEADER, timeout);
    }
    request
}

macro_rules! image_service_impl {
    ($api:ty, $module:ident) => {
        #[tonic::async_trait]
        impl $module::image_service_server::ImageService for ImageServiceAdapter<$api> {
            async fn list_images(
                &self,
                request: Request<$module::ListImagesRequest>,
            ) -> std::result::Result<Response<$module::ListImagesResponse>, Status> {
                self.handle_list_images(request).await
            }

            async fn image_status(
                &self,
                request: Request<$module::ImageStatusRequest>,
            ) -> std::result::Result<Response<$module::ImageStatusResponse>, Status> {
                self.handle_image_status(request).await
            }

            async fn pull_image(
                &self,
                request: Request<$module::PullImageRequest>,
            ) -> std::result::Result<Response<$module::PullImageResponse>, Status> {
                self.handle_pull_image(request).await
            }

            async fn remove_image(
                &self,
                request: Request<$module::RemoveImageRequest>,
            ) -> std::result::Result<Response<$module::RemoveImageResponse>, Status> {
                self.handle_remove_image(request).await
            }

            async fn image_fs_info(
                &self,
                request: Request<$module::ImageFsInfoRequest>,
            ) -> std::result::Result<Response<$module::ImageFsInfoResponse>, Status> {
                self.handle_image_fs_info(request).await
            }
        }
    };
}

image_service_impl!(V1, v1);
image_service_impl!(V1Alpha2, v1alpha2);
