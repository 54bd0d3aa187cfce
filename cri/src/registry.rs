//! Registry tag probing.
//!
//! The rewriter asks each configured registry whether it holds a given
//! `repository:tag`. [`TagLister`] is the seam; [`OciTagLister`] talks to
//! real registries through `oci-distribution`.

use std::time::Duration;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};

use image_cri_shim_core::error::{Result, ShimError};
use image_cri_shim_core::{RegistryCredential, RegistryWithPriority};

/// Tags requested per page.
const TAG_PAGE_SIZE: usize = 1000;

/// Upper bound on pages fetched for one repository.
const MAX_TAG_PAGES: usize = 10;

/// Lists the tags a registry holds for a repository.
#[async_trait]
pub trait TagLister: Send + Sync {
    async fn tags(&self, registry: &RegistryWithPriority, repository: &str) -> Result<Vec<String>>;
}

/// [`TagLister`] backed by the OCI distribution API.
pub struct OciTagLister {
    client: Client,
    timeout: Duration,
    plain_http: Vec<String>,
}

impl OciTagLister {
    /// Registries configured as insecure, and loopback ones, are reached
    /// over plain HTTP; everything else uses HTTPS.
    pub fn new(timeout: Duration, registries: &[RegistryWithPriority]) -> Self {
        let plain_http: Vec<String> = registries
            .iter()
            .filter(|registry| registry.insecure || is_loopback(&registry.domain))
            .map(|registry| registry.domain.clone())
            .collect();
        if !plain_http.is_empty() {
            tracing::info!(registries = ?plain_http, "Probing registries over plain HTTP");
        }
        let config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(plain_http.clone()),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            timeout,
            plain_http,
        }
    }

    /// Domains probed over plain HTTP.
    pub fn plain_http_domains(&self) -> &[String] {
        &self.plain_http
    }

    async fn list_all(&self, reference: &Reference, auth: &RegistryAuth) -> Result<Vec<String>> {
        let registry = reference.registry().to_string();
        let mut tags = Vec::new();
        let mut last: Option<String> = None;

        for _ in 0..MAX_TAG_PAGES {
            let page = self
                .client
                .list_tags(reference, auth, Some(TAG_PAGE_SIZE), last.as_deref())
                .await
                .map_err(|e| ShimError::Probe {
                    registry: registry.clone(),
                    message: e.to_string(),
                })?;
            let count = page.tags.len();
            last = page.tags.last().cloned();
            tags.extend(page.tags);
            if count < TAG_PAGE_SIZE {
                break;
            }
        }
        Ok(tags)
    }
}

#[async_trait]
impl TagLister for OciTagLister {
    async fn tags(&self, registry: &RegistryWithPriority, repository: &str) -> Result<Vec<String>> {
        let reference = Reference::with_tag(
            registry.domain.clone(),
            repository.to_string(),
            "latest".to_string(),
        );
        let auth = to_oci_auth(&registry.credential);

        tracing::debug!(
            registry = %registry.domain,
            repository = %repository,
            "Listing registry tags"
        );
        match tokio::time::timeout(self.timeout, self.list_all(&reference, &auth)).await {
            Ok(result) => result,
            Err(_) => Err(ShimError::Probe {
                registry: registry.domain.clone(),
                message: format!("tag listing timed out after {:?}", self.timeout),
            }),
        }
    }
}

fn is_loopback(domain: &str) -> bool {
    let host = domain.split(':').next().unwrap_or_default();
    host == "localhost" || host.starts_with("127.")
}

fn to_oci_auth(credential: &RegistryCredential) -> RegistryAuth {
    if credential.is_anonymous() {
        RegistryAuth::Anonymous
    } else {
        RegistryAuth::Basic(credential.username.clone(), credential.password.clone())
    }
}
