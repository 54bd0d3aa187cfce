//! Image reference rewriting.
//!
//! Decides where an image should be pulled from:
//!
//! 1. images the runtime already holds are left alone;
//! 2. allow-listed references go straight to the mirror;
//! 3. otherwise each configured registry is asked for the tag, in priority
//!    order, and the first one holding it wins. These probe outcomes are
//!    cached; allow-list decisions always follow the current snapshot.
//!
//! Every failure along the way leaves the reference unchanged.

use std::sync::Arc;

use async_trait::async_trait;

use image_cri_shim_core::error::Result;
use image_cri_shim_core::{AuthStore, ImageReference, RegistryCredential};

use crate::allowlist::AllowList;
use crate::cache::{CachedRewrite, RewriteCache};
use crate::registry::TagLister;

/// Source of the image identifiers the backing runtime already holds.
#[async_trait]
pub trait LocalImages: Send + Sync {
    /// Image IDs and repo digests known to the runtime.
    async fn image_ids(&self) -> Result<Vec<String>>;
}

/// RPC a rewrite is performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteAction {
    ImageStatus,
    PullImage,
    RemoveImage,
}

impl RewriteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewriteAction::ImageStatus => "ImageStatus",
            RewriteAction::PullImage => "PullImage",
            RewriteAction::RemoveImage => "RemoveImage",
        }
    }
}

/// What decided the outcome of a rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteSource {
    Local,
    Cache,
    AllowList,
    Registry(String),
    Unchanged,
}

impl std::fmt::Display for RewriteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewriteSource::Local => write!(f, "local"),
            RewriteSource::Cache => write!(f, "cache"),
            RewriteSource::AllowList => write!(f, "allow-list"),
            RewriteSource::Registry(domain) => write!(f, "registry:{}", domain),
            RewriteSource::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Outcome of one rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub image: String,
    pub replaced: bool,
    /// Registry the reference now points at, when redirected.
    pub domain: Option<String>,
    pub source: RewriteSource,
}

impl Rewrite {
    fn unchanged(image: &str, source: RewriteSource) -> Self {
        Self {
            image: image.to_string(),
            replaced: false,
            domain: None,
            source,
        }
    }

    fn redirected(reference: &ImageReference, source: RewriteSource) -> Self {
        Self {
            image: reference.full_reference(),
            replaced: true,
            domain: Some(reference.domain.clone()),
            source,
        }
    }
}

/// Rewrites image references toward the mirror and configured registries.
pub struct ReferenceRewriter {
    auth: Arc<AuthStore>,
    allow_list: Arc<AllowList>,
    prober: Arc<dyn TagLister>,
    cache: RewriteCache,
    digest_compat: bool,
}

impl ReferenceRewriter {
    pub fn new(
        auth: Arc<AuthStore>,
        allow_list: Arc<AllowList>,
        prober: Arc<dyn TagLister>,
        cache: RewriteCache,
    ) -> Self {
        Self {
            auth,
            allow_list,
            prober,
            cache,
            digest_compat: true,
        }
    }

    /// With compat on, `@digest` is dropped and `latest` used instead.
    pub fn with_digest_compat(mut self, digest_compat: bool) -> Self {
        self.digest_compat = digest_compat;
        self
    }

    pub fn cache(&self) -> &RewriteCache {
        &self.cache
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    pub async fn rewrite(
        &self,
        action: RewriteAction,
        image: &str,
        local: &dyn LocalImages,
    ) -> Rewrite {
        let (outcome, cache_hit) = self.resolve(image, local).await;
        tracing::info!(
            action = action.as_str(),
            original = %image,
            result = %outcome.image,
            source = %outcome.source,
            cache_hit,
            replaced = outcome.replaced,
            "Rewrite decision"
        );
        outcome
    }

    async fn resolve(&self, image: &str, local: &dyn LocalImages) -> (Rewrite, bool) {
        if image.is_empty() {
            return (Rewrite::unchanged(image, RewriteSource::Unchanged), false);
        }

        if is_local(image, local).await {
            return (Rewrite::unchanged(image, RewriteSource::Local), false);
        }

        let reference = match ImageReference::parse(image) {
            Ok(reference) => reference,
            Err(e) => {
                tracing::warn!(image = %image, error = %e, "Leaving unparseable reference unchanged");
                return (Rewrite::unchanged(image, RewriteSource::Unchanged), false);
            }
        };
        let reference = if self.digest_compat {
            reference.pin_to_latest_tag()
        } else {
            reference
        };

        if let Some(mirror) = self.auth.mirror_domain() {
            if !self.allow_list.is_empty() && self.allow_list.contains(image) {
                let target = reference.with_domain(mirror);
                return (Rewrite::redirected(&target, RewriteSource::AllowList), false);
            }
        }

        // A tag listing cannot confirm that a registry holds a digest.
        if reference.digest.is_some() {
            return (Rewrite::unchanged(image, RewriteSource::Unchanged), false);
        }

        if let Some(cached) = self.cache.get(image) {
            let outcome = Rewrite {
                image: cached.image,
                replaced: cached.replaced,
                domain: cached.domain,
                source: RewriteSource::Cache,
            };
            return (outcome, true);
        }

        let (outcome, cacheable) = self.probe(image, &reference).await;
        if cacheable {
            self.cache.insert(
                image,
                CachedRewrite {
                    image: outcome.image.clone(),
                    domain: outcome.domain.clone(),
                    replaced: outcome.replaced,
                },
            );
        }
        (outcome, false)
    }

    /// Ask each registry for the tag. Returns the outcome and whether it may
    /// be cached; outcomes produced while a probe failed are not.
    async fn probe(&self, image: &str, reference: &ImageReference) -> (Rewrite, bool) {
        let tag = reference.tag_or_default();
        let mut probe_failed = false;
        for registry in self.auth.sorted_registries() {
            match self.prober.tags(registry, &reference.repository).await {
                Ok(tags) if tags.iter().any(|t| t == tag) => {
                    let target = reference.with_domain(&registry.domain);
                    let source = RewriteSource::Registry(registry.domain.clone());
                    return (Rewrite::redirected(&target, source), true);
                }
                Ok(_) => {
                    tracing::debug!(
                        registry = %registry.domain,
                        repository = %reference.repository,
                        tag,
                        "Tag not found in registry"
                    );
                }
                Err(e) => {
                    probe_failed = true;
                    tracing::warn!(
                        registry = %registry.domain,
                        repository = %reference.repository,
                        error = %e,
                        "Registry probe failed"
                    );
                }
            }
        }

        (
            Rewrite::unchanged(image, RewriteSource::Unchanged),
            !probe_failed,
        )
    }

    /// Stored credential to inject into a pull of `image`, if any.
    pub fn credential_for_pull(&self, image: &str) -> Option<&RegistryCredential> {
        let reference = ImageReference::parse(image).ok()?;
        self.auth
            .credential_for(&reference.domain)
            .filter(|credential| !credential.is_anonymous())
    }
}

async fn is_local(image: &str, local: &dyn LocalImages) -> bool {
    match local.image_ids().await {
        Ok(ids) => ids.iter().any(|id| matches_local_id(image, id)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list local images, assuming not local");
            false
        }
    }
}

fn matches_local_id(image: &str, id: &str) -> bool {
    if image == id {
        return true;
    }
    match id.strip_prefix("sha256:") {
        Some(bare) => image == bare,
        None => false,
    }
}
