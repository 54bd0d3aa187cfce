//! Image reference parsing and normalization.
//!
//! Decomposes references like `nginx`, `team/app:v2` or
//! `myregistry.io:5000/team/app@sha256:...` into domain, repository, tag
//! and digest, applying the Docker Hub defaults.

use crate::error::{Result, ShimError};

/// Canonical domain of the default registry.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Legacy alias of the default registry, always folded into [`DEFAULT_DOMAIN`].
pub const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";

/// Namespace of official images on the default registry.
pub const OFFICIAL_REPO_PREFIX: &str = "library/";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed and normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry domain, never empty after parsing (e.g. "docker.io", "sealos.hub:5000")
    pub domain: String,
    /// Namespace-qualified repository path (e.g. "library/nginx", "team/app")
    pub repository: String,
    /// Tag; `None` only when a digest is authoritative
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalize a raw reference.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `team/app:v2` → docker.io/team/app:v2
    /// - `index.docker.io/nginx` → docker.io/library/nginx:latest
    /// - `myregistry.io:5000/team/app:v2` → unchanged
    /// - `ghcr.io/org/app@sha256:...` → digest kept, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ShimError::Reference("empty image reference".to_string()));
        }

        let (domain, remainder) = split_domain(reference);

        let (name_tag, digest) = match remainder.rfind('@') {
            Some(at) => {
                let digest = &remainder[at + 1..];
                validate_digest(reference, digest)?;
                (&remainder[..at], Some(digest.to_string()))
            }
            None => (remainder, None),
        };

        let (name, tag) = match name_tag.rfind(':') {
            Some(colon) => {
                let tag = &name_tag[colon + 1..];
                validate_tag(reference, tag)?;
                (&name_tag[..colon], Some(tag.to_string()))
            }
            None => (name_tag, None),
        };

        let domain = normalize_domain(domain);
        let repository = if domain == DEFAULT_DOMAIN && !name.contains('/') {
            format!("{}{}", OFFICIAL_REPO_PREFIX, name)
        } else {
            name.to_string()
        };
        validate_repository(reference, &repository)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            domain,
            repository,
            tag,
            digest,
        })
    }

    /// Drop the digest and force the `latest` tag.
    ///
    /// Rewritten pulls resolve through tag listings, which cannot express a
    /// digest; the pinned content is therefore not guaranteed to match.
    pub fn pin_to_latest_tag(mut self) -> Self {
        if self.digest.take().is_some() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }

    /// Tag to probe registries with, `latest` when only a digest is known.
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Same reference relocated onto another registry domain.
    pub fn with_domain(&self, domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..self.clone()
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.domain, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Fold the legacy alias and the empty domain into the canonical default.
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('/');
    if domain.is_empty() || domain.eq_ignore_ascii_case(LEGACY_DEFAULT_DOMAIN) {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain.to_ascii_lowercase()
    }
}

/// Split on the first `/`; the left part is a domain only when it looks like one.
fn split_domain(reference: &str) -> (&str, &str) {
    if let Some(slash) = reference.find('/') {
        let first = &reference[..slash];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first, &reference[slash + 1..]);
        }
    }
    ("", reference)
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    let valid = match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && !hex.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '_' | '-'))
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ShimError::Reference(format!(
            "invalid digest in '{}': expected algorithm:hex",
            reference
        )))
    }
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && !tag.starts_with(['.', '-']);
    if valid {
        Ok(())
    } else {
        Err(ShimError::Reference(format!(
            "invalid tag '{}' in '{}'",
            tag, reference
        )))
    }
}

fn validate_repository(reference: &str, repository: &str) -> Result<()> {
    let valid = !repository.is_empty()
        && repository.split('/').all(|component| {
            !component.is_empty()
                && component.chars().all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
                })
        });
    if valid {
        Ok(())
    } else {
        Err(ShimError::Reference(format!(
            "invalid repository '{}' in '{}'",
            repository, reference
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.domain, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("1.25".to_string()));
    }

    #[test]
    fn test_parse_namespaced_repo() {
        let r = ImageReference::parse("myrepo/app:v1").unwrap();
        assert_eq!(r.domain, "docker.io");
        assert_eq!(r.repository, "myrepo/app");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port_round_trips() {
        let raw = "myregistry.io:5000/team/app:v2";
        let r = ImageReference::parse(raw).unwrap();
        assert_eq!(r.domain, "myregistry.io:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, Some("v2".to_string()));
        assert_eq!(r.full_reference(), raw);
    }

    #[test]
    fn test_legacy_domain_is_normalized() {
        let r = ImageReference::parse("index.docker.io/nginx").unwrap();
        assert_eq!(r.domain, "docker.io");
        assert_eq!(r.repository, "library/nginx");
    }

    #[test]
    fn test_explicit_default_domain_gets_namespace() {
        let r = ImageReference::parse("docker.io/busybox:1.36").unwrap();
        assert_eq!(r.full_reference(), "docker.io/library/busybox:1.36");
    }

    #[test]
    fn test_custom_domain_keeps_single_component() {
        let r = ImageReference::parse("sealos.hub:5000/pause:3.9").unwrap();
        assert_eq!(r.domain, "sealos.hub:5000");
        assert_eq!(r.repository, "pause");
    }

    #[test]
    fn test_localhost_is_domain() {
        let r = ImageReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.domain, "localhost");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, Some("test".to_string()));
    }

    #[test]
    fn test_first_segment_without_dot_is_repository() {
        let r = ImageReference::parse("team/sub/app").unwrap();
        assert_eq!(r.domain, "docker.io");
        assert_eq!(r.repository, "team/sub/app");
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app@{}", DIGEST)).unwrap();
        assert_eq!(r.domain, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some(DIGEST));
        assert_eq!(r.tag_or_default(), "latest");
    }

    #[test]
    fn test_pin_to_latest_tag_drops_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app:v3@{}", DIGEST))
            .unwrap()
            .pin_to_latest_tag();
        assert_eq!(r.digest, None);
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.full_reference(), "ghcr.io/org/app:latest");
    }

    #[test]
    fn test_pin_without_digest_keeps_tag() {
        let r = ImageReference::parse("nginx:1.25").unwrap().pin_to_latest_tag();
        assert_eq!(r.tag, Some("1.25".to_string()));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for raw in [
            "nginx",
            "nginx:1.25",
            "myrepo/app:v1",
            "index.docker.io/library/redis",
            "myregistry.io:5000/team/app:v2",
            "localhost/img",
        ] {
            let once = ImageReference::parse(raw).unwrap();
            let twice = ImageReference::parse(&once.full_reference()).unwrap();
            assert_eq!(once, twice, "not idempotent for {}", raw);
        }
    }

    #[test]
    fn test_with_domain() {
        let r = ImageReference::parse("myrepo/app:v1").unwrap();
        assert_eq!(
            r.with_domain("sealos.hub:5000").full_reference(),
            "sealos.hub:5000/myrepo/app:v1"
        );
    }

    #[test]
    fn test_parse_empty_reference() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
    }

    #[test]
    fn test_parse_invalid_references() {
        assert!(ImageReference::parse("bad@@@").is_err());
        assert!(ImageReference::parse("nginx@invaliddigest").is_err());
        assert!(ImageReference::parse("Nginx").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain(""), "docker.io");
        assert_eq!(normalize_domain("index.docker.io"), "docker.io");
        assert_eq!(normalize_domain("Sealos.Hub:5000"), "sealos.hub:5000");
    }
}
