//! Shim configuration file model.
//!
//! ```yaml
//! shimSocket: /var/run/image-cri-shim.sock
//! criSocket: /run/containerd/containerd.sock
//! address: http://sealos.hub:5000
//! auth: admin:passw0rd
//! registries:
//!   - address: docker.io
//!     auth: user:pass
//!     priority: 600
//! allowList:
//!   dir: /etc/image-cri-shim/images
//!   intervalSecs: 30
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{
    RegistryCredential, ShimAuthConfig, MAX_PRIORITY, MIN_PRIORITY, OFFLINE_DEFAULT_PRIORITY,
    REGISTRY_DEFAULT_PRIORITY,
};
use crate::error::{Result, ShimError};
use crate::reference::normalize_domain;

/// Default listening socket of the shim.
pub const DEFAULT_SHIM_SOCKET: &str = "/var/run/image-cri-shim.sock";

/// Default negotiation timeout (15 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 15 * 60;

/// Default bound on a single registry tag probe.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Default capacity of the rewrite result cache.
pub const DEFAULT_IMAGE_CACHE_SIZE: i64 = 1024;

/// Default lifetime of a cached rewrite result (30 minutes).
pub const DEFAULT_IMAGE_CACHE_TTL_SECS: u64 = 30 * 60;

/// One online registry entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Registry address, with or without scheme; `http://` selects plain HTTP.
    pub address: String,
    /// `user:password`
    #[serde(default)]
    pub auth: String,
    /// Probe priority in [0, 10000]; 0 means default.
    #[serde(default)]
    pub priority: i32,
}

/// Allow-list refresh settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowListConfig {
    /// Directory of plain-text files, one reference per line.
    #[serde(default)]
    pub dir: PathBuf,
    /// Refresh interval; 0 disables the refresh task.
    #[serde(default)]
    pub interval_secs: u64,
}

impl AllowListConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Rewrite result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Capacity; 0 means default, negative disables caching.
    #[serde(default)]
    pub image_cache_size: i64,
    /// Entry lifetime; 0 means default.
    #[serde(default)]
    pub image_cache_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            image_cache_size: DEFAULT_IMAGE_CACHE_SIZE,
            image_cache_ttl_secs: DEFAULT_IMAGE_CACHE_TTL_SECS,
        }
    }
}

impl CacheConfig {
    /// Effective capacity; 0 disables caching.
    pub fn capacity(&self) -> usize {
        match self.image_cache_size {
            0 => DEFAULT_IMAGE_CACHE_SIZE as usize,
            n if n < 0 => 0,
            n => n as usize,
        }
    }

    pub fn ttl(&self) -> Duration {
        match self.image_cache_ttl_secs {
            0 => Duration::from_secs(DEFAULT_IMAGE_CACHE_TTL_SECS),
            n => Duration::from_secs(n),
        }
    }
}

/// Explicit ownership and mode of the shim socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketPermissions {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits, e.g. `0o660` (YAML `432`).
    pub mode: u32,
}

/// Shim configuration as read from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimConfig {
    /// Absolute path of the socket the shim listens on.
    #[serde(default = "default_shim_socket")]
    pub shim_socket: PathBuf,
    /// Absolute path of the backing runtime's image socket.
    #[serde(default)]
    pub cri_socket: PathBuf,
    /// Mirror (offline) registry address.
    #[serde(default)]
    pub address: String,
    /// Mirror credentials as `user:password`.
    #[serde(default)]
    pub auth: String,
    /// Priority of the mirror registry; 0 means default.
    #[serde(default)]
    pub offline_priority: i32,
    /// Online registries with their own credentials.
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
    /// Version negotiation timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bound on a single registry tag probe.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Block until the backing runtime socket appears.
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub allow_list: AllowListConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Drop `@digest` suffixes and use `latest` when rewriting.
    #[serde(default = "default_true")]
    pub digest_compat: bool,
    /// Explicit socket ownership; mirrored from the backing runtime when unset.
    #[serde(default)]
    pub socket_permissions: Option<SocketPermissions>,
    #[serde(default)]
    pub debug: bool,
}

fn default_shim_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SHIM_SOCKET)
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            shim_socket: default_shim_socket(),
            cri_socket: PathBuf::new(),
            address: String::new(),
            auth: String::new(),
            offline_priority: 0,
            registries: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            wait: false,
            allow_list: AllowListConfig::default(),
            cache: CacheConfig::default(),
            digest_compat: true,
            socket_permissions: None,
            debug: false,
        }
    }
}

impl ShimConfig {
    /// Parse YAML configuration data.
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ShimError::Config(format!(
                "failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&data)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    /// Validate socket paths and build the credential maps.
    pub fn pre_process(&self) -> Result<ShimAuthConfig> {
        if self.cri_socket.as_os_str().is_empty() {
            return Err(ShimError::Config(
                "no backing runtime socket configured".to_string(),
            ));
        }
        if !self.cri_socket.is_absolute() {
            return Err(ShimError::Config(format!(
                "cri socket {} must be an absolute path",
                self.cri_socket.display()
            )));
        }
        if !self.shim_socket.is_absolute() {
            return Err(ShimError::Config(format!(
                "shim socket {} must be an absolute path",
                self.shim_socket.display()
            )));
        }

        let mut auth = ShimAuthConfig {
            offline_priority: clamp_priority(
                "offline registry",
                self.offline_priority,
                OFFLINE_DEFAULT_PRIORITY,
            ),
            ..Default::default()
        };

        if !self.address.is_empty() {
            let domain = registry_domain(&self.address);
            if is_plain_http(&self.address) {
                auth.insecure_registries.insert(domain.clone());
            }
            if let Some(cred) = credential(&domain, &self.auth) {
                auth.offline_configs.insert(domain.clone(), cred);
            }
            auth.mirror_domain = Some(domain);
        }

        let mut seen = HashSet::new();
        for registry in &self.registries {
            if registry.address.is_empty() {
                tracing::warn!("Skipping registry entry without address");
                continue;
            }
            let domain = registry_domain(&registry.address);
            if !seen.insert(domain.clone()) {
                tracing::warn!(domain = %domain, "Duplicate registry entry, keeping the first");
                continue;
            }
            let Some(cred) = credential(&domain, &registry.auth) else {
                continue;
            };
            if is_plain_http(&registry.address) {
                auth.insecure_registries.insert(domain.clone());
            }
            auth.cri_priorities.insert(
                domain.clone(),
                clamp_priority(&domain, registry.priority, REGISTRY_DEFAULT_PRIORITY),
            );
            auth.cri_configs.insert(domain, cred);
        }

        Ok(auth)
    }
}

/// Strip scheme and path from an address and normalize the domain.
pub fn registry_domain(address: &str) -> String {
    let address = address.trim();
    let without_scheme = match address.split_once("://") {
        Some((_, rest)) => rest,
        None => address,
    };
    let host = without_scheme.split('/').next().unwrap_or_default();
    normalize_domain(host)
}

/// Whether an address asks for plain HTTP.
pub fn is_plain_http(address: &str) -> bool {
    address
        .trim()
        .get(..7)
        .map_or(false, |scheme| scheme.eq_ignore_ascii_case("http://"))
}

fn credential(domain: &str, auth: &str) -> Option<RegistryCredential> {
    if auth.is_empty() {
        return Some(RegistryCredential::new(domain, "", ""));
    }
    let cred = RegistryCredential::from_auth_string(domain, auth);
    if cred.is_none() {
        tracing::warn!(domain = %domain, "Ignoring malformed auth, expected user:password");
    }
    cred
}

fn clamp_priority(what: &str, priority: i32, default: i32) -> i32 {
    if priority == 0 {
        return default;
    }
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        let clamped = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        tracing::warn!(
            registry = %what,
            priority,
            clamped,
            "Priority out of range, clamping"
        );
        return clamped;
    }
    priority
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_sockets(mut cfg: ShimConfig) -> ShimConfig {
        cfg.cri_socket = PathBuf::from("/tmp/fake-cri.sock");
        cfg
    }

    #[test]
    fn test_defaults() {
        let cfg = ShimConfig::from_yaml("criSocket: /run/containerd/containerd.sock\n").unwrap();
        assert_eq!(cfg.shim_socket, PathBuf::from(DEFAULT_SHIM_SOCKET));
        assert_eq!(cfg.timeout(), Duration::from_secs(900));
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(5));
        assert!(cfg.digest_compat);
        assert!(!cfg.wait);
        assert_eq!(cfg.allow_list.interval(), Duration::ZERO);
        assert_eq!(cfg.cache.capacity(), 1024);
        assert!(cfg.socket_permissions.is_none());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
shimSocket: /var/run/shim.sock
criSocket: /run/containerd/containerd.sock
address: https://sealos.hub:5000
auth: admin:passw0rd
offlinePriority: 900
registries:
  - address: docker.io
    auth: user1:pass1
    priority: 600
  - address: https://registry.example.com/v2/
    auth: user2:pass2
    priority: 950
timeoutSecs: 60
probeTimeoutSecs: 2
wait: true
allowList:
  dir: /etc/image-cri-shim/images
  intervalSecs: 30
cache:
  imageCacheSize: 16
  imageCacheTtlSecs: 10
digestCompat: false
socketPermissions:
  uid: 0
  gid: 992
  mode: 432
debug: true
"#;
        let cfg = ShimConfig::from_yaml(yaml).unwrap();
        assert!(cfg.wait);
        assert!(!cfg.digest_compat);
        assert_eq!(cfg.allow_list.dir, PathBuf::from("/etc/image-cri-shim/images"));
        assert_eq!(cfg.cache.capacity(), 16);
        assert_eq!(cfg.cache.ttl(), Duration::from_secs(10));
        assert_eq!(
            cfg.socket_permissions,
            Some(SocketPermissions {
                uid: 0,
                gid: 992,
                mode: 0o660
            })
        );

        let auth = cfg.pre_process().unwrap();
        assert_eq!(auth.mirror_domain.as_deref(), Some("sealos.hub:5000"));
        assert_eq!(auth.offline_priority, 900);
        assert_eq!(auth.offline_configs["sealos.hub:5000"].username, "admin");
        assert_eq!(auth.cri_priorities["docker.io"], 600);
        assert_eq!(auth.cri_priorities["registry.example.com"], 950);
        assert_eq!(auth.cri_configs["registry.example.com"].password, "pass2");
    }

    #[test]
    fn test_priority_defaults_and_clamping() {
        let yaml = r#"
address: sealos.hub
auth: admin:passw0rd
offlinePriority: 15000
registries:
  - address: docker.io
    auth: user1:pass1
  - address: low.example.com
    auth: u:p
    priority: -100
"#;
        let auth = with_sockets(ShimConfig::from_yaml(yaml).unwrap())
            .pre_process()
            .unwrap();
        assert_eq!(auth.offline_priority, MAX_PRIORITY);
        assert_eq!(auth.cri_priorities["docker.io"], REGISTRY_DEFAULT_PRIORITY);
        assert_eq!(auth.cri_priorities["low.example.com"], MIN_PRIORITY);
    }

    #[test]
    fn test_offline_priority_zero_uses_default() {
        let auth = with_sockets(ShimConfig::from_yaml("address: sealos.hub\n").unwrap())
            .pre_process()
            .unwrap();
        assert_eq!(auth.offline_priority, OFFLINE_DEFAULT_PRIORITY);
        assert!(auth.offline_configs.contains_key("sealos.hub"));
    }

    #[test]
    fn test_legacy_docker_domain_normalized() {
        let yaml = r#"
registries:
  - address: https://index.docker.io
    auth: user:pass
"#;
        let auth = with_sockets(ShimConfig::from_yaml(yaml).unwrap())
            .pre_process()
            .unwrap();
        assert!(auth.cri_configs.contains_key("docker.io"));
    }

    #[test]
    fn test_malformed_auth_is_skipped() {
        let yaml = r#"
registries:
  - address: registry.example.com
    auth: nocolon
"#;
        let auth = with_sockets(ShimConfig::from_yaml(yaml).unwrap())
            .pre_process()
            .unwrap();
        assert!(auth.cri_configs.is_empty());
    }

    #[test]
    fn test_relative_sockets_rejected() {
        let mut cfg = ShimConfig::default();
        cfg.cri_socket = PathBuf::from("run/containerd.sock");
        assert!(matches!(cfg.pre_process(), Err(ShimError::Config(_))));

        let mut cfg = ShimConfig::default();
        cfg.cri_socket = PathBuf::from("/run/containerd.sock");
        cfg.shim_socket = PathBuf::from("shim.sock");
        assert!(matches!(cfg.pre_process(), Err(ShimError::Config(_))));
    }

    #[test]
    fn test_missing_cri_socket_rejected() {
        let err = ShimConfig::default().pre_process().unwrap_err();
        assert!(err.to_string().contains("no backing runtime socket"));
    }

    #[test]
    fn test_cache_disabled_by_negative_size() {
        let cfg = CacheConfig {
            image_cache_size: -1,
            image_cache_ttl_secs: 0,
        };
        assert_eq!(cfg.capacity(), 0);
        assert_eq!(cfg.ttl(), Duration::from_secs(DEFAULT_IMAGE_CACHE_TTL_SECS));
    }

    #[test]
    fn test_registry_domain() {
        assert_eq!(registry_domain("https://sealos.hub:5000"), "sealos.hub:5000");
        assert_eq!(registry_domain("http://localhost:5000/v2/"), "localhost:5000");
        assert_eq!(registry_domain("index.docker.io"), "docker.io");
    }

    #[test]
    fn test_http_scheme_marks_registry_insecure() {
        let yaml = r#"
address: http://sealos.hub:5000
auth: admin:passw0rd
registries:
  - address: HTTP://harbor.internal/v2/
    auth: u:p
  - address: https://registry.example.com
    auth: u:p
  - address: quay.io
"#;
        let auth = with_sockets(ShimConfig::from_yaml(yaml).unwrap())
            .pre_process()
            .unwrap();
        assert_eq!(auth.mirror_domain.as_deref(), Some("sealos.hub:5000"));
        assert!(auth.insecure_registries.contains("sealos.hub:5000"));
        assert!(auth.insecure_registries.contains("harbor.internal"));
        assert!(!auth.insecure_registries.contains("registry.example.com"));
        assert!(!auth.insecure_registries.contains("quay.io"));
        assert_eq!(auth.insecure_registries.len(), 2);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shim.yaml");
        std::fs::write(&path, "criSocket: /run/crio/crio.sock\nwait: true\n").unwrap();
        let cfg = ShimConfig::load(&path).unwrap();
        assert!(cfg.wait);
        assert_eq!(cfg.cri_socket, PathBuf::from("/run/crio/crio.sock"));

        assert!(matches!(
            ShimConfig::load(&dir.path().join("missing.yaml")),
            Err(ShimError::Config(_))
        ));
    }
}
