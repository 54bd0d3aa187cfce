//! Registry credentials and priority ordering.
//!
//! Credentials come in two maps: online registries (pulled through as
//! configured) and offline/fallback registries (the operator mirror). Both are
//! keyed by normalized domain and never change after construction.

use std::collections::{HashMap, HashSet};

use crate::reference::normalize_domain;

/// Lowest accepted registry priority.
pub const MIN_PRIORITY: i32 = 0;

/// Highest accepted registry priority.
pub const MAX_PRIORITY: i32 = 10000;

/// Priority of an online registry that does not set one.
pub const REGISTRY_DEFAULT_PRIORITY: i32 = 500;

/// Priority of the offline mirror unless configured otherwise.
pub const OFFLINE_DEFAULT_PRIORITY: i32 = 1000;

/// Username/password pair for one registry domain.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    pub domain: String,
    pub username: String,
    pub password: String,
}

impl RegistryCredential {
    pub fn new(
        domain: impl AsRef<str>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            domain: normalize_domain(domain.as_ref()),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse a `user:password` string. The password may itself contain `:`.
    pub fn from_auth_string(domain: impl AsRef<str>, auth: &str) -> Option<Self> {
        let (username, password) = auth.split_once(':')?;
        if username.is_empty() {
            return None;
        }
        Some(Self::new(domain, username, password))
    }

    /// Entries configured without `auth` carry no credential to inject.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }
}

impl std::fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Fully processed credential configuration handed to the shim.
#[derive(Debug, Clone, Default)]
pub struct ShimAuthConfig {
    /// Online registries keyed by domain.
    pub cri_configs: HashMap<String, RegistryCredential>,
    /// Priorities of online registries keyed by domain.
    pub cri_priorities: HashMap<String, i32>,
    /// Offline/fallback registries keyed by domain.
    pub offline_configs: HashMap<String, RegistryCredential>,
    /// Priority shared by every offline registry.
    pub offline_priority: i32,
    /// Mirror registry domain that allow-listed references are redirected to.
    pub mirror_domain: Option<String>,
    /// Domains configured with an `http://` address.
    pub insecure_registries: HashSet<String>,
}

/// A registry domain in probe order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryWithPriority {
    pub domain: String,
    pub credential: RegistryCredential,
    pub priority: i32,
    pub offline: bool,
    /// Reached over plain HTTP.
    pub insecure: bool,
}

/// Read-only credential lookup shared by every adapter.
#[derive(Debug, Default)]
pub struct AuthStore {
    online: HashMap<String, RegistryCredential>,
    offline: HashMap<String, RegistryCredential>,
    priorities: HashMap<String, i32>,
    offline_priority: i32,
    mirror_domain: Option<String>,
    insecure: HashSet<String>,
    sorted: Vec<RegistryWithPriority>,
}

impl AuthStore {
    pub fn new(config: ShimAuthConfig) -> Self {
        let rekey = |map: HashMap<String, RegistryCredential>| {
            map.into_iter()
                .map(|(domain, cred)| (normalize_domain(&domain), cred))
                .collect::<HashMap<_, _>>()
        };
        let online = rekey(config.cri_configs);
        let offline = rekey(config.offline_configs);
        let priorities = config
            .cri_priorities
            .into_iter()
            .map(|(domain, priority)| (normalize_domain(&domain), priority))
            .collect();
        let offline_priority = if config.offline_priority == 0 {
            OFFLINE_DEFAULT_PRIORITY
        } else {
            config.offline_priority
        };

        let mut store = Self {
            online,
            offline,
            priorities,
            offline_priority,
            mirror_domain: config.mirror_domain.map(|d| normalize_domain(&d)),
            insecure: config
                .insecure_registries
                .iter()
                .map(|d| normalize_domain(d))
                .collect(),
            sorted: Vec::new(),
        };
        store.sorted = store.compute_sorted();
        store
    }

    fn compute_sorted(&self) -> Vec<RegistryWithPriority> {
        let mut entries: Vec<RegistryWithPriority> = self
            .offline
            .iter()
            .map(|(domain, cred)| RegistryWithPriority {
                domain: domain.clone(),
                credential: cred.clone(),
                priority: self.offline_priority,
                offline: true,
                insecure: self.insecure.contains(domain),
            })
            .collect();

        for (domain, cred) in &self.online {
            if self.offline.contains_key(domain) {
                continue;
            }
            let priority = match self.priorities.get(domain) {
                Some(&p) if p != 0 => p,
                _ => REGISTRY_DEFAULT_PRIORITY,
            };
            entries.push(RegistryWithPriority {
                domain: domain.clone(),
                credential: cred.clone(),
                priority,
                offline: false,
                insecure: self.insecure.contains(domain),
            });
        }

        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.offline.cmp(&a.offline))
                .then_with(|| a.domain.cmp(&b.domain))
        });
        entries
    }

    /// Every configured domain, highest priority first; offline wins ties.
    pub fn sorted_registries(&self) -> &[RegistryWithPriority] {
        &self.sorted
    }

    /// Stored credential for `domain`, online map first, case-insensitive.
    pub fn credential_for(&self, domain: &str) -> Option<&RegistryCredential> {
        let domain = normalize_domain(domain);
        self.online
            .get(&domain)
            .or_else(|| self.offline.get(&domain))
    }

    pub fn mirror_domain(&self) -> Option<&str> {
        self.mirror_domain.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty() && self.offline.is_empty()
    }
}
