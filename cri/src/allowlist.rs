//! Allow-listed image references.
//!
//! References listed in the allow-list directory are redirected to the
//! mirror registry without probing. The set is swapped atomically on each
//! refresh so readers never observe a partial update.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;

/// Snapshot-swapped set of allow-listed references.
pub struct AllowList {
    entries: ArcSwap<HashSet<String>>,
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new()
    }
}

impl AllowList {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashSet::new()),
        }
    }

    /// Verbatim membership test against the current snapshot.
    pub fn contains(&self, reference: &str) -> bool {
        self.entries.load().contains(reference)
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    pub fn snapshot(&self) -> Arc<HashSet<String>> {
        self.entries.load_full()
    }

    /// Replace the whole set.
    pub fn replace(&self, entries: HashSet<String>) {
        self.entries.store(Arc::new(entries));
    }

    /// Reload from `dir` and swap the result in. Returns the new size.
    pub async fn reload(&self, dir: &Path) -> usize {
        let entries = load_dir(dir).await;
        let count = entries.len();
        self.replace(entries);
        count
    }
}

/// Read every file under `dir`, one reference per line.
///
/// Blank lines and `#` comments are skipped. Unreadable files are logged and
/// skipped; a missing directory yields an empty set.
pub async fn load_dir(dir: &Path) -> HashSet<String> {
    let mut entries = HashSet::new();
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut reader = match tokio::fs::read_dir(&current).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %current.display(), "Allow-list directory does not exist");
                continue;
            }
            Err(e) => {
                tracing::warn!(dir = %current.display(), error = %e, "Failed to read allow-list directory");
                continue;
            }
        };

        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %current.display(), error = %e, "Failed to list allow-list directory");
                    break;
                }
            };
            let path = entry.path();
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => {
                    pending.push(path);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Skipping allow-list entry");
                    continue;
                }
            }

            match tokio::fs::read_to_string(&path).await {
                Ok(content) => entries.extend(parse_lines(&content)),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Skipping unreadable allow-list file");
                }
            }
        }
    }

    entries
}

fn parse_lines(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

/// Periodically reloads an [`AllowList`] from its directory.
pub struct AllowListRefresher {
    list: Arc<AllowList>,
    dir: PathBuf,
    interval: Duration,
}

impl AllowListRefresher {
    pub fn new(list: Arc<AllowList>, dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            list,
            dir: dir.into(),
            interval,
        }
    }

    /// Spawn the refresh task. A zero interval starts nothing.
    ///
    /// The first tick fires immediately, so the list is populated right
    /// after start.
    pub fn start(self) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            tracing::info!("Allow-list refresh disabled");
            return None;
        }

        tracing::info!(
            dir = %self.dir.display(),
            interval_secs = self.interval.as_secs(),
            "Starting allow-list refresh"
        );
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let before = self.list.len();
                let after = self.list.reload(&self.dir).await;
                if before != after {
                    tracing::info!(before, after, "Allow-list reloaded");
                } else {
                    tracing::debug!(entries = after, "Allow-list reloaded");
                }
            }
        }))
    }
}
