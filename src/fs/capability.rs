//! Capability Oracle (spec §4.11).
//!
//! Polled by the Local Index and Snapshot Store to ask whether the plugin
//! data directory / snapshot subdirectory is writable, and whether a
//! persistent index is likely to succeed. Each capability is cached with an
//! exponential-backoff TTL on failure; consumers never block permanently on
//! a probe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::atomic::probe_rename_capability;

const BASE_BACKOFF: Duration = Duration::from_secs(5 * 60);
const MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    PluginDataWritable,
    SnapshotDirWritable,
    PersistentIndexLikely,
}

struct CacheEntry {
    available: bool,
    checked_at: Instant,
    consecutive_failures: u32,
}

impl CacheEntry {
    fn ttl(&self) -> Duration {
        if self.available {
            // Successes are cheap to re-verify relatively often; failures
            // back off so we don't hammer a read-only host.
            BASE_BACKOFF
        } else {
            let doublings = self.consecutive_failures.min(3);
            (BASE_BACKOFF * 2u32.pow(doublings)).min(MAX_BACKOFF)
        }
    }

    fn is_stale(&self) -> bool {
        self.checked_at.elapsed() >= self.ttl()
    }
}

/// Probes writability of a directory by attempting to create and remove a
/// throwaway marker file.
async fn probe_writable(dir: &Path) -> bool {
    if tokio::fs::create_dir_all(dir).await.is_err() {
        return false;
    }
    let marker = dir.join(".kohl-capability-probe");
    let ok = tokio::fs::write(&marker, b"probe").await.is_ok();
    let _ = tokio::fs::remove_file(&marker).await;
    ok
}

pub struct CapabilityOracle {
    plugin_data_dir: PathBuf,
    snapshot_dir: PathBuf,
    cache: Mutex<HashMap<Capability, CacheEntry>>,
}

impl CapabilityOracle {
    pub fn new(plugin_data_dir: PathBuf, snapshot_dir: PathBuf) -> Self {
        CapabilityOracle {
            plugin_data_dir,
            snapshot_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached verdict for `cap`, re-probing if the TTL expired.
    pub async fn check(&self, cap: Capability) -> bool {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get(&cap) {
            if !entry.is_stale() {
                return entry.available;
            }
        }
        let prior_failures = cache
            .get(&cap)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0);
        drop(cache);

        let available = self.probe(cap).await;

        let mut cache = self.cache.lock().await;
        cache.insert(
            cap,
            CacheEntry {
                available,
                checked_at: Instant::now(),
                consecutive_failures: if available { 0 } else { prior_failures + 1 },
            },
        );
        available
    }

    async fn probe(&self, cap: Capability) -> bool {
        match cap {
            Capability::PluginDataWritable => probe_writable(&self.plugin_data_dir).await,
            Capability::SnapshotDirWritable => probe_writable(&self.snapshot_dir).await,
            Capability::PersistentIndexLikely => {
                probe_writable(&self.plugin_data_dir).await
                    && probe_rename_capability(&self.plugin_data_dir).await
            }
        }
    }

    /// Manually reset every TTL, forcing the next `check()` to re-probe.
    pub async fn refresh_all(&self) {
        self.cache.lock().await.clear();
    }
}
