//! Input cache — per-agent on-disk cache keyed by signed URL.
//!
//! Forward-HTTP workloads frequently submit bursts of jobs sharing one
//! input (repeated analysis of the same asset with different parameters),
//! and the signer keeps URLs stable within its TTL window. Caching the
//! download turns N fetches into one.
//!
//! With a TTL <= 0 the cache is disabled: every call downloads to a fresh
//! one-shot file whose [`Release`] deletes it. With a TTL > 0, entries
//! live under a deterministic name (URL hash + input-key extension) and
//! expired entries are evicted on access.
//!
//! Concurrent calls for the same URL race safely: lookups and map
//! mutations hold the mutex, downloads happen outside it to a unique temp
//! path that is renamed into place. The worst case wastes one duplicate
//! download; it never corrupts state.

use super::download_to_file;
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

struct CacheEntry {
    path: PathBuf,
    expires_at: Instant,
}

/// Cleanup handle returned with every cached path.
pub enum Release {
    /// Cache-owned file; releasing is a no-op.
    Keep,
    /// One-shot temp file (caching disabled); releasing deletes it.
    Remove(PathBuf),
}

impl Release {
    pub async fn release(self) {
        if let Release::Remove(path) = self {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

pub struct InputCache {
    dir: PathBuf,
    ttl: Option<Duration>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    client: reqwest::Client,
}

impl InputCache {
    pub fn new(dir: PathBuf, ttl_secs: i64, client: reqwest::Client) -> Self {
        let ttl = if ttl_secs > 0 {
            Some(Duration::from_secs(ttl_secs as u64))
        } else {
            None
        };
        InputCache {
            dir,
            ttl,
            entries: Mutex::new(HashMap::new()),
            client,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deterministic cache filename: URL digest plus the input key's
    /// extension so downstream tooling can dispatch by file type.
    fn cached_name(url: &str, input_key: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let mut name: String = digest
            .iter()
            .take(16)
            .map(|b| format!("{:02x}", b))
            .collect();
        name.push_str(&super::executor::input_extension(input_key));
        name
    }

    /// Resolve a local file for `url`, downloading when necessary.
    pub async fn get(&self, url: &str, input_key: &str) -> Result<(PathBuf, Release)> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let Some(ttl) = self.ttl else {
            // Caching disabled: fresh one-shot file per call.
            let path = self.dir.join(format!(
                "oneshot_{}{}",
                Uuid::new_v4(),
                super::executor::input_extension(input_key)
            ));
            if let Err(e) = download_to_file(&self.client, url, &path).await {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
            return Ok((path.clone(), Release::Remove(path)));
        };

        let path = self.dir.join(Self::cached_name(url, input_key));

        // Fast path: a live entry whose file still exists.
        let stale_path = {
            let mut entries = self.lock();
            match entries.get(url) {
                Some(entry) if entry.expires_at > Instant::now() && entry.path.exists() => {
                    debug!(url = %crate::redact_url(url), "input cache hit");
                    return Ok((entry.path.clone(), Release::Keep));
                }
                Some(entry) => {
                    let stale = entry.path.clone();
                    entries.remove(url);
                    Some(stale)
                }
                None => None,
            }
        };
        if let Some(stale) = stale_path {
            debug!(url = %crate::redact_url(url), "evicting expired cache entry");
            let _ = tokio::fs::remove_file(stale).await;
        }

        // Download outside the lock to a unique temp path, then rename
        // into place; concurrent callers at worst both download.
        let tmp = self.dir.join(format!(".download_{}", Uuid::new_v4()));
        if let Err(e) = download_to_file(&self.client, url, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, &path).await?;

        self.lock().insert(
            url.to_string(),
            CacheEntry {
                path: path.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok((path, Release::Keep))
    }
}
