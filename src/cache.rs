//! Knowledge Cache: immutable, content-addressed jurisdiction research.
//!
//! Each `put` writes a new file
//! `jurisdictions/<key>/<fetched_at>-<sha256 prefix>.json` through a temp
//! file and rename; nothing is ever modified in place. `get` returns the
//! entry with the latest timestamp, so concurrent writers resolve as
//! last-write-wins and readers never see a partial entry.

use crate::util::{is_temp_file, write_json_atomic};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use slotflow_common::{CacheRef, RunId, normalize_jurisdiction};
use std::fs;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.9fZ";

/// One research result for a jurisdiction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Jurisdiction as the caller spelled it
    pub jurisdiction: String,
    /// Normalized cache key
    pub key: String,
    pub fetched_at: DateTime<Utc>,
    /// Hex SHA-256 of the serialized payload
    pub digest: String,
    /// Recon run that produced the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_run: Option<RunId>,
    pub payload: Value,
}

/// A cache entry together with where it lives.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub entry: CacheEntry,
    pub path: PathBuf,
}

impl StoredEntry {
    pub fn to_cache_ref(&self) -> CacheRef {
        CacheRef {
            jurisdiction: self.entry.jurisdiction.clone(),
            path: self.path.clone(),
            fetched_at: self.entry.fetched_at,
        }
    }

    pub fn is_fresh(&self, freshness: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.entry.fetched_at <= freshness
    }
}

/// Result of checking the cache for a jurisdiction.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Fresh(StoredEntry),
    /// Present but older than the freshness window
    Stale(StoredEntry),
    Miss,
}

#[derive(Debug, Clone)]
pub struct KnowledgeCache {
    root: PathBuf,
    freshness: chrono::Duration,
}

impl KnowledgeCache {
    /// Open the cache under `cache_dir` with the given freshness window.
    pub fn new(cache_dir: &Path, freshness: chrono::Duration) -> Self {
        Self {
            root: cache_dir.join("jurisdictions"),
            freshness,
        }
    }

    pub fn freshness(&self) -> chrono::Duration {
        self.freshness
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Latest entry for a jurisdiction, fresh or not.
    pub fn get(&self, jurisdiction: &str) -> Result<Option<StoredEntry>> {
        let key = normalize_jurisdiction(jurisdiction);
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self.history_for_key(&key)?.pop())
    }

    /// Classify a jurisdiction against the freshness window.
    pub fn lookup(&self, jurisdiction: &str, now: DateTime<Utc>) -> Result<CacheLookup> {
        Ok(match self.get(jurisdiction)? {
            Some(stored) if stored.is_fresh(self.freshness, now) => CacheLookup::Fresh(stored),
            Some(stored) => CacheLookup::Stale(stored),
            None => CacheLookup::Miss,
        })
    }

    /// Store a new entry timestamped now.
    pub fn put(
        &self,
        jurisdiction: &str,
        payload: Value,
        source_run: Option<RunId>,
    ) -> Result<StoredEntry> {
        self.put_at(jurisdiction, payload, source_run, Utc::now())
    }

    /// Store a new entry with an explicit fetch time.
    pub fn put_at(
        &self,
        jurisdiction: &str,
        payload: Value,
        source_run: Option<RunId>,
        fetched_at: DateTime<Utc>,
    ) -> Result<StoredEntry> {
        let key = normalize_jurisdiction(jurisdiction);
        if key.is_empty() {
            bail!("Cannot cache research for an empty jurisdiction name");
        }

        let bytes = serde_json::to_vec(&payload).context("Failed to serialize cache payload")?;
        let digest = format!("{:x}", Sha256::digest(&bytes));

        let entry = CacheEntry {
            jurisdiction: jurisdiction.trim().to_string(),
            key: key.clone(),
            fetched_at,
            digest: digest.clone(),
            source_run,
            payload,
        };
        let path = self.key_dir(&key).join(format!(
            "{}-{}.json",
            fetched_at.format(TIMESTAMP_FORMAT),
            &digest[..16]
        ));
        write_json_atomic(&path, &entry)
            .with_context(|| format!("Failed to write cache entry {}", path.display()))?;

        tracing::debug!(jurisdiction = %key, digest = %&digest[..16], "cache entry written");
        Ok(StoredEntry { entry, path })
    }

    /// Every entry for a jurisdiction, oldest first.
    pub fn history(&self, jurisdiction: &str) -> Result<Vec<StoredEntry>> {
        self.history_for_key(&normalize_jurisdiction(jurisdiction))
    }

    /// Latest entry of every cached jurisdiction, sorted by key.
    pub fn list(&self) -> Result<Vec<StoredEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys: Vec<String> = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read cache dir {}", self.root.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        keys.sort();

        let mut latest = Vec::new();
        for key in keys {
            if let Some(stored) = self.history_for_key(&key)?.pop() {
                latest.push(stored);
            }
        }
        Ok(latest)
    }

    fn history_for_key(&self, key: &str) -> Result<Vec<StoredEntry>> {
        let dir = self.key_dir(key);
        if key.is_empty() || !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read cache dir {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| !is_temp_file(p) && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            match read_entry(&path) {
                Ok(entry) => entries.push(StoredEntry { entry, path }),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable cache entry"),
            }
        }
        entries.sort_by(|a, b| a.entry.fetched_at.cmp(&b.entry.fetched_at));
        Ok(entries)
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry> {
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}
