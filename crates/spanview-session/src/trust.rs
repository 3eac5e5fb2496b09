//! Client-side certificate trust: SHA-256 fingerprints pinned per
//! `host:port` on first use, persisted as JSON in the app-data directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};

/// Outcome of checking a presented certificate against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// No pin existed for this host; the fingerprint was pinned now.
    FirstUse,
    /// The fingerprint matches the pin.
    Trusted,
    /// The fingerprint differs from the pin. Fatal; requires explicit
    /// re-trust via [`TrustStore::forget`].
    Mismatch { pinned: String },
}

#[derive(Debug)]
pub struct TrustStore {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, String>>,
}

impl TrustStore {
    /// Open (or lazily create) the store file. A missing or unreadable
    /// file starts empty rather than failing the connection path.
    pub fn open(path: PathBuf) -> Self {
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), "trust store unreadable, starting empty: {e}");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self { path: Some(path), entries: Mutex::new(entries) }
    }

    /// Ephemeral store, nothing persisted.
    pub fn in_memory() -> Self {
        Self { path: None, entries: Mutex::new(HashMap::new()) }
    }

    /// Check `fingerprint` for `host_key` ("host:port"), pinning it on
    /// first use.
    pub fn check_or_pin(&self, host_key: &str, fingerprint: &str) -> TrustDecision {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(host_key) {
            Some(pinned) if pinned == fingerprint => TrustDecision::Trusted,
            Some(pinned) => TrustDecision::Mismatch { pinned: pinned.clone() },
            None => {
                entries.insert(host_key.to_string(), fingerprint.to_string());
                info!(host = host_key, "pinned server certificate on first use");
                self.persist(&entries);
                TrustDecision::FirstUse
            }
        }
    }

    /// Remove the pin for a host, e.g. after the user chose to re-trust.
    pub fn forget(&self, host_key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let removed = entries.remove(host_key).is_some();
        if removed {
            self.persist(&entries);
        }
        removed
    }

    /// All pins, sorted by host, for display.
    pub fn list(&self) -> Vec<(String, String)> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<_> = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort();
        all
    }

    fn persist(&self, entries: &HashMap<String, String>) {
        let Some(path) = &self.path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(entries) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!(path = %path.display(), "failed to persist trust store: {e}");
                }
            }
            Err(e) => warn!("failed to serialize trust store: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_pins_then_trusts() {
        let store = TrustStore::in_memory();
        assert_eq!(store.check_or_pin("10.0.0.2:15555", "aa11"), TrustDecision::FirstUse);
        assert_eq!(store.check_or_pin("10.0.0.2:15555", "aa11"), TrustDecision::Trusted);
    }

    #[test]
    fn changed_fingerprint_is_a_mismatch() {
        let store = TrustStore::in_memory();
        store.check_or_pin("pc:1", "aa11");
        assert_eq!(
            store.check_or_pin("pc:1", "bb22"),
            TrustDecision::Mismatch { pinned: "aa11".into() }
        );
        // The pin is untouched by a mismatch.
        assert_eq!(store.check_or_pin("pc:1", "aa11"), TrustDecision::Trusted);
    }

    #[test]
    fn forget_allows_repin() {
        let store = TrustStore::in_memory();
        store.check_or_pin("pc:1", "aa11");
        assert!(store.forget("pc:1"));
        assert!(!store.forget("pc:1"));
        assert_eq!(store.check_or_pin("pc:1", "bb22"), TrustDecision::FirstUse);
    }

    #[test]
    fn hosts_are_independent() {
        let store = TrustStore::in_memory();
        store.check_or_pin("pc:1", "aa11");
        assert_eq!(store.check_or_pin("pc:2", "bb22"), TrustDecision::FirstUse);
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");

        let store = TrustStore::open(path.clone());
        store.check_or_pin("pc:1", "aa11");
        drop(store);

        let reopened = TrustStore::open(path);
        assert_eq!(reopened.check_or_pin("pc:1", "aa11"), TrustDecision::Trusted);
    }
}
