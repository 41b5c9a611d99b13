//! MAC to VM registry and its durable storage.
//!
//! The registry is rebuilt as a whole from an inventory scan at startup and
//! persisted as a single JSON document:
//!
//! ```json
//! { "port": 7, "vms": { "AA:BB:CC:DD:EE:FF": "web01" }, "host": "0.0.0.0", "timeout": "60" }
//! ```
//!
//! All access to the document goes through [`RegistryStore`], which holds the
//! lock: exclusive while writing, shared while reading. Writes go to a sibling
//! temporary file that is renamed into place, so readers never see a torn
//! document and a failed write leaves the previous one untouched.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};

use crate::common::{canonical_mac, parse_mac};
use crate::error::RegistryError;
use crate::inventory::VmRecord;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 7;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    port: u16,
    vms: BTreeMap<String, String>,
    host: String,
    timeout: String,
}

/// In-memory registry. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    entries: BTreeMap<String, String>,
    pub bind_host: String,
    pub bind_port: u16,
    pub operation_timeout: Duration,
}

impl Registry {
    /// Default network parameters plus one entry per record. When two VMs
    /// report the same MAC the later one wins.
    pub fn from_records(records: Vec<VmRecord>) -> Self {
        let mut entries = BTreeMap::new();
        for record in records {
            let key = canonical_mac(&record.mac);
            if let Some(previous) = entries.insert(key.clone(), record.name) {
                log::warn!("MAC {} reported by both '{}' and '{}', keeping the latter",
                    key, previous, entries[&key]);
            }
        }

        Self {
            entries,
            bind_host: DEFAULT_HOST.to_string(),
            bind_port: DEFAULT_PORT,
            operation_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn resolve(&self, mac: &MacAddr) -> Option<&str> {
        self.entries.get(&canonical_mac(mac)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `host:port` as stored, not yet resolved.
    pub fn bind_addr(&self) -> String {
        if self.bind_host.contains(':') && !self.bind_host.starts_with('[') {
            format!("[{}]:{}", self.bind_host, self.bind_port)
        } else {
            format!("{}:{}", self.bind_host, self.bind_port)
        }
    }

    fn to_document(&self) -> RegistryDocument {
        RegistryDocument {
            port: self.bind_port,
            vms: self.entries.clone(),
            host: self.bind_host.clone(),
            timeout: self.operation_timeout.as_secs().to_string(),
        }
    }

    fn parse(bytes: &[u8], path: &Path) -> Result<Self, RegistryError> {
        let doc: RegistryDocument = serde_json::from_slice(bytes)
            .map_err(|source| RegistryError::Parse { path: path.to_path_buf(), source })?;

        let timeout = doc.timeout.trim().parse::<u64>()
            .map_err(|_| RegistryError::Timeout(doc.timeout.clone()))?;

        // Hand-edited documents may use any MAC spelling; keys are canonical in memory.
        let mut entries = BTreeMap::new();
        for (mac, name) in doc.vms {
            match parse_mac(&mac) {
                Ok(parsed) => { entries.insert(canonical_mac(&parsed), name); }
                Err(e) => log::warn!("ignoring registry entry for '{}': {}", name, e),
            }
        }

        Ok(Self {
            entries,
            bind_host: doc.host,
            bind_port: doc.port,
            operation_timeout: Duration::from_secs(timeout),
        })
    }
}

/// Result of a successful [`RegistryStore::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Written { entries: usize },
    /// Writing failed but a valid registry was already on disk and stays
    /// authoritative.
    KeptPrevious,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Owned handle on the registry document. Share it behind an `Arc`.
pub struct RegistryStore {
    path: PathBuf,
    lock: RwLock<()>,
    reads: AtomicUsize,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of read attempts made by [`load`](Self::load) so far.
    pub fn read_attempts(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Replaces the persisted registry with one built from `records`.
    pub fn build(&self, records: Vec<VmRecord>) -> Result<BuildOutcome, RegistryError> {
        let registry = Registry::from_records(records);
        let data = serde_json::to_vec_pretty(&registry.to_document())
            .map_err(RegistryError::Serialize)?;

        let _guard = self.lock.write();
        if let Err(source) = self.write_atomic(&data) {
            log::warn!("failed to write registry {}: {}", self.path.display(), source);
            if self.read_valid().is_ok() {
                log::warn!("keeping existing registry {}", self.path.display());
                return Ok(BuildOutcome::KeptPrevious);
            }
            return Err(RegistryError::Write { path: self.path.clone(), source });
        }

        log::info!("wrote registry {} with {} VMs", self.path.display(), registry.len());
        Ok(BuildOutcome::Written { entries: registry.len() })
    }

    /// Whether a complete, parsable registry is currently on disk.
    pub fn has_valid_registry(&self) -> bool {
        let _guard = self.lock.read();
        self.read_valid().is_ok()
    }

    /// Reads the registry, retrying I/O failures per `policy`. A document that
    /// reads fine but does not parse is not retried.
    pub fn load(&self, policy: &RetryPolicy) -> Result<Registry, RegistryError> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            log::info!("reading registry {} (attempt {})", self.path.display(), attempt);
            let read = {
                let _guard = self.lock.read();
                self.reads.fetch_add(1, Ordering::SeqCst);
                fs::read(&self.path)
            };

            match read {
                Ok(bytes) => return Registry::parse(&bytes, &self.path),
                Err(source) if attempt >= attempts => {
                    log::error!("failed to read registry after {} attempts: {}", attempt, source);
                    return Err(RegistryError::Read { path: self.path.clone(), attempts: attempt, source });
                }
                Err(e) => {
                    log::warn!("failed to read registry (attempt {}): {}", attempt, e);
                    std::thread::sleep(policy.backoff);
                    attempt += 1;
                }
            }
        }
    }

    /// Caller holds the lock.
    fn read_valid(&self) -> Result<Registry, RegistryError> {
        let bytes = fs::read(&self.path)
            .map_err(|source| RegistryError::Read { path: self.path.clone(), attempts: 1, source })?;
        Registry::parse(&bytes, &self.path)
    }

    /// Caller holds the write lock.
    fn write_atomic(&self, data: &[u8]) -> io::Result<()> {
        let tmp = self.tmp_path();
        let result = File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(data)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, &self.path));
        if result.is_err() && tmp.is_file() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = OsString::from(self.path.as_os_str());
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    fn record(name: &str, mac: [u8; 6]) -> VmRecord {
        VmRecord {
            name: name.to_string(),
            mac: MacAddr::new(mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]),
        }
    }

    fn inventory() -> Vec<VmRecord> {
        vec![
            record("web01", [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            record("db01", [0x00, 0x15, 0x5d, 0x01, 0x02, 0x0a]),
        ]
    }

    fn store_in(dir: &tempfile::TempDir) -> RegistryStore {
        RegistryStore::new(dir.path().join("registry.json"))
    }

    #[test]
    fn build_uses_default_network_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.build(Vec::new()).unwrap(), BuildOutcome::Written { entries: 0 });

        let registry = store.load(&RetryPolicy::default()).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.bind_host, "0.0.0.0");
        assert_eq!(registry.bind_port, 7);
        assert_eq!(registry.operation_timeout, Duration::from_secs(60));
        assert_eq!(registry.bind_addr(), "0.0.0.0:7");
    }

    #[test]
    fn persisted_document_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.build(inventory()).unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(doc["port"], 7);
        assert_eq!(doc["host"], "0.0.0.0");
        assert_eq!(doc["timeout"], "60");
        assert_eq!(doc["vms"]["AA:BB:CC:DD:EE:FF"], "web01");
        assert_eq!(doc["vms"]["00:15:5D:01:02:0A"], "db01");
    }

    #[test]
    fn rebuild_over_same_inventory_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.build(inventory()).unwrap();
        let first = fs::read(store.path()).unwrap();

        let mut reversed = inventory();
        reversed.reverse();
        store.build(reversed).unwrap();
        assert_eq!(first, fs::read(store.path()).unwrap());
    }

    #[test]
    fn ipv6_bind_host_is_bracketed() {
        let mut registry = Registry::from_records(Vec::new());
        registry.bind_host = "::".to_string();
        assert_eq!(registry.bind_addr(), "[::]:7");
    }

    #[test]
    fn duplicate_mac_last_write_wins() {
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let registry = Registry::from_records(vec![record("first", mac), record("second", mac)]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(&MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff)), Some("second"));
    }

    #[test]
    fn resolve_hit_and_miss() {
        let registry = Registry::from_records(inventory());
        assert_eq!(registry.resolve(&MacAddr::new(0x00, 0x15, 0x5d, 0x01, 0x02, 0x0a)), Some("db01"));
        assert_eq!(registry.resolve(&MacAddr::new(0x11, 0x22, 0x33, 0x44, 0x55, 0x66)), None);
    }

    #[test]
    fn failed_write_keeps_existing_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.build(inventory()).unwrap();
        let before = fs::read(store.path()).unwrap();

        // A directory squatting on the temporary path makes the write fail.
        fs::create_dir(store.tmp_path()).unwrap();
        let outcome = store.build(vec![record("other", [1, 2, 3, 4, 5, 6])]).unwrap();

        assert_eq!(outcome, BuildOutcome::KeptPrevious);
        assert_eq!(before, fs::read(store.path()).unwrap());
        let registry = store.load(&RetryPolicy::default()).unwrap();
        assert_eq!(registry.resolve(&MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff)), Some("web01"));
    }

    #[test]
    fn failed_write_without_existing_registry_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir(store.tmp_path()).unwrap();

        assert!(matches!(store.build(inventory()), Err(RegistryError::Write { .. })));
        assert!(!store.has_valid_registry());
    }

    #[test]
    fn corrupt_existing_registry_is_no_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), b"{ \"port\": 7, ").unwrap();
        fs::create_dir(store.tmp_path()).unwrap();

        assert!(matches!(store.build(inventory()), Err(RegistryError::Write { .. })));
    }

    #[test]
    fn load_normalizes_hand_edited_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"port": 9, "host": "127.0.0.1", "timeout": "30",
                "vms": {"aa:bb:cc:dd:ee:ff": "web01", "00155d01020a": "db01", "nonsense": "bad"}}"#,
        )
        .unwrap();

        let registry = store.load(&RetryPolicy::default()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.bind_addr(), "127.0.0.1:9");
        assert_eq!(registry.operation_timeout, Duration::from_secs(30));
        assert_eq!(registry.resolve(&MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff)), Some("web01"));
        assert_eq!(registry.resolve(&MacAddr::new(0x00, 0x15, 0x5d, 0x01, 0x02, 0x0a)), Some("db01"));
    }

    #[test]
    fn unparsable_registry_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), b"not json").unwrap();
        assert!(matches!(store.load(&RetryPolicy::default()), Err(RegistryError::Parse { .. })));
        assert_eq!(store.read_attempts(), 1);

        fs::write(store.path(), br#"{"port": 7, "host": "0.0.0.0", "timeout": "soon", "vms": {}}"#).unwrap();
        assert!(matches!(store.load(&RetryPolicy::default()), Err(RegistryError::Timeout(_))));
    }

    #[test]
    fn load_gives_up_after_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let policy = RetryPolicy { attempts: 3, backoff: Duration::from_millis(10) };

        match store.load(&policy) {
            Err(RegistryError::Read { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(store.read_attempts(), 3);
    }

    #[test]
    fn load_succeeds_once_registry_appears() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(750));
                store.build(inventory()).unwrap();
            })
        };

        let started = Instant::now();
        let registry = store.load(&RetryPolicy::default()).unwrap();
        let elapsed = started.elapsed();
        writer.join().unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(store.read_attempts(), 3);
        assert!(elapsed >= Duration::from_millis(1000), "attempts too close: {:?}", elapsed);
    }
}
