//! Collaborator interfaces the engine drives but does not implement:
//! byte storage for transferred files, partner lookups, transfer tracking.
//! Also the cross-connection registry of interrupted transfers that makes
//! resume possible after a broken connection.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::diag::Diag;
use crate::state::TransferContext;

/// Byte source/sink for transferred file content.
pub trait FileStore: Send + Sync {
    fn exists(&self, name: &str) -> std::io::Result<bool>;
    fn size(&self, name: &str) -> std::io::Result<u64>;
    fn modified(&self, name: &str) -> std::io::Result<DateTime<Utc>>;
    fn open_read(&self, name: &str, offset: u64) -> std::io::Result<Box<dyn Read + Send>>;
    fn write(&self, name: &str, data: &[u8]) -> std::io::Result<()>;
    fn append_at(&self, name: &str, offset: u64, data: &[u8]) -> std::io::Result<()>;
}

/// Outcome of a partner lookup on CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartnerCheck {
    Accepted,
    Unknown,
    Denied,
    Disabled,
}

/// Partner and logical-file policy lookups.
pub trait PartnerDirectory: Send + Sync {
    fn authenticate(&self, partner: &str, password: Option<&str>) -> PartnerCheck;
    fn transfer_allowed(&self, partner: &str, filename: &str, write: bool) -> bool;
}

/// Sink for transfer lifecycle notifications.
pub trait TransferTracker: Send + Sync {
    fn transfer_started(&self, partner: &str, transfer: &TransferContext);
    fn sync_point(&self, transfer_id: u32, sync_point: u32, offset: u64);
    fn transfer_completed(&self, transfer_id: u32, bytes: u64, records: u64);
    fn transfer_failed(&self, transfer_id: u32, diag: Diag);
    fn message_received(&self, partner: &str, filename: &str, bytes: usize);
}

/// Snapshot of an interrupted transfer, kept so a later connection can
/// resume from the last acknowledged sync point.
#[derive(Debug, Clone)]
pub struct InterruptedTransfer {
    pub sync_point: u32,
    pub offset: u64,
    pub bytes_transferred: u64,
    pub data: Vec<u8>,
}

/// Cross-connection registry of interrupted transfers. Put and remove are
/// the only mutating operations.
#[derive(Default)]
pub struct TransferRegistry {
    inner: Mutex<HashMap<String, InterruptedTransfer>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(partner: &str, filename: &str, transfer_id: u32) -> String {
        format!("{partner}:{filename}:{transfer_id}")
    }

    pub fn put(
        &self,
        partner: &str,
        filename: &str,
        transfer_id: u32,
        snapshot: InterruptedTransfer,
    ) {
        let key = Self::key(partner, filename, transfer_id);
        info!(key = %key, offset = snapshot.offset, "interrupted transfer recorded");
        self.inner.lock().unwrap().insert(key, snapshot);
    }

    pub fn take(&self, partner: &str, filename: &str, transfer_id: u32) -> Option<InterruptedTransfer> {
        self.inner
            .lock()
            .unwrap()
            .remove(&Self::key(partner, filename, transfer_id))
    }

    pub fn remove(&self, partner: &str, filename: &str, transfer_id: u32) {
        self.inner
            .lock()
            .unwrap()
            .remove(&Self::key(partner, filename, transfer_id));
    }
}

/// In-memory store, for tests and loopback runs.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(name.into(), data);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).cloned()
    }
}

impl FileStore for MemoryStore {
    fn exists(&self, name: &str) -> std::io::Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(name))
    }

    fn size(&self, name: &str) -> std::io::Result<u64> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .map(|d| d.len() as u64)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name.to_string()))
    }

    fn modified(&self, _name: &str) -> std::io::Result<DateTime<Utc>> {
        Ok(Utc::now())
    }

    fn open_read(&self, name: &str, offset: u64) -> std::io::Result<Box<dyn Read + Send>> {
        let files = self.files.lock().unwrap();
        let data = files
            .get(name)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name.to_string()))?;
        let start = (offset as usize).min(data.len());
        Ok(Box::new(std::io::Cursor::new(data[start..].to_vec())))
    }

    fn write(&self, name: &str, data: &[u8]) -> std::io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(name.into(), data.to_vec());
        Ok(())
    }

    fn append_at(&self, name: &str, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(name.into()).or_default();
        entry.truncate(offset as usize);
        entry.extend_from_slice(data);
        Ok(())
    }
}

/// Accepts every partner and every transfer.
pub struct OpenPartnerDirectory;

impl PartnerDirectory for OpenPartnerDirectory {
    fn authenticate(&self, _partner: &str, _password: Option<&str>) -> PartnerCheck {
        PartnerCheck::Accepted
    }

    fn transfer_allowed(&self, _partner: &str, _filename: &str, _write: bool) -> bool {
        true
    }
}

/// Tracker that only logs.
pub struct LogTracker;

impl TransferTracker for LogTracker {
    fn transfer_started(&self, partner: &str, transfer: &TransferContext) {
        info!(
            partner = %partner,
            transfer_id = transfer.transfer_id,
            filename = %transfer.filename,
            write = transfer.write_mode,
            "transfer started"
        );
    }

    fn sync_point(&self, transfer_id: u32, sync_point: u32, offset: u64) {
        info!(transfer_id, sync_point, offset, "sync point");
    }

    fn transfer_completed(&self, transfer_id: u32, bytes: u64, records: u64) {
        info!(transfer_id, bytes, records, "transfer completed");
    }

    fn transfer_failed(&self, transfer_id: u32, diag: Diag) {
        warn!(transfer_id, diag = %diag, "transfer failed");
    }

    fn message_received(&self, partner: &str, filename: &str, bytes: usize) {
        info!(partner = %partner, filename = %filename, bytes, "message received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_put_take_remove() {
        let registry = TransferRegistry::new();
        registry.put(
            "A",
            "FILE",
            1,
            InterruptedTransfer {
                sync_point: 2,
                offset: 100,
                bytes_transferred: 100,
                data: vec![0u8; 100],
            },
        );
        let snap = registry.take("A", "FILE", 1).unwrap();
        assert_eq!(snap.sync_point, 2);
        assert_eq!(snap.offset, 100);
        assert!(registry.take("A", "FILE", 1).is_none());
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(!store.exists("F").unwrap());
        store.write("F", b"content").unwrap();
        assert!(store.exists("F").unwrap());
        assert_eq!(store.size("F").unwrap(), 7);

        let mut reader = store.open_read("F", 3).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"tent");
    }

    #[test]
    fn append_at_truncates_then_extends() {
        let store = MemoryStore::new();
        store.write("F", b"0123456789").unwrap();
        store.append_at("F", 4, b"XY").unwrap();
        assert_eq!(store.get("F").unwrap(), b"0123XY");
    }
}
