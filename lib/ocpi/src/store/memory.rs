//! In-memory peer storage

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::OcpiError;
use crate::store::PeerStore;
use crate::types::PeerRecord;

#[derive(Default)]
pub struct MemoryPeerStore {
    records: RwLock<HashMap<String, PeerRecord>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store, e.g. with records loaded elsewhere.
    pub fn with_records(records: impl IntoIterator<Item = PeerRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.peer_id.clone(), r))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn load(&self, peer_id: &str) -> Result<Option<PeerRecord>, OcpiError> {
        let guard = self
            .records
            .read()
            .map_err(|e| OcpiError::Storage(format!("Failed to acquire read lock: {}", e)))?;
        Ok(guard.get(peer_id).cloned())
    }

    async fn save(&self, record: &PeerRecord) -> Result<(), OcpiError> {
        let mut guard = self
            .records
            .write()
            .map_err(|e| OcpiError::Storage(format!("Failed to acquire write lock: {}", e)))?;
        guard.insert(record.peer_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, peer_id: &str) -> Result<(), OcpiError> {
        let mut guard = self
            .records
            .write()
            .map_err(|e| OcpiError::Storage(format!("Failed to acquire write lock: {}", e)))?;
        guard.remove(peer_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, OcpiError> {
        let guard = self
            .records
            .read()
            .map_err(|e| OcpiError::Storage(format!("Failed to acquire read lock: {}", e)))?;
        let mut ids: Vec<String> = guard.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
