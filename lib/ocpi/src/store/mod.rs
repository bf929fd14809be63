//! Peer Storage trait - persisting registered relationships locally

pub mod file;
pub mod memory;

pub use file::FilePeerStore;
pub use memory::MemoryPeerStore;

use async_trait::async_trait;

use crate::error::OcpiError;
use crate::types::{PeerRecord, VersionId};

/// Persistence for peer records. Loaded when an attempt starts and saved after
/// every transition that changes the stored credentials or default version.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Load a peer's record. Returns None if nothing was ever stored.
    async fn load(&self, peer_id: &str) -> Result<Option<PeerRecord>, OcpiError>;

    /// Save a record, replacing any existing one for the same peer.
    async fn save(&self, record: &PeerRecord) -> Result<(), OcpiError>;

    /// Delete a peer's record. No-op if not found.
    async fn delete(&self, peer_id: &str) -> Result<(), OcpiError>;

    /// Ids of all stored peers.
    async fn list(&self) -> Result<Vec<String>, OcpiError>;

    /// Persist a preferred version without touching the relationship.
    async fn save_default_version(
        &self,
        peer_id: &str,
        version: &VersionId,
    ) -> Result<(), OcpiError> {
        let mut record = self
            .load(peer_id)
            .await?
            .unwrap_or_else(|| PeerRecord::new(peer_id));
        record.default_version = Some(version.clone());
        self.save(&record).await
    }
}
