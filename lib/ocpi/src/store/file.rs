//! File-based peer storage

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::OcpiError;
use crate::store::PeerStore;
use crate::types::PeerRecord;

const RECORD_SUFFIX: &str = ".peer.json";

/// One JSON file per peer, for CLI and desktop use.
///
/// Saves go through a temporary file and a rename, so a crash mid-write
/// leaves the previous record in place.
pub struct FilePeerStore {
    dir: PathBuf,
}

impl FilePeerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, OcpiError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| OcpiError::Storage(e.to_string()))?;
        Ok(Self { dir })
    }

    fn record_path(&self, peer_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", encode_peer_id(peer_id), RECORD_SUFFIX))
    }
}

/// File name for a peer id. Unreserved characters are kept, every other byte
/// becomes `%XX`, so distinct ids never share a file and none can leave the
/// directory.
fn encode_peer_id(peer_id: &str) -> String {
    let mut encoded = String::with_capacity(peer_id.len());
    for byte in peer_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

#[async_trait]
impl PeerStore for FilePeerStore {
    async fn load(&self, peer_id: &str) -> Result<Option<PeerRecord>, OcpiError> {
        let path = self.record_path(peer_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(&path).map_err(|e| OcpiError::Storage(e.to_string()))?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn save(&self, record: &PeerRecord) -> Result<(), OcpiError> {
        let path = self.record_path(&record.peer_id);
        let tmp_path = path.with_extension("tmp");
        let contents = serde_json::to_string_pretty(record)?;

        let mut file =
            std::fs::File::create(&tmp_path).map_err(|e| OcpiError::Storage(e.to_string()))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| OcpiError::Storage(e.to_string()))?;
        file.sync_all()
            .map_err(|e| OcpiError::Storage(e.to_string()))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| OcpiError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, peer_id: &str) -> Result<(), OcpiError> {
        let path = self.record_path(peer_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| OcpiError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, OcpiError> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| OcpiError::Storage(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| OcpiError::Storage(e.to_string()))?;
            if !entry.file_name().to_string_lossy().ends_with(RECORD_SUFFIX) {
                continue;
            }
            let contents = std::fs::read_to_string(entry.path())
                .map_err(|e| OcpiError::Storage(e.to_string()))?;
            let record: PeerRecord = serde_json::from_str(&contents)?;
            ids.push(record.peer_id);
        }
        ids.sort();
        Ok(ids)
    }
}
