use crate::coverage::EntryId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact I/O error: {0}")]
    Io(String),
    #[error("Artifact serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for ArtifactError {
    fn from(err: std::io::Error) -> Self {
        ArtifactError::Io(err.to_string())
    }
}

/// Sidecar metadata written next to every crash payload.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ArtifactRecord {
    /// Human-readable description of how the target ended.
    pub description: String,
    /// Signal that terminated the target, if any (Unix).
    pub exit_signal: Option<i32>,
    pub severity: u8,
    /// Content hash of the (minimized) payload stored alongside.
    pub payload_hash: EntryId,
    /// The corpus entry the crashing candidate was mutated from, when known.
    pub discovered_from: Option<EntryId>,
    /// Candidate size before minimization.
    pub original_size: usize,
    /// Stored payload size.
    pub minimized_size: usize,
    /// Wall-clock discovery time, milliseconds since the Unix epoch.
    pub discovered_at_ms: u64,
}

/// Writes crash findings to a directory separate from the corpus.
///
/// Each finding is two files named by the minimized payload's content hash:
/// `crash-<hash>` holding the raw bytes and `crash-<hash>.json` holding the
/// [`ArtifactRecord`]. Writes go through a temp file and rename, so a
/// half-written artifact can never be mistaken for a finding. A payload
/// whose hash is already present is skipped; the first write wins.
pub struct ArtifactSink {
    dir: PathBuf,
}

impl ArtifactSink {
    /// Opens (creating if needed) the artifact directory.
    pub fn new(dir: PathBuf) -> Result<Self, ArtifactError> {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                ArtifactError::Io(format!(
                    "Failed to create artifact directory at {:?}: {}",
                    dir, e
                ))
            })?;
        } else if !dir.is_dir() {
            return Err(ArtifactError::Io(format!(
                "Artifact path {:?} exists but is not a directory",
                dir
            )));
        }
        Ok(ArtifactSink { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_file_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| {
            ArtifactError::Io(format!("Failed to create temp file in {:?}: {}", self.dir, e))
        })?;
        tmp.write_all(bytes)
            .map_err(|e| ArtifactError::Io(format!("Failed to write temp file: {}", e)))?;
        tmp.persist(path).map_err(|e| {
            ArtifactError::Io(format!("Failed to persist temp file to {:?}: {}", path, e))
        })?;
        Ok(())
    }

    /// Persists one minimized crash payload plus its sidecar record.
    ///
    /// Returns the payload path. If an artifact with the same payload hash
    /// already exists, nothing is written and the existing path is
    /// returned.
    pub fn write(
        &self,
        payload: &[u8],
        record: &ArtifactRecord,
    ) -> Result<PathBuf, ArtifactError> {
        let hash = EntryId::of(payload);
        let payload_path = self.dir.join(format!("crash-{hash}"));
        let sidecar_path = self.dir.join(format!("crash-{hash}.json"));
        if payload_path.exists() {
            log::debug!("artifacts: crash {} already recorded", hash);
            return Ok(payload_path);
        }

        let json = serde_json::to_vec_pretty(record).map_err(|e| {
            ArtifactError::Serialization(format!(
                "Failed to serialize artifact record for {}: {}",
                hash, e
            ))
        })?;
        self.write_file_atomic(&payload_path, payload)?;
        self.write_file_atomic(&sidecar_path, &json)?;
        log::info!(
            "artifacts: recorded crash {} ({} bytes, \"{}\")",
            hash,
            payload.len(),
            record.description
        );
        Ok(payload_path)
    }
}
