//! Disk snapshot (C4): write-through persistence of the full flag set to a
//! single JSON file, used only at startup and after a successful refresh —
//! never on the read path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::Flag;

/// Source doesn't version the snapshot format; this crate adds one so a
/// future incompatible change can migrate instead of failing to parse.
const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    flags: HashMap<String, Flag>,
}

fn default_schema_version() -> u32 {
    1
}

/// Durable last-known-good snapshot under a configured directory. Writers
/// are serialized through a file-level mutex; `load` can proceed
/// concurrently with no lock since it never runs alongside a `save` that
/// matters to correctness (both sides tolerate a torn read via the
/// write-to-temp-then-rename strategy).
pub struct DiskSnapshot {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskSnapshot {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            path: directory.as_ref().join("flagr-snapshot.json"),
            write_lock: Mutex::new(()),
        }
    }

    /// Atomic from the reader's perspective: serializes to a temp file in
    /// the same directory, then renames over the target. If this fails the
    /// memory store is unaffected — the caller already holds the flags in
    /// memory regardless of whether the write succeeds.
    pub async fn save(&self, flags: &HashMap<String, Flag>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = SnapshotFile {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            flags: flags.clone(),
        };
        let serialized = serde_json::to_vec_pretty(&file)?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &serialized).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), flags = file.flags.len(), "wrote disk snapshot");
        Ok(())
    }

    /// Returns an empty map when the file does not exist. An error is only
    /// returned when the file exists but cannot be parsed.
    pub async fn load(&self) -> Result<HashMap<String, Flag>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no disk snapshot present");
                return Ok(HashMap::new());
            }
            Err(err) => return Err(err.into()),
        };

        let file: SnapshotFile = serde_json::from_slice(&bytes)?;
        if file.schema_version != SNAPSHOT_SCHEMA_VERSION {
            warn!(
                found = file.schema_version,
                expected = SNAPSHOT_SCHEMA_VERSION,
                "disk snapshot schema version mismatch, loading anyway"
            );
        }
        Ok(file.flags)
    }
}
