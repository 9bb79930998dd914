//! Disk persistence for checkpoint slots

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{CheckpointRecord, CheckpointSlot};
use crate::error::{Error, Result};
use crate::training::config::TrainingConfig;
use crate::utils::io::{ensure_dir_exists, write_file_atomic};

/// Reads and writes the checkpoint slots of one run
///
/// Records are bincode-encoded and written through a temporary file that is
/// renamed over the slot, so a crash mid-write never leaves a partial record.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    prefix: String,
}

impl CheckpointStore {
    /// Create a store rooted at `dir` for the run named `prefix`
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Create a store from the checkpointing section of a configuration
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.checkpointing.model_dir.clone(), config.prefix.clone())
    }

    /// Directory holding the slots
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `slot`
    pub fn path(&self, slot: CheckpointSlot) -> PathBuf {
        self.dir
            .join(format!("{}{}.ckpt", self.prefix, slot.file_suffix()))
    }

    /// Whether `slot` has ever been written
    pub fn exists(&self, slot: CheckpointSlot) -> bool {
        self.path(slot).is_file()
    }

    /// Atomically replace `slot` with `record`
    pub fn save(&self, slot: CheckpointSlot, record: &CheckpointRecord) -> Result<PathBuf> {
        ensure_dir_exists(&self.dir)?;
        let path = self.path(slot);
        let bytes = bincode::serialize(record)?;
        write_file_atomic(&path, &bytes)?;

        let (epoch, minibatch) = record.position();
        info!(
            slot = slot.name(),
            epoch,
            minibatch,
            "Saved {} checkpoint to {}",
            slot,
            path.display()
        );
        Ok(path)
    }

    /// Read `slot` back
    ///
    /// A slot that was never written yields [`Error::CheckpointNotFound`];
    /// a file that fails to decode yields [`Error::CorruptCheckpoint`].
    pub fn load(&self, slot: CheckpointSlot) -> Result<CheckpointRecord> {
        let path = self.path(slot);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CheckpointNotFound {
                    slot: slot.name().to_string(),
                    path,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let record: CheckpointRecord =
            bincode::deserialize(&bytes).map_err(|err| Error::corrupt(&path, err))?;

        let (epoch, minibatch) = record.position();
        if epoch == 0 {
            return Err(Error::corrupt(&path, "record has epoch 0"));
        }
        debug!(slot = slot.name(), epoch, minibatch, "Loaded checkpoint {}", path.display());
        Ok(record)
    }
}
