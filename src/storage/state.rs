//! Durable per-fleet drift state
//!
//! Each fleet is owned by exactly one monitor, so stores do no locking
//! between writers of the same key.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, trace};

use super::error::{StorageError, StorageResult};
use crate::monitors::drift::DriftState;

const STATE_FILE: &str = "drift_state.json";

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persisted state, or the uninitialized default when nothing was saved yet
    async fn load(&self, fleet_id: &str) -> StorageResult<DriftState>;

    /// Replace the persisted state atomically
    async fn save(&self, fleet_id: &str, state: &DriftState) -> StorageResult<()>;
}

/// One JSON file per fleet under `<base_dir>/<fleet_id>/`
#[derive(Debug, Clone)]
pub struct FileStateStore {
    base_dir: PathBuf,
}

impl FileStateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn path_for(&self, fleet_id: &str) -> PathBuf {
        self.base_dir.join(fleet_id).join(STATE_FILE)
    }
}

/// Write `contents` next to `target`, flush it to disk and rename it over `target`
async fn write_atomically(target: &Path, contents: &[u8]) -> StorageResult<()> {
    let mut temp_path = target.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::IoError(e));
    }
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    #[instrument(skip(self))]
    async fn load(&self, fleet_id: &str) -> StorageResult<DriftState> {
        let path = self.path_for(fleet_id);

        match fs::read(&path).await {
            Ok(bytes) => {
                let state = serde_json::from_slice(&bytes)?;
                trace!("loaded drift state from {}: {state:?}", path.display());
                Ok(state)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no drift state at {}, starting fresh", path.display());
                Ok(DriftState::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, state))]
    async fn save(&self, fleet_id: &str, state: &DriftState) -> StorageResult<()> {
        let path = self.path_for(fleet_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let contents = serde_json::to_vec_pretty(state)?;
        write_atomically(&path, &contents).await?;

        trace!("saved drift state to {}", path.display());
        Ok(())
    }
}

/// Non-durable store keyed by fleet id
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, DriftState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, fleet_id: &str) -> StorageResult<DriftState> {
        let states = self
            .states
            .lock()
            .map_err(|_| StorageError::BackendError("drift state lock poisoned".to_string()))?;
        Ok(states.get(fleet_id).cloned().unwrap_or_default())
    }

    async fn save(&self, fleet_id: &str, state: &DriftState) -> StorageResult<()> {
        let mut states = self
            .states
            .lock()
            .map_err(|_| StorageError::BackendError("drift state lock poisoned".to_string()))?;
        states.insert(fleet_id.to_string(), state.clone());
        Ok(())
    }
}
