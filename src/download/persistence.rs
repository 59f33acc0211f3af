//!
//! # Persistence module
//! Keeps a paused session on disk so a resume survives a restart of the
//! orchestrator. The access credential is never written out.
//!

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PausedSession {
    pub id: Uuid,
    pub shared_link: String,
    pub destination: PathBuf,
    pub target_concurrency: usize,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct PersistenceState {
    pub paused: Option<PausedSession>,
}

impl PersistenceState {
    pub fn load_from_file(file_path: &Path) -> Result<Self> {
        if file_path.exists() {
            let data = fs::read_to_string(file_path)?;
            let state: PersistenceState = serde_json::from_str(&data)?;

            Ok(state)
        } else {
            Ok(PersistenceState::default())
        }
    }

    pub fn save_to_file(&self, file_path: &Path) -> Result<()> {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(file_path, data)?;

        Ok(())
    }

    pub fn clear_file(file_path: &Path) -> Result<()> {
        match fs::remove_file(file_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
