//! Persisted session state: the last source folder and ledger path, so a
//! restarted run picks up where the operator left off. Loading is lenient
//! (a damaged file means fresh defaults, never a startup failure), saving is
//! atomic via temp-file rename.

use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

pub const STATE_FILE_NAME: &str = "app_state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub saved_at: Option<String>,
}

impl AppState {
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("defect-ledger")
            .join(STATE_FILE_NAME)
    }

    pub fn load(path: &Path) -> AppState {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => state,
                Err(e) => {
                    warn!("ignoring unreadable state file {}: {}", path.display(), e);
                    AppState::default()
                }
            },
            Err(_) => AppState::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut state = self.clone();
        state.saved_at = Some(chrono::Local::now().to_rfc3339());
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| EngineError::Workbook(format!("state serialization failed: {}", e)))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}
