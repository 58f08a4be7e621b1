/*!
 * @file state.rs
 * @brief Persisted instance state (state.json)
 */

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TelemetryState;
use crate::error::{DoppelError, Result};

pub const STATE_FILE: &str = "state.json";

/// The single JSON object persisted across restarts. Rewritten atomically via
/// temp-file-and-rename so a crash never leaves a torn file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub uuid: Uuid,
    pub telemetry: TelemetryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_available: Option<bool>,
}

impl InstanceState {
    fn fresh(telemetry: TelemetryState) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            telemetry,
            latest_version: None,
            update_available: None,
        }
    }
}

pub struct StateStore {
    path: PathBuf,
    state: InstanceState,
}

impl StateStore {
    /// Loads `state.json` from the state directory, creating it (and the
    /// directory) on first start.
    pub fn open(state_dir: &Path, telemetry: TelemetryState) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(STATE_FILE);

        let state = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let mut state: InstanceState = serde_json::from_str(&content)
                    .map_err(|e| DoppelError::Config(format!("corrupt {}: {}", STATE_FILE, e)))?;
                // A flag explicitly set on the command line wins over the file.
                if telemetry != TelemetryState::Undecided {
                    state.telemetry = telemetry;
                }
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                InstanceState::fresh(telemetry)
            }
            Err(e) => return Err(e.into()),
        };

        let store = Self { path, state };
        store.persist()?;
        Ok(store)
    }

    pub fn get(&self) -> &InstanceState {
        &self.state
    }

    pub fn set_telemetry(&mut self, telemetry: TelemetryState) -> Result<()> {
        self.state.telemetry = telemetry;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let content = serde_json::to_vec_pretty(&self.state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
