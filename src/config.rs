//! Configuration loaded from `~/.coach/config.json`.
//!
//! Every field has a default, so a missing or partial file still yields a
//! usable config. A malformed file is reported and replaced by defaults
//! rather than aborting startup.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoachConfig {
    /// Chat-completions endpoint base URL.
    pub base_url: String,
    /// Bearer token for the model endpoint. Empty means unauthenticated
    /// (local inference servers).
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Override for the database path; defaults to `~/.coach/coach.db`.
    pub db_path: Option<PathBuf>,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            model: "llama3.1".to_string(),
            timeout_secs: 60,
            db_path: None,
        }
    }
}

impl CoachConfig {
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Ignoring malformed config at {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".coach").join("config.json"))
}
