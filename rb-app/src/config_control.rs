use crate::config::RelayConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Live view of the config file. `config` is the file contents with the
/// environment overrides applied.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub path: String,
    pub base_hash: String,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub config: RelayConfig,
}

#[derive(Clone)]
pub struct ConfigControl {
    path: PathBuf,
    state: Arc<Mutex<ConfigState>>,
}

struct ConfigState {
    file: RelayConfig,
    base_hash: String,
    updated_at: DateTime<Utc>,
}

impl ConfigControl {
    /// `file` is the config exactly as stored on disk (no env overrides), so
    /// writing it back never persists secrets that came from the environment.
    pub fn new(path: PathBuf, file: RelayConfig) -> Result<Self> {
        let base_hash = hash_config(&file)?;
        Ok(Self {
            path,
            state: Arc::new(Mutex::new(ConfigState {
                file,
                base_hash,
                updated_at: Utc::now(),
            })),
        })
    }

    pub async fn snapshot(&self) -> ConfigSnapshot {
        let state = self.state.lock().await;
        self.snapshot_of(&state)
    }

    /// Apply `mutate` to a copy of the stored config, validate the result and
    /// persist it. On any error the stored config and the file stay as they were.
    pub async fn update<F>(&self, mutate: F) -> Result<ConfigSnapshot>
    where
        F: FnOnce(&mut RelayConfig),
    {
        let mut state = self.state.lock().await;
        let mut next = state.file.clone();
        mutate(&mut next);
        next.clone().with_env_overrides().validate()?;
        write_config_file(&self.path, &next).await?;

        state.base_hash = hash_config(&next)?;
        state.updated_at = Utc::now();
        state.file = next;
        tracing::info!(
            path = %self.path.display(),
            base_hash = %state.base_hash,
            "config persisted"
        );
        Ok(self.snapshot_of(&state))
    }

    fn snapshot_of(&self, state: &ConfigState) -> ConfigSnapshot {
        ConfigSnapshot {
            path: self.path.display().to_string(),
            base_hash: state.base_hash.clone(),
            updated_at: state.updated_at,
            config: state.file.clone().with_env_overrides(),
        }
    }
}

fn hash_config(config: &RelayConfig) -> Result<String> {
    let bytes = serde_json::to_vec(config)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

async fn write_config_file(path: &Path, config: &RelayConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = toml::to_string_pretty(config)?;
    tokio::fs::write(path, content).await?;
    Ok(())
}
