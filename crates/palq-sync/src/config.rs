use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use palq_core::ReconcileConfig;
use tokio::fs;
use tracing::info;

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workbook_dir: PathBuf,
    pub config_path: PathBuf,
    pub scheduler_enabled: bool,
    pub reconcile_cron: String,
    pub release_cron: String,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workbook_dir: std::env::var("PALQ_WORKBOOK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./workbook")),
            config_path: std::env::var("PALQ_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./palq.yaml")),
            scheduler_enabled: std::env::var("PALQ_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            reconcile_cron: std::env::var("PALQ_RECONCILE_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            release_cron: std::env::var("PALQ_RELEASE_CRON")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            web_port: std::env::var("PALQ_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.workbook_dir.join(".palq.lock")
    }
}

/// Loads the YAML engine settings. A missing file means defaults; a file
/// that exists but does not parse is an error.
pub async fn load_reconcile_config(path: &Path) -> Result<ReconcileConfig> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no config file; using defaults");
            return Ok(ReconcileConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
