use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::LevelFilter;
use progress_core::WorkspaceId;
use progress_engine::SyncSettings;
use progress_logging::LogDestination;
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_CONFIG: &str = "progress_watch.ron";

/// Contents of the watcher's RON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct WatchConfig {
    pub settings: SyncSettings,
    pub workspaces: Vec<String>,
    /// Also log to this file when set.
    pub log_file: Option<PathBuf>,
    pub level: String,
    /// Exit once every watched job has finished.
    pub exit_when_finished: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            settings: SyncSettings::default(),
            workspaces: Vec::new(),
            log_file: None,
            level: "info".to_string(),
            exit_when_finished: true,
        }
    }
}

impl WatchConfig {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading watch config {}", path.display()))?;
        let config: WatchConfig = ron::from_str(&content)
            .with_context(|| format!("parsing watch config {}", path.display()))?;
        if config.workspaces.is_empty() {
            bail!("{} lists no workspaces to watch", path.display());
        }
        Ok(config)
    }

    pub(crate) fn workspace_ids(&self) -> Vec<WorkspaceId> {
        let mut ids: Vec<WorkspaceId> = self.workspaces.iter().map(WorkspaceId::new).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub(crate) fn log_destination(&self) -> LogDestination {
        match &self.log_file {
            Some(path) => LogDestination::Both(path.clone()),
            None => LogDestination::Terminal,
        }
    }

    /// Unknown level names fall back to `Info`.
    pub(crate) fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::Info)
    }
}
