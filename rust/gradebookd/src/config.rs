use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const WORKSPACE_CONFIG_FILE: &str = "gradebook.toml";

/// Command-line arguments for gradebookd
#[derive(Parser, Debug)]
#[command(name = "gradebookd")]
#[command(about = "Grade-book sidecar: JSON requests on stdin, JSON responses on stdout")]
#[command(version)]
pub struct Args {
    /// Workspace directory to open before reading requests
    #[arg(short, long, env = "GRADEBOOKD_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Log filter used when GRADEBOOKD_LOG is not set
    #[arg(long, default_value = "gradebookd=info")]
    pub log_level: String,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Optional per-workspace defaults. Each table mirrors a setup section and
/// is validated by the setup handler before it is stored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    pub grading: Option<toml::Table>,
    pub evaluation: Option<toml::Table>,
}

impl WorkspaceConfig {
    pub fn sections(&self) -> Vec<(&'static str, serde_json::Value)> {
        let mut out = Vec::new();
        if let Some(t) = &self.grading {
            if let Ok(v) = serde_json::to_value(t) {
                out.push(("grading", v));
            }
        }
        if let Some(t) = &self.evaluation {
            if let Ok(v) = serde_json::to_value(t) {
                out.push(("evaluation", v));
            }
        }
        out
    }
}

pub fn load_workspace_config(workspace: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    let path = workspace.join(WORKSPACE_CONFIG_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let cfg = toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?;
    Ok(Some(cfg))
}
