use crate::config;
use crate::db;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{reply, required_str, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Opens (creating if needed) the workspace database and makes it current.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;

    // Best-effort: seed setup sections from gradebook.toml. A broken file
    // must not prevent the workspace from opening.
    match config::load_workspace_config(path) {
        Ok(Some(cfg)) => {
            for (section, values) in cfg.sections() {
                match setup::seed_section(&conn, section, &values) {
                    Ok(true) => info!(section, "seeded setup from {}", config::WORKSPACE_CONFIG_FILE),
                    Ok(false) => {}
                    Err(e) => warn!(section, "ignoring workspace config section: {}", e),
                }
            }
        }
        Ok(None) => {}
        Err(e) => warn!("ignoring workspace config: {}", e),
    }

    info!("workspace opened: {}", path.display());
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    Ok(())
}

fn handle_health(state: &mut AppState, _req: &Request) -> HandlerResult {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
    }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> HandlerResult {
    let path = PathBuf::from(required_str(&req.params, "path")?);
    open_workspace(state, &path)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
