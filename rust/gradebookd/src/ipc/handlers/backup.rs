use crate::backup;
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::{reply, required_str, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info};

fn current_workspace(state: &AppState) -> Result<PathBuf, HandlerErr> {
    match (&state.workspace, &state.db) {
        (Some(p), Some(_)) => Ok(p.clone()),
        _ => Err(HandlerErr::new("no_workspace", "select a workspace first")),
    }
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> HandlerResult {
    let workspace_path = current_workspace(state)?;
    let out = PathBuf::from(required_str(&req.params, "outPath")?);

    let export = backup::export_workspace_bundle(&workspace_path, &out).map_err(|e| {
        HandlerErr::new("backup_failed", format!("{e:#}"))
            .with_details(json!({ "outPath": out.to_string_lossy() }))
    })?;
    info!(out = %out.display(), sha256 = %export.db_sha256, "workspace exported");

    Ok(json!({
        "ok": true,
        "path": out.to_string_lossy(),
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "dbSha256": export.db_sha256
    }))
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> HandlerResult {
    let workspace_path = current_workspace(state)?;
    let src = PathBuf::from(required_str(&req.params, "inPath")?);

    let staged = backup::stage_import(&src, &workspace_path).map_err(|e| {
        HandlerErr::new("backup_failed", format!("{e:#}"))
            .with_details(json!({ "inPath": src.to_string_lossy() }))
    })?;

    state.close_db();
    let import = staged.commit();
    // Reopen whatever database is now in place, even after a failed move.
    let reopened = open_workspace(state, &workspace_path);
    if reopened.is_err() {
        state.workspace = None;
    }

    let import = import.map_err(|e| {
        error!("workspace import failed: {:#}", e);
        HandlerErr::new("backup_failed", format!("{e:#}"))
            .with_details(json!({ "inPath": src.to_string_lossy() }))
    })?;
    reopened.map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    info!(src = %src.display(), exported_at = %import.exported_at, "workspace imported");

    Ok(json!({
        "ok": true,
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormat": import.bundle_format,
        "exportedAt": import.exported_at,
        "dbBytes": import.db_bytes
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.export" => handle_backup_export(state, req),
        "backup.import" => handle_backup_import(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
