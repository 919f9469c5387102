use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One protocol line: `{"id", "method", "params"?}`.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The selected workspace directory and its open database. `db` is only
/// `Some` while `workspace` is.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    /// Drops the connection but remembers the directory so it can be reopened.
    pub fn close_db(&mut self) {
        self.db = None;
    }
}
