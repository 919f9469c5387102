//! gradebookd - grade-book sidecar.
//!
//! Reads one JSON request per line on stdin and writes one JSON response per
//! line on stdout. Logs go to stderr.

mod backup;
mod calc;
mod config;
mod db;
mod ipc;

use std::io::{self, BufRead, Write};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let args = config::Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("GRADEBOOKD_LOG")
                .unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    info!("gradebookd {} starting", env!("CARGO_PKG_VERSION"));

    let mut state = ipc::AppState::default();
    if let Some(path) = args.workspace.as_ref() {
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            warn!("could not open workspace {}: {:#}", path.display(), e);
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping malformed request: {}", e);
                let _ = writeln!(stdout, "{}", ipc::bad_json(e.to_string()));
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    info!("stdin closed, shutting down");
}
