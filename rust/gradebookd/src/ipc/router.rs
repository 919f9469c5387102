use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use tracing::{debug, warn};

type FamilyHandler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[FamilyHandler] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::semesters::try_handle,
    handlers::subjects::try_handle,
    handlers::students::try_handle,
    handlers::structure::try_handle,
    handlers::activities::try_handle,
    handlers::scores::try_handle,
    handlers::evaluation::try_handle,
    handlers::dashboard::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    debug!(id = %req.id, method = %req.method, "request");

    for family in FAMILIES {
        if let Some(resp) = family(state, &req) {
            if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
                let code = resp
                    .pointer("/error/code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                debug!(id = %req.id, method = %req.method, code, "request failed");
            }
            return resp;
        }
    }

    warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
