use crate::calc::{GradingPolicy, MissingScorePolicy};
use crate::db;
use crate::ipc::helpers::{db_conn, reply, required_str, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Evaluation,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "evaluation" => Some(Self::Evaluation),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Evaluation => "setup.evaluation",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    let d = GradingPolicy::default();
    match section {
        SetupSection::Grading => json!({
            "passMark": d.pass_mark,
            "retakeMin": d.retake_min,
            "maxScore": d.max_score
        }),
        SetupSection::Evaluation => json!({
            "missingScorePolicy": "exclude",
            "roundingDecimals": d.rounding_decimals
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "passMark" | "retakeMin" | "maxScore" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 1000.0)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Evaluation => match k.as_str() {
                "missingScorePolicy" => {
                    let s = v
                        .as_str()
                        .ok_or_else(|| format!("{} must be string", k))?
                        .trim()
                        .to_ascii_lowercase();
                    if MissingScorePolicy::parse(&s).is_none() {
                        return Err("missingScorePolicy must be one of: exclude, zero".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "roundingDecimals" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 2)?));
                }
                _ => return Err(format!("unknown evaluation field: {}", k)),
            },
        }
    }

    if let SetupSection::Grading = section {
        let get = |k: &str| obj.get(k).and_then(|v| v.as_f64()).unwrap_or(0.0);
        let (retake_min, pass_mark, max_score) = (get("retakeMin"), get("passMark"), get("maxScore"));
        if !(retake_min < pass_mark && pass_mark <= max_score) {
            return Err("thresholds must satisfy retakeMin < passMark <= maxScore".into());
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values fall back to defaults.
            let mut candidate = current.clone();
            if merge_section_patch(section, &mut candidate, saved_obj).is_ok() {
                current = candidate;
            }
        }
    }
    Ok(current)
}

/// The effective grading policy for the open workspace.
pub fn grading_policy(conn: &rusqlite::Connection) -> anyhow::Result<GradingPolicy> {
    let grading = load_section(conn, SetupSection::Grading)?;
    let evaluation = load_section(conn, SetupSection::Evaluation)?;
    let d = GradingPolicy::default();
    Ok(GradingPolicy {
        pass_mark: grading["passMark"].as_f64().unwrap_or(d.pass_mark),
        retake_min: grading["retakeMin"].as_f64().unwrap_or(d.retake_min),
        max_score: grading["maxScore"].as_f64().unwrap_or(d.max_score),
        missing_score_policy: evaluation["missingScorePolicy"]
            .as_str()
            .and_then(MissingScorePolicy::parse)
            .unwrap_or(d.missing_score_policy),
        rounding_decimals: evaluation["roundingDecimals"]
            .as_u64()
            .map(|n| n as u32)
            .unwrap_or(d.rounding_decimals),
    })
}

pub fn policy_for(conn: &rusqlite::Connection) -> Result<GradingPolicy, HandlerErr> {
    grading_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

/// Stores `values` for `section` unless the workspace already has it.
/// Returns whether anything was written.
pub fn seed_section(
    conn: &rusqlite::Connection,
    section: &str,
    values: &Value,
) -> Result<bool, String> {
    let section = SetupSection::parse(section).ok_or_else(|| format!("unknown section: {}", section))?;
    let existing = db::settings_get_json(conn, section.key()).map_err(|e| e.to_string())?;
    if existing.is_some() {
        return Ok(false);
    }
    let patch = values
        .as_object()
        .ok_or_else(|| "section must be a table".to_string())?;
    let mut current = default_section(section);
    merge_section_patch(section, &mut current, patch)?;
    db::settings_set_json(conn, section.key(), &current).map_err(|e| e.to_string())?;
    Ok(true)
}

fn handle_setup_get(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let grading = load_section(conn, SetupSection::Grading)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let evaluation = load_section(conn, SetupSection::Evaluation)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(json!({
        "grading": grading,
        "evaluation": evaluation
    }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let section_raw = required_str(&req.params, "section")?;
    let Some(section) = SetupSection::parse(&section_raw) else {
        return Err(HandlerErr::bad_params("unknown section")
            .with_details(json!({ "section": section_raw })));
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = load_section(conn, section)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    merge_section_patch(section, &mut current, patch_obj).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "setup.get" => handle_setup_get(state, req),
        "setup.update" => handle_setup_update(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
