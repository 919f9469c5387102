use crate::calc::ScoreState;
use crate::db;
use crate::ipc::helpers::{
    begin, commit, db_conn, is_enrolled, reply, required_str, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;

const SCORES_BULK_SET_MAX_EDITS: usize = 5000;

struct ActivityInfo {
    subject_id: String,
    out_of: f64,
}

fn load_activity(conn: &Connection, activity_id: &str) -> Result<ActivityInfo, HandlerErr> {
    conn.query_row(
        "SELECT c.subject_id, a.out_of
         FROM activities a
         JOIN evidences ev ON ev.id = a.evidence_id
         JOIN criteria cr ON cr.id = ev.criterion_id
         JOIN competencies c ON c.id = cr.competency_id
         WHERE a.id = ?",
        [activity_id],
        |r| {
            Ok(ActivityInfo {
                subject_id: r.get(0)?,
                out_of: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("activity").with_details(json!({ "activityId": activity_id })))
}

/// Maps an edit's `value`/`state` pair onto a stored score state.
fn resolve_score_state(
    explicit_state: Option<&str>,
    value: Option<f64>,
    out_of: f64,
) -> Result<ScoreState, HandlerErr> {
    if let Some(v) = value {
        if !v.is_finite() || v < 0.0 {
            return Err(HandlerErr::bad_params("negative marks are not allowed")
                .with_details(json!({ "value": v })));
        }
        if v > out_of {
            return Err(HandlerErr::bad_params("mark exceeds the activity maximum")
                .with_details(json!({ "value": v, "outOf": out_of })));
        }
    }

    match explicit_state.map(|s| s.trim().to_ascii_lowercase()) {
        Some(s) if s == "no_mark" => Ok(ScoreState::NoMark),
        Some(s) if s == "zero" => Ok(ScoreState::Zero),
        Some(s) if s == "scored" => match value {
            Some(v) if v > 0.0 => Ok(ScoreState::Scored(v)),
            Some(v) => Err(HandlerErr::bad_params("scored marks must be > 0")
                .with_details(json!({ "value": v }))),
            None => Err(HandlerErr::bad_params("scored state requires numeric value")),
        },
        Some(other) => Err(HandlerErr::bad_params("state must be one of: scored, zero, no_mark")
            .with_details(json!({ "state": other }))),
        None => match value {
            Some(v) if v > 0.0 => Ok(ScoreState::Scored(v)),
            Some(_) => Ok(ScoreState::Zero),
            None => Ok(ScoreState::NoMark),
        },
    }
}

/// `value` may be absent, null or a number; anything else is rejected.
fn edit_value(obj: &serde_json::Map<String, serde_json::Value>) -> Result<Option<f64>, HandlerErr> {
    match obj.get("value") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params("value must be a number or null")),
    }
}

fn edit_state(obj: &serde_json::Map<String, serde_json::Value>) -> Result<Option<&str>, HandlerErr> {
    match obj.get("state") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params("state must be a string")),
    }
}

fn upsert_score(
    conn: &Connection,
    activity_id: &str,
    student_id: &str,
    state: ScoreState,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO scores(activity_id, student_id, raw_value, status, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(activity_id, student_id) DO UPDATE SET
           raw_value = excluded.raw_value,
           status = excluded.status,
           updated_at = excluded.updated_at",
        (
            activity_id,
            student_id,
            state.raw_value(),
            state.status(),
            db::now_stamp(),
        ),
    )
    .map_err(|e| HandlerErr::insert("scores", e))?;
    Ok(())
}

fn plan_edit(
    conn: &Connection,
    activity: &ActivityInfo,
    edit: &serde_json::Value,
    seen: &mut HashSet<String>,
) -> Result<(String, ScoreState), HandlerErr> {
    let Some(obj) = edit.as_object() else {
        return Err(HandlerErr::bad_params("edit must be an object"));
    };
    let student_id = required_str(edit, "studentId")?;
    if !seen.insert(student_id.clone()) {
        return Err(HandlerErr::bad_params("duplicate studentId in edits"));
    }
    require_enrolled(conn, &activity.subject_id, &student_id)?;
    let score = resolve_score_state(edit_state(obj)?, edit_value(obj)?, activity.out_of)?;
    Ok((student_id, score))
}

fn require_enrolled(conn: &Connection, subject_id: &str, student_id: &str) -> Result<(), HandlerErr> {
    if is_enrolled(conn, subject_id, student_id)? {
        Ok(())
    } else {
        Err(HandlerErr::bad_params("student is not enrolled in the activity's subject")
            .with_details(json!({ "studentId": student_id, "subjectId": subject_id })))
    }
}

fn handle_scores_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let activity_id = required_str(&req.params, "activityId")?;
    let activity = load_activity(conn, &activity_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.active, sc.raw_value, sc.status, sc.updated_at
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             LEFT JOIN scores sc ON sc.student_id = s.id AND sc.activity_id = ?
             WHERE e.subject_id = ?
             ORDER BY s.last_name, s.first_name, s.id",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map((&activity_id, &activity.subject_id), |row| {
            let id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let active: i64 = row.get(3)?;
            let raw_value: Option<f64> = row.get(4)?;
            let status: Option<String> = row.get(5)?;
            let updated_at: Option<String> = row.get(6)?;
            let state = status.map(|s| ScoreState::from_row(&s, raw_value));
            Ok(json!({
                "studentId": id,
                "displayName": format!("{}, {}", last, first),
                "active": active != 0,
                "value": state.and_then(|s| s.raw_value()),
                "state": state.map(|s| s.status()),
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({
        "activityId": activity_id,
        "outOf": activity.out_of,
        "scores": rows
    }))
}

fn handle_scores_set(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let activity_id = required_str(&req.params, "activityId")?;
    let student_id = required_str(&req.params, "studentId")?;
    let Some(obj) = req.params.as_object() else {
        return Err(HandlerErr::bad_params("params must be an object"));
    };
    let activity = load_activity(conn, &activity_id)?;
    require_enrolled(conn, &activity.subject_id, &student_id)?;

    let score = resolve_score_state(edit_state(obj)?, edit_value(obj)?, activity.out_of)?;
    upsert_score(conn, &activity_id, &student_id, score)?;

    Ok(json!({
        "ok": true,
        "state": score.status(),
        "value": score.raw_value()
    }))
}

fn handle_scores_bulk_set(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let activity_id = required_str(&req.params, "activityId")?;
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing edits[]"));
    };
    if edits_arr.len() > SCORES_BULK_SET_MAX_EDITS {
        return Err(HandlerErr::new(
            "limit_exceeded",
            format!(
                "bulk payload exceeds max edits: {} > {}",
                edits_arr.len(),
                SCORES_BULK_SET_MAX_EDITS
            ),
        )
        .with_details(json!({ "max": SCORES_BULK_SET_MAX_EDITS, "received": edits_arr.len() })));
    }
    let activity = load_activity(conn, &activity_id)?;

    // Validate everything first; nothing is written unless every edit is valid.
    let mut planned: Vec<(String, ScoreState)> = Vec::with_capacity(edits_arr.len());
    let mut errors: Vec<serde_json::Value> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let outcome = plan_edit(conn, &activity, edit, &mut seen);
        match outcome {
            Ok(p) => planned.push(p),
            Err(e) => errors.push(json!({
                "index": i,
                "studentId": edit.get("studentId"),
                "code": e.code,
                "message": e.message
            })),
        }
    }

    if !errors.is_empty() {
        return Err(HandlerErr::bad_params(format!(
            "{} of {} edits rejected; nothing was saved",
            errors.len(),
            edits_arr.len()
        ))
        .with_details(json!({ "rejected": errors.len(), "errors": errors })));
    }

    let tx = begin(conn)?;
    for (student_id, score) in &planned {
        upsert_score(&tx, &activity_id, student_id, *score)?;
    }
    commit(tx)?;

    Ok(json!({ "ok": true, "updated": planned.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "scores.list" => handle_scores_list(state, req),
        "scores.set" => handle_scores_set(state, req),
        "scores.bulkSet" => handle_scores_bulk_set(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
