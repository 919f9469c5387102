use crate::ipc::handlers::setup;
use crate::ipc::handlers::subjects::SUBJECT_EXISTS;
use crate::ipc::helpers::{
    db_conn, delete_cascade, next_sort_order, nullable_date, optional_date, patch_object, reply,
    require_row, required_name, required_str, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use uuid::Uuid;

const EVIDENCE_EXISTS: &str = "SELECT 1 FROM evidences WHERE id = ?";
const ACTIVITY_EXISTS: &str = "SELECT 1 FROM activities WHERE id = ?";

const ACTIVITY_CASCADE: &[(&str, &str)] = &[
    ("scores", "DELETE FROM scores WHERE activity_id = ?"),
    ("activities", "DELETE FROM activities WHERE id = ?"),
];

fn parse_out_of(v: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    let Some(n) = v.as_f64().filter(|n| n.is_finite()) else {
        return Err(HandlerErr::bad_params(format!("{} must be a number", key)));
    };
    if n <= 0.0 {
        return Err(HandlerErr::bad_params(format!("{} must be > 0", key))
            .with_details(json!({ key: n })));
    }
    Ok(n)
}

const ACTIVITY_COLUMNS: &str = "SELECT
       a.id,
       a.evidence_id,
       a.title,
       a.date,
       a.out_of,
       a.sort_order,
       (SELECT COUNT(*) FROM scores sc WHERE sc.activity_id = a.id) AS score_count
     FROM activities a";

fn activity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let evidence_id: String = row.get(1)?;
    let title: String = row.get(2)?;
    let date: Option<String> = row.get(3)?;
    let out_of: f64 = row.get(4)?;
    let sort_order: i64 = row.get(5)?;
    let score_count: i64 = row.get(6)?;
    Ok(json!({
        "id": id,
        "evidenceId": evidence_id,
        "title": title,
        "date": date,
        "outOf": out_of,
        "sortOrder": sort_order,
        "scoreCount": score_count
    }))
}

fn handle_activities_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let evidence_id = req.params.get("evidenceId").and_then(|v| v.as_str());
    let subject_id = req.params.get("subjectId").and_then(|v| v.as_str());

    let activities = match (evidence_id, subject_id) {
        (Some(evidence_id), _) => {
            require_row(conn, EVIDENCE_EXISTS, evidence_id, "evidence")?;
            let sql = format!("{} WHERE a.evidence_id = ? ORDER BY a.sort_order", ACTIVITY_COLUMNS);
            let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
            let rows = stmt
                .query_map([evidence_id], activity_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::query)?;
            rows
        }
        (None, Some(subject_id)) => {
            require_row(conn, SUBJECT_EXISTS, subject_id, "subject")?;
            // Tree order: competency, criterion, evidence, then activity.
            let sql = format!(
                "{}
                 JOIN evidences ev ON ev.id = a.evidence_id
                 JOIN criteria cr ON cr.id = ev.criterion_id
                 JOIN competencies c ON c.id = cr.competency_id
                 WHERE c.subject_id = ?
                 ORDER BY c.sort_order, cr.sort_order, ev.sort_order, a.sort_order",
                ACTIVITY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
            let rows = stmt
                .query_map([subject_id], activity_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::query)?;
            rows
        }
        (None, None) => {
            return Err(HandlerErr::bad_params("missing evidenceId or subjectId"));
        }
    };

    Ok(json!({ "activities": activities }))
}

fn handle_activities_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let evidence_id = required_str(&req.params, "evidenceId")?;
    let title = required_name(&req.params, "title")?;
    let date = optional_date(&req.params, "date")?;
    require_row(conn, EVIDENCE_EXISTS, &evidence_id, "evidence")?;
    let out_of = match req.params.get("outOf") {
        None | Some(serde_json::Value::Null) => setup::policy_for(conn)?.max_score,
        Some(v) => parse_out_of(v, "outOf")?,
    };

    let sort_order = next_sort_order(conn, "activities", "evidence_id", &evidence_id)?;
    let activity_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO activities(id, evidence_id, title, date, out_of, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&activity_id, &evidence_id, &title, &date, out_of, sort_order),
    )
    .map_err(|e| HandlerErr::insert("activities", e))?;

    Ok(json!({ "activityId": activity_id, "outOf": out_of }))
}

fn max_recorded_score(conn: &Connection, activity_id: &str) -> Result<Option<f64>, HandlerErr> {
    conn.query_row(
        "SELECT MAX(raw_value) FROM scores WHERE activity_id = ? AND status = 'scored'",
        [activity_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::query)
}

fn handle_activities_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let activity_id = required_str(&req.params, "activityId")?;
    let patch = patch_object(&req.params)?;
    require_row(conn, ACTIVITY_EXISTS, &activity_id, "activity")?;

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "title" => {
                let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(HandlerErr::bad_params("patch.title must be a non-empty string"));
                };
                set_parts.push("title = ?");
                bind_values.push(Value::Text(s.to_string()));
            }
            "date" => {
                set_parts.push("date = ?");
                bind_values.push(
                    nullable_date(v, "patch.date")?
                        .map(Value::Text)
                        .unwrap_or(Value::Null),
                );
            }
            "outOf" => {
                let out_of = parse_out_of(v, "patch.outOf")?;
                // Recorded scores must stay within the new maximum.
                if let Some(max) = max_recorded_score(conn, &activity_id)? {
                    if max > out_of {
                        return Err(HandlerErr::bad_params(
                            "outOf is below an already recorded score",
                        )
                        .with_details(json!({ "outOf": out_of, "maxRecorded": max })));
                    }
                }
                set_parts.push("out_of = ?");
                bind_values.push(Value::Real(out_of));
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown patch field: {}", other)));
            }
        }
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }

    let sql = format!("UPDATE activities SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(activity_id));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::update("activities", e))?;

    Ok(json!({ "ok": true }))
}

fn handle_activities_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let activity_id = required_str(&req.params, "activityId")?;
    require_row(conn, ACTIVITY_EXISTS, &activity_id, "activity")?;
    delete_cascade(conn, &activity_id, ACTIVITY_CASCADE)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "activities.list" => handle_activities_list(state, req),
        "activities.create" => handle_activities_create(state, req),
        "activities.update" => handle_activities_update(state, req),
        "activities.delete" => handle_activities_delete(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
