use crate::db;
use crate::ipc::handlers::subjects;
use crate::ipc::helpers::{
    begin, commit, db_conn, nullable_date, optional_date, patch_object, reply, require_row,
    required_name, required_str, run_steps, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const SEMESTER_EXISTS: &str = "SELECT 1 FROM semesters WHERE id = ?";

fn check_date_order(start: Option<&str>, end: Option<&str>) -> Result<(), HandlerErr> {
    if let (Some(s), Some(e)) = (start, end) {
        // ISO dates compare correctly as strings.
        if s > e {
            return Err(HandlerErr::bad_params("startDate must not be after endDate")
                .with_details(json!({ "startDate": s, "endDate": e })));
        }
    }
    Ok(())
}

fn handle_semesters_list(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;

    let mut stmt = conn
        .prepare(
            "SELECT
               se.id,
               se.name,
               se.start_date,
               se.end_date,
               se.created_at,
               (SELECT COUNT(*) FROM subjects su WHERE su.semester_id = se.id) AS subject_count
             FROM semesters se
             ORDER BY COALESCE(se.start_date, se.created_at) DESC, se.name",
        )
        .map_err(HandlerErr::query)?;
    let semesters = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let start_date: Option<String> = row.get(2)?;
            let end_date: Option<String> = row.get(3)?;
            let created_at: String = row.get(4)?;
            let subject_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "startDate": start_date,
                "endDate": end_date,
                "createdAt": created_at,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "semesters": semesters }))
}

fn handle_semesters_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let name = required_name(&req.params, "name")?;
    let start_date = optional_date(&req.params, "startDate")?;
    let end_date = optional_date(&req.params, "endDate")?;
    check_date_order(start_date.as_deref(), end_date.as_deref())?;

    let semester_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO semesters(id, name, start_date, end_date, created_at) VALUES(?, ?, ?, ?, ?)",
        (&semester_id, &name, &start_date, &end_date, db::now_stamp()),
    )
    .map_err(|e| HandlerErr::insert("semesters", e))?;

    Ok(json!({ "semesterId": semester_id, "name": name }))
}

fn current_dates(conn: &Connection, semester_id: &str) -> Result<(Option<String>, Option<String>), HandlerErr> {
    conn.query_row(
        "SELECT start_date, end_date FROM semesters WHERE id = ?",
        [semester_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("semester"))
}

fn handle_semesters_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let semester_id = required_str(&req.params, "semesterId")?;
    let patch = patch_object(&req.params)?;
    let (mut start_date, mut end_date) = current_dates(conn, &semester_id)?;

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(HandlerErr::bad_params("patch.name must be a non-empty string"));
                };
                set_parts.push("name = ?");
                bind_values.push(Value::Text(s.to_string()));
            }
            "startDate" => {
                start_date = nullable_date(v, "patch.startDate")?;
                set_parts.push("start_date = ?");
                bind_values.push(start_date.clone().map(Value::Text).unwrap_or(Value::Null));
            }
            "endDate" => {
                end_date = nullable_date(v, "patch.endDate")?;
                set_parts.push("end_date = ?");
                bind_values.push(end_date.clone().map(Value::Text).unwrap_or(Value::Null));
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown patch field: {}", other)));
            }
        }
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }
    check_date_order(start_date.as_deref(), end_date.as_deref())?;

    let sql = format!("UPDATE semesters SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(semester_id));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::update("semesters", e))?;

    Ok(json!({ "ok": true }))
}

fn handle_semesters_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let semester_id = required_str(&req.params, "semesterId")?;
    require_row(conn, SEMESTER_EXISTS, &semester_id, "semester")?;

    let mut stmt = conn
        .prepare("SELECT id FROM subjects WHERE semester_id = ?")
        .map_err(HandlerErr::query)?;
    let subject_ids = stmt
        .query_map([&semester_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    drop(stmt);

    let tx = begin(conn)?;
    for subject_id in &subject_ids {
        run_steps(&tx, subject_id, subjects::SUBJECT_CASCADE)?;
    }
    run_steps(
        &tx,
        &semester_id,
        &[("semesters", "DELETE FROM semesters WHERE id = ?")],
    )?;
    commit(tx)?;

    Ok(json!({ "ok": true, "deletedSubjects": subject_ids.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "semesters.list" => handle_semesters_list(state, req),
        "semesters.create" => handle_semesters_create(state, req),
        "semesters.update" => handle_semesters_update(state, req),
        "semesters.delete" => handle_semesters_delete(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
