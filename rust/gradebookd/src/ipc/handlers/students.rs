use crate::db;
use crate::ipc::helpers::{
    db_conn, delete_cascade, nullable_text, optional_text, patch_object, reply, require_row,
    required_name, required_str, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;
use uuid::Uuid;

const STUDENT_EXISTS: &str = "SELECT 1 FROM students WHERE id = ?";

const STUDENT_CASCADE: &[(&str, &str)] = &[
    ("scores", "DELETE FROM scores WHERE student_id = ?"),
    ("second_turns", "DELETE FROM second_turns WHERE student_id = ?"),
    (
        "partial_averages",
        "DELETE FROM partial_averages WHERE student_id = ?",
    ),
    ("enrollments", "DELETE FROM enrollments WHERE student_id = ?"),
    ("students", "DELETE FROM students WHERE id = ?"),
];

fn handle_students_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let active_only = req
        .params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut stmt = conn
        .prepare(
            "SELECT
               s.id,
               s.last_name,
               s.first_name,
               s.student_no,
               s.email,
               s.active,
               (SELECT COUNT(*) FROM enrollments e WHERE e.student_id = s.id) AS subject_count
             FROM students s
             WHERE (? = 0 OR s.active = 1)
             ORDER BY s.last_name, s.first_name, s.id",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([active_only as i64], |row| {
            let id: String = row.get(0)?;
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let student_no: Option<String> = row.get(3)?;
            let email: Option<String> = row.get(4)?;
            let active: i64 = row.get(5)?;
            let subject_count: i64 = row.get(6)?;
            let display_name = format!("{}, {}", last_name, first_name);
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "displayName": display_name,
                "studentNo": student_no,
                "email": email,
                "active": active != 0,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "students": students }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let last_name = required_name(&req.params, "lastName")?;
    let first_name = required_name(&req.params, "firstName")?;
    let student_no = optional_text(&req.params, "studentNo")?;
    let email = optional_text(&req.params, "email")?;
    let active = match req.params.get("active") {
        None => true,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("active must be a boolean"))?,
    };

    let student_id = Uuid::new_v4().to_string();
    let now = db::now_stamp();
    conn.execute(
        "INSERT INTO students(id, last_name, first_name, student_no, email, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &last_name,
            &first_name,
            &student_no,
            &email,
            active as i64,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::insert("students", e))?;

    Ok(json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    let patch = patch_object(&req.params)?;
    require_row(conn, STUDENT_EXISTS, &student_id, "student")?;

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (k, v) in patch {
        match k.as_str() {
            "lastName" | "firstName" => {
                let Some(s) = v.as_str() else {
                    return Err(HandlerErr::bad_params(format!("patch.{} must be a string", k)));
                };
                let s = s.trim();
                if s.is_empty() {
                    return Err(HandlerErr::bad_params(format!("{} must not be empty", k)));
                }
                set_parts.push(if k == "lastName" {
                    "last_name = ?"
                } else {
                    "first_name = ?"
                });
                bind_values.push(Value::Text(s.to_string()));
            }
            "studentNo" | "email" => {
                let text = nullable_text(v, &format!("patch.{}", k))?;
                set_parts.push(if k == "studentNo" {
                    "student_no = ?"
                } else {
                    "email = ?"
                });
                bind_values.push(text.map(Value::Text).unwrap_or(Value::Null));
            }
            "active" => {
                let Some(b) = v.as_bool() else {
                    return Err(HandlerErr::bad_params("patch.active must be a boolean"));
                };
                set_parts.push("active = ?");
                bind_values.push(Value::Integer(b as i64));
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown patch field: {}", other)));
            }
        }
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }

    set_parts.push("updated_at = ?");
    bind_values.push(Value::Text(db::now_stamp()));
    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::update("students", e))?;

    Ok(json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(&req.params, "studentId")?;
    require_row(conn, STUDENT_EXISTS, &student_id, "student")?;
    delete_cascade(conn, &student_id, STUDENT_CASCADE)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_students_list(state, req),
        "students.create" => handle_students_create(state, req),
        "students.update" => handle_students_update(state, req),
        "students.delete" => handle_students_delete(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
