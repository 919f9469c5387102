use crate::db;
use crate::ipc::helpers::{
    begin, commit, db_conn, delete_cascade, next_sort_order, nullable_text, optional_text,
    patch_object, reply, require_row, required_name, required_str, row_exists, string_array,
    HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use uuid::Uuid;

pub const SUBJECT_EXISTS: &str = "SELECT 1 FROM subjects WHERE id = ?";
const SEMESTER_EXISTS: &str = "SELECT 1 FROM semesters WHERE id = ?";
const STUDENT_EXISTS: &str = "SELECT 1 FROM students WHERE id = ?";

/// Everything owned by one subject, leaf tables first. Each statement binds
/// the subject id once.
pub const SUBJECT_CASCADE: &[(&str, &str)] = &[
    (
        "partial_averages",
        "DELETE FROM partial_averages WHERE subject_id = ?",
    ),
    ("second_turns", "DELETE FROM second_turns WHERE subject_id = ?"),
    (
        "scores",
        "DELETE FROM scores WHERE activity_id IN (
           SELECT a.id FROM activities a
           JOIN evidences ev ON ev.id = a.evidence_id
           JOIN criteria cr ON cr.id = ev.criterion_id
           JOIN competencies c ON c.id = cr.competency_id
           WHERE c.subject_id = ?)",
    ),
    (
        "activities",
        "DELETE FROM activities WHERE evidence_id IN (
           SELECT ev.id FROM evidences ev
           JOIN criteria cr ON cr.id = ev.criterion_id
           JOIN competencies c ON c.id = cr.competency_id
           WHERE c.subject_id = ?)",
    ),
    (
        "evidences",
        "DELETE FROM evidences WHERE criterion_id IN (
           SELECT cr.id FROM criteria cr
           JOIN competencies c ON c.id = cr.competency_id
           WHERE c.subject_id = ?)",
    ),
    (
        "criteria",
        "DELETE FROM criteria WHERE competency_id IN (
           SELECT id FROM competencies WHERE subject_id = ?)",
    ),
    ("competencies", "DELETE FROM competencies WHERE subject_id = ?"),
    ("enrollments", "DELETE FROM enrollments WHERE subject_id = ?"),
    ("subjects", "DELETE FROM subjects WHERE id = ?"),
];

fn subject_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let semester_id: String = row.get(1)?;
    let code: Option<String> = row.get(2)?;
    let name: String = row.get(3)?;
    let sort_order: i64 = row.get(4)?;
    let student_count: i64 = row.get(5)?;
    let competency_count: i64 = row.get(6)?;
    let percentage_total: f64 = row.get(7)?;
    Ok(json!({
        "id": id,
        "semesterId": semester_id,
        "code": code,
        "name": name,
        "sortOrder": sort_order,
        "studentCount": student_count,
        "competencyCount": competency_count,
        "percentageTotal": percentage_total
    }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let semester_id = optional_text(&req.params, "semesterId")?;

    // Correlated subqueries avoid double-counting from joins.
    let base = "SELECT
           su.id,
           su.semester_id,
           su.code,
           su.name,
           su.sort_order,
           (SELECT COUNT(*) FROM enrollments e WHERE e.subject_id = su.id) AS student_count,
           (SELECT COUNT(*) FROM competencies c WHERE c.subject_id = su.id) AS competency_count,
           (SELECT COALESCE(SUM(c.percentage), 0) FROM competencies c WHERE c.subject_id = su.id) AS percentage_total
         FROM subjects su";

    let subjects = match semester_id {
        Some(semester_id) => {
            let sql = format!("{} WHERE su.semester_id = ? ORDER BY su.sort_order", base);
            let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
            let rows = stmt
                .query_map([&semester_id], subject_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::query)?;
            rows
        }
        None => {
            let sql = format!("{} ORDER BY su.semester_id, su.sort_order", base);
            let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
            let rows = stmt
                .query_map([], subject_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::query)?;
            rows
        }
    };

    Ok(json!({ "subjects": subjects }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let semester_id = required_str(&req.params, "semesterId")?;
    let name = required_name(&req.params, "name")?;
    let code = optional_text(&req.params, "code")?;
    require_row(conn, SEMESTER_EXISTS, &semester_id, "semester")?;

    let sort_order = next_sort_order(conn, "subjects", "semester_id", &semester_id)?;
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, semester_id, code, name, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&subject_id, &semester_id, &code, &name, sort_order),
    )
    .map_err(|e| HandlerErr::insert("subjects", e))?;

    Ok(json!({ "subjectId": subject_id, "name": name }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let patch = patch_object(&req.params)?;
    require_row(conn, SUBJECT_EXISTS, &subject_id, "subject")?;

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
            "code" => {
                set_parts.push("code = ?");
                bind_values.push(
                    nullable_text(v, "patch.code")?
                        .map(Value::Text)
                        .unwrap_or(Value::Null),
                );
            }
            "semesterId" => {
                let Some(target) = v.as_str() else {
                    return Err(HandlerErr::bad_params("patch.semesterId must be a string"));
                };
                require_row(conn, SEMESTER_EXISTS, target, "semester")?;
                let current: String = conn
                    .query_row(
                        "SELECT semester_id FROM subjects WHERE id = ?",
                        [&subject_id],
                        |r| r.get(0),
                    )
                    .map_err(HandlerErr::query)?;
                if current != target {
                    // Moved subjects go to the end of the target semester.
                    let sort_order = next_sort_order(conn, "subjects", "semester_id", target)?;
                    set_parts.push("semester_id = ?");
                    bind_values.push(Value::Text(target.to_string()));
                    set_parts.push("sort_order = ?");
                    bind_values.push(Value::Integer(sort_order));
                }
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown patch field: {}", other)));
            }
        }
    }
    if patch.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }
    if set_parts.is_empty() {
        return Ok(json!({ "ok": true }));
    }

    let sql = format!("UPDATE subjects SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(subject_id));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::update("subjects", e))?;

    Ok(json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    require_row(conn, SUBJECT_EXISTS, &subject_id, "subject")?;
    delete_cascade(conn, &subject_id, SUBJECT_CASCADE)?;
    Ok(json!({ "ok": true }))
}

pub fn enrolled_students(conn: &Connection, subject_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.student_no, s.active, e.enrolled_at
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.subject_id = ?
             ORDER BY s.last_name, s.first_name, s.id",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([subject_id], |row| {
            let id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let student_no: Option<String> = row.get(3)?;
            let active: i64 = row.get(4)?;
            let enrolled_at: String = row.get(5)?;
            Ok(json!({
                "id": id,
                "displayName": format!("{}, {}", last, first),
                "lastName": last,
                "firstName": first,
                "studentNo": student_no,
                "active": active != 0,
                "enrolledAt": enrolled_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(rows)
}

fn handle_subjects_students(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    require_row(conn, SUBJECT_EXISTS, &subject_id, "subject")?;
    let students = enrolled_students(conn, &subject_id)?;
    Ok(json!({ "students": students }))
}

fn handle_subjects_enroll(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let student_ids = string_array(&req.params, "studentIds")?;
    require_row(conn, SUBJECT_EXISTS, &subject_id, "subject")?;

    for sid in &student_ids {
        if !row_exists(conn, STUDENT_EXISTS, sid)? {
            return Err(HandlerErr::not_found("student").with_details(json!({ "studentId": sid })));
        }
    }

    let tx = begin(conn)?;
    let now = db::now_stamp();
    let mut added = 0_usize;
    for sid in &student_ids {
        added += tx
            .execute(
                "INSERT OR IGNORE INTO enrollments(subject_id, student_id, enrolled_at) VALUES(?, ?, ?)",
                (&subject_id, sid, &now),
            )
            .map_err(|e| HandlerErr::insert("enrollments", e))?;
    }
    commit(tx)?;

    Ok(json!({ "ok": true, "added": added }))
}

fn handle_subjects_unenroll(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let student_ids = string_array(&req.params, "studentIds")?;
    require_row(conn, SUBJECT_EXISTS, &subject_id, "subject")?;

    // Both parameters bind (subject_id, student_id).
    const STEPS: &[(&str, &str)] = &[
        (
            "scores",
            "DELETE FROM scores WHERE student_id = ?2 AND activity_id IN (
               SELECT a.id FROM activities a
               JOIN evidences ev ON ev.id = a.evidence_id
               JOIN criteria cr ON cr.id = ev.criterion_id
               JOIN competencies c ON c.id = cr.competency_id
               WHERE c.subject_id = ?1)",
        ),
        (
            "second_turns",
            "DELETE FROM second_turns WHERE subject_id = ?1 AND student_id = ?2",
        ),
        (
            "partial_averages",
            "DELETE FROM partial_averages WHERE subject_id = ?1 AND student_id = ?2",
        ),
        (
            "enrollments",
            "DELETE FROM enrollments WHERE subject_id = ?1 AND student_id = ?2",
        ),
    ];

    let tx = begin(conn)?;
    let mut removed = 0_usize;
    for sid in &student_ids {
        for (table, sql) in STEPS {
            let n = tx
                .execute(sql, (&subject_id, sid))
                .map_err(|e| HandlerErr::delete(table, e))?;
            if *table == "enrollments" {
                removed += n;
            }
        }
    }
    commit(tx)?;

    Ok(json!({ "ok": true, "removed": removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "subjects.list" => handle_subjects_list(state, req),
        "subjects.create" => handle_subjects_create(state, req),
        "subjects.update" => handle_subjects_update(state, req),
        "subjects.delete" => handle_subjects_delete(state, req),
        "subjects.students" => handle_subjects_students(state, req),
        "subjects.enroll" => handle_subjects_enroll(state, req),
        "subjects.unenroll" => handle_subjects_unenroll(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
