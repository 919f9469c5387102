use crate::calc::{self, percentages_complete, CalcContext};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{db_conn, optional_text, reply, require_row, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn count(conn: &Connection, sql: &str, semester_id: Option<&str>) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [semester_id], |r| r.get(0))
        .map_err(HandlerErr::query)
}

fn handle_dashboard_summary(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let semester_id = optional_text(&req.params, "semesterId")?;
    if let Some(id) = semester_id.as_deref() {
        require_row(conn, "SELECT 1 FROM semesters WHERE id = ?", id, "semester")?;
    }
    let scope = semester_id.as_deref();

    let semesters = count(
        conn,
        "SELECT COUNT(*) FROM semesters WHERE (?1 IS NULL OR id = ?1)",
        scope,
    )?;
    let subjects = count(
        conn,
        "SELECT COUNT(*) FROM subjects WHERE (?1 IS NULL OR semester_id = ?1)",
        scope,
    )?;
    // Students are global; with a semester filter only the enrolled ones count.
    let students = count(
        conn,
        "SELECT COUNT(*) FROM students s
         WHERE s.active = 1 AND (?1 IS NULL OR EXISTS (
           SELECT 1 FROM enrollments e JOIN subjects su ON su.id = e.subject_id
           WHERE e.student_id = s.id AND su.semester_id = ?1))",
        scope,
    )?;
    let activities = count(
        conn,
        "SELECT COUNT(*) FROM activities a
         JOIN evidences ev ON ev.id = a.evidence_id
         JOIN criteria cr ON cr.id = ev.criterion_id
         JOIN competencies c ON c.id = cr.competency_id
         JOIN subjects su ON su.id = c.subject_id
         WHERE (?1 IS NULL OR su.semester_id = ?1)",
        scope,
    )?;
    let scores = count(
        conn,
        "SELECT COUNT(*) FROM scores sc
         JOIN activities a ON a.id = sc.activity_id
         JOIN evidences ev ON ev.id = a.evidence_id
         JOIN criteria cr ON cr.id = ev.criterion_id
         JOIN competencies c ON c.id = cr.competency_id
         JOIN subjects su ON su.id = c.subject_id
         WHERE (?1 IS NULL OR su.semester_id = ?1)",
        scope,
    )?;

    let mut stmt = conn
        .prepare(
            "SELECT su.id FROM subjects su
             JOIN semesters se ON se.id = su.semester_id
             WHERE (?1 IS NULL OR su.semester_id = ?1)
             ORDER BY se.start_date, se.created_at, su.sort_order",
        )
        .map_err(HandlerErr::query)?;
    let subject_ids = stmt
        .query_map([scope], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let policy = setup::policy_for(conn)?;
    let mut per_subject = Vec::with_capacity(subject_ids.len());
    for subject_id in &subject_ids {
        let ctx = CalcContext { conn, subject_id };
        let summary = calc::compute_subject_summary(&ctx, &policy)?;
        let totals = &summary.totals;
        per_subject.push(json!({
            "subjectId": summary.subject.id,
            "semesterId": summary.subject.semester_id,
            "code": summary.subject.code,
            "name": summary.subject.name,
            "enrolled": summary.per_student.len(),
            "classAverage": totals.class_average,
            "approved": totals.approved,
            "retake": totals.retake,
            "failed": totals.failed,
            "noData": totals.no_data,
            "percentageTotal": summary.percentage_total,
            "incompleteWeights": !percentages_complete(summary.percentage_total)
        }));
    }

    Ok(json!({
        "semesterId": semester_id,
        "counts": {
            "semesters": semesters,
            "subjects": subjects,
            "students": students,
            "activities": activities,
            "scores": scores
        },
        "subjects": per_subject
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "dashboard.summary" => handle_dashboard_summary(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
