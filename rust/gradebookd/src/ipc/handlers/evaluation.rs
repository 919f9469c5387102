use crate::calc::{self, CalcContext, PartialLevel, StudentGrade, SummaryModel};
use crate::db;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    begin, commit, db_conn, is_enrolled, optional_text, reply, required_str, HandlerErr,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn subject_summary(conn: &Connection, subject_id: &str) -> Result<SummaryModel, HandlerErr> {
    let policy = setup::policy_for(conn)?;
    let ctx = CalcContext { conn, subject_id };
    Ok(calc::compute_subject_summary(&ctx, &policy)?)
}

/// Splits one student's grade out of a subject summary.
fn student_grade(mut summary: SummaryModel, student_id: &str) -> Result<(SummaryModel, StudentGrade), HandlerErr> {
    let Some(pos) = summary
        .per_student
        .iter()
        .position(|s| s.student_id == student_id)
    else {
        return Err(HandlerErr::not_found("enrolled student")
            .with_details(json!({ "studentId": student_id, "subjectId": summary.subject.id })));
    };
    let grade = summary.per_student.swap_remove(pos);
    Ok((summary, grade))
}

fn handle_subject_summary(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let summary = subject_summary(conn, &subject_id)?;
    serde_json::to_value(summary).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_student_summary(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let student_id = required_str(&req.params, "studentId")?;
    let (summary, grade) = student_grade(subject_summary(conn, &subject_id)?, &student_id)?;

    let in_band = grade
        .outcome
        .partial_final
        .map(|g| summary.policy.in_retake_band(g))
        .unwrap_or(false);
    Ok(json!({
        "subject": summary.subject,
        "policy": summary.policy,
        "percentageTotal": summary.percentage_total,
        "student": grade,
        "inRetakeBand": in_band
    }))
}

fn handle_set_second_turn(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let student_id = required_str(&req.params, "studentId")?;
    let Some(score) = req.params.get("score").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::bad_params("missing score"));
    };

    let (summary, grade) = student_grade(subject_summary(conn, &subject_id)?, &student_id)?;
    let policy = &summary.policy;
    if !(0.0..=policy.max_score).contains(&score) {
        return Err(HandlerErr::bad_params(format!(
            "score must be in 0..={}",
            policy.max_score
        ))
        .with_details(json!({ "score": score })));
    }

    let partial = grade.outcome.partial_final;
    if !partial.map(|g| policy.in_retake_band(g)).unwrap_or(false) {
        return Err(HandlerErr::new(
            "not_in_retake_band",
            format!(
                "second turn only applies to partial finals in [{}, {})",
                policy.retake_min, policy.pass_mark
            ),
        )
        .with_details(json!({
            "partialFinal": partial,
            "retakeMin": policy.retake_min,
            "passMark": policy.pass_mark
        })));
    }

    conn.execute(
        "INSERT INTO second_turns(subject_id, student_id, score, recorded_at) VALUES(?, ?, ?, ?)
         ON CONFLICT(subject_id, student_id) DO UPDATE SET
           score = excluded.score,
           recorded_at = excluded.recorded_at",
        (&subject_id, &student_id, score, db::now_stamp()),
    )
    .map_err(|e| HandlerErr::insert("second_turns", e))?;

    let outcome = calc::resolve_final(partial, Some(score), policy);
    Ok(json!({ "ok": true, "outcome": outcome }))
}

fn handle_clear_second_turn(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let student_id = required_str(&req.params, "studentId")?;
    if !is_enrolled(conn, &subject_id, &student_id)? {
        return Err(HandlerErr::not_found("enrolled student")
            .with_details(json!({ "studentId": student_id, "subjectId": subject_id })));
    }
    let removed = conn
        .execute(
            "DELETE FROM second_turns WHERE subject_id = ? AND student_id = ?",
            (&subject_id, &student_id),
        )
        .map_err(|e| HandlerErr::delete("second_turns", e))?;
    Ok(json!({ "ok": true, "removed": removed > 0 }))
}

fn handle_save_partial_averages(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let summary = subject_summary(conn, &subject_id)?;
    let computed_at = db::now_stamp();

    let tx = begin(conn)?;
    tx.execute(
        "DELETE FROM partial_averages WHERE subject_id = ?",
        [&subject_id],
    )
    .map_err(|e| HandlerErr::delete("partial_averages", e))?;

    let mut saved = 0_usize;
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO partial_averages(id, subject_id, student_id, level, entity_id, value, computed_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
            )
            .map_err(HandlerErr::query)?;
        for grade in &summary.per_student {
            for row in calc::partial_averages(grade, &subject_id) {
                stmt.execute((
                    Uuid::new_v4().to_string(),
                    &subject_id,
                    &row.student_id,
                    row.level.as_str(),
                    &row.entity_id,
                    row.value,
                    &computed_at,
                ))
                .map_err(|e| HandlerErr::insert("partial_averages", e))?;
                saved += 1;
            }
        }
    }
    commit(tx)?;

    info!(subject_id = %subject_id, saved, "partial averages saved");
    Ok(json!({ "ok": true, "saved": saved, "computedAt": computed_at }))
}

fn handle_list_partial_averages(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let student_id = optional_text(&req.params, "studentId")?;
    let level = match optional_text(&req.params, "level")? {
        None => None,
        Some(raw) => Some(PartialLevel::parse(&raw).ok_or_else(|| {
            HandlerErr::bad_params("level must be one of: evidence, criterion, competency, final")
                .with_details(json!({ "level": raw }))
        })?),
    };

    let mut stmt = conn
        .prepare(
            "SELECT student_id, level, entity_id, value, computed_at
             FROM partial_averages
             WHERE subject_id = ?1
               AND (?2 IS NULL OR student_id = ?2)
               AND (?3 IS NULL OR level = ?3)
             ORDER BY student_id, level, entity_id",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map(
            (&subject_id, &student_id, level.map(PartialLevel::as_str)),
            |row| {
                let student_id: String = row.get(0)?;
                let level: String = row.get(1)?;
                let entity_id: String = row.get(2)?;
                let value: Option<f64> = row.get(3)?;
                let computed_at: String = row.get(4)?;
                Ok(json!({
                    "studentId": student_id,
                    "level": level,
                    "entityId": entity_id,
                    "value": value,
                    "computedAt": computed_at
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "partialAverages": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "evaluation.subjectSummary" => handle_subject_summary(state, req),
        "evaluation.studentSummary" => handle_student_summary(state, req),
        "evaluation.setSecondTurn" => handle_set_second_turn(state, req),
        "evaluation.clearSecondTurn" => handle_clear_second_turn(state, req),
        "evaluation.savePartialAverages" => handle_save_partial_averages(state, req),
        "evaluation.listPartialAverages" => handle_list_partial_averages(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
