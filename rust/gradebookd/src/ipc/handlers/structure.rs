//! Competencies, criteria and evidences: the weighted tree an activity hangs
//! from. Percentages live on competencies; criteria carry a relative weight.

use crate::calc::{self, check_percentage_headroom};
use crate::ipc::handlers::subjects::SUBJECT_EXISTS;
use crate::ipc::helpers::{
    db_conn, delete_cascade, next_sort_order, nullable_text, optional_text, patch_object, reply,
    require_row, required_name, required_str, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Map};
use uuid::Uuid;

const COMPETENCY_EXISTS: &str = "SELECT 1 FROM competencies WHERE id = ?";
const CRITERION_EXISTS: &str = "SELECT 1 FROM criteria WHERE id = ?";
const EVIDENCE_EXISTS: &str = "SELECT 1 FROM evidences WHERE id = ?";

const COMPETENCY_CASCADE: &[(&str, &str)] = &[
    (
        "partial_averages",
        "DELETE FROM partial_averages WHERE entity_id = ?1
           OR entity_id IN (SELECT id FROM criteria WHERE competency_id = ?1)
           OR entity_id IN (
             SELECT ev.id FROM evidences ev
             JOIN criteria cr ON cr.id = ev.criterion_id
             WHERE cr.competency_id = ?1)",
    ),
    (
        "scores",
        "DELETE FROM scores WHERE activity_id IN (
           SELECT a.id FROM activities a
           JOIN evidences ev ON ev.id = a.evidence_id
           JOIN criteria cr ON cr.id = ev.criterion_id
           WHERE cr.competency_id = ?1)",
    ),
    (
        "activities",
        "DELETE FROM activities WHERE evidence_id IN (
           SELECT ev.id FROM evidences ev
           JOIN criteria cr ON cr.id = ev.criterion_id
           WHERE cr.competency_id = ?1)",
    ),
    (
        "evidences",
        "DELETE FROM evidences WHERE criterion_id IN (
           SELECT id FROM criteria WHERE competency_id = ?1)",
    ),
    ("criteria", "DELETE FROM criteria WHERE competency_id = ?1"),
    ("competencies", "DELETE FROM competencies WHERE id = ?1"),
];

const CRITERION_CASCADE: &[(&str, &str)] = &[
    (
        "partial_averages",
        "DELETE FROM partial_averages WHERE entity_id = ?1
           OR entity_id IN (SELECT id FROM evidences WHERE criterion_id = ?1)",
    ),
    (
        "scores",
        "DELETE FROM scores WHERE activity_id IN (
           SELECT a.id FROM activities a
           JOIN evidences ev ON ev.id = a.evidence_id
           WHERE ev.criterion_id = ?1)",
    ),
    (
        "activities",
        "DELETE FROM activities WHERE evidence_id IN (
           SELECT id FROM evidences WHERE criterion_id = ?1)",
    ),
    ("evidences", "DELETE FROM evidences WHERE criterion_id = ?1"),
    ("criteria", "DELETE FROM criteria WHERE id = ?1"),
];

const EVIDENCE_CASCADE: &[(&str, &str)] = &[
    ("partial_averages", "DELETE FROM partial_averages WHERE entity_id = ?1"),
    (
        "scores",
        "DELETE FROM scores WHERE activity_id IN (
           SELECT id FROM activities WHERE evidence_id = ?1)",
    ),
    ("activities", "DELETE FROM activities WHERE evidence_id = ?1"),
    ("evidences", "DELETE FROM evidences WHERE id = ?1"),
];

fn parse_number(v: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    v.as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))
}

fn parse_weight(v: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    let w = parse_number(v, key)?;
    if w <= 0.0 {
        return Err(HandlerErr::bad_params(format!("{} must be > 0", key))
            .with_details(json!({ key: w })));
    }
    Ok(w)
}

/// Sum of competency percentages in a subject, optionally leaving one out.
fn percentage_total(conn: &Connection, subject_id: &str, except: Option<&str>) -> Result<f64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(SUM(percentage), 0) FROM competencies
         WHERE subject_id = ?1 AND (?2 IS NULL OR id <> ?2)",
        (subject_id, except),
        |r| r.get(0),
    )
    .map_err(HandlerErr::query)
}

/// Handles the `name`/`description` keys shared by every level's patch.
/// Returns false for keys it does not own.
fn patch_text_field(
    k: &str,
    v: &serde_json::Value,
    set_parts: &mut Vec<&'static str>,
    bind_values: &mut Vec<Value>,
) -> Result<bool, HandlerErr> {
    match k {
        "name" => {
            let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                return Err(HandlerErr::bad_params("patch.name must be a non-empty string"));
            };
            set_parts.push("name = ?");
            bind_values.push(Value::Text(s.to_string()));
            Ok(true)
        }
        "description" => {
            set_parts.push("description = ?");
            bind_values.push(
                nullable_text(v, "patch.description")?
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
            );
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn apply_patch(
    conn: &Connection,
    table: &str,
    id: String,
    set_parts: Vec<&'static str>,
    mut bind_values: Vec<Value>,
) -> Result<(), HandlerErr> {
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }
    let sql = format!("UPDATE {} SET {} WHERE id = ?", table, set_parts.join(", "));
    bind_values.push(Value::Text(id));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::update(table, e))?;
    Ok(())
}

fn unknown_field(k: &str) -> HandlerErr {
    HandlerErr::bad_params(format!("unknown patch field: {}", k))
}

fn handle_competencies_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    require_row(conn, SUBJECT_EXISTS, &subject_id, "subject")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.description,
               c.percentage,
               c.sort_order,
               (SELECT COUNT(*) FROM criteria cr WHERE cr.competency_id = c.id) AS criteria_count
             FROM competencies c
             WHERE c.subject_id = ?
             ORDER BY c.sort_order",
        )
        .map_err(HandlerErr::query)?;
    let competencies = stmt
        .query_map([&subject_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let percentage: f64 = row.get(3)?;
            let sort_order: i64 = row.get(4)?;
            let criteria_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "description": description,
                "percentage": percentage,
                "sortOrder": sort_order,
                "criteriaCount": criteria_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let total = percentage_total(conn, &subject_id, None)?;
    Ok(json!({
        "competencies": competencies,
        "percentageTotal": total,
        "percentageRemaining": (calc::FULL_PERCENTAGE - total).max(0.0)
    }))
}

fn handle_competencies_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let name = required_name(&req.params, "name")?;
    let description = optional_text(&req.params, "description")?;
    let Some(raw_pct) = req.params.get("percentage") else {
        return Err(HandlerErr::bad_params("missing percentage"));
    };
    let percentage = parse_number(raw_pct, "percentage")?;
    require_row(conn, SUBJECT_EXISTS, &subject_id, "subject")?;

    let others = percentage_total(conn, &subject_id, None)?;
    check_percentage_headroom(others, percentage)?;

    let sort_order = next_sort_order(conn, "competencies", "subject_id", &subject_id)?;
    let competency_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO competencies(id, subject_id, name, description, percentage, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&competency_id, &subject_id, &name, &description, percentage, sort_order),
    )
    .map_err(|e| HandlerErr::insert("competencies", e))?;

    Ok(json!({
        "competencyId": competency_id,
        "percentageTotal": others + percentage
    }))
}

fn handle_competencies_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let competency_id = required_str(&req.params, "competencyId")?;
    let patch = patch_object(&req.params)?;
    let subject_id: String = conn
        .query_row(
            "SELECT subject_id FROM competencies WHERE id = ?",
            [&competency_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("competency"))?;

    let mut set_parts = Vec::new();
    let mut bind_values = Vec::new();
    for (k, v) in patch {
        if patch_text_field(k, v, &mut set_parts, &mut bind_values)? {
            continue;
        }
        match k.as_str() {
            "percentage" => {
                let percentage = parse_number(v, "patch.percentage")?;
                let others = percentage_total(conn, &subject_id, Some(&competency_id))?;
                check_percentage_headroom(others, percentage)?;
                set_parts.push("percentage = ?");
                bind_values.push(Value::Real(percentage));
            }
            other => return Err(unknown_field(other)),
        }
    }
    apply_patch(conn, "competencies", competency_id, set_parts, bind_values)?;
    Ok(json!({ "ok": true }))
}

fn handle_competencies_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let competency_id = required_str(&req.params, "competencyId")?;
    require_row(conn, COMPETENCY_EXISTS, &competency_id, "competency")?;
    delete_cascade(conn, &competency_id, COMPETENCY_CASCADE)?;
    Ok(json!({ "ok": true }))
}

fn handle_criteria_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let competency_id = required_str(&req.params, "competencyId")?;
    require_row(conn, COMPETENCY_EXISTS, &competency_id, "competency")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               cr.id,
               cr.name,
               cr.description,
               cr.weight,
               cr.sort_order,
               (SELECT COUNT(*) FROM evidences ev WHERE ev.criterion_id = cr.id) AS evidence_count
             FROM criteria cr
             WHERE cr.competency_id = ?
             ORDER BY cr.sort_order",
        )
        .map_err(HandlerErr::query)?;
    let criteria = stmt
        .query_map([&competency_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let weight: f64 = row.get(3)?;
            let sort_order: i64 = row.get(4)?;
            let evidence_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "description": description,
                "weight": weight,
                "sortOrder": sort_order,
                "evidenceCount": evidence_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "criteria": criteria }))
}

fn handle_criteria_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let competency_id = required_str(&req.params, "competencyId")?;
    let name = required_name(&req.params, "name")?;
    let description = optional_text(&req.params, "description")?;
    let weight = match req.params.get("weight") {
        None | Some(serde_json::Value::Null) => 1.0,
        Some(v) => parse_weight(v, "weight")?,
    };
    require_row(conn, COMPETENCY_EXISTS, &competency_id, "competency")?;

    let sort_order = next_sort_order(conn, "criteria", "competency_id", &competency_id)?;
    let criterion_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO criteria(id, competency_id, name, description, weight, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&criterion_id, &competency_id, &name, &description, weight, sort_order),
    )
    .map_err(|e| HandlerErr::insert("criteria", e))?;

    Ok(json!({ "criterionId": criterion_id }))
}

fn handle_criteria_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let criterion_id = required_str(&req.params, "criterionId")?;
    let patch = patch_object(&req.params)?;
    require_row(conn, CRITERION_EXISTS, &criterion_id, "criterion")?;

    let mut set_parts = Vec::new();
    let mut bind_values = Vec::new();
    for (k, v) in patch {
        if patch_text_field(k, v, &mut set_parts, &mut bind_values)? {
            continue;
        }
        match k.as_str() {
            "weight" => {
                set_parts.push("weight = ?");
                bind_values.push(Value::Real(parse_weight(v, "patch.weight")?));
            }
            other => return Err(unknown_field(other)),
        }
    }
    apply_patch(conn, "criteria", criterion_id, set_parts, bind_values)?;
    Ok(json!({ "ok": true }))
}

fn handle_criteria_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let criterion_id = required_str(&req.params, "criterionId")?;
    require_row(conn, CRITERION_EXISTS, &criterion_id, "criterion")?;
    delete_cascade(conn, &criterion_id, CRITERION_CASCADE)?;
    Ok(json!({ "ok": true }))
}

fn handle_evidences_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let criterion_id = required_str(&req.params, "criterionId")?;
    require_row(conn, CRITERION_EXISTS, &criterion_id, "criterion")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               ev.id,
               ev.name,
               ev.description,
               ev.sort_order,
               (SELECT COUNT(*) FROM activities a WHERE a.evidence_id = ev.id) AS activity_count
             FROM evidences ev
             WHERE ev.criterion_id = ?
             ORDER BY ev.sort_order",
        )
        .map_err(HandlerErr::query)?;
    let evidences = stmt
        .query_map([&criterion_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let sort_order: i64 = row.get(3)?;
            let activity_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "description": description,
                "sortOrder": sort_order,
                "activityCount": activity_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "evidences": evidences }))
}

fn handle_evidences_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let criterion_id = required_str(&req.params, "criterionId")?;
    let name = required_name(&req.params, "name")?;
    let description = optional_text(&req.params, "description")?;
    require_row(conn, CRITERION_EXISTS, &criterion_id, "criterion")?;

    let sort_order = next_sort_order(conn, "evidences", "criterion_id", &criterion_id)?;
    let evidence_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO evidences(id, criterion_id, name, description, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&evidence_id, &criterion_id, &name, &description, sort_order),
    )
    .map_err(|e| HandlerErr::insert("evidences", e))?;

    Ok(json!({ "evidenceId": evidence_id }))
}

fn handle_evidences_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let evidence_id = required_str(&req.params, "evidenceId")?;
    let patch = patch_object(&req.params)?;
    require_row(conn, EVIDENCE_EXISTS, &evidence_id, "evidence")?;

    let mut set_parts = Vec::new();
    let mut bind_values = Vec::new();
    for (k, v) in patch {
        if !patch_text_field(k, v, &mut set_parts, &mut bind_values)? {
            return Err(unknown_field(k));
        }
    }
    apply_patch(conn, "evidences", evidence_id, set_parts, bind_values)?;
    Ok(json!({ "ok": true }))
}

fn handle_evidences_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let evidence_id = required_str(&req.params, "evidenceId")?;
    require_row(conn, EVIDENCE_EXISTS, &evidence_id, "evidence")?;
    delete_cascade(conn, &evidence_id, EVIDENCE_CASCADE)?;
    Ok(json!({ "ok": true }))
}

fn handle_structure_tree(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let subject = calc::load_subject_ref(conn, &subject_id)?;
    let tree = calc::load_grade_tree(conn, &subject_id)?;

    let competencies: Vec<serde_json::Value> = tree
        .competencies
        .iter()
        .map(|c| {
            let criteria: Vec<serde_json::Value> = c
                .criteria
                .iter()
                .map(|cr| {
                    let evidences: Vec<serde_json::Value> = cr
                        .evidences
                        .iter()
                        .map(|ev| {
                            let activities: Vec<serde_json::Value> = ev
                                .activities
                                .iter()
                                .map(|a| json!({ "id": a.id, "title": a.title, "outOf": a.out_of }))
                                .collect();
                            json!({
                                "id": ev.id,
                                "name": ev.name,
                                "activityCount": activities.len(),
                                "activities": activities
                            })
                        })
                        .collect();
                    json!({
                        "id": cr.id,
                        "name": cr.name,
                        "weight": cr.weight,
                        "evidences": evidences
                    })
                })
                .collect();
            json!({
                "id": c.id,
                "name": c.name,
                "percentage": c.percentage,
                "criteria": criteria
            })
        })
        .collect();

    let mut out = Map::new();
    out.insert("subject".into(), json!(subject));
    out.insert("percentageTotal".into(), json!(tree.percentage_total()));
    out.insert("activityCount".into(), json!(tree.activities().count()));
    out.insert("competencies".into(), json!(competencies));
    Ok(serde_json::Value::Object(out))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "competencies.list" => handle_competencies_list(state, req),
        "competencies.create" => handle_competencies_create(state, req),
        "competencies.update" => handle_competencies_update(state, req),
        "competencies.delete" => handle_competencies_delete(state, req),
        "criteria.list" => handle_criteria_list(state, req),
        "criteria.create" => handle_criteria_create(state, req),
        "criteria.update" => handle_criteria_update(state, req),
        "criteria.delete" => handle_criteria_delete(state, req),
        "evidences.list" => handle_evidences_list(state, req),
        "evidences.create" => handle_evidences_create(state, req),
        "evidences.update" => handle_evidences_update(state, req),
        "evidences.delete" => handle_evidences_delete(state, req),
        "structure.tree" => handle_structure_tree(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
