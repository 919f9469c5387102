use crate::calc::CalcError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::AppState;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::{json, Map, Value};

pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn insert(table: &str, e: rusqlite::Error) -> Self {
        Self::new("db_insert_failed", e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn update(table: &str, e: rusqlite::Error) -> Self {
        Self::new("db_update_failed", e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn delete(table: &str, e: rusqlite::Error) -> Self {
        Self::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn response(self, id: &str) -> Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub type HandlerResult = Result<Value, HandlerErr>;

pub fn reply(id: &str, result: HandlerResult) -> Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn required_name(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = required_str(params, key)?.trim().to_string();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn optional_text(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) => nullable_text(v, key),
    }
}

/// Strings are trimmed; blank and null both clear the field.
pub fn nullable_text(v: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    if v.is_null() {
        return Ok(None);
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr::bad_params(format!("{} must be a string or null", key)));
    };
    let t = s.trim();
    if t.is_empty() {
        Ok(None)
    } else {
        Ok(Some(t.to_string()))
    }
}

pub fn nullable_date(v: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    let Some(s) = nullable_text(v, key)? else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map(|d| Some(d.format("%Y-%m-%d").to_string()))
        .map_err(|_| {
            HandlerErr::bad_params(format!("{} must be a YYYY-MM-DD date", key))
                .with_details(json!({ key: s }))
        })
}

pub fn optional_date(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) => nullable_date(v, key),
    }
}

pub fn patch_object(params: &Value) -> Result<&Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing/invalid patch"))
}

pub fn string_array(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", key)))
        })
        .collect()
}

/// Runs an existence probe such as `SELECT 1 FROM t WHERE id = ?`.
pub fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::query)
}

pub fn require_row(conn: &Connection, sql: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, sql, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(what).with_details(json!({ "id": id })))
    }
}

pub fn next_sort_order(conn: &Connection, table: &str, parent_col: &str, parent_id: &str) -> Result<i64, HandlerErr> {
    let sql = format!(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM {} WHERE {} = ?",
        table, parent_col
    );
    conn.query_row(&sql, [parent_id], |r| r.get(0))
        .map_err(HandlerErr::query)
}

pub fn is_enrolled(conn: &Connection, subject_id: &str, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM enrollments WHERE subject_id = ? AND student_id = ?",
        (subject_id, student_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

pub fn begin(conn: &Connection) -> Result<Transaction<'_>, HandlerErr> {
    conn.unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))
}

pub fn commit(tx: Transaction<'_>) -> Result<(), HandlerErr> {
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))
}

/// Executes the given statements in order, binding `id` to each. Entries name
/// the table they touch so failures report where they stopped. Dropping the
/// transaction on error rolls everything back.
pub fn run_steps(tx: &Transaction<'_>, id: &str, steps: &[(&str, &str)]) -> Result<(), HandlerErr> {
    for (table, sql) in steps {
        tx.execute(sql, [id])
            .map_err(|e| HandlerErr::delete(table, e))?;
    }
    Ok(())
}

pub fn delete_cascade(conn: &Connection, id: &str, steps: &[(&str, &str)]) -> Result<(), HandlerErr> {
    let tx = begin(conn)?;
    run_steps(&tx, id, steps)?;
    commit(tx)
}
