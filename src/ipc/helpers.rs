use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{self, Role};
use crate::ipc::error::{err, user_message};
use crate::ipc::types::AppState;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// A domain status code carrying its standard user-facing message.
    pub fn status(code: &'static str) -> Self {
        Self::new(code, user_message(code))
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

/// Non-empty trimmed form value; blank input is the classic form error.
pub fn form_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let value = required_str(params, key)?.trim().to_string();
    if value.is_empty() {
        return Err(HandlerErr::status("form_error").with_details(json!({ "field": key })));
    }
    Ok(value)
}

pub fn valid_date(raw: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| {
            HandlerErr::status("form_error").with_details(json!({ "date": raw }))
        })
}

/// Optional `date` param, defaulting to today's local date.
pub fn date_or_today(params: &serde_json::Value) -> Result<String, HandlerErr> {
    match params.get("date").and_then(|v| v.as_str()) {
        Some(raw) => valid_date(raw),
        None => Ok(chrono::Local::now().format("%Y-%m-%d").to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct Authed {
    pub user_id: String,
    pub role: Role,
}

/// Resolves the request's session token to an account and its role.
/// Fails closed: unknown token is `unauthorized`, an account matching
/// no role table is the distinguished `role_integrity` failure.
pub fn authed(state: &AppState, params: &serde_json::Value) -> Result<Authed, HandlerErr> {
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let token = required_str(params, "token")
        .map_err(|_| HandlerErr::status("unauthorized"))?;
    let user_id = state
        .sessions
        .get(&token)
        .cloned()
        .ok_or_else(|| HandlerErr::status("unauthorized"))?;
    let role = auth::classify_role(conn, &user_id)
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::status("role_integrity"))?;
    Ok(Authed { user_id, role })
}

/// The role gate composed in front of every protected operation: a
/// wrong or missing role rejects before any side effect.
pub fn require_role(
    state: &AppState,
    params: &serde_json::Value,
    role: Role,
) -> Result<Authed, HandlerErr> {
    let who = authed(state, params)?;
    if who.role != role {
        return Err(HandlerErr::status("unauthorized")
            .with_details(json!({ "required": role.as_str(), "actual": who.role.as_str() })));
    }
    Ok(who)
}

/// Gate for teacher operations; returns the teacher's assigned class,
/// if any.
pub fn require_teacher(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<Option<String>, HandlerErr> {
    let who = require_role(state, params, Role::Teacher)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let row: Option<Option<String>> = conn
        .query_row(
            "SELECT class_id FROM teachers WHERE user_id = ?",
            [&who.user_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    match row {
        Some(class_id) => Ok(class_id),
        None => Err(HandlerErr::status("role_integrity")),
    }
}

/// Gate for teacher operations that only make sense with an assigned
/// class.
pub fn require_teacher_class(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<String, HandlerErr> {
    require_teacher(state, params)?.ok_or_else(|| {
        HandlerErr::new("not_found", "teacher has no class assigned")
    })
}

pub fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

/// Ten digits, no more, no less.
pub fn validate_phone(phone: i64) -> Result<i64, HandlerErr> {
    if !(1_000_000_000..=9_999_999_999).contains(&phone) {
        return Err(HandlerErr::status("phone_invalid").with_details(json!({ "phone": phone })));
    }
    Ok(phone)
}

/// Stamps a zero marks row for every test of `class_id` that this
/// student does not already have one for. Used both when a test gains
/// a new student and when a student moves between classes.
pub fn backfill_zero_marks(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<usize, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT t.id FROM tests t
             JOIN subjects s ON s.id = t.subject_id
             WHERE s.class_id = ?",
        )
        .map_err(HandlerErr::db)?;
    let test_ids = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut created = 0usize;
    for test_id in test_ids {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM marks WHERE test_id = ? AND student_id = ?",
                (&test_id, student_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db)?;
        if exists.is_some() {
            continue;
        }
        conn.execute(
            "INSERT INTO marks(id, test_id, student_id, marks) VALUES(?, ?, ?, 0)",
            (uuid::Uuid::new_v4().to_string(), &test_id, student_id),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "marks" }))
        })?;
        created += 1;
    }
    Ok(created)
}
