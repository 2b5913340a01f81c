use crate::auth::Role;
use crate::ipc::error::ok;
use crate::ipc::helpers::{date_or_today, form_str, require_role, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use serde_json::json;

fn sms_configure(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let config = notify::SmsConfig {
        base_url: form_str(params, "baseUrl")?,
        username: form_str(params, "username")?,
        password: form_str(params, "password")?,
        sender_id: form_str(params, "senderId")?,
        route: form_str(params, "route")?,
    };
    notify::store_config(conn, &config)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

/// Scan only: the day's absentees and the messages that would go out.
fn notify_preview(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let date = date_or_today(params)?;

    let absentees = notify::absentees_on(conn, &date).map_err(HandlerErr::db)?;
    let rows: Vec<serde_json::Value> = absentees
        .iter()
        .map(|a| {
            json!({
                "studentId": a.student_id,
                "rollNo": a.roll_no,
                "name": a.name,
                "phone": a.phone,
                "message": notify::absence_message(&a.username, &date),
            })
        })
        .collect();
    Ok(json!({ "date": date, "absentees": rows }))
}

fn notify_absentees(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let date = date_or_today(params)?;

    let config = notify::load_config(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::status("sms_not_configured"))?;

    let outcome = notify::send_absentee_alerts(conn, &config, &date).map_err(HandlerErr::db)?;
    let result = serde_json::to_value(&outcome)
        .map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    Ok(json!({ "date": date, "outcome": result }))
}

fn handle(
    state: &mut AppState,
    req: &Request,
    f: fn(&AppState, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    match f(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sms.configure" => Some(handle(state, req, sms_configure)),
        "notify.preview" => Some(handle(state, req, notify_preview)),
        "notify.absentees" => Some(handle(state, req, notify_absentees)),
        _ => None,
    }
}
