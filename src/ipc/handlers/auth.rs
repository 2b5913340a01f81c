use crate::auth;
use crate::ipc::error::{err, ok, user_message};
use crate::ipc::helpers::{authed, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let username = match req.params.get("username").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "form_error", user_message("form_error"), None),
    };
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => return err(&req.id, "form_error", user_message("form_error"), None),
    };

    let user_id = match auth::verify_login(conn, &username, &password) {
        Ok(Some(id)) => id,
        Ok(None) => return err(&req.id, "login_failed", user_message("login_failed"), None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Classify before minting a token; an account with no role row is
    // an inconsistent state, not a login.
    let role = match auth::classify_role(conn, &user_id) {
        Ok(Some(role)) => role,
        Ok(None) => {
            return err(
                &req.id,
                "role_integrity",
                user_message("role_integrity"),
                Some(json!({ "username": username })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let token = Uuid::new_v4().to_string();
    state.sessions.insert(token.clone(), user_id);
    ok(&req.id, json!({ "token": token, "role": role.as_str() }))
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(token) = req.params.get("token").and_then(|v| v.as_str()) {
        state.sessions.remove(token);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn change_password(state: &AppState, params: &serde_json::Value) -> Result<(), HandlerErr> {
    let who = authed(state, params)?;
    let new_password = params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if new_password.is_empty() {
        return Err(HandlerErr::status("form_error"));
    }
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    auth::set_password(conn, &who.user_id, new_password).map_err(HandlerErr::db)
}

fn handle_change_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    match change_password(state, &req.params) {
        Ok(()) => ok(&req.id, json!({ "status": "pswdchg" })),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        "auth.changePassword" => Some(handle_change_password(state, req)),
        _ => None,
    }
}
