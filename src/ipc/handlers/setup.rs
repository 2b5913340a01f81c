use crate::auth::{self, Role};
use crate::ipc::error::ok;
use crate::ipc::helpers::{form_str, require_role, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn create_account_with_role(
    conn: &Connection,
    table: &str,
    username: &str,
    password: &str,
) -> Result<(String, String), HandlerErr> {
    if auth::username_taken(conn, username).map_err(HandlerErr::db)? {
        return Err(HandlerErr::status("user_exists"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let user_id = auth::insert_user(&tx, username, password)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    let role_id = Uuid::new_v4().to_string();
    tx.execute(
        &format!("INSERT INTO {}(id, user_id) VALUES(?, ?)", table),
        (&role_id, &user_id),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": table }))
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok((user_id, role_id))
}

fn seed_admin(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let username = form_str(params, "username")?;
    let password = form_str(params, "password")?;

    // Open only on a fresh workspace; afterwards the admin makes accounts.
    let existing: i64 = conn
        .query_row("SELECT COUNT(*) FROM admins", [], |r| r.get(0))
        .map_err(HandlerErr::db)?;
    if existing > 0 {
        return Err(HandlerErr::new(
            "admin_exists",
            "an admin account already exists",
        ));
    }

    let (user_id, admin_id) = create_account_with_role(conn, "admins", &username, &password)?;
    Ok(json!({ "adminId": admin_id, "userId": user_id }))
}

fn seed_principal(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let username = form_str(params, "username")?;
    let password = form_str(params, "password")?;
    let (user_id, principal_id) =
        create_account_with_role(conn, "principals", &username, &password)?;
    Ok(json!({ "principalId": principal_id, "userId": user_id }))
}

fn handle_seed_admin(state: &mut AppState, req: &Request) -> serde_json::Value {
    match seed_admin(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_seed_principal(state: &mut AppState, req: &Request) -> serde_json::Value {
    match seed_principal(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.seedAdmin" => Some(handle_seed_admin(state, req)),
        "setup.seedPrincipal" => Some(handle_seed_principal(state, req)),
        _ => None,
    }
}
