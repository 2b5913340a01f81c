use crate::auth::{self, Role};
use crate::ipc::error::ok;
use crate::ipc::helpers::{class_exists, form_str, require_role, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn class_has_other_teacher(
    conn: &Connection,
    class_id: &str,
    excluding_teacher: Option<&str>,
) -> Result<bool, HandlerErr> {
    let holder: Option<String> = conn
        .query_row(
            "SELECT id FROM teachers WHERE class_id = ?",
            [class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    Ok(match holder {
        Some(id) => excluding_teacher != Some(id.as_str()),
        None => false,
    })
}

fn teachers_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.name, u.username, c.id, c.grade, c.division
             FROM teachers t
             JOIN users u ON u.id = t.user_id
             LEFT JOIN classes c ON c.id = t.class_id
             ORDER BY t.name",
        )
        .map_err(HandlerErr::db)?;
    let teachers = stmt
        .query_map([], |row| {
            let class = match row.get::<_, Option<String>>(3)? {
                Some(class_id) => json!({
                    "id": class_id,
                    "grade": row.get::<_, i64>(4)?,
                    "division": row.get::<_, String>(5)?,
                }),
                None => serde_json::Value::Null,
            };
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "username": row.get::<_, String>(2)?,
                "class": class,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let username = form_str(params, "username")?;
    let password = form_str(params, "password")?;
    let full_name = form_str(params, "fullName")?;
    let class_id = params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(cid) = &class_id {
        if !class_exists(conn, cid)? {
            return Err(HandlerErr::new("not_found", "class not found"));
        }
        // At most one teacher per class.
        if class_has_other_teacher(conn, cid, None)? {
            return Err(HandlerErr::status("class_assigned").with_details(json!({ "classId": cid })));
        }
    }

    if auth::username_taken(conn, &username).map_err(HandlerErr::db)? {
        return Err(HandlerErr::status("user_exists"));
    }

    // Account and role record stand or fall together.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let user_id = auth::insert_user(&tx, &username, &password)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    let teacher_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO teachers(id, user_id, class_id, name) VALUES(?, ?, ?, ?)",
        (&teacher_id, &user_id, &class_id, &full_name),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "teachers" }))
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "teacherId": teacher_id, "userId": user_id }))
}

fn delete_teacher_row(conn: &Connection, teacher_id: &str) -> Result<(), HandlerErr> {
    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM teachers WHERE id = ?",
            [teacher_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::new("not_found", "teacher not found")
            .with_details(json!({ "teacherId": teacher_id })));
    };
    conn.execute("DELETE FROM teachers WHERE id = ?", [teacher_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "teachers" }))
        })?;
    conn.execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "users" }))
        })?;
    Ok(())
}

fn teachers_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let teacher_id =
        required_str(params, "teacherId").map_err(|_| HandlerErr::status("form_error"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    delete_teacher_row(&tx, &teacher_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn teachers_bulk_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let Some(rows) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing rows"));
    };

    // Whole batch or nothing; the first bad row aborts the transaction.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut updated = 0usize;
    let mut deleted = 0usize;
    for (idx, row) in rows.iter().enumerate() {
        let teacher_id = row
            .get("teacherId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerErr::new("bad_params", "row missing teacherId")
                    .with_details(json!({ "row": idx }))
            })?;

        if row.get("delete").and_then(|v| v.as_bool()).unwrap_or(false) {
            delete_teacher_row(&tx, teacher_id)?;
            deleted += 1;
            continue;
        }

        if let Some(name) = row.get("name").and_then(|v| v.as_str()) {
            let name = name.trim();
            if name.is_empty() {
                return Err(
                    HandlerErr::status("form_error").with_details(json!({ "row": idx }))
                );
            }
            let changed = tx
                .execute("UPDATE teachers SET name = ? WHERE id = ?", (name, teacher_id))
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            if changed == 0 {
                return Err(HandlerErr::new("not_found", "teacher not found")
                    .with_details(json!({ "teacherId": teacher_id })));
            }
        }

        if let Some(new_password) = row.get("newPassword").and_then(|v| v.as_str()) {
            if !new_password.is_empty() {
                let user_id: Option<String> = tx
                    .query_row(
                        "SELECT user_id FROM teachers WHERE id = ?",
                        [teacher_id],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(HandlerErr::db)?;
                let Some(user_id) = user_id else {
                    return Err(HandlerErr::new("not_found", "teacher not found")
                        .with_details(json!({ "teacherId": teacher_id })));
                };
                auth::set_password(&tx, &user_id, new_password).map_err(HandlerErr::db)?;
            }
        }
        updated += 1;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "updated": updated, "deleted": deleted }))
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
        "teachers.list" => Some(handle(state, req, teachers_list)),
        "teachers.create" => Some(handle(state, req, teachers_create)),
        "teachers.delete" => Some(handle(state, req, teachers_delete)),
        "teachers.bulkUpdate" => Some(handle(state, req, teachers_bulk_update)),
        _ => None,
    }
}
