use crate::auth::Role;
use crate::ipc::error::ok;
use crate::ipc::helpers::{authed, require_role, required_i64, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn classes_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    authed(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    // Include basic counts so clients can show a useful dashboard.
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.grade,
               c.division,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
               (SELECT COUNT(*) FROM subjects sub WHERE sub.class_id = c.id) AS subject_count,
               (SELECT t.name FROM teachers t WHERE t.class_id = c.id) AS teacher_name
             FROM classes c
             ORDER BY c.grade, c.division",
        )
        .map_err(HandlerErr::db)?;
    let classes = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "grade": row.get::<_, i64>(1)?,
                "division": row.get::<_, String>(2)?,
                "studentCount": row.get::<_, i64>(3)?,
                "subjectCount": row.get::<_, i64>(4)?,
                "teacherName": row.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "classes": classes }))
}

fn classes_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let grade = required_i64(params, "grade")
        .map_err(|_| HandlerErr::status("form_error").with_details(json!({ "field": "grade" })))?;
    let division = required_str(params, "division")
        .map(|s| s.trim().to_string())
        .map_err(|_| HandlerErr::status("form_error").with_details(json!({ "field": "division" })))?;
    if division.chars().count() != 1 {
        return Err(
            HandlerErr::status("form_error").with_details(json!({ "division": division }))
        );
    }

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, grade, division) VALUES(?, ?, ?)",
        (&class_id, grade, &division),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "classes" }))
    })?;

    Ok(json!({ "classId": class_id, "grade": grade, "division": division }))
}

fn classes_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, params, Role::Admin)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let class_id =
        required_str(params, "classId").map_err(|_| HandlerErr::status("selection_missing"))?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let del = |sql: &str, table: &str| -> Result<(), HandlerErr> {
        tx.execute(sql, [&class_id]).map(|_| ()).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table }))
        })
    };

    // Accounts are referenced by the role rows, so collect them before
    // the role rows go.
    let mut account_ids: Vec<String> = {
        let mut stmt = tx
            .prepare("SELECT user_id FROM students WHERE class_id = ?")
            .map_err(HandlerErr::db)?;
        stmt.query_map([&class_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?
    };
    let teacher_user: Option<String> = tx
        .query_row(
            "SELECT user_id FROM teachers WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    account_ids.extend(teacher_user);

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    del(
        "DELETE FROM marks
         WHERE test_id IN (
           SELECT t.id FROM tests t
           JOIN subjects s ON s.id = t.subject_id
           WHERE s.class_id = ?
         )",
        "marks",
    )?;
    del(
        "DELETE FROM tests
         WHERE subject_id IN (SELECT id FROM subjects WHERE class_id = ?)",
        "tests",
    )?;
    del("DELETE FROM subjects WHERE class_id = ?", "subjects")?;
    del(
        "DELETE FROM attendance
         WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        "attendance",
    )?;
    del("DELETE FROM students WHERE class_id = ?", "students")?;
    del("DELETE FROM teachers WHERE class_id = ?", "teachers")?;
    for user_id in &account_ids {
        tx.execute("DELETE FROM users WHERE id = ?", [user_id])
            .map_err(|e| {
                HandlerErr::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": "users" }))
            })?;
    }
    del("DELETE FROM classes WHERE id = ?", "classes")?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
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
        "classes.list" => Some(handle(state, req, classes_list)),
        "classes.create" => Some(handle(state, req, classes_create)),
        "classes.delete" => Some(handle(state, req, classes_delete)),
        _ => None,
    }
}
