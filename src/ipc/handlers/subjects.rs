use crate::ipc::error::ok;
use crate::ipc::helpers::{form_str, require_teacher, require_teacher_class, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn subjects_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assigned = require_teacher(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let Some(class_id) = assigned else {
        return Ok(json!({ "subjects": [] }));
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, name,
               (SELECT COUNT(*) FROM tests t WHERE t.subject_id = subjects.id) AS test_count
             FROM subjects
             WHERE class_id = ?
             ORDER BY name",
        )
        .map_err(HandlerErr::db)?;
    let subjects = stmt
        .query_map([&class_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "testCount": row.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "classId": class_id, "subjects": subjects }))
}

fn subjects_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_teacher_class(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let name = form_str(params, "name")?;
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, class_id, name) VALUES(?, ?, ?)",
        (&subject_id, &class_id, &name),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "subjects" }))
    })?;

    Ok(json!({ "subjectId": subject_id, "name": name }))
}

fn delete_subject_rows(conn: &Connection, subject_id: &str) -> Result<(), HandlerErr> {
    let del = |sql: &str, table: &str| -> Result<(), HandlerErr> {
        conn.execute(sql, [subject_id]).map(|_| ()).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table }))
        })
    };
    del(
        "DELETE FROM marks WHERE test_id IN (SELECT id FROM tests WHERE subject_id = ?)",
        "marks",
    )?;
    del("DELETE FROM tests WHERE subject_id = ?", "tests")?;
    del("DELETE FROM subjects WHERE id = ?", "subjects")?;
    Ok(())
}

fn subjects_bulk_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_teacher_class(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let Some(rows) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing rows"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut updated = 0usize;
    let mut deleted = 0usize;
    for (idx, row) in rows.iter().enumerate() {
        let subject_id = row
            .get("subjectId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerErr::new("bad_params", "row missing subjectId")
                    .with_details(json!({ "row": idx }))
            })?;

        // Subjects are edited only within the teacher's own class.
        let owned: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM subjects WHERE id = ? AND class_id = ?",
                (subject_id, &class_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db)?;
        if owned.is_none() {
            return Err(HandlerErr::new("not_found", "subject not found")
                .with_details(json!({ "subjectId": subject_id })));
        }

        if row.get("delete").and_then(|v| v.as_bool()).unwrap_or(false) {
            delete_subject_rows(&tx, subject_id)?;
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
            tx.execute(
                "UPDATE subjects SET name = ? WHERE id = ?",
                (name, subject_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
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
        "subjects.list" => Some(handle(state, req, subjects_list)),
        "subjects.create" => Some(handle(state, req, subjects_create)),
        "subjects.bulkUpdate" => Some(handle(state, req, subjects_bulk_update)),
        _ => None,
    }
}
