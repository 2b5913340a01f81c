use std::collections::{HashMap, HashSet};

use crate::auth;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    backfill_zero_marks, class_exists, form_str, require_teacher, require_teacher_class,
    required_i64, required_str, validate_phone, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn students_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assigned = require_teacher(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let Some(class_id) = assigned else {
        return Ok(json!({ "students": [] }));
    };

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.roll_no, s.name, s.phone, u.username
             FROM students s
             JOIN users u ON u.id = s.user_id
             WHERE s.class_id = ?
             ORDER BY s.roll_no",
        )
        .map_err(HandlerErr::db)?;
    let students = stmt
        .query_map([&class_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "rollNo": row.get::<_, i64>(1)?,
                "name": row.get::<_, String>(2)?,
                "phone": row.get::<_, i64>(3)?,
                "username": row.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "classId": class_id, "students": students }))
}

fn roll_taken(
    conn: &Connection,
    class_id: &str,
    roll_no: i64,
    excluding_student: Option<&str>,
) -> Result<bool, HandlerErr> {
    let holder: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE class_id = ? AND roll_no = ?",
            (class_id, roll_no),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    Ok(match holder {
        Some(id) => excluding_student != Some(id.as_str()),
        None => false,
    })
}

fn students_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_teacher_class(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let username = form_str(params, "username")?;
    let password = form_str(params, "password")?;
    let full_name = form_str(params, "fullName")?;
    let phone = required_i64(params, "phone")
        .map_err(|_| HandlerErr::status("form_error").with_details(json!({ "field": "phone" })))
        .and_then(validate_phone)?;
    let roll_no = required_i64(params, "rollNo")
        .map_err(|_| HandlerErr::status("form_error").with_details(json!({ "field": "rollNo" })))?;

    // Roll numbers are scoped to the class, not the school.
    if roll_taken(conn, &class_id, roll_no, None)? {
        return Err(HandlerErr::status("roll_conflict").with_details(json!({ "rollNo": roll_no })));
    }
    if auth::username_taken(conn, &username).map_err(HandlerErr::db)? {
        return Err(HandlerErr::status("user_exists"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let user_id = auth::insert_user(&tx, &username, &password)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    let student_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO students(id, user_id, class_id, phone, roll_no, name)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&student_id, &user_id, &class_id, phone, roll_no, &full_name),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;
    // Keep the one-marks-row-per-test invariant for the newcomer.
    let stamped = backfill_zero_marks(&tx, &class_id, &student_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "studentId": student_id, "userId": user_id, "marksStamped": stamped }))
}

fn delete_student_rows(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id })));
    };

    let del = |sql: &str, key: &str, table: &str| -> Result<(), HandlerErr> {
        conn.execute(sql, [key]).map(|_| ()).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table }))
        })
    };
    del("DELETE FROM marks WHERE student_id = ?", student_id, "marks")?;
    del(
        "DELETE FROM attendance WHERE student_id = ?",
        student_id,
        "attendance",
    )?;
    del("DELETE FROM students WHERE id = ?", student_id, "students")?;
    del("DELETE FROM users WHERE id = ?", &user_id, "users")?;
    Ok(())
}

fn students_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_teacher_class(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let student_id =
        required_str(params, "studentId").map_err(|_| HandlerErr::status("form_error"))?;

    // Teachers only manage their own roster.
    let in_class: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if in_class.is_none() {
        return Err(HandlerErr::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    delete_student_rows(&tx, &student_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

struct RosterRow {
    student_id: String,
    delete: bool,
    full_name: Option<String>,
    phone: Option<i64>,
    roll_no: Option<i64>,
    class_id: Option<String>,
    new_password: Option<String>,
}

fn parse_roster_row(idx: usize, row: &serde_json::Value) -> Result<RosterRow, HandlerErr> {
    let student_id = row
        .get("studentId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            HandlerErr::new("bad_params", "row missing studentId")
                .with_details(json!({ "row": idx }))
        })?
        .to_string();
    let full_name = match row.get("fullName").and_then(|v| v.as_str()) {
        Some(name) if name.trim().is_empty() => {
            return Err(HandlerErr::status("form_error").with_details(json!({ "row": idx })))
        }
        Some(name) => Some(name.trim().to_string()),
        None => None,
    };
    Ok(RosterRow {
        student_id,
        delete: row.get("delete").and_then(|v| v.as_bool()).unwrap_or(false),
        full_name,
        phone: row.get("phone").and_then(|v| v.as_i64()),
        roll_no: row.get("rollNo").and_then(|v| v.as_i64()),
        class_id: row
            .get("classId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        new_password: row
            .get("newPassword")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
    })
}

/// Structured replacement for the old per-field form submission: every
/// row names its student, the whole batch is validated up front, and
/// the writes land in one transaction.
fn students_bulk_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_teacher_class(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let Some(raw_rows) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing rows"));
    };
    let mut rows = Vec::with_capacity(raw_rows.len());
    for (idx, raw) in raw_rows.iter().enumerate() {
        rows.push(parse_roster_row(idx, raw)?);
    }

    // Current roster of the teacher's class.
    let mut roster: HashMap<String, (i64, String)> = {
        let mut stmt = conn
            .prepare("SELECT id, roll_no, class_id FROM students WHERE class_id = ?")
            .map_err(HandlerErr::db)?;
        stmt.query_map([&class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                (r.get::<_, i64>(1)?, r.get::<_, String>(2)?),
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(HandlerErr::db)?
    };

    // Validate the whole batch before the first write.
    for row in &rows {
        if !roster.contains_key(&row.student_id) {
            return Err(HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "studentId": row.student_id })));
        }
        if row.delete {
            continue;
        }
        if let Some(phone) = row.phone {
            validate_phone(phone)?;
        }
        if let Some(dest) = &row.class_id {
            if !class_exists(conn, dest)? {
                return Err(HandlerErr::new("not_found", "class not found")
                    .with_details(json!({ "classId": dest })));
            }
        }
    }

    // Apply the patches in memory and check the roll invariant per
    // destination class.
    for row in &rows {
        if row.delete {
            roster.remove(&row.student_id);
            continue;
        }
        let entry = roster
            .get_mut(&row.student_id)
            .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
        if let Some(roll) = row.roll_no {
            entry.0 = roll;
        }
        if let Some(dest) = &row.class_id {
            entry.1 = dest.clone();
        }
    }
    let mut seen: HashSet<(String, i64)> = HashSet::new();
    for (student_id, (roll, dest_class)) in &roster {
        if !seen.insert((dest_class.clone(), *roll)) {
            return Err(HandlerErr::status("roll_conflict")
                .with_details(json!({ "rollNo": roll, "studentId": student_id })));
        }
        // A move must not collide with rolls already used there.
        if dest_class != &class_id
            && roll_taken(conn, dest_class, *roll, Some(student_id.as_str()))?
        {
            return Err(HandlerErr::status("roll_conflict")
                .with_details(json!({ "rollNo": roll, "classId": dest_class })));
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut updated = 0usize;
    let mut deleted = 0usize;
    let mut backfilled = 0usize;
    for row in &rows {
        if row.delete {
            delete_student_rows(&tx, &row.student_id)?;
            deleted += 1;
            continue;
        }

        if let Some(name) = &row.full_name {
            tx.execute(
                "UPDATE students SET name = ? WHERE id = ?",
                (name, &row.student_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        if let Some(phone) = row.phone {
            tx.execute(
                "UPDATE students SET phone = ? WHERE id = ?",
                (phone, &row.student_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        if let Some(roll) = row.roll_no {
            tx.execute(
                "UPDATE students SET roll_no = ? WHERE id = ?",
                (roll, &row.student_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        if let Some(dest) = &row.class_id {
            if dest != &class_id {
                tx.execute(
                    "UPDATE students SET class_id = ? WHERE id = ?",
                    (dest, &row.student_id),
                )
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
                // The mover needs a marks row for every test already
                // defined in the destination class.
                backfilled += backfill_zero_marks(&tx, dest, &row.student_id)?;
            }
        }
        if let Some(new_password) = &row.new_password {
            let user_id: String = tx
                .query_row(
                    "SELECT user_id FROM students WHERE id = ?",
                    [&row.student_id],
                    |r| r.get(0),
                )
                .map_err(HandlerErr::db)?;
            auth::set_password(&tx, &user_id, new_password).map_err(HandlerErr::db)?;
        }
        updated += 1;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "updated": updated, "deleted": deleted, "marksBackfilled": backfilled }))
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
        "students.list" => Some(handle(state, req, students_list)),
        "students.create" => Some(handle(state, req, students_create)),
        "students.delete" => Some(handle(state, req, students_delete)),
        "students.bulkUpdate" => Some(handle(state, req, students_bulk_update)),
        _ => None,
    }
}
