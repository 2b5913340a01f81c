use std::collections::HashMap;

use crate::ipc::error::ok;
use crate::ipc::helpers::{date_or_today, require_teacher_class, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::report;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct RosterStudent {
    id: String,
    roll_no: i64,
    name: String,
}

fn class_roster(conn: &Connection, class_id: &str) -> Result<Vec<RosterStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, roll_no, name FROM students
             WHERE class_id = ?
             ORDER BY roll_no",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map([class_id], |r| {
        Ok(RosterStudent {
            id: r.get(0)?,
            roll_no: r.get(1)?,
            name: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

/// Attendance rows already written for the class on the given day,
/// keyed by student id.
fn day_rows(
    conn: &Connection,
    class_id: &str,
    date: &str,
) -> Result<HashMap<String, bool>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT a.student_id, a.is_present
             FROM attendance a
             JOIN students s ON s.id = a.student_id
             WHERE s.class_id = ? AND a.date = ?",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map((class_id, date), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0))
    })
    .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
    .map_err(HandlerErr::db)
}

fn parse_presence(params: &serde_json::Value) -> Result<HashMap<String, bool>, HandlerErr> {
    let Some(rows) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing rows"));
    };
    let mut presence = HashMap::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let student_id = row
            .get("studentId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerErr::new("bad_params", "row missing studentId")
                    .with_details(json!({ "row": idx }))
            })?;
        let present = row.get("present").and_then(|v| v.as_bool()).unwrap_or(false);
        presence.insert(student_id.to_string(), present);
    }
    Ok(presence)
}

fn summary_json(present: i64, absent: i64) -> serde_json::Value {
    let total = present + absent;
    json!({
        "present": present,
        "absent": absent,
        "total": total,
        "percentage": report::format_percentage(present, total),
    })
}

/// Opens the day for a class: either the untaken roster to mark, or
/// the taken day's rows plus its summary.
fn attendance_day_open(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_teacher_class(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let date = date_or_today(params)?;

    let roster = class_roster(conn, &class_id)?;
    let taken = day_rows(conn, &class_id, &date)?;

    if taken.is_empty() {
        let students: Vec<serde_json::Value> = roster
            .iter()
            .map(|s| json!({ "studentId": s.id, "rollNo": s.roll_no, "name": s.name }))
            .collect();
        return Ok(json!({
            "date": date,
            "status": "not_taken",
            "students": students,
        }));
    }

    let mut present = 0i64;
    let mut absent = 0i64;
    let rows: Vec<serde_json::Value> = roster
        .iter()
        .filter_map(|s| {
            taken.get(&s.id).map(|is_present| {
                if *is_present {
                    present += 1;
                } else {
                    absent += 1;
                }
                json!({
                    "studentId": s.id,
                    "rollNo": s.roll_no,
                    "name": s.name,
                    "isPresent": is_present,
                })
            })
        })
        .collect();

    Ok(json!({
        "date": date,
        "status": "taken",
        "summary": summary_json(present, absent),
        "rows": rows,
    }))
}

/// NotTaken -> Taken: writes one row per enrolled student. Students
/// missing from the submission are recorded absent, mirroring an
/// unticked checkbox.
fn attendance_capture(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_teacher_class(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let date = date_or_today(params)?;
    let presence = parse_presence(params)?;

    let roster = class_roster(conn, &class_id)?;
    let roster_ids: HashMap<&str, ()> = roster.iter().map(|s| (s.id.as_str(), ())).collect();
    for student_id in presence.keys() {
        if !roster_ids.contains_key(student_id.as_str()) {
            return Err(HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "studentId": student_id })));
        }
    }

    // One capture per day; edits go through attendance.edit.
    if !day_rows(conn, &class_id, &date)?.is_empty() {
        return Err(HandlerErr::status("already_taken").with_details(json!({ "date": date })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut present = 0i64;
    let mut absent = 0i64;
    for student in &roster {
        let is_present = presence.get(&student.id).copied().unwrap_or(false);
        if is_present {
            present += 1;
        } else {
            absent += 1;
        }
        tx.execute(
            "INSERT INTO attendance(id, student_id, date, is_present) VALUES(?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &student.id,
                &date,
                is_present as i64,
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "attendance" }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "date": date,
        "recorded": roster.len(),
        "summary": summary_json(present, absent),
    }))
}

/// Overwrites is_present on the day's existing rows; never inserts.
fn attendance_edit(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_teacher_class(state, params)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let date = date_or_today(params)?;
    let presence = parse_presence(params)?;

    let existing = day_rows(conn, &class_id, &date)?;
    if existing.is_empty() {
        return Err(HandlerErr::new("not_found", "attendance not taken for this date")
            .with_details(json!({ "date": date })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut present = 0i64;
    let mut absent = 0i64;
    for student_id in existing.keys() {
        let is_present = presence.get(student_id).copied().unwrap_or(false);
        if is_present {
            present += 1;
        } else {
            absent += 1;
        }
        tx.execute(
            "UPDATE attendance SET is_present = ? WHERE student_id = ? AND date = ?",
            (is_present as i64, student_id, &date),
        )
        .map_err(|e| {
            HandlerErr::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "attendance" }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "date": date,
        "updated": existing.len(),
        "summary": summary_json(present, absent),
    }))
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
        "attendance.dayOpen" => Some(handle(state, req, attendance_day_open)),
        "attendance.capture" => Some(handle(state, req, attendance_capture)),
        "attendance.edit" => Some(handle(state, req, attendance_edit)),
        _ => None,
    }
}
