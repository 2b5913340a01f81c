use crate::auth::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    require_role, require_teacher_class, required_str, valid_date, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::report;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn report_err(req: &Request, e: report::ReportError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn handler_err(req: &Request, e: HandlerErr) -> serde_json::Value {
    e.response(&req.id)
}

fn student_in_class(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
    req: &Request,
) -> Result<(String, i64), serde_json::Value> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT name, roll_no FROM students WHERE id = ? AND class_id = ?",
            (student_id, class_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    row.ok_or_else(|| {
        err(
            &req.id,
            "not_found",
            "student not found",
            Some(json!({ "studentId": student_id })),
        )
    })
}

/// Whole-history or bounded-range attendance aggregate for one student
/// of the teacher's class.
fn handle_attendance(state: &AppState, req: &Request) -> Result<serde_json::Value, serde_json::Value> {
    let class_id =
        require_teacher_class(state, &req.params).map_err(|e| handler_err(req, e))?;
    let conn = db_conn(state, req)?;
    let student_id = required_str(&req.params, "studentId").map_err(|e| handler_err(req, e))?;
    let (name, roll_no) = student_in_class(conn, &student_id, &class_id, req)?;

    let from = req.params.get("from").and_then(|v| v.as_str());
    let to = req.params.get("to").and_then(|v| v.as_str());
    let summary = match (from, to) {
        (None, None) => report::attendance_summary(conn, &student_id),
        (Some(from), Some(to)) => {
            let from = valid_date(from).map_err(|e| handler_err(req, e))?;
            let to = valid_date(to).map_err(|e| handler_err(req, e))?;
            report::attendance_summary_range(conn, &student_id, &from, &to)
        }
        _ => {
            return Err(err(
                &req.id,
                "bad_params",
                "from and to must be given together",
                None,
            ))
        }
    }
    .map_err(|e| report_err(req, e))?;

    Ok(json!({
        "studentId": student_id,
        "name": name,
        "rollNo": roll_no,
        "attendance": summary,
    }))
}

/// Marks for one student in one subject, test by test.
fn handle_student_subject(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, serde_json::Value> {
    let class_id =
        require_teacher_class(state, &req.params).map_err(|e| handler_err(req, e))?;
    let conn = db_conn(state, req)?;
    let student_id = required_str(&req.params, "studentId").map_err(|e| handler_err(req, e))?;
    let subject_id = required_str(&req.params, "subjectId").map_err(|e| handler_err(req, e))?;
    student_in_class(conn, &student_id, &class_id, req)?;

    let owned: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM subjects WHERE id = ? AND class_id = ?",
            (&subject_id, &class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if owned.is_none() {
        return Err(err(&req.id, "not_found", "subject not found", None));
    }

    let rows = report::subject_mark_report(conn, &student_id, &subject_id)
        .map_err(|e| report_err(req, e))?;
    Ok(json!({ "studentId": student_id, "rows": rows }))
}

fn overview_json(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
    name: &str,
    roll_no: i64,
) -> Result<serde_json::Value, report::ReportError> {
    let attendance = report::attendance_summary(conn, student_id)?;
    let groups = report::exam_group_report(conn, student_id, class_id)?;
    let subjects: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT name FROM subjects WHERE class_id = ? ORDER BY name")
            .map_err(|e| report::ReportError::new("db_query_failed", e.to_string()))?;
        stmt.query_map([class_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| report::ReportError::new("db_query_failed", e.to_string()))?
    };
    Ok(json!({
        "studentId": student_id,
        "name": name,
        "rollNo": roll_no,
        "attendance": attendance,
        "examGroups": groups,
        "subjects": subjects,
    }))
}

/// Full per-student view: attendance aggregate plus marks grouped by
/// logical exam.
fn handle_student(state: &AppState, req: &Request) -> Result<serde_json::Value, serde_json::Value> {
    let class_id =
        require_teacher_class(state, &req.params).map_err(|e| handler_err(req, e))?;
    let conn = db_conn(state, req)?;
    let student_id = required_str(&req.params, "studentId").map_err(|e| handler_err(req, e))?;
    let (name, roll_no) = student_in_class(conn, &student_id, &class_id, req)?;
    overview_json(conn, &student_id, &class_id, &name, roll_no).map_err(|e| report_err(req, e))
}

/// The same view for the logged-in student's own record.
fn handle_my_overview(state: &AppState, req: &Request) -> Result<serde_json::Value, serde_json::Value> {
    let who = require_role(state, &req.params, Role::Student).map_err(|e| handler_err(req, e))?;
    let conn = db_conn(state, req)?;
    let row: Option<(String, String, String, i64)> = conn
        .query_row(
            "SELECT id, class_id, name, roll_no FROM students WHERE user_id = ?",
            [&who.user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some((student_id, class_id, name, roll_no)) = row else {
        return Err(err(
            &req.id,
            "role_integrity",
            "student record missing for this account",
            None,
        ));
    };
    overview_json(conn, &student_id, &class_id, &name, roll_no).map_err(|e| report_err(req, e))
}

fn handle_class_subject(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, serde_json::Value> {
    let class_id =
        require_teacher_class(state, &req.params).map_err(|e| handler_err(req, e))?;
    let conn = db_conn(state, req)?;
    let subject_id = required_str(&req.params, "subjectId")
        .map_err(|_| HandlerErr::status("selection_missing"))
        .map_err(|e| handler_err(req, e))?;

    let owned: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM subjects WHERE id = ? AND class_id = ?",
            (&subject_id, &class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if owned.is_none() {
        return Err(err(&req.id, "not_found", "subject not found", None));
    }

    let table = report::class_subject_report(conn, &subject_id).map_err(|e| report_err(req, e))?;
    Ok(serde_json::to_value(table)
        .map_err(|e| err(&req.id, "internal", e.to_string(), None))?)
}

/// The principal's whole-class view: roster attendance plus one
/// marks table per subject.
fn handle_school(state: &AppState, req: &Request) -> Result<serde_json::Value, serde_json::Value> {
    require_role(state, &req.params, Role::Principal).map_err(|e| handler_err(req, e))?;
    let conn = db_conn(state, req)?;
    let class_id = required_str(&req.params, "classId")
        .map_err(|_| HandlerErr::status("selection_missing"))
        .map_err(|e| handler_err(req, e))?;

    let class: Option<(i64, String)> = conn
        .query_row(
            "SELECT grade, division FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some((grade, division)) = class else {
        return Err(err(&req.id, "not_found", "class not found", None));
    };

    let teacher_name: Option<String> = conn
        .query_row(
            "SELECT name FROM teachers WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let students: Vec<(String, i64, String)> = {
        let mut stmt = conn
            .prepare(
                "SELECT id, roll_no, name FROM students WHERE class_id = ? ORDER BY roll_no",
            )
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        stmt.query_map([&class_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
    };
    let mut attendance_rows = Vec::with_capacity(students.len());
    for (student_id, roll_no, name) in &students {
        let summary =
            report::attendance_summary(conn, student_id).map_err(|e| report_err(req, e))?;
        attendance_rows.push(json!({
            "studentId": student_id,
            "rollNo": roll_no,
            "name": name,
            "attendance": summary,
        }));
    }

    let subject_ids: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT id FROM subjects WHERE class_id = ? ORDER BY name")
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        stmt.query_map([&class_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
    };
    let mut subject_reports = Vec::with_capacity(subject_ids.len());
    for subject_id in &subject_ids {
        let table =
            report::class_subject_report(conn, subject_id).map_err(|e| report_err(req, e))?;
        subject_reports.push(
            serde_json::to_value(table)
                .map_err(|e| err(&req.id, "internal", e.to_string(), None))?,
        );
    }

    Ok(json!({
        "classId": class_id,
        "grade": grade,
        "division": division,
        "teacherName": teacher_name,
        "attendance": attendance_rows,
        "subjectReports": subject_reports,
    }))
}

fn respond(result: Result<serde_json::Value, serde_json::Value>, id: &str) -> serde_json::Value {
    match result {
        Ok(value) => ok(id, value),
        Err(resp) => resp,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.attendance" => Some(respond(handle_attendance(state, req), &req.id)),
        "reports.studentSubject" => Some(respond(handle_student_subject(state, req), &req.id)),
        "reports.student" => Some(respond(handle_student(state, req), &req.id)),
        "reports.classSubject" => Some(respond(handle_class_subject(state, req), &req.id)),
        "reports.school" => Some(respond(handle_school(state, req), &req.id)),
        "student.overview" => Some(respond(handle_my_overview(state, req), &req.id)),
        _ => None,
    }
}
