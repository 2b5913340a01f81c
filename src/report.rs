use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

fn db_err(e: rusqlite::Error) -> ReportError {
    ReportError::new("db_query_failed", e.to_string())
}

/// present / total * 100, always rendered with two fractional digits.
/// An empty history is "0.00" by definition, not a division error.
pub fn format_percentage(present: i64, total: i64) -> String {
    if total == 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", (present as f64 / total as f64) * 100.0)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub present: i64,
    pub absent: i64,
    pub total: i64,
    pub percentage_present: String,
}

fn summarize_flags(flags: impl IntoIterator<Item = bool>) -> AttendanceSummary {
    let mut present: i64 = 0;
    let mut absent: i64 = 0;
    for is_present in flags {
        if is_present {
            present += 1;
        } else {
            absent += 1;
        }
    }
    let total = present + absent;
    AttendanceSummary {
        present,
        absent,
        total,
        percentage_present: format_percentage(present, total),
    }
}

/// Whole-history attendance aggregate for one student.
pub fn attendance_summary(
    conn: &Connection,
    student_id: &str,
) -> Result<AttendanceSummary, ReportError> {
    let mut stmt = conn
        .prepare("SELECT is_present FROM attendance WHERE student_id = ?")
        .map_err(db_err)?;
    let flags = stmt
        .query_map([student_id], |r| Ok(r.get::<_, i64>(0)? != 0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(summarize_flags(flags))
}

/// Same counting as `attendance_summary`, bounded to [from, to] inclusive.
pub fn attendance_summary_range(
    conn: &Connection,
    student_id: &str,
    from: &str,
    to: &str,
) -> Result<AttendanceSummary, ReportError> {
    let mut stmt = conn
        .prepare(
            "SELECT is_present FROM attendance
             WHERE student_id = ? AND date >= ? AND date <= ?",
        )
        .map_err(db_err)?;
    let flags = stmt
        .query_map((student_id, from, to), |r| Ok(r.get::<_, i64>(0)? != 0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(summarize_flags(flags))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTestMark {
    pub test_id: String,
    pub test_name: String,
    pub date: String,
    pub subject: String,
    pub marks: f64,
    pub total_marks: i64,
}

fn mark_for(conn: &Connection, test_id: &str, student_id: &str) -> Result<f64, ReportError> {
    let value: Option<f64> = conn
        .query_row(
            "SELECT marks FROM marks WHERE test_id = ? AND student_id = ?",
            (test_id, student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    // A missing row means the stamp/backfill invariant was broken for
    // this pair; report it rather than coercing to zero.
    value.ok_or_else(|| {
        ReportError::new("not_found", "marks row missing for student/test pair")
            .with_details(json!({ "testId": test_id, "studentId": student_id }))
    })
}

/// One row per test of the subject, in date order, with the student's
/// recorded marks.
pub fn subject_mark_report(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
) -> Result<Vec<SubjectTestMark>, ReportError> {
    let subject_name: Option<String> = conn
        .query_row("SELECT name FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    let Some(subject_name) = subject_name else {
        return Err(ReportError::new("not_found", "subject not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, name, date, total_marks FROM tests
             WHERE subject_id = ?
             ORDER BY date, name",
        )
        .map_err(db_err)?;
    let tests = stmt
        .query_map([subject_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut out = Vec::with_capacity(tests.len());
    for (test_id, test_name, date, total_marks) in tests {
        let marks = mark_for(conn, &test_id, student_id)?;
        out.push(SubjectTestMark {
            test_id,
            test_name,
            date,
            subject: subject_name.clone(),
            marks,
            total_marks,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamGroup {
    pub name: String,
    pub entries: Vec<SubjectTestMark>,
}

/// Marks for one student grouped by logical exam: tests sharing a name
/// across the class's subjects are one group. Groups come out in
/// first-sat order (earliest test date, then name); entries within a
/// group are ordered by subject name.
pub fn exam_group_report(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
) -> Result<Vec<ExamGroup>, ReportError> {
    let mut names_stmt = conn
        .prepare(
            "SELECT t.name, MIN(t.date) AS first_date
             FROM tests t
             JOIN subjects s ON s.id = t.subject_id
             WHERE s.class_id = ?
             GROUP BY t.name
             ORDER BY first_date, t.name",
        )
        .map_err(db_err)?;
    let exam_names = names_stmt
        .query_map([class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut entries_stmt = conn
        .prepare(
            "SELECT t.id, t.name, t.date, s.name, m.marks, t.total_marks
             FROM marks m
             JOIN tests t ON t.id = m.test_id
             JOIN subjects s ON s.id = t.subject_id
             WHERE m.student_id = ? AND s.class_id = ? AND t.name = ?
             ORDER BY s.name",
        )
        .map_err(db_err)?;

    let mut groups = Vec::with_capacity(exam_names.len());
    for exam_name in exam_names {
        let entries = entries_stmt
            .query_map((student_id, class_id, &exam_name), |r| {
                Ok(SubjectTestMark {
                    test_id: r.get(0)?,
                    test_name: r.get(1)?,
                    date: r.get(2)?,
                    subject: r.get(3)?,
                    marks: r.get(4)?,
                    total_marks: r.get(5)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;
        groups.push(ExamGroup {
            name: exam_name,
            entries,
        });
    }
    Ok(groups)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestColumn {
    pub test_id: String,
    pub name: String,
    pub date: String,
    pub total_marks: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSubjectRow {
    pub student_id: String,
    pub roll_no: i64,
    pub name: String,
    pub attendance: AttendanceSummary,
    pub marks: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSubjectReport {
    pub subject_id: String,
    pub subject: String,
    pub tests: Vec<TestColumn>,
    pub rows: Vec<ClassSubjectRow>,
}

/// Cross-tab for one subject: rows are the enrolled students in roll
/// order, columns the subject's tests in date order, each row paired
/// with that student's whole-history attendance aggregate.
pub fn class_subject_report(
    conn: &Connection,
    subject_id: &str,
) -> Result<ClassSubjectReport, ReportError> {
    let subject: Option<(String, String)> = conn
        .query_row(
            "SELECT name, class_id FROM subjects WHERE id = ?",
            [subject_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((subject_name, class_id)) = subject else {
        return Err(ReportError::new("not_found", "subject not found"));
    };

    let mut tests_stmt = conn
        .prepare(
            "SELECT id, name, date, total_marks FROM tests
             WHERE subject_id = ?
             ORDER BY date, name",
        )
        .map_err(db_err)?;
    let tests = tests_stmt
        .query_map([subject_id], |r| {
            Ok(TestColumn {
                test_id: r.get(0)?,
                name: r.get(1)?,
                date: r.get(2)?,
                total_marks: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut students_stmt = conn
        .prepare(
            "SELECT id, roll_no, name FROM students
             WHERE class_id = ?
             ORDER BY roll_no",
        )
        .map_err(db_err)?;
    let students = students_stmt
        .query_map([&class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut rows = Vec::with_capacity(students.len());
    for (student_id, roll_no, name) in students {
        let attendance = attendance_summary(conn, &student_id)?;
        let mut cells = Vec::with_capacity(tests.len());
        for test in &tests {
            cells.push(mark_for(conn, &test.test_id, &student_id)?);
        }
        rows.push(ClassSubjectRow {
            student_id,
            roll_no,
            name,
            attendance,
            marks: cells,
        });
    }

    Ok(ClassSubjectReport {
        subject_id: subject_id.to_string(),
        subject: subject_name,
        tests,
        rows,
    })
}
