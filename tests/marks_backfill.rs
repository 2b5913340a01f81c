use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolregd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolregd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct ClassSetup {
    teacher_token: String,
}

fn seed_admin(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed",
        "setup.seedAdmin",
        json!({ "username": "head", "password": "pw" }),
    );
    let login = request_ok(
        stdin,
        reader,
        "login",
        "auth.login",
        json!({ "username": "head", "password": "pw" }),
    );
    login["token"].as_str().expect("admin token").to_string()
}

fn add_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &str,
    division: &str,
    teacher_user: &str,
) -> (String, ClassSetup) {
    let class = request_ok(
        stdin,
        reader,
        &format!("class-{}", division),
        "classes.create",
        json!({ "token": admin, "grade": 8, "division": division }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        &format!("teacher-{}", division),
        "teachers.create",
        json!({
            "token": admin,
            "username": teacher_user,
            "password": "pw",
            "fullName": format!("Teacher {}", division),
            "classId": class_id
        }),
    );
    let tlogin = request_ok(
        stdin,
        reader,
        &format!("tlogin-{}", division),
        "auth.login",
        json!({ "username": teacher_user, "password": "pw" }),
    );
    (
        class_id,
        ClassSetup {
            teacher_token: tlogin["token"].as_str().expect("token").to_string(),
        },
    )
}

fn add_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    teacher: &str,
    username: &str,
    roll: i64,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("student-{}", username),
        "students.create",
        json!({
            "token": teacher,
            "username": username,
            "password": "pw",
            "fullName": username,
            "phone": 9876543210i64,
            "rollNo": roll
        }),
    );
    created["studentId"].as_str().expect("studentId").to_string()
}

#[test]
fn test_creation_stamps_one_zero_row_per_student() {
    let workspace = temp_dir("schoolreg-stamp");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let admin = seed_admin(&mut stdin, &mut reader, &workspace);
    let (_class_id, setup) = add_class(&mut stdin, &mut reader, &admin, "A", "t.a");
    let teacher = setup.teacher_token;

    let maths = request_ok(
        &mut stdin,
        &mut reader,
        "subj-m",
        "subjects.create",
        json!({ "token": teacher, "name": "Maths" }),
    );
    let maths_id = maths["subjectId"].as_str().expect("id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "subj-s",
        "subjects.create",
        json!({ "token": teacher, "name": "Science" }),
    );

    let _alice = add_student(&mut stdin, &mut reader, &teacher, "s.alice", 1);
    let _bob = add_student(&mut stdin, &mut reader, &teacher, "s.bob", 2);

    // Two subjects x two students: four zero rows stamped.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "test",
        "tests.create",
        json!({
            "token": teacher,
            "name": "Unit Test 1",
            "date": "2016-06-10",
            "totalMarks": 25
        }),
    );
    assert_eq!(created["marksStamped"], 4);
    assert_eq!(created["tests"].as_array().expect("tests").len(), 2);

    let table = request_ok(
        &mut stdin,
        &mut reader,
        "table",
        "reports.classSubject",
        json!({ "token": teacher, "subjectId": maths_id }),
    );
    let rows = table["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row["marks"], json!([0.0]));
    }

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn late_enrolment_and_class_moves_backfill_missing_rows_only() {
    let workspace = temp_dir("schoolreg-backfill");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let admin = seed_admin(&mut stdin, &mut reader, &workspace);
    let (_class_a, setup_a) = add_class(&mut stdin, &mut reader, &admin, "A", "t.a");
    let (class_b, setup_b) = add_class(&mut stdin, &mut reader, &admin, "B", "t.b");
    let teacher_a = setup_a.teacher_token;
    let teacher_b = setup_b.teacher_token;

    // Class A: one subject with one test already held.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "subj-a",
        "subjects.create",
        json!({ "token": teacher_a, "name": "Maths" }),
    );
    let anchor = add_student(&mut stdin, &mut reader, &teacher_a, "s.anchor", 1);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "test-a",
        "tests.create",
        json!({
            "token": teacher_a,
            "name": "Unit Test 1",
            "date": "2016-06-10",
            "totalMarks": 25
        }),
    );

    // Class B: two subjects, each with one test.
    for (id, name) in [("subj-b1", "English"), ("subj-b2", "History")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "subjects.create",
            json!({ "token": teacher_b, "name": name }),
        );
    }
    let b_student = add_student(&mut stdin, &mut reader, &teacher_b, "s.b1", 5);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "test-b",
        "tests.create",
        json!({
            "token": teacher_b,
            "name": "Terminal",
            "date": "2016-07-01",
            "totalMarks": 50
        }),
    );

    // A student enrolled after the test exists gets stamped on create.
    let late = add_student(&mut stdin, &mut reader, &teacher_b, "s.late", 6);
    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "late-report",
        "reports.student",
        json!({ "token": teacher_b, "studentId": late }),
    );
    assert_eq!(
        overview["examGroups"].as_array().expect("groups").len(),
        1,
        "late student must appear in the existing exam"
    );

    // Moving the class A student into class B backfills one zero row
    // per class B test (two subjects x one exam).
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "move",
        "students.bulkUpdate",
        json!({
            "token": teacher_a,
            "rows": [{ "studentId": anchor, "classId": class_b }]
        }),
    );
    assert_eq!(moved["marksBackfilled"], 2);

    let b_overview = request_ok(
        &mut stdin,
        &mut reader,
        "moved-report",
        "reports.student",
        json!({ "token": teacher_b, "studentId": anchor }),
    );
    let groups = b_overview["examGroups"].as_array().expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["name"], "Terminal");
    assert_eq!(groups[0]["entries"].as_array().expect("entries").len(), 2);

    // Pairs that already have a row are skipped: the resident student
    // gains nothing from a no-op bulk pass.
    let noop = request_ok(
        &mut stdin,
        &mut reader,
        "noop",
        "students.bulkUpdate",
        json!({
            "token": teacher_b,
            "rows": [{ "studentId": b_student, "classId": class_b }]
        }),
    );
    assert_eq!(noop["marksBackfilled"], 0);

    let _ = std::fs::remove_dir_all(workspace);
}
