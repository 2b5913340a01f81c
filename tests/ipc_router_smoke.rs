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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
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

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schoolreg-router-smoke");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.seedAdmin",
        json!({ "username": "head", "password": "pw" }),
    );
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "username": "head", "password": "pw" }),
    );
    let admin = login.get("token").and_then(|v| v.as_str()).expect("token").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "setup.seedPrincipal",
        json!({ "token": admin, "username": "principal", "password": "pw" }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.create",
        json!({ "token": admin, "grade": 8, "division": "A" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classes.list",
        json!({ "token": admin }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "teachers.create",
        json!({
            "token": admin,
            "username": "t.anya",
            "password": "pw",
            "fullName": "Anya Sharma",
            "classId": class_id
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "teachers.list",
        json!({ "token": admin }),
    );
    let tlogin = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "auth.login",
        json!({ "username": "t.anya", "password": "pw" }),
    );
    let teacher = tlogin.get("token").and_then(|v| v.as_str()).expect("token").to_string();

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "subjects.create",
        json!({ "token": teacher, "name": "Maths" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "subjects.list",
        json!({ "token": teacher }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "students.create",
        json!({
            "token": teacher,
            "username": "s.alice",
            "password": "pw",
            "fullName": "Alice",
            "phone": 9876543210i64,
            "rollNo": 1
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "students.list",
        json!({ "token": teacher }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "tests.create",
        json!({
            "token": teacher,
            "name": "Unit Test 1",
            "date": "2016-06-10",
            "totalMarks": 25
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "tests.names",
        json!({ "token": teacher }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "tests.open",
        json!({ "token": teacher, "name": "Unit Test 1" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "attendance.dayOpen",
        json!({ "token": teacher, "date": "2016-06-10" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "attendance.capture",
        json!({
            "token": teacher,
            "date": "2016-06-10",
            "rows": [{ "studentId": student_id, "present": true }]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "reports.attendance",
        json!({ "token": teacher, "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "reports.studentSubject",
        json!({ "token": teacher, "studentId": student_id, "subjectId": subject_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "reports.student",
        json!({ "token": teacher, "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "reports.classSubject",
        json!({ "token": teacher, "subjectId": subject_id }),
    );
    let plogin = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "auth.login",
        json!({ "username": "principal", "password": "pw" }),
    );
    let principal = plogin.get("token").and_then(|v| v.as_str()).expect("token");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "reports.school",
        json!({ "token": principal, "classId": class_id }),
    );
    let slogin = request_ok(
        &mut stdin,
        &mut reader,
        "26",
        "auth.login",
        json!({ "username": "s.alice", "password": "pw" }),
    );
    let student_token = slogin.get("token").and_then(|v| v.as_str()).expect("token");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "27",
        "student.overview",
        json!({ "token": student_token }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "28",
        "notify.preview",
        json!({ "token": admin, "date": "2016-06-10" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "notify.absentees",
        json!({ "token": admin, "date": "2016-06-10" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "30",
        "auth.logout",
        json!({ "token": teacher }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "31",
        "classes.delete",
        json!({ "token": admin, "classId": class_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
