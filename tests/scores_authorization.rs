use serde_json::{json, Value};
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

struct Daemon {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Daemon {
    fn spawn() -> Daemon {
        let exe = env!("CARGO_BIN_EXE_reportcardd");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn reportcardd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Daemon {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 1,
        }
    }

    fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id.to_string();
        self.next_id += 1;
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response");
        let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.call(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().expect("result")
    }

    fn err_code(&mut self, method: &str, params: Value) -> String {
        let value = self.call(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .expect("error code")
            .to_string()
    }

    fn shutdown(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

fn admin() -> Value {
    json!({ "userId": "u-admin", "role": "admin" })
}

fn teacher() -> Value {
    json!({ "userId": "u-teach", "role": "teacher" })
}

fn score_params(caller: Value, class_id: &str, student_id: &str, subject_id: &str) -> Value {
    json!({
        "caller": caller,
        "classId": class_id,
        "studentId": student_id,
        "subjectId": subject_id,
        "periodId": "period-1",
        "quiz": 20.0, "assignment": 20.0, "participation": 20.0, "test": 25.0
    })
}

struct School {
    class_id: String,
    other_class_id: String,
    subject_id: String,
    other_subject_id: String,
    student_id: String,
    other_class_student_id: String,
}

fn seed_school(d: &mut Daemon, workspace: &PathBuf) -> School {
    d.ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year = d.ok(
        "years.create",
        json!({ "name": "2025/2026", "startDate": "2025-09-01", "endDate": "2026-06-30" }),
    );
    d.ok("years.activate", json!({ "yearId": year["yearId"] }));

    let class = d.ok("classes.create", json!({ "name": "Grade 7" }));
    let other_class = d.ok("classes.create", json!({ "name": "Grade 8" }));
    let subject = d.ok("subjects.create", json!({ "name": "Mathematics" }));
    let other_subject = d.ok("subjects.create", json!({ "name": "Biology" }));
    let class_id = class["classId"].as_str().unwrap().to_string();
    let other_class_id = other_class["classId"].as_str().unwrap().to_string();

    let student = d.ok(
        "students.create",
        json!({ "classId": class_id, "fullName": "Ama Mensah", "userId": "u-ama" }),
    );
    let other_student = d.ok(
        "students.create",
        json!({ "classId": other_class_id, "fullName": "Kofi Boateng" }),
    );

    School {
        class_id,
        other_class_id,
        subject_id: subject["subjectId"].as_str().unwrap().to_string(),
        other_subject_id: other_subject["subjectId"].as_str().unwrap().to_string(),
        student_id: student["studentId"].as_str().unwrap().to_string(),
        other_class_student_id: other_student["studentId"].as_str().unwrap().to_string(),
    }
}

#[test]
fn writes_require_an_active_year() {
    let workspace = temp_dir("reportcard-no-active-year");
    let mut d = Daemon::spawn();
    d.ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    d.ok(
        "years.create",
        json!({ "name": "2025/2026", "startDate": "2025-09-01", "endDate": "2026-06-30" }),
    );
    // Year exists but was never activated: resolution fails.
    let code = d.err_code(
        "scores.upsert",
        score_params(admin(), "c-any", "s-any", "sub-any"),
    );
    assert_eq!(code, "no_active_year");

    d.shutdown();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn only_admin_tier_and_assigned_teachers_write_scores() {
    let workspace = temp_dir("reportcard-score-authz");
    let mut d = Daemon::spawn();
    let school = seed_school(&mut d, &workspace);

    // A student can never write scores.
    let code = d.err_code(
        "scores.upsert",
        score_params(
            json!({ "userId": "u-ama", "role": "student" }),
            &school.class_id,
            &school.student_id,
            &school.subject_id,
        ),
    );
    assert_eq!(code, "not_authorized");

    // A teacher with no assignment for this class+subject is rejected.
    let code = d.err_code(
        "scores.upsert",
        score_params(
            teacher(),
            &school.class_id,
            &school.student_id,
            &school.subject_id,
        ),
    );
    assert_eq!(code, "not_authorized");

    // The assignment is per subject: Biology alone does not grant Mathematics.
    d.ok(
        "teachers.assign",
        json!({
            "teacherUserId": "u-teach",
            "classId": school.class_id,
            "subjectId": school.other_subject_id
        }),
    );
    let code = d.err_code(
        "scores.upsert",
        score_params(
            teacher(),
            &school.class_id,
            &school.student_id,
            &school.subject_id,
        ),
    );
    assert_eq!(code, "not_authorized");

    d.ok(
        "teachers.assign",
        json!({
            "teacherUserId": "u-teach",
            "classId": school.class_id,
            "subjectId": school.subject_id
        }),
    );
    let created = d.ok(
        "scores.upsert",
        score_params(
            teacher(),
            &school.class_id,
            &school.student_id,
            &school.subject_id,
        ),
    );
    assert_eq!(created["created"].as_bool(), Some(true));
    assert_eq!(created["finalScore"].as_f64(), Some(85.0));

    d.shutdown();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_outside_the_class_is_a_scope_mismatch() {
    let workspace = temp_dir("reportcard-scope-mismatch");
    let mut d = Daemon::spawn();
    let school = seed_school(&mut d, &workspace);

    let value = d.call(
        "scores.upsert",
        score_params(
            admin(),
            &school.class_id,
            &school.other_class_student_id,
            &school.subject_id,
        ),
    );
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(value["error"]["code"].as_str(), Some("scope_mismatch"));
    assert_eq!(
        value["error"]["details"]["studentClassId"].as_str(),
        Some(school.other_class_id.as_str())
    );

    d.shutdown();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn duplicate_identity_is_a_conflict_and_updates_need_the_edit_flag() {
    let workspace = temp_dir("reportcard-edit-flag");
    let mut d = Daemon::spawn();
    let school = seed_school(&mut d, &workspace);
    d.ok(
        "teachers.assign",
        json!({
            "teacherUserId": "u-teach",
            "classId": school.class_id,
            "subjectId": school.subject_id
        }),
    );

    let created = d.ok(
        "scores.upsert",
        score_params(
            teacher(),
            &school.class_id,
            &school.student_id,
            &school.subject_id,
        ),
    );
    let score_id = created["scoreId"].as_str().unwrap().to_string();

    // A second create for the same identity points at the existing record.
    let value = d.call(
        "scores.upsert",
        score_params(
            teacher(),
            &school.class_id,
            &school.student_id,
            &school.subject_id,
        ),
    );
    assert_eq!(value["error"]["code"].as_str(), Some("conflict"));
    assert_eq!(
        value["error"]["details"]["scoreId"].as_str(),
        Some(score_id.as_str())
    );

    // Teacher updates are closed until an admin opens the record.
    let mut update = score_params(
        teacher(),
        &school.class_id,
        &school.student_id,
        &school.subject_id,
    );
    update["scoreId"] = json!(score_id);
    update["test"] = json!(30.0);
    assert_eq!(d.err_code("scores.upsert", update.clone()), "not_authorized");

    d.ok(
        "scores.allowTeacherEdit",
        json!({ "caller": admin(), "scoreId": score_id, "allow": true }),
    );
    let updated = d.ok("scores.upsert", update);
    assert_eq!(updated["created"].as_bool(), Some(false));
    assert_eq!(updated["finalScore"].as_f64(), Some(90.0));

    // Only the admin tier may touch the flag.
    let code = d.err_code(
        "scores.allowTeacherEdit",
        json!({ "caller": teacher(), "scoreId": score_id, "allow": false }),
    );
    assert_eq!(code, "not_authorized");

    d.shutdown();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deletion_is_admin_tier_only() {
    let workspace = temp_dir("reportcard-score-delete");
    let mut d = Daemon::spawn();
    let school = seed_school(&mut d, &workspace);
    d.ok(
        "teachers.assign",
        json!({
            "teacherUserId": "u-teach",
            "classId": school.class_id,
            "subjectId": school.subject_id
        }),
    );
    let created = d.ok(
        "scores.upsert",
        score_params(
            teacher(),
            &school.class_id,
            &school.student_id,
            &school.subject_id,
        ),
    );
    let score_id = created["scoreId"].as_str().unwrap().to_string();

    let code = d.err_code(
        "scores.delete",
        json!({ "caller": teacher(), "scoreId": score_id }),
    );
    assert_eq!(code, "not_authorized");

    d.ok(
        "scores.delete",
        json!({ "caller": admin(), "scoreId": score_id }),
    );
    let code = d.err_code(
        "scores.delete",
        json!({ "caller": admin(), "scoreId": score_id }),
    );
    assert_eq!(code, "not_found");

    d.shutdown();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn listing_narrows_by_capability_instead_of_erroring() {
    let workspace = temp_dir("reportcard-score-list");
    let mut d = Daemon::spawn();
    let school = seed_school(&mut d, &workspace);
    d.ok(
        "scores.upsert",
        score_params(
            admin(),
            &school.class_id,
            &school.student_id,
            &school.subject_id,
        ),
    );

    // Students and parents get an empty list, never an error.
    let listed = d.ok(
        "scores.list",
        json!({ "caller": { "userId": "u-ama", "role": "student" } }),
    );
    assert_eq!(listed["scores"].as_array().map(|a| a.len()), Some(0));

    // A teacher only sees rows covered by an assignment.
    let listed = d.ok("scores.list", json!({ "caller": teacher() }));
    assert_eq!(listed["scores"].as_array().map(|a| a.len()), Some(0));
    d.ok(
        "teachers.assign",
        json!({
            "teacherUserId": "u-teach",
            "classId": school.class_id,
            "subjectId": school.subject_id
        }),
    );
    let listed = d.ok("scores.list", json!({ "caller": teacher() }));
    assert_eq!(listed["scores"].as_array().map(|a| a.len()), Some(1));

    d.shutdown();
    let _ = std::fs::remove_dir_all(workspace);
}
