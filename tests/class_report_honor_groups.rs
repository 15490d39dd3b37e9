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

    fn shutdown(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

fn admin() -> Value {
    json!({ "userId": "u-admin", "role": "admin" })
}

/// One Mathematics score per student whose final score equals the wanted
/// period average.
fn seed_class_with_averages(
    d: &mut Daemon,
    workspace: &PathBuf,
    roster: &[(&str, f64)],
) -> String {
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
    let class_id = class["classId"].as_str().unwrap().to_string();
    let subject = d.ok("subjects.create", json!({ "name": "Mathematics" }));
    let subject_id = subject["subjectId"].as_str().unwrap().to_string();

    for (name, total) in roster {
        let student = d.ok(
            "students.create",
            json!({ "classId": class_id, "fullName": name }),
        );
        d.ok(
            "scores.upsert",
            json!({
                "caller": admin(),
                "classId": class_id,
                "studentId": student["studentId"],
                "subjectId": subject_id,
                "periodId": "period-1",
                "quiz": total - 60.0,
                "assignment": 20.0,
                "participation": 20.0,
                "test": 20.0
            }),
        );
    }
    class_id
}

#[test]
fn honor_groups_split_by_band_with_sequential_ranks() {
    let workspace = temp_dir("reportcard-honor-groups");
    let mut d = Daemon::spawn();
    let class_id = seed_class_with_averages(
        &mut d,
        &workspace,
        &[
            ("Carol Danso", 82.0),
            ("Alice Aidoo", 92.0),
            ("Bob Quartey", 87.0),
            ("Dora Asante", 75.0),
            ("Evans Tetteh", 65.0),
        ],
    );

    let built = d.ok(
        "averages.classReport",
        json!({ "caller": admin(), "classId": class_id, "periodId": "period-1" }),
    );
    let rows = built["students"].as_array().unwrap();
    assert_eq!(rows.len(), 5);
    // Tie-aware class ranks come back sorted best first.
    assert_eq!(rows[0]["studentName"].as_str(), Some("Alice Aidoo"));
    assert_eq!(rows[0]["rank"].as_i64(), Some(1));
    assert_eq!(rows[4]["studentName"].as_str(), Some("Evans Tetteh"));
    assert_eq!(rows[4]["rank"].as_i64(), Some(5));

    d.ok(
        "grades.publish",
        json!({ "caller": admin(), "periodId": "period-1" }),
    );

    let report = d.ok(
        "reports.academic",
        json!({ "classId": class_id, "periodId": "period-1" }),
    );
    assert_eq!(report["gradeClass"].as_str(), Some("Grade 7"));
    assert_eq!(report["period"].as_str(), Some("Period 1"));
    assert_eq!(report["totalHonorStudents"].as_i64(), Some(3));
    assert_eq!(report["totalDelinquentStudents"].as_i64(), Some(1));

    let honor = report["honorStudents"].as_array().unwrap();
    let averages: Vec<f64> = honor.iter().map(|s| s["average"].as_f64().unwrap()).collect();
    assert_eq!(averages, vec![92.0, 87.0, 82.0]);
    let ranks: Vec<i64> = honor.iter().map(|s| s["rank"].as_i64().unwrap()).collect();
    assert_eq!(ranks, vec![1, 2, 3]);

    let groups = &report["honorGroups"];
    assert_eq!(
        groups["Principal's List (90-100)"][0]["studentName"].as_str(),
        Some("Alice Aidoo")
    );
    assert_eq!(
        groups["High Honor Roll (85-89)"][0]["studentName"].as_str(),
        Some("Bob Quartey")
    );
    assert_eq!(
        groups["Honor Roll (80-84)"][0]["studentName"].as_str(),
        Some("Carol Danso")
    );
    assert_eq!(
        report["topHonorStudent"]["studentName"].as_str(),
        Some("Alice Aidoo")
    );

    // 75.0 sits between the buckets: not honored, not delinquent.
    let delinquent = report["delinquentStudents"].as_array().unwrap();
    assert_eq!(delinquent.len(), 1);
    assert_eq!(delinquent[0]["studentName"].as_str(), Some("Evans Tetteh"));
    assert_eq!(
        delinquent[0]["remark"].as_str(),
        Some("Need Improvement")
    );

    d.shutdown();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unpublished_averages_stay_out_of_the_academic_report() {
    let workspace = temp_dir("reportcard-unpublished-report");
    let mut d = Daemon::spawn();
    let class_id = seed_class_with_averages(
        &mut d,
        &workspace,
        &[("Alice Aidoo", 92.0), ("Bob Quartey", 87.0)],
    );
    d.ok(
        "averages.classReport",
        json!({ "caller": admin(), "classId": class_id, "periodId": "period-1" }),
    );

    // Built but not yet released.
    let report = d.ok(
        "reports.academic",
        json!({ "classId": class_id, "periodId": "period-1" }),
    );
    assert_eq!(report["totalHonorStudents"].as_i64(), Some(0));
    assert_eq!(report["topHonorStudent"], Value::Null);

    d.ok(
        "grades.publish",
        json!({ "caller": admin(), "periodId": "period-1" }),
    );
    let report = d.ok(
        "reports.academic",
        json!({ "classId": class_id, "periodId": "period-1" }),
    );
    assert_eq!(report["totalHonorStudents"].as_i64(), Some(2));

    d.shutdown();
    let _ = std::fs::remove_dir_all(workspace);
}
