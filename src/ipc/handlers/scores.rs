use crate::calc;
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    caller, db_conn, enqueue_notification, new_id, now, optional_str, period_by_id, required_score,
    required_str, resolve_year, student_by_id, teacher_assigned_to, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roles::{Caller, Capability};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct ScoreRecordRow {
    id: String,
    academic_year_id: String,
    class_id: String,
    student_id: String,
    subject_id: String,
    period_id: String,
    teacher_may_edit: bool,
}

fn score_record_by_id(conn: &Connection, score_id: &str) -> Result<ScoreRecordRow, HandlerErr> {
    conn.query_row(
        "SELECT id, academic_year_id, class_id, student_id, subject_id, period_id, teacher_may_edit
         FROM score_records
         WHERE id = ?",
        [score_id],
        |r| {
            Ok(ScoreRecordRow {
                id: r.get(0)?,
                academic_year_id: r.get(1)?,
                class_id: r.get(2)?,
                student_id: r.get(3)?,
                subject_id: r.get(4)?,
                period_id: r.get(5)?,
                teacher_may_edit: r.get::<_, i64>(6)? != 0,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::not_found("score record not found"))
}

fn subject_name(conn: &Connection, subject_id: &str) -> Result<String, HandlerErr> {
    conn.query_row("SELECT name FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get(0)
    })
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::not_found("subject not found"))
}

/// Mutations only target the active year; deactivated years are read-only
/// history.
fn require_active_year(conn: &Connection, year_id: &str) -> Result<(), HandlerErr> {
    let active = db::active_year(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    match active {
        Some(y) if y.id == year_id => Ok(()),
        _ => Err(HandlerErr::not_authorized(
            "academic year is closed; its records are read-only",
        )),
    }
}

fn authorize_score_write(
    conn: &Connection,
    who: &Caller,
    class_id: &str,
    subject_id: &str,
) -> Result<Capability, HandlerErr> {
    let cap = who.capability();
    match cap {
        Capability::AdminTier => Ok(cap),
        Capability::Teacher => {
            if teacher_assigned_to(conn, &who.user_id, class_id, Some(subject_id))? {
                Ok(cap)
            } else {
                Err(HandlerErr::not_authorized(
                    "teacher is not assigned to this class and subject",
                ))
            }
        }
        _ => Err(HandlerErr::not_authorized(
            "role may not write score records",
        )),
    }
}

// Best-effort fan-out when a teacher submits grades; never fails the write.
fn notify_class_students(
    conn: &Connection,
    class_id: &str,
    year_id: &str,
    subject: &str,
    class_name: &str,
    period_name: &str,
) {
    let message = format!(
        "New grades have been submitted for {} ({}) for {}. \
         Please see the teacher for details or check your grade performance chart.",
        subject, class_name, period_name
    );
    let stmt = conn.prepare(
        "SELECT DISTINCT user_id FROM students
         WHERE class_id = ? AND academic_year_id = ? AND status = 'enrolled'
           AND user_id IS NOT NULL",
    );
    let Ok(mut stmt) = stmt else { return };
    let user_ids = stmt
        .query_map((class_id, year_id), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let Ok(user_ids) = user_ids else { return };
    for user_id in user_ids {
        let _ = enqueue_notification(conn, &user_id, &message);
    }
}

fn handle_scores_upsert(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = caller(&req.params)?;

    let class_id = required_str(&req.params, "classId")?;
    let student_id = required_str(&req.params, "studentId")?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let period_id = required_str(&req.params, "periodId")?;
    let quiz = required_score(&req.params, "quiz")?;
    let assignment = required_score(&req.params, "assignment")?;
    let participation = required_score(&req.params, "participation")?;
    let test = required_score(&req.params, "test")?;

    let year = resolve_year(conn, &req.params)?;
    require_active_year(conn, &year.id)?;

    let period = period_by_id(conn, &period_id)?;
    let subject = subject_name(conn, &subject_id)?;
    let class_name = crate::ipc::helpers::class_name(conn, &class_id)?;

    let student = student_by_id(conn, &student_id)?;
    if student.class_id != class_id {
        return Err(HandlerErr {
            code: "scope_mismatch",
            message: format!(
                "student {} does not belong to grade class {}",
                student.full_name, class_name
            ),
            details: Some(json!({
                "studentClassId": student.class_id,
                "classId": class_id,
            })),
        });
    }

    let cap = authorize_score_write(conn, &who, &class_id, &subject_id)?;

    if let Some(score_id) = optional_str(&req.params, "scoreId") {
        let row = score_record_by_id(conn, &score_id)?;
        if row.student_id != student_id
            || row.subject_id != subject_id
            || row.period_id != period_id
            || row.academic_year_id != year.id
            || row.class_id != class_id
        {
            return Err(HandlerErr::new(
                "bad_params",
                "scoreId does not match the record identity in params",
            ));
        }
        if cap == Capability::Teacher && !row.teacher_may_edit {
            return Err(HandlerErr::not_authorized(
                "teacher updates are disabled for this record; an admin must enable them",
            ));
        }
        conn.execute(
            "UPDATE score_records
             SET quiz = ?, assignment = ?, participation = ?, test = ?, updated_at = ?
             WHERE id = ?",
            (quiz, assignment, participation, test, now(), &row.id),
        )
        .map_err(HandlerErr::db)?;
        return Ok(json!({
            "scoreId": row.id,
            "finalScore": calc::final_score(quiz, assignment, participation, test),
            "academicYearId": year.id,
            "created": false,
        }));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM score_records
             WHERE student_id = ? AND subject_id = ? AND period_id = ? AND academic_year_id = ?",
            (&student_id, &subject_id, &period_id, &year.id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if let Some(existing_id) = existing {
        return Err(HandlerErr {
            code: "conflict",
            message: "a score record already exists for this student, subject, period and year"
                .to_string(),
            details: Some(json!({ "scoreId": existing_id })),
        });
    }

    let score_id = new_id();
    let inserted = conn.execute(
        "INSERT INTO score_records(
            id, academic_year_id, class_id, student_id, subject_id, period_id,
            quiz, assignment, participation, test, teacher_may_edit, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        rusqlite::params![
            &score_id,
            &year.id,
            &class_id,
            &student_id,
            &subject_id,
            &period_id,
            quiz,
            assignment,
            participation,
            test,
            &who.user_id,
            now(),
        ],
    );
    match inserted {
        Ok(_) => {}
        // Storage-level uniqueness backstop for concurrent creates.
        Err(rusqlite::Error::SqliteFailure(e, msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(HandlerErr::new(
                "conflict",
                msg.unwrap_or_else(|| "duplicate score record identity".to_string()),
            ));
        }
        Err(e) => return Err(HandlerErr::db(e)),
    }

    notify_class_students(conn, &class_id, &year.id, &subject, &class_name, &period.name);

    Ok(json!({
        "scoreId": score_id,
        "finalScore": calc::final_score(quiz, assignment, participation, test),
        "academicYearId": year.id,
        "created": true,
    }))
}

fn handle_scores_allow_teacher_edit(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = caller(&req.params)?;
    if who.capability() != Capability::AdminTier {
        return Err(HandlerErr::not_authorized(
            "only admin-tier roles may change the teacher edit flag",
        ));
    }
    let score_id = required_str(&req.params, "scoreId")?;
    let allow = req
        .params
        .get("allow")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing boolean allow"))?;

    let changed = conn
        .execute(
            "UPDATE score_records SET teacher_may_edit = ? WHERE id = ?",
            (allow as i64, &score_id),
        )
        .map_err(HandlerErr::db)?;
    if changed == 0 {
        return Err(HandlerErr::not_found("score record not found"));
    }
    Ok(json!({ "scoreId": score_id, "teacherMayEdit": allow }))
}

fn handle_scores_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = caller(&req.params)?;
    if who.capability() != Capability::AdminTier {
        return Err(HandlerErr::not_authorized(
            "only admin-tier roles may delete score records",
        ));
    }
    let score_id = required_str(&req.params, "scoreId")?;
    let row = score_record_by_id(conn, &score_id)?;
    require_active_year(conn, &row.academic_year_id)?;

    conn.execute("DELETE FROM score_records WHERE id = ?", [&row.id])
        .map_err(HandlerErr::db)?;
    Ok(json!({ "deleted": true }))
}

// Scoped list: unauthorized scope narrows to empty instead of erroring.
fn handle_scores_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = caller(&req.params)?;

    match who.capability() {
        Capability::AdminTier | Capability::Teacher => {}
        _ => return Ok(json!({ "scores": [] })),
    }

    let class_filter = optional_str(&req.params, "classId");
    let period_filter = optional_str(&req.params, "periodId");
    let year_filter = match optional_str(&req.params, "academicYearId") {
        Some(id) => Some(id),
        None => db::active_year(conn)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
            .map(|y| y.id),
    };

    let mut sql = String::from(
        "SELECT sr.id, sr.class_id, sr.student_id, st.full_name, sr.subject_id, sub.name,
                sr.period_id, p.name, sr.academic_year_id,
                sr.quiz, sr.assignment, sr.participation, sr.test, sr.teacher_may_edit
         FROM score_records sr
         JOIN students st ON st.id = sr.student_id
         JOIN subjects sub ON sub.id = sr.subject_id
         JOIN periods p ON p.id = sr.period_id
         WHERE 1 = 1",
    );
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(class_id) = &class_filter {
        sql.push_str(" AND sr.class_id = ?");
        binds.push(rusqlite::types::Value::Text(class_id.clone()));
    }
    if let Some(period_id) = &period_filter {
        sql.push_str(" AND sr.period_id = ?");
        binds.push(rusqlite::types::Value::Text(period_id.clone()));
    }
    if let Some(year_id) = &year_filter {
        sql.push_str(" AND sr.academic_year_id = ?");
        binds.push(rusqlite::types::Value::Text(year_id.clone()));
    }
    if who.capability() == Capability::Teacher {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM teacher_assignments ta
                          WHERE ta.teacher_user_id = ?
                            AND ta.class_id = sr.class_id
                            AND ta.subject_id = sr.subject_id)",
        );
        binds.push(rusqlite::types::Value::Text(who.user_id.clone()));
    }
    sql.push_str(" ORDER BY st.full_name, sub.name");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let scores = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let quiz: f64 = r.get(9)?;
            let assignment: f64 = r.get(10)?;
            let participation: f64 = r.get(11)?;
            let test: f64 = r.get(12)?;
            let final_score = calc::final_score(quiz, assignment, participation, test);
            Ok(json!({
                "scoreId": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "studentId": r.get::<_, String>(2)?,
                "studentName": r.get::<_, String>(3)?,
                "subjectId": r.get::<_, String>(4)?,
                "subjectName": r.get::<_, String>(5)?,
                "periodId": r.get::<_, String>(6)?,
                "periodName": r.get::<_, String>(7)?,
                "academicYearId": r.get::<_, String>(8)?,
                "quiz": quiz,
                "assignment": assignment,
                "participation": participation,
                "test": test,
                "finalScore": final_score,
                "remark": calc::classify(final_score),
                "teacherMayEdit": r.get::<_, i64>(13)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "scores": scores }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "scores.upsert" => handle_scores_upsert(state, req),
        "scores.allowTeacherEdit" => handle_scores_allow_teacher_edit(state, req),
        "scores.delete" => handle_scores_delete(state, req),
        "scores.list" => handle_scores_list(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
