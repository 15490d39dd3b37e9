use crate::db::{self, YearRow};
use crate::ipc::error::err;
use crate::ipc::types::AppState;
use crate::roles::{Caller, Role};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::new("not_authorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// A sub-score field: required, finite, non-negative.
pub fn required_score(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    let value = params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing numeric {}", key)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be a non-negative number", key),
            details: Some(json!({ key: value })),
        });
    }
    Ok(value)
}

/// Transport-resolved identity, required on every authorized method.
pub fn caller(params: &serde_json::Value) -> Result<Caller, HandlerErr> {
    let raw = params
        .get("caller")
        .ok_or_else(|| HandlerErr::new("bad_params", "missing caller"))?;
    let user_id = raw
        .get("userId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing caller.userId"))?;
    let role_str = raw
        .get("role")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing caller.role"))?;
    let role = Role::parse(role_str).ok_or_else(|| HandlerErr {
        code: "not_authorized",
        message: "unknown role".to_string(),
        details: Some(json!({ "role": role_str })),
    })?;
    Ok(Caller {
        user_id: user_id.to_string(),
        role,
    })
}

/// Year scope for a request: the explicit academicYearId param when present,
/// otherwise the single active year. No ambient fallback beyond that.
pub fn resolve_year(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<YearRow, HandlerErr> {
    if let Some(year_id) = optional_str(params, "academicYearId") {
        let row = conn
            .query_row(
                "SELECT id, name FROM academic_years WHERE id = ?",
                [&year_id],
                |r| {
                    Ok(YearRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(HandlerErr::db)?;
        return row.ok_or_else(|| HandlerErr::not_found("academic year not found"));
    }
    db::active_year(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("no_active_year", "no active academic year set"))
}

#[derive(Debug, Clone)]
pub struct PeriodRow {
    pub id: String,
    pub name: String,
}

pub fn period_by_id(conn: &Connection, period_id: &str) -> Result<PeriodRow, HandlerErr> {
    conn.query_row(
        "SELECT id, name FROM periods WHERE id = ?",
        [period_id],
        |r| {
            Ok(PeriodRow {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::not_found("period not found"))
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub class_id: String,
    pub academic_year_id: String,
    pub full_name: String,
    pub user_id: Option<String>,
    pub parent_user_id: Option<String>,
    pub status: String,
}

pub fn student_by_id(conn: &Connection, student_id: &str) -> Result<StudentRow, HandlerErr> {
    conn.query_row(
        "SELECT id, class_id, academic_year_id, full_name, user_id, parent_user_id, status
         FROM students
         WHERE id = ?",
        [student_id],
        |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                class_id: r.get(1)?,
                academic_year_id: r.get(2)?,
                full_name: r.get(3)?,
                user_id: r.get(4)?,
                parent_user_id: r.get(5)?,
                status: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::not_found("student not found"))
}

pub fn class_name(conn: &Connection, class_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT name FROM grade_classes WHERE id = ?",
        [class_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::not_found("grade class not found"))
}

pub fn teacher_assigned_to(
    conn: &Connection,
    teacher_user_id: &str,
    class_id: &str,
    subject_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let found: Option<i64> = match subject_id {
        Some(subject_id) => conn
            .query_row(
                "SELECT 1 FROM teacher_assignments
                 WHERE teacher_user_id = ? AND class_id = ? AND subject_id = ?",
                (teacher_user_id, class_id, subject_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db)?,
        None => conn
            .query_row(
                "SELECT 1 FROM teacher_assignments
                 WHERE teacher_user_id = ? AND class_id = ?
                 LIMIT 1",
                (teacher_user_id, class_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db)?,
    };
    Ok(found.is_some())
}

/// Final scores of every ScoreRecord for one student+period+year, in subject
/// name order.
pub fn final_scores_for(
    conn: &Connection,
    student_id: &str,
    period_id: &str,
    year_id: &str,
) -> Result<Vec<f64>, HandlerErr> {
    let rows = subject_rows_for(conn, student_id, period_id, year_id)?;
    Ok(rows.into_iter().map(|(_, score)| score).collect())
}

/// (subject name, final score) pairs for one student+period+year.
pub fn subject_rows_for(
    conn: &Connection,
    student_id: &str,
    period_id: &str,
    year_id: &str,
) -> Result<Vec<(String, f64)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT sub.name, sr.quiz + sr.assignment + sr.participation + sr.test
             FROM score_records sr
             JOIN subjects sub ON sub.id = sr.subject_id
             WHERE sr.student_id = ? AND sr.period_id = ? AND sr.academic_year_id = ?
             ORDER BY sub.name",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map((student_id, period_id, year_id), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

pub fn enqueue_notification(
    conn: &Connection,
    user_id: &str,
    message: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO notifications_outbox(id, user_id, message, created_at, delivered)
         VALUES(?, ?, ?, ?, 0)",
        (new_id(), user_id, message, now()),
    )
    .map_err(HandlerErr::db)?;
    Ok(())
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now() -> String {
    Utc::now().to_rfc3339()
}
