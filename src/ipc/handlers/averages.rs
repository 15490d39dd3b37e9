use crate::calc;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    caller, class_name, db_conn, final_scores_for, new_id, now, period_by_id, required_str,
    resolve_year, student_by_id, subject_rows_for, teacher_assigned_to, HandlerErr, StudentRow,
};
use crate::ipc::types::{AppState, Request};
use crate::roles::Capability;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

pub fn enrolled_students(
    conn: &Connection,
    class_id: &str,
    year_id: &str,
) -> Result<Vec<StudentRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, class_id, academic_year_id, full_name, user_id, parent_user_id, status
             FROM students
             WHERE class_id = ? AND academic_year_id = ? AND status = 'enrolled'
             ORDER BY full_name",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map((class_id, year_id), |r| {
        Ok(StudentRow {
            id: r.get(0)?,
            class_id: r.get(1)?,
            academic_year_id: r.get(2)?,
            full_name: r.get(3)?,
            user_id: r.get(4)?,
            parent_user_id: r.get(5)?,
            status: r.get(6)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

/// Tie-aware ranks for every enrolled student of a class+period+year, keyed
/// by student id. The metric is the period average recomputed from raw
/// score records.
pub fn class_period_ranks(
    conn: &Connection,
    class_id: &str,
    period_id: &str,
    year_id: &str,
) -> Result<HashMap<String, i64>, HandlerErr> {
    let students = enrolled_students(conn, class_id, year_id)?;
    let mut metric: Vec<(String, f64)> = Vec::with_capacity(students.len());
    for student in &students {
        let scores = final_scores_for(conn, &student.id, period_id, year_id)?;
        metric.push((student.id.clone(), calc::mean(&scores)));
    }
    Ok(calc::rank_dense(&metric))
}

/// Latest period-average row for a student+period+year, if any: (id, published).
pub fn latest_average_row(
    conn: &Connection,
    student_id: &str,
    period_id: &str,
    year_id: &str,
) -> Result<Option<(String, bool)>, HandlerErr> {
    conn.query_row(
        "SELECT id, published FROM period_averages
         WHERE student_id = ? AND period_id = ? AND academic_year_id = ?
         ORDER BY created_at DESC, id DESC
         LIMIT 1",
        (student_id, period_id, year_id),
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0)),
    )
    .optional()
    .map_err(HandlerErr::db)
}

fn handle_averages_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = caller(&req.params)?;
    let student_id = required_str(&req.params, "studentId")?;
    let period_id = required_str(&req.params, "periodId")?;
    let year = resolve_year(conn, &req.params)?;
    let period = period_by_id(conn, &period_id)?;
    let student = student_by_id(conn, &student_id)?;

    let row = latest_average_row(conn, &student.id, &period.id, &year.id)?;
    let Some((_, published)) = row else {
        return Err(HandlerErr::not_found("no period average for this student"));
    };

    // Students and parents never see anyone else's row, and never an
    // unpublished one. Both cases read as absent rather than leaking.
    match who.capability() {
        Capability::AdminTier => {}
        Capability::Teacher => {
            if !teacher_assigned_to(conn, &who.user_id, &student.class_id, None)? {
                return Err(HandlerErr::not_authorized(
                    "teacher is not assigned to this student's class",
                ));
            }
        }
        Capability::Student => {
            if student.user_id.as_deref() != Some(who.user_id.as_str()) || !published {
                return Err(HandlerErr::not_found("no period average for this student"));
            }
        }
        Capability::Parent => {
            if student.parent_user_id.as_deref() != Some(who.user_id.as_str()) || !published {
                return Err(HandlerErr::not_found("no period average for this student"));
            }
        }
        Capability::Other => {
            return Err(HandlerErr::not_authorized(
                "role may not read period averages",
            ));
        }
    }

    let scores = final_scores_for(conn, &student.id, &period.id, &year.id)?;
    let average = calc::mean(&scores);
    let subject_rows = subject_rows_for(conn, &student.id, &period.id, &year.id)?;
    let subjects: Vec<calc::SubjectLine> = calc::subject_lines(&subject_rows).collect();
    let ranks = class_period_ranks(conn, &student.class_id, &period.id, &year.id)?;

    Ok(json!({
        "studentId": student.id,
        "studentName": student.full_name,
        "classId": student.class_id,
        "periodId": period.id,
        "periodName": period.name,
        "academicYearId": year.id,
        "published": published,
        "average": calc::round_off_2_decimals(average),
        "remark": calc::classify(average),
        "rank": ranks.get(&student.id).copied(),
        "subjects": subjects,
    }))
}

// Builds the class report: makes sure one PeriodAverage row exists per
// enrolled student, then returns each student's computed average, remark and
// tie-aware class rank.
fn handle_averages_class_report(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = caller(&req.params)?;
    let class_id = required_str(&req.params, "classId")?;
    let period_id = required_str(&req.params, "periodId")?;
    let year = resolve_year(conn, &req.params)?;
    let period = period_by_id(conn, &period_id)?;
    let class = class_name(conn, &class_id)?;

    match who.capability() {
        Capability::AdminTier => {}
        Capability::Teacher => {
            if !teacher_assigned_to(conn, &who.user_id, &class_id, None)? {
                return Err(HandlerErr::not_authorized(
                    "teacher is not assigned to this class",
                ));
            }
        }
        _ => {
            return Err(HandlerErr::not_authorized(
                "role may not build class reports",
            ));
        }
    }

    let students = enrolled_students(conn, &class_id, &year.id)?;
    if students.is_empty() {
        return Err(HandlerErr::not_found(
            "no enrolled students in this grade class for the selected year",
        ));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db)?;
    for student in &students {
        let existing = latest_average_row(&tx, &student.id, &period.id, &year.id)?;
        if existing.is_none() {
            tx.execute(
                "INSERT INTO period_averages(
                    id, academic_year_id, class_id, student_id, period_id, published, created_at)
                 VALUES(?, ?, ?, ?, ?, 0, ?)",
                (
                    new_id(),
                    &year.id,
                    &class_id,
                    &student.id,
                    &period.id,
                    now(),
                ),
            )
            .map_err(HandlerErr::db)?;
        }
    }
    tx.commit().map_err(HandlerErr::db)?;

    let ranks = class_period_ranks(conn, &class_id, &period.id, &year.id)?;
    let mut rows = Vec::with_capacity(students.len());
    for student in &students {
        let (average_id, published) = latest_average_row(conn, &student.id, &period.id, &year.id)?
            .ok_or_else(|| HandlerErr::not_found("period average row missing"))?;
        let scores = final_scores_for(conn, &student.id, &period.id, &year.id)?;
        let average = calc::mean(&scores);
        rows.push(json!({
            "averageId": average_id,
            "studentId": student.id,
            "studentName": student.full_name,
            "average": calc::round_off_2_decimals(average),
            "remark": calc::classify(average),
            "rank": ranks.get(&student.id).copied(),
            "published": published,
        }));
    }
    rows.sort_by_key(|row| {
        (
            row.get("rank").and_then(|v| v.as_i64()).unwrap_or(i64::MAX),
            row.get("studentName")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        )
    });

    Ok(json!({
        "classId": class_id,
        "className": class,
        "periodId": period.id,
        "periodName": period.name,
        "academicYearId": year.id,
        "students": rows,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "averages.get" => handle_averages_get(state, req),
        "averages.classReport" => handle_averages_class_report(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
