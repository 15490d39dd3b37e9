use crate::calc;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    caller, class_name, db_conn, period_by_id, required_str, resolve_year, student_by_id,
    teacher_assigned_to, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roles::Capability;
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;

use super::averages::enrolled_students;

/// Published averages for one class+period+year, collapsed to the
/// latest-created row per student: (student_id, student_name, average).
fn published_rows_for_class(
    conn: &Connection,
    class_id: &str,
    period_id: &str,
    year_id: &str,
) -> Result<Vec<(String, String, f64)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT pa.student_id, st.full_name
             FROM period_averages pa
             JOIN students st ON st.id = pa.student_id
             WHERE pa.class_id = ? AND pa.period_id = ? AND pa.academic_year_id = ?
               AND pa.published = 1
             ORDER BY pa.created_at DESC, pa.id DESC",
        )
        .map_err(HandlerErr::db)?;
    let raw: Vec<(String, String)> = stmt
        .query_map((class_id, period_id, year_id), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut rows = Vec::new();
    for (student_id, full_name) in raw {
        if !seen.insert(student_id.clone()) {
            continue;
        }
        let scores =
            crate::ipc::helpers::final_scores_for(conn, &student_id, period_id, year_id)?;
        rows.push((student_id, full_name, calc::mean(&scores)));
    }
    Ok(rows)
}

fn handle_reports_academic(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let period_id = required_str(&req.params, "periodId")?;
    let year = resolve_year(conn, &req.params)?;
    let class = class_name(conn, &class_id)?;
    let period = period_by_id(conn, &period_id)?;

    let rows = published_rows_for_class(conn, &class_id, &period.id, &year.id)?;
    let report = calc::compose_academic_report(class, period.name, rows);
    Ok(serde_json::to_value(report).unwrap_or_else(|_| json!({})))
}

// Sequential per class; each class's composition is independent and
// read-only.
fn handle_reports_academic_all(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let period_id = required_str(&req.params, "periodId")?;
    let year = resolve_year(conn, &req.params)?;
    let period = period_by_id(conn, &period_id)?;

    let mut stmt = conn
        .prepare("SELECT id, name FROM grade_classes ORDER BY name")
        .map_err(HandlerErr::db)?;
    let classes: Vec<(String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut reports = Vec::with_capacity(classes.len());
    for (class_id, name) in classes {
        let rows = published_rows_for_class(conn, &class_id, &period.id, &year.id)?;
        let report = calc::compose_academic_report(name, period.name.clone(), rows);
        reports.push(serde_json::to_value(report).unwrap_or_else(|_| json!({})));
    }
    Ok(json!({ "reports": reports }))
}

/// Flat mean of final scores over every raw record whose period falls in the
/// semester window. Not a mean of period averages: unevenly filled periods
/// must not be re-weighted.
fn semester_average(
    conn: &Connection,
    student_id: &str,
    year_id: &str,
    semester: i64,
) -> Result<f64, HandlerErr> {
    let Some(window) = calc::semester_periods(semester) else {
        return Err(HandlerErr::new("bad_params", "semester must be 1 or 2"));
    };
    let mut stmt = conn
        .prepare(
            "SELECT sr.quiz + sr.assignment + sr.participation + sr.test
             FROM score_records sr
             JOIN periods p ON p.id = sr.period_id
             WHERE sr.student_id = ? AND sr.academic_year_id = ?
               AND p.name IN (?, ?, ?, ?)",
        )
        .map_err(HandlerErr::db)?;
    let scores: Vec<f64> = stmt
        .query_map(
            (student_id, year_id, window[0], window[1], window[2], window[3]),
            |r| r.get(0),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(calc::mean(&scores))
}

fn yearly_average_for(
    conn: &Connection,
    student_id: &str,
    year_id: &str,
) -> Result<f64, HandlerErr> {
    let first = semester_average(conn, student_id, year_id, 1)?;
    let second = semester_average(conn, student_id, year_id, 2)?;
    Ok(calc::yearly_average(first, second))
}

fn handle_reports_yearly(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = caller(&req.params)?;
    let student_id = required_str(&req.params, "studentId")?;
    let year = resolve_year(conn, &req.params)?;
    let student = student_by_id(conn, &student_id)?;

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
            if student.user_id.as_deref() != Some(who.user_id.as_str()) {
                return Err(HandlerErr::not_authorized(
                    "students may only read their own yearly report",
                ));
            }
        }
        Capability::Parent => {
            if student.parent_user_id.as_deref() != Some(who.user_id.as_str()) {
                return Err(HandlerErr::not_authorized(
                    "parents may only read their own child's yearly report",
                ));
            }
        }
        Capability::Other => {
            return Err(HandlerErr::not_authorized(
                "role may not read yearly reports",
            ));
        }
    }

    let first_semester = semester_average(conn, &student.id, &year.id, 1)?;
    let second_semester = semester_average(conn, &student.id, &year.id, 2)?;
    let yearly = calc::yearly_average(first_semester, second_semester);

    // Ranks over every enrolled classmate, tie-aware at each grain.
    let classmates = enrolled_students(conn, &student.class_id, &year.id)?;
    let mut yearly_metric = Vec::with_capacity(classmates.len());
    let mut sem1_metric = Vec::with_capacity(classmates.len());
    let mut sem2_metric = Vec::with_capacity(classmates.len());
    for classmate in &classmates {
        yearly_metric.push((
            classmate.id.clone(),
            yearly_average_for(conn, &classmate.id, &year.id)?,
        ));
        sem1_metric.push((
            classmate.id.clone(),
            semester_average(conn, &classmate.id, &year.id, 1)?,
        ));
        sem2_metric.push((
            classmate.id.clone(),
            semester_average(conn, &classmate.id, &year.id, 2)?,
        ));
    }
    let yearly_ranks = calc::rank_dense(&yearly_metric);
    let sem1_ranks = calc::rank_dense(&sem1_metric);
    let sem2_ranks = calc::rank_dense(&sem2_metric);

    // Per-subject lines across the whole year, each with its period average.
    let mut stmt = conn
        .prepare(
            "SELECT sub.name, p.name, p.id,
                    sr.quiz + sr.assignment + sr.participation + sr.test
             FROM score_records sr
             JOIN subjects sub ON sub.id = sr.subject_id
             JOIN periods p ON p.id = sr.period_id
             WHERE sr.student_id = ? AND sr.academic_year_id = ?
             ORDER BY p.sort_order, sub.name",
        )
        .map_err(HandlerErr::db)?;
    let lines: Vec<(String, String, String, f64)> = stmt
        .query_map((&student.id, &year.id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    let mut grades = Vec::with_capacity(lines.len());
    for (subject_name, period_name, line_period_id, final_score) in lines {
        let period_scores =
            crate::ipc::helpers::final_scores_for(conn, &student.id, &line_period_id, &year.id)?;
        grades.push(json!({
            "subjectName": subject_name,
            "periodName": period_name,
            "finalScore": final_score,
            "periodAverage": calc::round_off_2_decimals(calc::mean(&period_scores)),
        }));
    }

    Ok(json!({
        "studentId": student.id,
        "studentName": student.full_name,
        "classId": student.class_id,
        "academicYearId": year.id,
        "firstSemesterAverage": calc::round_off_2_decimals(first_semester),
        "secondSemesterAverage": calc::round_off_2_decimals(second_semester),
        "yearlyAverage": calc::round_off_2_decimals(yearly),
        "firstSemesterRank": sem1_ranks.get(&student.id).copied(),
        "secondSemesterRank": sem2_ranks.get(&student.id).copied(),
        "yearlyRank": yearly_ranks.get(&student.id).copied(),
        "remark": calc::classify(yearly),
        "grades": grades,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.academic" => handle_reports_academic(state, req),
        "reports.academicAll" => handle_reports_academic_all(state, req),
        "reports.yearly" => handle_reports_yearly(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
