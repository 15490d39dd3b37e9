use crate::ipc::error::ok;
use crate::ipc::helpers::{
    class_name, db_conn, new_id, optional_str, required_str, resolve_year, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

// Minimal roster surface. Identity, admissions and teacher data live in
// external collaborators; the daemon keeps just enough membership to scope
// scores, averages and reports.

fn create_named_row(
    state: &AppState,
    req: &Request,
    table: &str,
    id_key: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let name = required_str(&req.params, "name")?;
    let row_id = new_id();
    let sql = format!("INSERT OR IGNORE INTO {}(id, name) VALUES(?, ?)", table);
    match conn.execute(&sql, (&row_id, &name)) {
        Ok(1) => Ok(json!({ id_key: row_id, "name": name })),
        Ok(_) => Err(HandlerErr::new("conflict", "name already exists")),
        Err(e) => Err(HandlerErr::db(e)),
    }
}

fn list_named_rows(
    state: &AppState,
    table: &str,
    id_key: &str,
    list_key: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let sql = format!("SELECT id, name FROM {} ORDER BY name", table);
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                id_key: r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ list_key: rows }))
}

fn handle_periods_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare("SELECT id, name, sort_order FROM periods ORDER BY sort_order")
        .map_err(HandlerErr::db)?;
    let periods = stmt
        .query_map([], |r| {
            Ok(json!({
                "periodId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "sortOrder": r.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "periods": periods }))
}

fn handle_students_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let full_name = required_str(&req.params, "fullName")?;
    let user_id = optional_str(&req.params, "userId");
    let parent_user_id = optional_str(&req.params, "parentUserId");
    let year = resolve_year(conn, &req.params)?;

    class_name(conn, &class_id)?;

    let student_id = new_id();
    conn.execute(
        "INSERT INTO students(id, class_id, academic_year_id, full_name, user_id, parent_user_id, status)
         VALUES(?, ?, ?, ?, ?, ?, 'enrolled')",
        (
            &student_id,
            &class_id,
            &year.id,
            &full_name,
            &user_id,
            &parent_user_id,
        ),
    )
    .map_err(HandlerErr::db)?;
    Ok(json!({ "studentId": student_id, "academicYearId": year.id }))
}

fn handle_students_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let year = resolve_year(conn, &req.params)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, full_name, user_id, parent_user_id, status
             FROM students
             WHERE class_id = ? AND academic_year_id = ?
             ORDER BY full_name",
        )
        .map_err(HandlerErr::db)?;
    let students = stmt
        .query_map((&class_id, &year.id), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "userId": r.get::<_, Option<String>>(2)?,
                "parentUserId": r.get::<_, Option<String>>(3)?,
                "status": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "students": students, "academicYearId": year.id }))
}

fn handle_teachers_assign(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let teacher_user_id = required_str(&req.params, "teacherUserId")?;
    let class_id = required_str(&req.params, "classId")?;
    let subject_id = required_str(&req.params, "subjectId")?;

    class_name(conn, &class_id)?;
    conn.execute(
        "INSERT OR IGNORE INTO teacher_assignments(teacher_user_id, class_id, subject_id)
         VALUES(?, ?, ?)",
        (&teacher_user_id, &class_id, &subject_id),
    )
    .map_err(HandlerErr::db)?;
    Ok(json!({ "assigned": true }))
}

fn handle_teachers_assignments(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let teacher_user_id = required_str(&req.params, "teacherUserId")?;
    let mut stmt = conn
        .prepare(
            "SELECT ta.class_id, gc.name, ta.subject_id, sub.name
             FROM teacher_assignments ta
             JOIN grade_classes gc ON gc.id = ta.class_id
             JOIN subjects sub ON sub.id = ta.subject_id
             WHERE ta.teacher_user_id = ?
             ORDER BY gc.name, sub.name",
        )
        .map_err(HandlerErr::db)?;
    let assignments = stmt
        .query_map([&teacher_user_id], |r| {
            Ok(json!({
                "classId": r.get::<_, String>(0)?,
                "className": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "subjectName": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "assignments": assignments }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.create" => create_named_row(state, req, "grade_classes", "classId"),
        "classes.list" => list_named_rows(state, "grade_classes", "classId", "classes"),
        "subjects.create" => create_named_row(state, req, "subjects", "subjectId"),
        "subjects.list" => list_named_rows(state, "subjects", "subjectId", "subjects"),
        "periods.list" => handle_periods_list(state),
        "students.create" => handle_students_create(state, req),
        "students.list" => handle_students_list(state, req),
        "teachers.assign" => handle_teachers_assign(state, req),
        "teachers.assignments" => handle_teachers_assignments(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
