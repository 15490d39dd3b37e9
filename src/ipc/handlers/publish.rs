use crate::ipc::error::ok;
use crate::ipc::helpers::{
    caller, db_conn, enqueue_notification, period_by_id, required_str, resolve_year, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roles::{Capability, Role};
use rusqlite::Connection;
use serde_json::json;

fn scope_row_count(
    conn: &Connection,
    period_id: &str,
    year_id: &str,
) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM period_averages
         WHERE period_id = ? AND academic_year_id = ?",
        (period_id, year_id),
        |r| r.get(0),
    )
    .map_err(HandlerErr::db)
}

// Publish moves every unpublished average in the (period, year) scope to
// Published and enqueues one outbox notification per affected enrolled
// student, all inside a single transaction. A second publish flips nothing
// and therefore notifies nobody.
fn handle_grades_publish(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = caller(&req.params)?;
    if who.capability() != Capability::AdminTier {
        return Err(HandlerErr::not_authorized(
            "only admin-tier roles may publish grades",
        ));
    }
    let period_id = required_str(&req.params, "periodId")?;
    let year = resolve_year(conn, &req.params)?;
    let period = period_by_id(conn, &period_id)?;

    if scope_row_count(conn, &period.id, &year.id)? == 0 {
        return Err(HandlerErr::not_found(
            "no period averages exist for the selected period",
        ));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db)?;

    // Affected students: distinct, enrolled in the year, flipped by this call.
    let affected_user_ids: Vec<String> = {
        let mut stmt = tx
            .prepare(
                "SELECT DISTINCT st.user_id
                 FROM period_averages pa
                 JOIN students st ON st.id = pa.student_id
                 WHERE pa.period_id = ? AND pa.academic_year_id = ? AND pa.published = 0
                   AND st.academic_year_id = ? AND st.status = 'enrolled'
                   AND st.user_id IS NOT NULL",
            )
            .map_err(HandlerErr::db)?;
        stmt.query_map((&period.id, &year.id, &year.id), |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?
    };

    let flipped = tx
        .execute(
            "UPDATE period_averages SET published = 1
             WHERE period_id = ? AND academic_year_id = ? AND published = 0",
            (&period.id, &year.id),
        )
        .map_err(HandlerErr::db)?;

    let message = format!(
        "Grades for {} have been published. Check your Grade Report.",
        period.name
    );
    for user_id in &affected_user_ids {
        enqueue_notification(&tx, user_id, &message)?;
    }
    tx.commit().map_err(HandlerErr::db)?;

    Ok(json!({
        "periodId": period.id,
        "academicYearId": year.id,
        "published": flipped,
        "notified": affected_user_ids.len(),
    }))
}

// Stricter than publish: the admin role itself, not the admin tier. Already
// delivered notifications are not retracted.
fn handle_grades_unpublish(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = caller(&req.params)?;
    if who.role != Role::Admin {
        return Err(HandlerErr::not_authorized(
            "only the admin role may unpublish grades",
        ));
    }
    let period_id = required_str(&req.params, "periodId")?;
    let year = resolve_year(conn, &req.params)?;
    let period = period_by_id(conn, &period_id)?;

    if scope_row_count(conn, &period.id, &year.id)? == 0 {
        return Err(HandlerErr::not_found(
            "no period averages exist for the selected period",
        ));
    }

    let flipped = conn
        .execute(
            "UPDATE period_averages SET published = 0
             WHERE period_id = ? AND academic_year_id = ? AND published = 1",
            (&period.id, &year.id),
        )
        .map_err(HandlerErr::db)?;

    Ok(json!({
        "periodId": period.id,
        "academicYearId": year.id,
        "unpublished": flipped,
    }))
}

// Worker pull for the outbox. Rows are marked delivered as they are handed
// out; a failed downstream delivery is the worker's problem, never the
// publisher's.
fn handle_notifications_drain(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let max = req
        .params
        .get("max")
        .and_then(|v| v.as_i64())
        .unwrap_or(100)
        .clamp(1, 1000);

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db)?;
    let batch: Vec<(String, String, String, String)> = {
        let mut stmt = tx
            .prepare(
                "SELECT id, user_id, message, created_at FROM notifications_outbox
                 WHERE delivered = 0
                 ORDER BY created_at, id
                 LIMIT ?",
            )
            .map_err(HandlerErr::db)?;
        stmt.query_map([max], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?
    };
    for (id, _, _, _) in &batch {
        tx.execute(
            "UPDATE notifications_outbox SET delivered = 1 WHERE id = ?",
            [id],
        )
        .map_err(HandlerErr::db)?;
    }
    tx.commit().map_err(HandlerErr::db)?;

    let notifications: Vec<serde_json::Value> = batch
        .into_iter()
        .map(|(id, user_id, message, created_at)| {
            json!({
                "notificationId": id,
                "userId": user_id,
                "message": message,
                "createdAt": created_at,
            })
        })
        .collect();
    Ok(json!({ "notifications": notifications }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.publish" => handle_grades_publish(state, req),
        "grades.unpublish" => handle_grades_unpublish(state, req),
        "notifications.drain" => handle_notifications_drain(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
