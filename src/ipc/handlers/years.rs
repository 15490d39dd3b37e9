use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{db_conn, new_id, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = db_conn(state)?;
        let name = required_str(&req.params, "name")?;
        let start_date = required_str(&req.params, "startDate")?;
        let end_date = required_str(&req.params, "endDate")?;
        if start_date >= end_date {
            return Err(HandlerErr::new(
                "bad_params",
                "startDate must be before endDate",
            ));
        }

        let year_id = new_id();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO academic_years(id, name, start_date, end_date, is_active)
             VALUES(?, ?, ?, ?, 0)",
            (&year_id, &name, &start_date, &end_date),
        );
        match inserted {
            Ok(1) => Ok(json!({ "yearId": year_id, "name": name })),
            Ok(_) => Err(HandlerErr::new("conflict", "academic year name already exists")),
            Err(e) => Err(HandlerErr::db(e)),
        }
    };
    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

// Activation flips every other year off in the same transaction, keeping the
// at-most-one-active invariant.
fn handle_years_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = db_conn(state)?;
        let year_id = required_str(&req.params, "yearId")?;

        let tx = conn.unchecked_transaction().map_err(HandlerErr::db)?;
        tx.execute("UPDATE academic_years SET is_active = 0", [])
            .map_err(HandlerErr::db)?;
        let changed = tx
            .execute(
                "UPDATE academic_years SET is_active = 1 WHERE id = ?",
                [&year_id],
            )
            .map_err(HandlerErr::db)?;
        if changed == 0 {
            return Err(HandlerErr::not_found("academic year not found"));
        }
        tx.commit().map_err(HandlerErr::db)?;
        Ok(json!({ "yearId": year_id, "active": true }))
    };
    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = db_conn(state)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, start_date, end_date, is_active
                 FROM academic_years
                 ORDER BY start_date",
            )
            .map_err(HandlerErr::db)?;
        let years = stmt
            .query_map([], |r| {
                Ok(json!({
                    "yearId": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "startDate": r.get::<_, String>(2)?,
                    "endDate": r.get::<_, String>(3)?,
                    "isActive": r.get::<_, i64>(4)? != 0,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?;
        Ok(json!({ "years": years }))
    };
    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_years_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let conn = db_conn(state)?;
        let year = db::active_year(conn)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        Ok(match year {
            Some(y) => json!({ "year": { "yearId": y.id, "name": y.name } }),
            None => json!({ "year": null }),
        })
    };
    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_years_create(state, req)),
        "years.activate" => Some(handle_years_activate(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "years.active" => Some(handle_years_active(state, req)),
        _ => None,
    }
}
