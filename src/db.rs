use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct YearRow {
    pub id: String,
    pub name: String,
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("reportcard.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    seed_periods(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            full_name TEXT NOT NULL,
            user_id TEXT,
            parent_user_id TEXT,
            status TEXT NOT NULL DEFAULT 'enrolled',
            FOREIGN KEY(class_id) REFERENCES grade_classes(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_year ON students(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_assignments(
            teacher_user_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(teacher_user_id, class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES grade_classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_assignments_teacher
         ON teacher_assignments(teacher_user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_records(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            quiz REAL NOT NULL DEFAULT 0,
            assignment REAL NOT NULL DEFAULT 0,
            participation REAL NOT NULL DEFAULT 0,
            test REAL NOT NULL DEFAULT 0,
            teacher_may_edit INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(class_id) REFERENCES grade_classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(period_id) REFERENCES periods(id),
            UNIQUE(student_id, subject_id, period_id, academic_year_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_records_student_period
         ON score_records(student_id, period_id, academic_year_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_records_class_period
         ON score_records(class_id, period_id, academic_year_id)",
        [],
    )?;

    // One logical row per (student, period, year); duplicates are tolerated
    // as history and collapsed by created_at at report time.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS period_averages(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            published INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(class_id) REFERENCES grade_classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(period_id) REFERENCES periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_period_averages_period_year
         ON period_averages(period_id, academic_year_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_period_averages_student
         ON period_averages(student_id)",
        [],
    )?;

    // Outbound notification queue. The publish workflow writes here inside
    // its transaction; a worker drains rows and delivery stays best-effort.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications_outbox(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            delivered INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_outbox_undelivered
         ON notifications_outbox(delivered, created_at)",
        [],
    )?;

    ensure_score_records_teacher_may_edit(&conn)?;

    Ok(conn)
}

/// The eight standard grading checkpoints. Semester one closes with "Exam",
/// semester two with "Examm".
const STANDARD_PERIODS: [&str; 8] = [
    "Period 1", "Period 2", "Period 3", "Exam", "Period 4", "Period 5", "Period 6", "Examm",
];

fn seed_periods(conn: &Connection) -> anyhow::Result<()> {
    for (i, name) in STANDARD_PERIODS.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO periods(id, name, sort_order) VALUES(?, ?, ?)",
            (format!("period-{}", i + 1), *name, i as i64),
        )?;
    }
    Ok(())
}

/// Explicit lookup of the single active academic year, if any. Writes that
/// omit a year default to this; the schema-level invariant (at most one
/// active) is maintained by years.activate flipping the rest off in one
/// transaction.
pub fn active_year(conn: &Connection) -> anyhow::Result<Option<YearRow>> {
    let row = conn
        .query_row(
            "SELECT id, name FROM academic_years WHERE is_active = 1 LIMIT 1",
            [],
            |r| {
                Ok(YearRow {
                    id: r.get(0)?,
                    name: r.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn ensure_score_records_teacher_may_edit(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "score_records", "teacher_may_edit")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE score_records ADD COLUMN teacher_may_edit INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
