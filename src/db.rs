use std::path::Path;

use anyhow::Result;
use rusqlite::Connection;

use crate::normalize::CanonicalRecord;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS students (
            id               INTEGER PRIMARY KEY,
            roll_number      TEXT NOT NULL,
            student_name     TEXT NOT NULL,
            institution_name TEXT NOT NULL,
            gpa              TEXT NOT NULL,
            total_marks      INTEGER NOT NULL DEFAULT 0,
            board            TEXT,
            father_name      TEXT,
            group_name       TEXT,
            mother_name      TEXT,
            year             TEXT NOT NULL,
            exam_type        TEXT NOT NULL,
            session_year     TEXT,
            registration_id  TEXT,
            student_type     TEXT,
            date_of_birth    TEXT,
            subject_marks    TEXT NOT NULL DEFAULT '{}',
            created_at       TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(roll_number, exam_type, year)
        );
        CREATE INDEX IF NOT EXISTS idx_students_exam_type ON students(exam_type);
        CREATE INDEX IF NOT EXISTS idx_students_year ON students(year);
        CREATE INDEX IF NOT EXISTS idx_students_institution_name ON students(institution_name);
        CREATE INDEX IF NOT EXISTS idx_students_total_marks ON students(total_marks DESC);
        CREATE INDEX IF NOT EXISTS idx_students_roll_number ON students(roll_number);
        CREATE INDEX IF NOT EXISTS idx_students_student_name ON students(student_name);
        CREATE INDEX IF NOT EXISTS idx_students_institution_total_marks
            ON students(institution_name, total_marks DESC);
        ",
    )?;
    Ok(())
}

// ── Import ──

/// Insert records in one transaction. Rows whose (roll, exam type, year) already exist are left untouched.
pub fn upsert_students(conn: &Connection, rows: &[CanonicalRecord]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO students
             (roll_number, student_name, institution_name, gpa, total_marks,
              board, father_name, group_name, mother_name, year, exam_type, session_year,
              registration_id, student_type, date_of_birth, subject_marks)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
        )?;
        for r in rows {
            let marks = serde_json::to_string(&r.subject_marks)?;
            count += stmt.execute(rusqlite::params![
                r.roll_number, r.student_name, r.institution_name, r.gpa, r.total_marks,
                r.board, r.father_name, r.group_name, r.mother_name, r.year, r.exam_type,
                r.session_year, r.registration_id, r.student_type, r.date_of_birth, marks,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub fn count_students(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?;
    Ok(n as usize)
}

/// Every stored exam for one roll number, newest year first.
pub fn fetch_student(conn: &Connection, roll_number: &str) -> Result<Vec<CanonicalRecord>> {
    let mut stmt = conn.prepare(
        "SELECT roll_number, student_name, institution_name, gpa, total_marks,
                COALESCE(board, ''), COALESCE(father_name, ''), COALESCE(group_name, ''),
                COALESCE(mother_name, ''), COALESCE(session_year, ''),
                COALESCE(registration_id, ''), COALESCE(student_type, ''),
                COALESCE(date_of_birth, ''), exam_type, year, subject_marks
         FROM students WHERE roll_number = ?1
         ORDER BY year DESC, exam_type",
    )?;
    let rows = stmt
        .query_map([roll_number], |row| {
            let marks: String = row.get(15)?;
            Ok((
                CanonicalRecord {
                    roll_number: row.get(0)?,
                    student_name: row.get(1)?,
                    institution_name: row.get(2)?,
                    gpa: row.get(3)?,
                    total_marks: row.get(4)?,
                    board: row.get(5)?,
                    father_name: row.get(6)?,
                    group_name: row.get(7)?,
                    mother_name: row.get(8)?,
                    session_year: row.get(9)?,
                    registration_id: row.get(10)?,
                    student_type: row.get(11)?,
                    date_of_birth: row.get(12)?,
                    exam_type: row.get(13)?,
                    year: row.get(14)?,
                    subject_marks: Default::default(),
                },
                marks,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (mut rec, marks) in rows {
        rec.subject_marks = serde_json::from_str(&marks)?;
        out.push(rec);
    }
    Ok(out)
}

// ── Ranking ──

#[derive(Debug, Default)]
pub struct RankQuery {
    pub search: Option<String>,
    pub institution: Option<String>,
    pub year: Option<String>,
    pub exam_type: Option<String>,
    /// Rank within each institution instead of across the whole exam.
    pub by_institution: bool,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug)]
pub struct RankRow {
    pub rank: i64,
    pub roll_number: String,
    pub student_name: String,
    pub institution_name: String,
    pub gpa: String,
    pub total_marks: u32,
    pub group_name: String,
}

/// Dense rank by total marks. Exam and year filters scope the ranking;
/// search and institution filters only narrow the rows shown.
pub fn fetch_ranking(conn: &Connection, q: &RankQuery) -> Result<Vec<RankRow>> {
    let mut inner = Vec::new();
    let mut outer = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(y) = &q.year {
        inner.push(format!("year = ?{}", params.len() + 1));
        params.push(Box::new(y.clone()));
    }
    if let Some(e) = &q.exam_type {
        inner.push(format!("exam_type = ?{}", params.len() + 1));
        params.push(Box::new(e.clone()));
    }
    if let Some(s) = &q.search {
        let n = params.len() + 1;
        outer.push(format!(
            "(LOWER(student_name) LIKE ?{n} OR LOWER(roll_number) LIKE ?{n} OR LOWER(institution_name) LIKE ?{n})"
        ));
        params.push(Box::new(format!("%{}%", s.to_lowercase())));
    }
    if let Some(i) = &q.institution {
        outer.push(format!("LOWER(institution_name) = LOWER(?{})", params.len() + 1));
        params.push(Box::new(i.clone()));
    }

    let where_sql = |c: &[String]| {
        if c.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", c.join(" AND "))
        }
    };
    let (partition, order) = if q.by_institution {
        ("PARTITION BY institution_name", "institution_name, total_marks DESC, roll_number")
    } else {
        ("", "total_marks DESC, roll_number")
    };

    let sql = format!(
        "WITH ranked AS (
            SELECT roll_number, student_name, institution_name, gpa, total_marks,
                   COALESCE(group_name, '') AS group_name,
                   DENSE_RANK() OVER ({partition} ORDER BY total_marks DESC) AS rank
            FROM students{}
         )
         SELECT rank, roll_number, student_name, institution_name, gpa, total_marks, group_name
         FROM ranked{}
         ORDER BY {order}
         LIMIT {} OFFSET {}",
        where_sql(&inner),
        where_sql(&outer),
        q.limit,
        q.offset
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(RankRow {
                rank: row.get(0)?,
                roll_number: row.get(1)?,
                student_name: row.get(2)?,
                institution_name: row.get(3)?,
                gpa: row.get(4)?,
                total_marks: row.get(5)?,
                group_name: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Filters ──

pub struct Filters {
    pub institutions: Vec<String>,
    pub years: Vec<String>,
    pub exam_types: Vec<String>,
    pub groups: Vec<String>,
}

pub fn fetch_filters(conn: &Connection) -> Result<Filters> {
    let distinct = |sql: &str| -> Result<Vec<String>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    };
    Ok(Filters {
        institutions: distinct(
            "SELECT DISTINCT institution_name FROM students ORDER BY institution_name",
        )?,
        years: distinct("SELECT DISTINCT year FROM students ORDER BY year DESC")?,
        exam_types: distinct("SELECT DISTINCT exam_type FROM students ORDER BY exam_type")?,
        groups: distinct(
            "SELECT DISTINCT group_name FROM students
             WHERE group_name IS NOT NULL AND group_name != '' ORDER BY group_name",
        )?,
    })
}
