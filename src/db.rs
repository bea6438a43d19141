use std::path::PathBuf;

use anyhow::{bail, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::docmap::DocumentMap;
use crate::extract::answers::Link;
use crate::extract::problems::Problem;
use crate::extract::theory::Theory;

const DB_PATH: &str = "data/corpus.sqlite";

pub fn connect() -> Result<Connection> {
    let path = std::env::var("TEXTBOOK_DB").map(PathBuf::from).unwrap_or(DB_PATH.into());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS books (
            id         INTEGER PRIMARY KEY,
            title      TEXT NOT NULL,
            subject    TEXT,
            grade      TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS pages (
            id         INTEGER PRIMARY KEY,
            book_id    INTEGER NOT NULL REFERENCES books(id),
            source_id  INTEGER NOT NULL,
            page_index INTEGER NOT NULL,
            text       TEXT NOT NULL,
            quality    REAL NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(source_id, page_index)
        );
        CREATE INDEX IF NOT EXISTS idx_pages_source ON pages(source_id);

        -- One row per segmentation version; re-segmentation appends, never
        -- rewrites.
        CREATE TABLE IF NOT EXISTS document_maps (
            id         INTEGER PRIMARY KEY,
            book_id    INTEGER NOT NULL REFERENCES books(id),
            source_id  INTEGER NOT NULL,
            version    INTEGER NOT NULL,
            map_json   TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(source_id, version)
        );

        CREATE TABLE IF NOT EXISTS problems (
            id                 INTEGER PRIMARY KEY,
            book_id            INTEGER NOT NULL REFERENCES books(id),
            source_id          INTEGER NOT NULL,
            map_version        INTEGER NOT NULL,
            number             TEXT,
            section            TEXT,
            problem_text       TEXT NOT NULL,
            problem_text_clean TEXT,
            solution_text      TEXT,
            answer_text        TEXT,
            problem_type       TEXT NOT NULL DEFAULT 'unknown'
                               CHECK(problem_type IN ('question','exercise','unknown')),
            has_parts          BOOLEAN NOT NULL DEFAULT 0,
            needs_review       BOOLEAN NOT NULL DEFAULT 0,
            superseded         BOOLEAN NOT NULL DEFAULT 0,
            start_page         INTEGER,
            end_page           INTEGER,
            created_at         TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_problems_book ON problems(book_id, number);
        CREATE INDEX IF NOT EXISTS idx_problems_source ON problems(source_id, map_version);

        CREATE TABLE IF NOT EXISTS problem_parts (
            id          INTEGER PRIMARY KEY,
            problem_id  INTEGER NOT NULL REFERENCES problems(id),
            part_label  TEXT NOT NULL,
            part_text   TEXT NOT NULL,
            answer_text TEXT,
            UNIQUE(problem_id, part_label)
        );

        CREATE TABLE IF NOT EXISTS theory (
            id          INTEGER PRIMARY KEY,
            book_id     INTEGER NOT NULL REFERENCES books(id),
            source_id   INTEGER NOT NULL,
            map_version INTEGER NOT NULL,
            section     TEXT NOT NULL,
            theory_text TEXT NOT NULL,
            start_page  INTEGER,
            end_page    INTEGER,
            superseded  BOOLEAN NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_theory_book ON theory(book_id, section);

        -- Every parsed answer entry, linked or orphaned. Orphans keep
        -- problem_id NULL so coverage gaps stay visible.
        CREATE TABLE IF NOT EXISTS answer_links (
            id           INTEGER PRIMARY KEY,
            book_id      INTEGER NOT NULL REFERENCES books(id),
            source_id    INTEGER NOT NULL,
            map_version  INTEGER NOT NULL,
            section      TEXT,
            number       TEXT NOT NULL,
            problem_type TEXT,
            answer_text  TEXT NOT NULL,
            problem_id   INTEGER REFERENCES problems(id),
            confidence   TEXT NOT NULL CHECK(confidence IN ('high','low')),
            ambiguous    BOOLEAN NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_links_source ON answer_links(source_id, map_version);

        -- Append-only audit of every generation call, keyed by input hash.
        CREATE TABLE IF NOT EXISTS llm_audit (
            id               INTEGER PRIMARY KEY,
            input_hash       TEXT NOT NULL,
            task             TEXT NOT NULL,
            request          TEXT NOT NULL,
            raw_response     TEXT,
            parsed_result    TEXT,
            error            TEXT,
            pipeline_version TEXT NOT NULL,
            created_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_audit_hash ON llm_audit(input_hash);

        CREATE TABLE IF NOT EXISTS ingest_runs (
            id          INTEGER PRIMARY KEY,
            book_id     INTEGER NOT NULL,
            source_id   INTEGER NOT NULL,
            mode        TEXT NOT NULL,
            status      TEXT NOT NULL CHECK(status IN ('running','done','failed')),
            map_version INTEGER,
            error       TEXT,
            started_at  TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_runs_source ON ingest_runs(source_id, status);

        CREATE VIRTUAL TABLE IF NOT EXISTS problems_fts
            USING fts5(problem_text, solution_text, answer_text);
        ",
    )?;
    Ok(())
}

// ── Books ──

pub struct BookRow {
    pub id: i64,
    pub title: String,
    pub subject: Option<String>,
    pub grade: Option<String>,
}

pub fn add_book(
    conn: &Connection,
    title: &str,
    subject: Option<&str>,
    grade: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO books (title, subject, grade) VALUES (?1, ?2, ?3)",
        rusqlite::params![title, subject, grade],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_book(conn: &Connection, id: i64) -> Result<Option<BookRow>> {
    Ok(conn
        .query_row(
            "SELECT id, title, subject, grade FROM books WHERE id = ?1",
            [id],
            |row| {
                Ok(BookRow {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    subject: row.get(2)?,
                    grade: row.get(3)?,
                })
            },
        )
        .optional()?)
}

// ── Pages ──

pub struct PageRow {
    pub page_index: i64,
    pub text: String,
    pub quality: f64,
}

pub fn save_pages(
    conn: &Connection,
    book_id: i64,
    source_id: i64,
    pages: &[PageRow],
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO pages (book_id, source_id, page_index, text, quality)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for p in pages {
            stmt.execute(rusqlite::params![book_id, source_id, p.page_index, p.text, p.quality])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn fetch_pages(conn: &Connection, source_id: i64) -> Result<Vec<PageRow>> {
    let mut stmt = conn.prepare(
        "SELECT page_index, text, quality FROM pages WHERE source_id = ?1 ORDER BY page_index",
    )?;
    let rows = stmt
        .query_map([source_id], |row| {
            Ok(PageRow { page_index: row.get(0)?, text: row.get(1)?, quality: row.get(2)? })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Document maps ──

pub fn next_map_version(conn: &Connection, source_id: i64) -> Result<i64> {
    let v: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM document_maps WHERE source_id = ?1",
        [source_id],
        |r| r.get(0),
    )?;
    Ok(v + 1)
}

pub fn save_document_map(conn: &Connection, map: &DocumentMap) -> Result<()> {
    let json = serde_json::to_string(map)?;
    conn.execute(
        "INSERT INTO document_maps (book_id, source_id, version, map_json)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![map.book_id, map.source_id, map.version, json],
    )?;
    Ok(())
}

pub fn load_document_map(
    conn: &Connection,
    source_id: i64,
    version: Option<i64>,
) -> Result<Option<DocumentMap>> {
    let json: Option<String> = match version {
        Some(v) => conn
            .query_row(
                "SELECT map_json FROM document_maps WHERE source_id = ?1 AND version = ?2",
                rusqlite::params![source_id, v],
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT map_json FROM document_maps WHERE source_id = ?1
                 ORDER BY version DESC LIMIT 1",
                [source_id],
                |r| r.get(0),
            )
            .optional()?,
    };
    Ok(match json {
        Some(j) => Some(serde_json::from_str(&j)?),
        None => None,
    })
}

// ── Entities ──

/// Mark entity rows of older versions superseded and drop them from the FTS
/// mirror. Rows themselves are kept for comparison across versions.
pub fn supersede_entities(conn: &Connection, source_id: i64, keep_version: i64) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM problems_fts WHERE rowid IN
           (SELECT id FROM problems WHERE source_id = ?1 AND map_version < ?2)",
        rusqlite::params![source_id, keep_version],
    )?;
    tx.execute(
        "UPDATE problems SET superseded = 1 WHERE source_id = ?1 AND map_version < ?2",
        rusqlite::params![source_id, keep_version],
    )?;
    tx.execute(
        "UPDATE theory SET superseded = 1 WHERE source_id = ?1 AND map_version < ?2",
        rusqlite::params![source_id, keep_version],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn save_problems(
    conn: &Connection,
    book_id: i64,
    source_id: i64,
    map_version: i64,
    problems: &[Problem],
) -> Result<Vec<i64>> {
    let tx = conn.unchecked_transaction()?;
    let mut ids = Vec::with_capacity(problems.len());
    {
        let mut stmt = tx.prepare(
            "INSERT INTO problems
             (book_id, source_id, map_version, number, section, problem_text,
              solution_text, answer_text, problem_type, has_parts, start_page, end_page)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
        )?;
        let mut part_stmt = tx.prepare(
            "INSERT OR IGNORE INTO problem_parts (problem_id, part_label, part_text)
             VALUES (?1, ?2, ?3)",
        )?;
        let mut fts_stmt = tx.prepare(
            "INSERT INTO problems_fts (rowid, problem_text, solution_text, answer_text)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for p in problems {
            stmt.execute(rusqlite::params![
                book_id,
                source_id,
                map_version,
                p.number,
                p.section,
                p.text,
                p.solution_text,
                p.answer_text,
                p.problem_type,
                p.has_parts,
                p.start_page,
                p.end_page,
            ])?;
            let id = tx.last_insert_rowid();
            ids.push(id);
            for part in &p.parts {
                part_stmt.execute(rusqlite::params![id, part.label, part.text])?;
            }
            fts_stmt.execute(rusqlite::params![id, p.text, p.solution_text, p.answer_text])?;
        }
    }
    tx.commit()?;
    Ok(ids)
}

pub fn save_theory(
    conn: &Connection,
    book_id: i64,
    source_id: i64,
    map_version: i64,
    records: &[Theory],
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO theory
             (book_id, source_id, map_version, section, theory_text, start_page, end_page)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
        )?;
        for t in records {
            stmt.execute(rusqlite::params![
                book_id, source_id, map_version, t.section, t.text, t.start_page, t.end_page,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Persist answer links and fill matched problems' empty answer_text (and
/// part answers). Orphans are stored with problem_id NULL.
pub fn apply_links(
    conn: &Connection,
    book_id: i64,
    source_id: i64,
    map_version: i64,
    links: &[Link],
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut link_stmt = tx.prepare(
            "INSERT INTO answer_links
             (book_id, source_id, map_version, section, number, problem_type,
              answer_text, problem_id, confidence, ambiguous)
             VALUES (?1,?2,?3,?4,?5,
                     COALESCE((SELECT problem_type FROM problems WHERE id = ?7), 'unknown'),
                     ?6,?7,?8,?9)",
        )?;
        let mut fill_stmt = tx.prepare(
            "UPDATE problems SET answer_text = ?2
             WHERE id = ?1 AND (answer_text IS NULL OR answer_text = '')",
        )?;
        let mut part_stmt = tx.prepare(
            "UPDATE problem_parts SET answer_text = ?3
             WHERE problem_id = ?1 AND part_label = ?2
               AND (answer_text IS NULL OR answer_text = '')",
        )?;
        for link in links {
            link_stmt.execute(rusqlite::params![
                book_id,
                source_id,
                map_version,
                link.entry.section,
                link.entry.number,
                link.entry.text,
                link.problem_id,
                link.confidence.as_str(),
                link.ambiguous,
            ])?;
            if let Some(pid) = link.problem_id {
                fill_stmt.execute(rusqlite::params![pid, link.entry.text])?;
                for (label, text) in &link.part_answers {
                    part_stmt.execute(rusqlite::params![pid, label, text])?;
                }
            }
        }
    }
    tx.commit()?;
    // Refresh the FTS mirror for filled problems.
    for link in links.iter().filter(|l| l.problem_id.is_some()) {
        refresh_fts(conn, link.problem_id.unwrap())?;
    }
    Ok(())
}

/// Rewrite one problem's FTS row from the problems table.
pub fn refresh_fts(conn: &Connection, problem_id: i64) -> Result<()> {
    conn.execute("DELETE FROM problems_fts WHERE rowid = ?1", [problem_id])?;
    conn.execute(
        "INSERT INTO problems_fts (rowid, problem_text, solution_text, answer_text)
         SELECT id, COALESCE(problem_text_clean, problem_text), solution_text, answer_text
         FROM problems WHERE id = ?1 AND superseded = 0",
        [problem_id],
    )?;
    Ok(())
}

/// Store a gateway-repaired problem text; the original column is untouched.
pub fn set_problem_text_clean(conn: &Connection, problem_id: i64, clean: &str) -> Result<()> {
    conn.execute(
        "UPDATE problems SET problem_text_clean = ?2, needs_review = 0 WHERE id = ?1",
        rusqlite::params![problem_id, clean],
    )?;
    refresh_fts(conn, problem_id)
}

pub fn mark_needs_review(conn: &Connection, problem_id: i64) -> Result<()> {
    conn.execute("UPDATE problems SET needs_review = 1 WHERE id = ?1", [problem_id])?;
    Ok(())
}

pub struct RepairCandidate {
    pub id: i64,
    pub problem_text: String,
}

/// Problems of the current version whose source pages fell below the quality
/// floor, or that were flagged for review.
pub fn fetch_repair_candidates(
    conn: &Connection,
    source_id: i64,
    map_version: i64,
    quality_floor: f64,
) -> Result<Vec<RepairCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.problem_text FROM problems p
         WHERE p.source_id = ?1 AND p.map_version = ?2 AND p.superseded = 0
           AND p.problem_text_clean IS NULL
           AND (p.needs_review = 1 OR EXISTS (
                SELECT 1 FROM pages pg
                WHERE pg.source_id = p.source_id
                  AND pg.page_index BETWEEN p.start_page AND p.end_page
                  AND pg.quality < ?3))
         ORDER BY p.id",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![source_id, map_version, quality_floor], |row| {
            Ok(RepairCandidate { id: row.get(0)?, problem_text: row.get(1)? })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Audit ──

pub struct AuditRow {
    pub input_hash: String,
    pub task: String,
    pub request: String,
    pub raw_response: Option<String>,
    pub parsed_result: Option<String>,
    pub error: Option<String>,
    pub pipeline_version: String,
}

pub fn save_audit(conn: &Connection, row: &AuditRow) -> Result<()> {
    conn.execute(
        "INSERT INTO llm_audit
         (input_hash, task, request, raw_response, parsed_result, error, pipeline_version)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        rusqlite::params![
            row.input_hash,
            row.task,
            row.request,
            row.raw_response,
            row.parsed_result,
            row.error,
            row.pipeline_version,
        ],
    )?;
    Ok(())
}

pub fn audit_count(conn: &Connection, input_hash: &str) -> Result<usize> {
    let n: usize = conn.query_row(
        "SELECT COUNT(*) FROM llm_audit WHERE input_hash = ?1",
        [input_hash],
        |r| r.get(0),
    )?;
    Ok(n)
}

// ── Runs ──

/// Start a run for a source. Two concurrent runs for the same source must be
/// serialized; a second caller fails fast here.
pub fn begin_run(conn: &Connection, book_id: i64, source_id: i64, mode: &str) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    let running: Option<i64> = tx
        .query_row(
            "SELECT id FROM ingest_runs WHERE source_id = ?1 AND status = 'running'",
            [source_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = running {
        bail!("ingestion already in flight for source {} (run {})", source_id, id);
    }
    tx.execute(
        "INSERT INTO ingest_runs (book_id, source_id, mode, status) VALUES (?1, ?2, ?3, 'running')",
        rusqlite::params![book_id, source_id, mode],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(id)
}

pub fn finish_run(conn: &Connection, run_id: i64, map_version: Option<i64>) -> Result<()> {
    conn.execute(
        "UPDATE ingest_runs SET status = 'done', map_version = ?2,
         finished_at = datetime('now') WHERE id = ?1",
        rusqlite::params![run_id, map_version],
    )?;
    Ok(())
}

pub fn fail_run(conn: &Connection, run_id: i64, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE ingest_runs SET status = 'failed', error = ?2,
         finished_at = datetime('now') WHERE id = ?1",
        rusqlite::params![run_id, error],
    )?;
    Ok(())
}

// ── Metrics ──

/// Machine-readable per-source report; `pct_start_with_paragraph` moving away
/// from zero means section headers are leaking into problems again.
#[derive(Debug, serde::Serialize)]
pub struct Metrics {
    pub book_id: i64,
    pub source_id: i64,
    pub map_version: i64,
    pub pages_processed: usize,
    pub problems_count: usize,
    pub pct_start_with_paragraph: f64,
    pub answer_coverage_pct: f64,
    pub section_coverage_pct: f64,
    pub theory_count: usize,
    pub answers_orphaned: usize,
    pub answers_ambiguous: usize,
    pub needs_review_count: usize,
}

pub fn compute_metrics(
    conn: &Connection,
    book_id: i64,
    source_id: i64,
    map_version: i64,
) -> Result<Metrics> {
    let count_where = |sql: &str| -> Result<usize> {
        Ok(conn.query_row(sql, rusqlite::params![source_id, map_version], |r| r.get(0))?)
    };
    let pages: usize = conn.query_row(
        "SELECT COUNT(*) FROM pages WHERE source_id = ?1",
        [source_id],
        |r| r.get(0),
    )?;
    let problems = count_where(
        "SELECT COUNT(*) FROM problems WHERE source_id = ?1 AND map_version = ?2",
    )?;
    let para_start = count_where(
        "SELECT COUNT(*) FROM problems WHERE source_id = ?1 AND map_version = ?2
           AND (problem_text LIKE '§%' OR LOWER(problem_text) LIKE 'параграф%')",
    )?;
    let with_answer = count_where(
        "SELECT COUNT(*) FROM problems WHERE source_id = ?1 AND map_version = ?2
           AND answer_text IS NOT NULL AND answer_text != ''",
    )?;
    let with_section = count_where(
        "SELECT COUNT(*) FROM problems WHERE source_id = ?1 AND map_version = ?2
           AND section IS NOT NULL AND section != ''",
    )?;
    let theory = count_where(
        "SELECT COUNT(*) FROM theory WHERE source_id = ?1 AND map_version = ?2",
    )?;
    let orphans = count_where(
        "SELECT COUNT(*) FROM answer_links WHERE source_id = ?1 AND map_version = ?2
           AND problem_id IS NULL",
    )?;
    let ambiguous = count_where(
        "SELECT COUNT(*) FROM answer_links WHERE source_id = ?1 AND map_version = ?2
           AND ambiguous = 1",
    )?;
    let needs_review = count_where(
        "SELECT COUNT(*) FROM problems WHERE source_id = ?1 AND map_version = ?2
           AND needs_review = 1",
    )?;

    let pct = |n: usize| if problems == 0 { 0.0 } else { 100.0 * n as f64 / problems as f64 };
    Ok(Metrics {
        book_id,
        source_id,
        map_version,
        pages_processed: pages,
        problems_count: problems,
        pct_start_with_paragraph: pct(para_start),
        answer_coverage_pct: pct(with_answer),
        section_coverage_pct: pct(with_section),
        theory_count: theory,
        answers_orphaned: orphans,
        answers_ambiguous: ambiguous,
        needs_review_count: needs_review,
    })
}

// ── Stats ──

pub struct Stats {
    pub books: usize,
    pub pages: usize,
    pub problems: usize,
    pub theory: usize,
    pub answers_linked: usize,
    pub answers_orphaned: usize,
    pub runs_done: usize,
    pub runs_failed: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    Ok(Stats {
        books: count("SELECT COUNT(*) FROM books")?,
        pages: count("SELECT COUNT(*) FROM pages")?,
        problems: count("SELECT COUNT(*) FROM problems WHERE superseded = 0")?,
        theory: count("SELECT COUNT(*) FROM theory WHERE superseded = 0")?,
        answers_linked: count("SELECT COUNT(*) FROM answer_links WHERE problem_id IS NOT NULL")?,
        answers_orphaned: count("SELECT COUNT(*) FROM answer_links WHERE problem_id IS NULL")?,
        runs_done: count("SELECT COUNT(*) FROM ingest_runs WHERE status = 'done'")?,
        runs_failed: count("SELECT COUNT(*) FROM ingest_runs WHERE status = 'failed'")?,
    })
}

// ── Tests ──
