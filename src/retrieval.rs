use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use rusqlite::Connection;

use crate::cues::CueSet;
use crate::gateway::Embed;

/// Top score at or above this is a single confident match; below it the
/// caller gets a disambiguation set — a deliberate refusal to guess.
pub const CONFIDENCE_THRESHOLD: f64 = 2.0;
/// An exact problem-number token match dominates lexical rank.
const NUMBER_BONUS: f64 = 2.5;
const ANSWER_BONUS: f64 = 1.0;
const SOLUTION_BONUS: f64 = 0.5;
const PARTS_BONUS: f64 = 0.25;
/// Fixed blend weight for embedding similarity when a provider is wired in.
const EMBED_WEIGHT: f64 = 0.3;
const CANDIDATE_POOL: usize = 40;

static NON_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());

#[derive(Debug, Default, Clone)]
pub struct SearchFilters {
    pub book_id: Option<i64>,
    pub subject: Option<String>,
    pub grade: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub problem_id: i64,
    pub book_id: i64,
    pub book_title: String,
    pub number: Option<String>,
    pub section: Option<String>,
    pub problem_text: String,
    pub solution_text: Option<String>,
    pub answer_text: Option<String>,
    pub problem_type: String,
    pub has_parts: bool,
    pub start_page: Option<i64>,
    pub requested_part: Option<String>,
    pub part_answer: Option<String>,
    pub score: f64,
}

#[derive(Debug)]
pub enum SearchOutcome {
    /// One candidate cleared the confidence threshold.
    Confident(Box<SearchResult>),
    /// Nothing cleared the threshold; the caller must choose.
    NeedsChoice(Vec<SearchResult>),
    Empty,
}

/// Hybrid search: FTS5 lexical rank, fixed field bonuses, an exact
/// number-token bonus, and optional embedding blend over the candidate pool.
/// Ties break on lower number, then earliest page — fully deterministic.
pub async fn search(
    conn: &Connection,
    query: &str,
    filters: &SearchFilters,
    cues: &CueSet,
    embedder: Option<&dyn Embed>,
    top_n: usize,
) -> Result<SearchOutcome> {
    let number_token = cues.number_token(query);
    let requested_part = cues.part_request(query);
    let tokens = preprocess(query);
    if tokens.is_empty() && number_token.is_none() {
        return Ok(SearchOutcome::Empty);
    }

    let mut candidates: HashMap<i64, Candidate> = HashMap::new();
    if !tokens.is_empty() {
        let and_query = fts_query(&tokens, " AND ");
        for c in fts_candidates(conn, &and_query, filters)? {
            candidates.insert(c.row.problem_id, c);
        }
        if candidates.is_empty() && tokens.len() > 1 {
            let or_query = fts_query(&tokens, " OR ");
            for c in fts_candidates(conn, &or_query, filters)? {
                candidates.insert(c.row.problem_id, c);
            }
        }
    }
    // A bare number token must find its problem even when FTS has nothing.
    if let Some(num) = &number_token {
        for c in number_candidates(conn, num, filters)? {
            candidates.entry(c.row.problem_id).or_insert(c);
        }
    }
    if candidates.is_empty() {
        return Ok(SearchOutcome::Empty);
    }

    let mut pool: Vec<Candidate> = candidates.into_values().collect();

    let max_lex = pool.iter().map(|c| c.lex).fold(0.0, f64::max);
    let sims = match embedder {
        Some(e) => embedding_similarities(e, query, &pool).await?,
        None => vec![None; pool.len()],
    };

    for (c, sim) in pool.iter_mut().zip(sims) {
        let norm_lex = if max_lex > 0.0 { c.lex / max_lex } else { 0.0 };
        let blended = match sim {
            Some(s) => (1.0 - EMBED_WEIGHT) * norm_lex + EMBED_WEIGHT * s,
            None => norm_lex,
        };
        let mut score = blended;
        if c.row.answer_text.as_deref().is_some_and(|a| a.len() > 1) {
            score += ANSWER_BONUS;
        }
        if c.row.solution_text.as_deref().is_some_and(|s| s.len() > 3) {
            score += SOLUTION_BONUS;
        }
        if c.row.has_parts {
            score += PARTS_BONUS;
        }
        if number_token.is_some() && c.row.number == number_token {
            score += NUMBER_BONUS;
        }
        c.row.score = score;
    }

    pool.sort_by(|a, b| {
        b.row
            .score
            .partial_cmp(&a.row.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| number_order(&a.row.number).partial_cmp(&number_order(&b.row.number)).unwrap())
            .then_with(|| a.row.start_page.unwrap_or(i64::MAX).cmp(&b.row.start_page.unwrap_or(i64::MAX)))
    });

    let mut results: Vec<SearchResult> = pool.into_iter().map(|c| c.row).collect();
    for r in results.iter_mut().take(top_n.max(1)) {
        attach_part_answer(conn, r, requested_part.as_deref())?;
    }

    let top = &results[0];
    if top.score >= CONFIDENCE_THRESHOLD {
        Ok(SearchOutcome::Confident(Box::new(results.swap_remove(0))))
    } else {
        results.truncate(top_n.max(1));
        Ok(SearchOutcome::NeedsChoice(results))
    }
}

struct Candidate {
    row: SearchResult,
    lex: f64,
}

fn preprocess(query: &str) -> Vec<String> {
    let cleaned = NON_WORD_RE.replace_all(query, " ").to_lowercase();
    cleaned.split_whitespace().map(String::from).collect()
}

fn fts_query(tokens: &[String], op: &str) -> String {
    tokens.iter().map(|t| format!("\"{}\"", t)).collect::<Vec<_>>().join(op)
}

const CANDIDATE_COLUMNS: &str = "p.id, p.book_id, b.title, p.number, p.section,
       COALESCE(p.problem_text_clean, p.problem_text), p.solution_text, p.answer_text,
       p.problem_type, p.has_parts, p.start_page";

fn row_to_result(row: &rusqlite::Row) -> rusqlite::Result<SearchResult> {
    Ok(SearchResult {
        problem_id: row.get(0)?,
        book_id: row.get(1)?,
        book_title: row.get(2)?,
        number: row.get(3)?,
        section: row.get(4)?,
        problem_text: row.get(5)?,
        solution_text: row.get(6)?,
        answer_text: row.get(7)?,
        problem_type: row.get(8)?,
        has_parts: row.get(9)?,
        start_page: row.get(10)?,
        requested_part: None,
        part_answer: None,
        score: 0.0,
    })
}

fn filter_clause(
    filters: &SearchFilters,
    params: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
) -> String {
    let mut sql = String::new();
    if let Some(book_id) = filters.book_id {
        params.push(Box::new(book_id));
        sql.push_str(&format!(" AND p.book_id = ?{}", params.len()));
    }
    if let Some(subject) = &filters.subject {
        params.push(Box::new(subject.clone()));
        sql.push_str(&format!(" AND b.subject = ?{}", params.len()));
    }
    if let Some(grade) = &filters.grade {
        params.push(Box::new(format!("%{}%", grade)));
        sql.push_str(&format!(" AND b.grade LIKE ?{}", params.len()));
    }
    sql
}

fn fts_candidates(
    conn: &Connection,
    match_query: &str,
    filters: &SearchFilters,
) -> Result<Vec<Candidate>> {
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(match_query.to_string())];
    let filter_sql = filter_clause(filters, &mut params);
    let sql = format!(
        "SELECT {CANDIDATE_COLUMNS}, bm25(problems_fts) AS rank
         FROM problems_fts
         JOIN problems p ON p.id = problems_fts.rowid
         JOIN books b ON b.id = p.book_id
         WHERE problems_fts MATCH ?1 AND p.superseded = 0{filter_sql}
         ORDER BY rank LIMIT {CANDIDATE_POOL}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            let rank: f64 = row.get(11)?;
            Ok(Candidate { row: row_to_result(row)?, lex: -rank })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn number_candidates(
    conn: &Connection,
    number: &str,
    filters: &SearchFilters,
) -> Result<Vec<Candidate>> {
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(number.to_string())];
    let filter_sql = filter_clause(filters, &mut params);
    let sql = format!(
        "SELECT {CANDIDATE_COLUMNS}
         FROM problems p
         JOIN books b ON b.id = p.book_id
         WHERE p.number = ?1 AND p.superseded = 0{filter_sql}
         ORDER BY p.id LIMIT {CANDIDATE_POOL}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(Candidate { row: row_to_result(row)?, lex: 0.0 })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

async fn embedding_similarities(
    embedder: &dyn Embed,
    query: &str,
    pool: &[Candidate],
) -> Result<Vec<Option<f64>>> {
    let mut texts = vec![query.to_string()];
    texts.extend(pool.iter().map(|c| c.row.problem_text.clone()));
    let vectors = embedder.embed(&texts).await?;
    let Some((q, rest)) = vectors.split_first() else {
        return Ok(vec![None; pool.len()]);
    };
    Ok(rest.iter().map(|v| Some(cosine(q, v))).collect())
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)).clamp(0.0, 1.0)
    }
}

fn number_order(number: &Option<String>) -> f64 {
    number.as_deref().and_then(|n| n.parse::<f64>().ok()).unwrap_or(f64::MAX)
}

/// For multi-part problems, surface the requested part's answer, or all part
/// answers when no part was asked for.
fn attach_part_answer(
    conn: &Connection,
    result: &mut SearchResult,
    requested_part: Option<&str>,
) -> Result<()> {
    if !result.has_parts {
        return Ok(());
    }
    result.requested_part = requested_part.map(String::from);
    match requested_part {
        Some(label) => {
            let answer: Option<String> = conn
                .query_row(
                    "SELECT answer_text FROM problem_parts
                     WHERE problem_id = ?1 AND part_label = ?2",
                    rusqlite::params![result.problem_id, label],
                    |r| r.get(0),
                )
                .unwrap_or(None);
            result.part_answer = answer;
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT part_label, answer_text FROM problem_parts
                 WHERE problem_id = ?1 AND answer_text IS NOT NULL
                 ORDER BY part_label",
            )?;
            let parts: Vec<String> = stmt
                .query_map([result.problem_id], |r| {
                    let label: String = r.get(0)?;
                    let answer: String = r.get(1)?;
                    Ok(format!("{}) {}", label, answer))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            if !parts.is_empty() {
                result.part_answer = Some(parts.join("; "));
            }
        }
    }
    Ok(())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cues::Cues;
    use crate::db;
    use crate::extract::problems::{Part, Problem};

    fn cues() -> CueSet {
        Cues::default().compile().unwrap()
    }

    fn seed_problem(
        number: &str,
        text: &str,
        answer: Option<&str>,
        page: i64,
    ) -> Problem {
        Problem {
            number: Some(number.to_string()),
            section: Some("§3".into()),
            text: text.to_string(),
            solution_text: None,
            answer_text: answer.map(String::from),
            problem_type: "exercise",
            has_parts: false,
            parts: Vec::new(),
            start_page: page,
            end_page: page,
            line_offset: 0,
        }
    }

    fn corpus() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let book = db::add_book(&conn, "Геометрия", Some("geometry"), Some("7")).unwrap();
        db::save_problems(
            &conn,
            book,
            1,
            1,
            &[
                seed_problem("1", "1. Найти x.", Some("x=5"), 2),
                seed_problem("2", "2. Найти y.", Some("y=7"), 2),
            ],
        )
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn number_token_is_sole_confident_match() {
        let conn = corpus();
        let outcome = search(&conn, "№2", &SearchFilters::default(), &cues(), None, 5)
            .await
            .unwrap();
        match outcome {
            SearchOutcome::Confident(r) => {
                assert_eq!(r.number.as_deref(), Some("2"));
                assert_eq!(r.answer_text.as_deref(), Some("y=7"));
            }
            other => panic!("expected confident match, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_candidates_below_threshold_need_choice() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let book = db::add_book(&conn, "Геометрия", None, None).unwrap();
        db::save_problems(
            &conn,
            book,
            1,
            1,
            &[
                seed_problem("10", "10. Найдите смежные углы треугольника.", None, 4),
                seed_problem("11", "11. Найдите смежные углы параллелограмма.", None, 5),
            ],
        )
        .unwrap();
        let outcome = search(
            &conn,
            "найдите смежные углы",
            &SearchFilters::default(),
            &cues(),
            None,
            5,
        )
        .await
        .unwrap();
        match outcome {
            SearchOutcome::NeedsChoice(rs) => {
                assert_eq!(rs.len(), 2, "both candidates surface, no silent guess");
            }
            other => panic!("expected needs-choice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ties_break_on_lower_number() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let book = db::add_book(&conn, "Тест", None, None).unwrap();
        db::save_problems(
            &conn,
            book,
            1,
            1,
            &[
                seed_problem("12", "12. Вычислите периметр квадрата.", None, 9),
                seed_problem("3", "3. Вычислите периметр квадрата.", None, 7),
            ],
        )
        .unwrap();
        let outcome = search(
            &conn,
            "вычислите периметр квадрата",
            &SearchFilters::default(),
            &cues(),
            None,
            5,
        )
        .await
        .unwrap();
        match outcome {
            SearchOutcome::NeedsChoice(rs) => {
                assert_eq!(rs[0].number.as_deref(), Some("3"));
                assert_eq!(rs[1].number.as_deref(), Some("12"));
            }
            other => panic!("expected needs-choice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn superseded_problems_invisible() {
        let conn = corpus();
        db::supersede_entities(&conn, 1, 99).unwrap();
        let outcome = search(&conn, "№2", &SearchFilters::default(), &cues(), None, 5)
            .await
            .unwrap();
        assert!(matches!(outcome, SearchOutcome::Empty));
    }

    #[tokio::test]
    async fn requested_part_answer_surfaces() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let book = db::add_book(&conn, "Тест", None, None).unwrap();
        let mut p = seed_problem("4", "4. Найдите углы: 1) смежные 2) вертикальные", Some("см. части"), 3);
        p.has_parts = true;
        p.parts = vec![
            Part { label: "1".into(), text: "смежные".into() },
            Part { label: "2".into(), text: "вертикальные".into() },
        ];
        let ids = db::save_problems(&conn, book, 1, 1, &[p]).unwrap();
        conn.execute(
            "UPDATE problem_parts SET answer_text = '130°' WHERE problem_id = ?1 AND part_label = '1'",
            [ids[0]],
        )
        .unwrap();
        let outcome = search(
            &conn,
            "найдите углы 1 вариант №4",
            &SearchFilters::default(),
            &cues(),
            None,
            5,
        )
        .await
        .unwrap();
        match outcome {
            SearchOutcome::Confident(r) => {
                assert_eq!(r.requested_part.as_deref(), Some("1"));
                assert_eq!(r.part_answer.as_deref(), Some("130°"));
            }
            other => panic!("expected confident match, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn book_filter_restricts() {
        let conn = corpus();
        let other = SearchFilters { book_id: Some(999), ..Default::default() };
        let outcome = search(&conn, "№2", &other, &cues(), None, 5).await.unwrap();
        assert!(matches!(outcome, SearchOutcome::Empty));
    }
}
