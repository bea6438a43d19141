use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use regex::Regex;
use rusqlite::Connection;
use serde::Deserialize;
use tracing::{info, warn};

use crate::cues::CueSet;
use crate::db::{self, PageRow};
use crate::docmap::{self, DocumentMap, SpanType};
use crate::extract::{self, answers};
use crate::gateway::{Gateway, GatewayError, Generate};
use crate::normalize;
use crate::strip;

/// Page blocks of the normalized-markdown input format: "## Страница N".
static PAGE_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s+Страница\s+(\d+)\s*$").unwrap());

const RETYPE_SYSTEM: &str = "Ты классифицируешь страницу учебника по её тексту. \
Верни JSON вида {\"span_type\": \"...\", \"confidence\": 0.0-1.0}. \
Допустимые значения span_type: paragraph (теория), task_block (задачи), answers (ответы). \
Никакого текста кроме JSON.";

const REPAIR_SYSTEM: &str = "Ты исправляешь текст задачи после OCR учебника: \
латиница вместо кириллицы, перепутанные символы, разорванные формулы. \
Формулы записывай в Unicode (², √, ∠, °, ×, ≤, ≥, ≠, ±) или с ^, без LaTeX. \
Верни JSON вида {\"text\": \"исправленный текст\"}. Никакого текста кроме JSON.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normalize, strip, map, extract — everything from raw OCR text.
    Full,
    /// Input is already normalized; skip the normalizer and stripper.
    FromNormalized,
    /// Rebuild the map and entities from pages already in the store.
    Resegment,
    /// Re-run only generation-backed repair on low-confidence fields.
    LlmRepairOnly,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Full => "full",
            Mode::FromNormalized => "from_normalized",
            Mode::Resegment => "resegment",
            Mode::LlmRepairOnly => "llm_repair_only",
        }
    }
}

pub struct RunOptions {
    pub book_id: i64,
    pub source_id: i64,
    pub mode: Mode,
    pub input: Option<PathBuf>,
    pub quality_floor: f64,
    pub span_floor: f64,
    pub artifacts_root: PathBuf,
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub map_version: Option<i64>,
    pub pages: usize,
    pub problems: usize,
    pub theory: usize,
    pub answers_linked: usize,
    pub answers_orphaned: usize,
    pub repaired: usize,
    pub repair_failed: usize,
    pub artifacts_dir: Option<PathBuf>,
}

impl RunOutcome {
    pub fn print(&self) {
        println!(
            "Saved {} problems, {} theory sections, {} answers linked ({} orphaned).",
            self.problems, self.theory, self.answers_linked, self.answers_orphaned,
        );
        if self.repaired > 0 || self.repair_failed > 0 {
            println!("Repaired {} fields ({} left for review).", self.repaired, self.repair_failed);
        }
        if let Some(dir) = &self.artifacts_dir {
            println!("Artifacts: {}", dir.display());
        }
    }
}

/// Run one ingestion for one source. Stages are strictly sequential; each
/// stage consumes the full output of the previous one. A second concurrent
/// run for the same source fails fast in `begin_run`.
pub async fn run(
    conn: &Connection,
    provider: Option<&dyn Generate>,
    cues: &CueSet,
    opts: &RunOptions,
) -> Result<RunOutcome> {
    let run_id = db::begin_run(conn, opts.book_id, opts.source_id, opts.mode.as_str())?;
    let result = run_inner(conn, provider, cues, opts).await;
    match &result {
        Ok(out) => db::finish_run(conn, run_id, out.map_version)?,
        Err(e) => db::fail_run(conn, run_id, &e.to_string())?,
    }
    result
}

async fn run_inner(
    conn: &Connection,
    provider: Option<&dyn Generate>,
    cues: &CueSet,
    opts: &RunOptions,
) -> Result<RunOutcome> {
    if opts.mode == Mode::LlmRepairOnly {
        return repair_only(conn, provider, opts).await;
    }

    // Stage 1-2: acquire pages.
    let pages: Vec<PageRow> = match opts.mode {
        Mode::Resegment => {
            let stored = db::fetch_pages(conn, opts.source_id)?;
            if stored.is_empty() {
                bail!("no stored pages for source {}; run a full ingest first", opts.source_id);
            }
            stored
        }
        _ => {
            let input = opts
                .input
                .as_deref()
                .context("ingest in this mode requires an --input file")?;
            let raw = read_input_pages(input)?;
            let prepared = match opts.mode {
                Mode::Full => normalize_and_strip(raw, cues),
                _ => raw
                    .into_iter()
                    .map(|p| PageRow {
                        page_index: p.page_index,
                        text: p.raw_text,
                        quality: p.quality_score.clamp(0.0, 1.0),
                    })
                    .collect(),
            };
            db::save_pages(conn, opts.book_id, opts.source_id, &prepared)?;
            prepared
        }
    };
    let page_pairs: Vec<(i64, String)> =
        pages.iter().map(|p| (p.page_index, p.text.clone())).collect();

    // Stage 3: document map, a new immutable version.
    let version = db::next_map_version(conn, opts.source_id)?;
    let mut map = docmap::build(&page_pairs, opts.book_id, opts.source_id, version, cues);
    if let Some(provider) = provider {
        retype_low_confidence_spans(conn, provider, &mut map, &page_pairs, opts.span_floor).await;
    }
    let total_pages = page_pairs.iter().map(|(i, _)| *i).max().unwrap_or(0);
    if let Err(e) = map.verify_partition(total_pages) {
        warn!("document map partition check failed: {}", e);
    }
    db::save_document_map(conn, &map)?;

    // Stage 4: extract entities.
    let data = extract::extract_all(&map, &page_pairs, cues);
    let ids = db::save_problems(conn, opts.book_id, opts.source_id, version, &data.problems)?;

    // Stage 5: link answers.
    let keys: Vec<answers::ProblemKey> = data
        .problems
        .iter()
        .zip(ids.iter())
        .map(|(p, id)| answers::ProblemKey {
            id: *id,
            number: p.number.clone(),
            section: p.section.clone(),
            has_answer: p.answer_text.is_some(),
            has_parts: p.has_parts,
        })
        .collect();
    let links = answers::link_entries(data.answers.clone(), &keys);
    db::apply_links(conn, opts.book_id, opts.source_id, version, &links)?;
    db::save_theory(conn, opts.book_id, opts.source_id, version, &data.theory)?;
    db::supersede_entities(conn, opts.source_id, version)?;

    let mut out = RunOutcome {
        map_version: Some(version),
        pages: pages.len(),
        problems: data.problems.len(),
        theory: data.theory.len(),
        answers_linked: links.iter().filter(|l| l.problem_id.is_some()).count(),
        answers_orphaned: links.iter().filter(|l| l.problem_id.is_none()).count(),
        ..Default::default()
    };

    // Optional: generation-backed repair of low-confidence fields.
    if provider.is_some() {
        let (repaired, failed) =
            repair_low_confidence(conn, provider.unwrap(), opts, version).await?;
        out.repaired = repaired;
        out.repair_failed = failed;
    }

    out.artifacts_dir = Some(write_artifacts(conn, &map, &data, opts, version)?);
    info!(
        "Ingested source {} v{}: {} pages, {} problems, {} theory",
        opts.source_id, version, out.pages, out.problems, out.theory
    );
    Ok(out)
}

async fn repair_only(
    conn: &Connection,
    provider: Option<&dyn Generate>,
    opts: &RunOptions,
) -> Result<RunOutcome> {
    let Some(provider) = provider else {
        bail!("llm_repair_only mode requires a generation provider (--llm)");
    };
    let map = db::load_document_map(conn, opts.source_id, None)?
        .context("no document map for source; run ingest first")?;
    let (repaired, failed) = repair_low_confidence(conn, provider, opts, map.version).await?;
    let metrics = db::compute_metrics(conn, opts.book_id, opts.source_id, map.version)?;
    let dir = artifacts_dir(&opts.artifacts_root, opts.book_id, opts.source_id, map.version);
    write_json(&dir.join("metrics.json"), &metrics)?;
    Ok(RunOutcome {
        map_version: Some(map.version),
        repaired,
        repair_failed: failed,
        artifacts_dir: Some(dir),
        ..Default::default()
    })
}

// ── Input ──

#[derive(Deserialize)]
struct InputPage {
    page_index: i64,
    raw_text: String,
    #[serde(default = "default_quality")]
    quality_score: f64,
}

fn default_quality() -> f64 {
    1.0
}

/// Accepts the OCR collaborator's JSON contract or the normalized-markdown
/// page format ("## Страница N" blocks).
fn read_input_pages(path: &Path) -> Result<Vec<InputPage>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input {}", path.display()))?;
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        let pages: Vec<InputPage> =
            serde_json::from_str(trimmed).context("Invalid pages JSON")?;
        return Ok(pages);
    }
    let mut pages = Vec::new();
    let mut current: Option<(i64, Vec<&str>)> = None;
    for line in raw.lines() {
        if let Some(caps) = PAGE_HEADER_RE.captures(line.trim()) {
            if let Some((idx, lines)) = current.take() {
                pages.push(InputPage {
                    page_index: idx,
                    raw_text: lines.join("\n").trim().to_string(),
                    quality_score: 1.0,
                });
            }
            current = Some((caps[1].parse()?, Vec::new()));
            continue;
        }
        if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((idx, lines)) = current.take() {
        pages.push(InputPage {
            page_index: idx,
            raw_text: lines.join("\n").trim().to_string(),
            quality_score: 1.0,
        });
    }
    if pages.is_empty() {
        bail!("no pages found in {} (expected JSON array or '## Страница N' blocks)", path.display());
    }
    Ok(pages)
}

fn normalize_and_strip(input: Vec<InputPage>, cues: &CueSet) -> Vec<PageRow> {
    let pb = ProgressBar::new(input.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec})")
            .unwrap()
            .progress_chars("=> "),
    );
    let mut normalized: Vec<PageRow> = Vec::with_capacity(input.len());
    for chunk in input.chunks(64) {
        let batch: Vec<PageRow> = chunk
            .par_iter()
            .map(|p| {
                let n = normalize::normalize_page(&p.raw_text, p.quality_score);
                PageRow { page_index: p.page_index, text: n.text, quality: n.quality }
            })
            .collect();
        pb.inc(chunk.len() as u64);
        normalized.extend(batch);
    }
    pb.finish_and_clear();

    let texts: Vec<String> = normalized.iter().map(|p| p.text.clone()).collect();
    let (stripped, stats) = strip::strip_pages(&texts, strip::DEFAULT_ZONE, cues);
    info!("Stripped {} header/footer lines ({} recurring)", stats.stripped, stats.recurring);
    normalized
        .into_iter()
        .zip(stripped)
        .map(|(p, text)| PageRow { text, ..p })
        .collect()
}

// ── Gateway-backed corrections ──

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SpanVote {
    span_type: String,
    confidence: f64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct RepairedText {
    text: String,
}

/// Ask the gateway to re-type partitioning spans below the confidence floor.
/// A failed or invalid vote keeps the heuristic type — never fatal.
async fn retype_low_confidence_spans(
    conn: &Connection,
    provider: &dyn Generate,
    map: &mut DocumentMap,
    pages: &[(i64, String)],
    span_floor: f64,
) {
    let gateway = Gateway::new(provider, conn);
    let mut retyped = 0usize;
    for span in map.spans.iter_mut() {
        if !span.span_type.is_partitioning() || span.confidence >= span_floor {
            continue;
        }
        let excerpt: String = pages
            .iter()
            .filter(|(i, _)| *i >= span.start_page && *i <= span.end_page)
            .flat_map(|(_, t)| t.chars())
            .take(1500)
            .collect();
        let prompt = format!(
            "Страницы {}-{} учебника. Текст:\n{}",
            span.start_page, span.end_page, excerpt
        );
        match gateway.call::<SpanVote>("retype_span", RETYPE_SYSTEM, &prompt).await {
            Ok(vote) => {
                let new_type = match vote.span_type.as_str() {
                    "paragraph" => Some(SpanType::Paragraph),
                    "task_block" => Some(SpanType::TaskBlock),
                    "answers" => Some(SpanType::Answers),
                    other => {
                        warn!("retype returned unknown span type '{}', keeping heuristic", other);
                        None
                    }
                };
                if let Some(t) = new_type {
                    if t != span.span_type {
                        retyped += 1;
                    }
                    span.span_type = t;
                    span.confidence = vote.confidence.clamp(0.0, 1.0);
                }
            }
            Err(e) => warn!(
                "retype of span {}-{} failed, keeping heuristic type: {}",
                span.start_page, span.end_page, e
            ),
        }
    }
    if retyped > 0 {
        map.spans = docmap::merge_spans(std::mem::take(&mut map.spans));
        info!("Gateway re-typed {} low-confidence spans", retyped);
    }
}

/// Repair problems from low-quality pages. One gateway call per problem; a
/// second schema failure marks that problem needs_review and moves on — the
/// document is never abandoned for one field.
async fn repair_low_confidence(
    conn: &Connection,
    provider: &dyn Generate,
    opts: &RunOptions,
    version: i64,
) -> Result<(usize, usize)> {
    let gateway = Gateway::new(provider, conn);
    let candidates =
        db::fetch_repair_candidates(conn, opts.source_id, version, opts.quality_floor)?;
    if candidates.is_empty() {
        return Ok((0, 0));
    }
    info!("Repairing {} low-confidence problems via gateway", candidates.len());
    let mut repaired = 0usize;
    let mut failed = 0usize;
    for c in candidates {
        let prompt = format!("Текст задачи после OCR:\n{}", c.problem_text);
        match gateway.call::<RepairedText>("repair_problem", REPAIR_SYSTEM, &prompt).await {
            Ok(fix) if !fix.text.trim().is_empty() => {
                db::set_problem_text_clean(conn, c.id, fix.text.trim())?;
                repaired += 1;
            }
            Ok(_) => {
                db::mark_needs_review(conn, c.id)?;
                failed += 1;
            }
            Err(GatewayError::Transport(e)) => {
                // Network trouble affects every remaining call; stop here and
                // leave the rest for a later llm_repair_only run.
                warn!("gateway transport failure, deferring remaining repairs: {}", e);
                failed += 1;
                db::mark_needs_review(conn, c.id)?;
                break;
            }
            Err(e) => {
                warn!("repair of problem {} failed: {}", c.id, e);
                db::mark_needs_review(conn, c.id)?;
                failed += 1;
            }
        }
    }
    Ok((repaired, failed))
}

// ── Artifacts ──

fn artifacts_dir(root: &Path, book_id: i64, source_id: i64, version: i64) -> PathBuf {
    root.join(book_id.to_string()).join(source_id.to_string()).join(format!("v{}", version))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Versioned artifact bundle: the document map, extraction samples, and the
/// metrics report. Produced for every run, partial failures included.
fn write_artifacts(
    conn: &Connection,
    map: &DocumentMap,
    data: &extract::ExtractedData,
    opts: &RunOptions,
    version: i64,
) -> Result<PathBuf> {
    let dir = artifacts_dir(&opts.artifacts_root, opts.book_id, opts.source_id, version);
    write_json(&dir.join("doc_map.json"), map)?;

    let truncate = |s: &str| s.chars().take(200).collect::<String>();
    let samples = serde_json::json!({
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "map_version": version,
        "problems": data.problems.iter().take(5).map(|p| serde_json::json!({
            "number": p.number,
            "section": p.section,
            "text": truncate(&p.text),
            "has_parts": p.has_parts,
        })).collect::<Vec<_>>(),
        "theory": data.theory.iter().take(5).map(|t| serde_json::json!({
            "section": t.section,
            "text": truncate(&t.text),
        })).collect::<Vec<_>>(),
        "answers": data.answers.iter().take(5).map(|a| serde_json::json!({
            "section": a.section,
            "number": a.number,
            "text": truncate(&a.text),
        })).collect::<Vec<_>>(),
    });
    write_json(&dir.join("samples.json"), &samples)?;

    let metrics = db::compute_metrics(conn, opts.book_id, opts.source_id, version)?;
    write_json(&dir.join("metrics.json"), &metrics)?;
    Ok(dir)
}

// ── Tests ──
