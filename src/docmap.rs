use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cues::CueSet;

/// Pages below this best-vote score carry no confident type of their own and
/// absorb the neighboring span's type instead.
const MIN_VOTE: f64 = 0.3;
/// Confidence assigned to absorbed pages.
const CONTINUITY_CONF: f64 = 0.35;
/// TOC is only looked for within the first pages of a book.
const TOC_WINDOW: i64 = 20;
/// Index is only looked for within the last pages of a book.
const INDEX_WINDOW: i64 = 20;

static NUM_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:\.\d+)?[.)]\s").unwrap());
static TOC_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[§$]?\s*\d+[.)]\s+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    FrontMatter,
    Toc,
    Paragraph,
    TaskBlock,
    Answers,
    Index,
}

impl SpanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanType::FrontMatter => "front_matter",
            SpanType::Toc => "toc",
            SpanType::Paragraph => "paragraph",
            SpanType::TaskBlock => "task_block",
            SpanType::Answers => "answers",
            SpanType::Index => "index",
        }
    }

    /// Paragraph/task_block/answers partition the page range; the rest are
    /// page-granularity overlays.
    pub fn is_partitioning(&self) -> bool {
        matches!(self, SpanType::Paragraph | SpanType::TaskBlock | SpanType::Answers)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub page: i64,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    #[serde(rename = "type")]
    pub span_type: SpanType,
    pub start_page: i64,
    pub end_page: i64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub section_label: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub anchors: Vec<Anchor>,
}

/// Versioned segmentation of one source document. Immutable once persisted;
/// re-segmentation produces a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMap {
    pub version: i64,
    pub book_id: i64,
    pub source_id: i64,
    pub spans: Vec<Span>,
}

impl DocumentMap {
    pub fn paragraph_spans(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(|s| s.span_type == SpanType::Paragraph)
    }

    pub fn task_spans(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(|s| s.span_type == SpanType::TaskBlock)
    }

    pub fn answers_range(&self) -> Option<(i64, i64)> {
        self.spans
            .iter()
            .find(|s| s.span_type == SpanType::Answers)
            .map(|s| (s.start_page, s.end_page))
    }

    /// Section label in effect at `page`: the last labeled paragraph span
    /// starting at or before it.
    pub fn section_for_page(&self, page: i64) -> Option<String> {
        self.paragraph_spans()
            .filter(|s| s.start_page <= page)
            .filter_map(|s| s.section_label.clone())
            .last()
    }

    /// Partitioning spans must cover 1..=total exactly once, in order.
    pub fn verify_partition(&self, total_pages: i64) -> Result<(), String> {
        let mut parts: Vec<&Span> =
            self.spans.iter().filter(|s| s.span_type.is_partitioning()).collect();
        parts.sort_by_key(|s| s.start_page);
        let mut expect = 1i64;
        for s in &parts {
            if s.start_page != expect {
                return Err(format!(
                    "partition gap/overlap at page {}: {} span starts at {}",
                    expect,
                    s.span_type.as_str(),
                    s.start_page
                ));
            }
            if s.end_page < s.start_page {
                return Err(format!("inverted span at page {}", s.start_page));
            }
            expect = s.end_page + 1;
        }
        if expect != total_pages + 1 {
            return Err(format!("partition covers up to {}, expected {}", expect - 1, total_pages));
        }
        Ok(())
    }
}

#[derive(Default)]
struct PageInfo {
    paragraph_score: f64,
    task_score: f64,
    answers_score: f64,
    fallback_heading: bool,
    enum_lines: usize,
    nonempty: usize,
    /// (section label, anchor) per explicit paragraph marker, in line order.
    par_anchors: Vec<(String, Anchor)>,
    other_anchors: Vec<Anchor>,
    answers_header: bool,
}

/// Build the document map for an ordered page sequence.
///
/// Vote priority: explicit anchor > positional heuristic > density heuristic;
/// ties keep the previous page's type; unvoted pages absorb their neighbor.
pub fn build(
    pages_in: &[(i64, String)],
    book_id: i64,
    source_id: i64,
    version: i64,
    cues: &CueSet,
) -> DocumentMap {
    let mut pages: Vec<(i64, &str)> =
        pages_in.iter().map(|(i, t)| (*i, t.as_str())).collect();
    pages.sort_by_key(|(i, _)| *i);
    let total = pages.last().map(|(i, _)| *i).unwrap_or(0);
    if pages.is_empty() {
        return DocumentMap { version, book_id, source_id, spans: Vec::new() };
    }

    let toc = detect_toc(&pages, cues);
    let index = detect_index(&pages, total, cues);
    let overlay_pages: HashSet<i64> = toc
        .iter()
        .chain(index.iter())
        .flat_map(|s| s.start_page..=s.end_page)
        .collect();

    // Score pages; an accepted answers anchor re-routes later enumeration
    // density to the answers type (answers run to the back of the book).
    let mut answers_open = false;
    let mut infos: Vec<PageInfo> = Vec::with_capacity(pages.len());
    for (idx, text) in &pages {
        let info = score_page(*idx, total, text, cues, answers_open, overlay_pages.contains(idx));
        if info.answers_header && info.answers_score >= 0.5 {
            answers_open = true;
        }
        infos.push(info);
    }

    // Resolve one type per page.
    let mut resolved: Vec<Option<(SpanType, f64)>> = Vec::with_capacity(infos.len());
    for info in &infos {
        let cands = [
            (SpanType::Paragraph, info.paragraph_score),
            (SpanType::TaskBlock, info.task_score),
            (SpanType::Answers, info.answers_score),
        ];
        let best = cands.iter().map(|c| c.1).fold(0.0, f64::max);
        if best < MIN_VOTE {
            resolved.push(None);
            continue;
        }
        let winners: Vec<SpanType> =
            cands.iter().filter(|c| (best - c.1).abs() < 1e-9).map(|c| c.0).collect();
        let prev = resolved.iter().rev().flatten().next().map(|(t, _)| *t);
        let ty = prev
            .filter(|p| winners.len() > 1 && winners.contains(p))
            .unwrap_or(winners[0]);
        resolved.push(Some((ty, best)));
    }

    // Absorb unvoted pages: forward fill, leading pages take the first
    // resolved type. A book with no cues at all becomes one paragraph span.
    let first_ty = resolved
        .iter()
        .flatten()
        .next()
        .map(|(t, _)| *t)
        .unwrap_or(SpanType::Paragraph);
    let mut prev_ty = first_ty;
    let filled: Vec<(SpanType, f64)> = resolved
        .iter()
        .map(|r| match r {
            Some((t, c)) => {
                prev_ty = *t;
                (*t, *c)
            }
            None => (prev_ty, CONTINUITY_CONF),
        })
        .collect();

    // Merge adjacent same-type pages; a new paragraph anchor starts a new span.
    let mut spans: Vec<Span> = Vec::new();
    let mut cur: Option<Span> = None;
    let mut confs: Vec<f64> = Vec::new();
    for (((idx, _), (ty, conf)), info) in pages.iter().zip(filled.iter()).zip(infos.iter()) {
        let split = match &cur {
            None => true,
            Some(b) => {
                b.span_type != *ty
                    || (*ty == SpanType::Paragraph && !info.par_anchors.is_empty())
            }
        };
        if split {
            if let Some(mut b) = cur.take() {
                b.confidence = mean(&confs);
                spans.push(b);
                confs.clear();
            }
            let section_label = if *ty == SpanType::Paragraph {
                info.par_anchors.last().map(|(label, _)| label.clone())
            } else {
                None
            };
            cur = Some(Span {
                span_type: *ty,
                start_page: *idx,
                end_page: *idx,
                confidence: 0.0,
                section_label,
                anchors: Vec::new(),
            });
        }
        let b = cur.as_mut().unwrap();
        b.end_page = *idx;
        confs.push(*conf);
        b.anchors
            .extend(info.par_anchors.iter().map(|(_, a)| a.clone()));
        b.anchors.extend(info.other_anchors.iter().cloned());
    }
    if let Some(mut b) = cur.take() {
        b.confidence = mean(&confs);
        spans.push(b);
    }

    // Front matter overlay: pages before the first structural anchor.
    let first_anchor_page = infos
        .iter()
        .zip(pages.iter())
        .filter(|(info, _)| !info.par_anchors.is_empty() || !info.other_anchors.is_empty())
        .map(|(_, (idx, _))| *idx)
        .chain(toc.iter().map(|s| s.start_page))
        .min();
    if let Some(first) = first_anchor_page {
        if first > 1 {
            spans.insert(
                0,
                Span {
                    span_type: SpanType::FrontMatter,
                    start_page: 1,
                    end_page: first - 1,
                    confidence: 0.8,
                    section_label: None,
                    anchors: Vec::new(),
                },
            );
        }
    }

    spans.extend(toc);
    spans.extend(index);

    DocumentMap { version, book_id, source_id, spans }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn short(line: &str) -> String {
    line.chars().take(60).collect()
}

fn score_page(
    idx: i64,
    total: i64,
    text: &str,
    cues: &CueSet,
    answers_open: bool,
    suppressed: bool,
) -> PageInfo {
    let mut info = PageInfo::default();
    if suppressed || text.trim().is_empty() {
        return info;
    }

    let mut prev_blank = true;
    for (li, line) in text.lines().enumerate() {
        let lt = line.trim();
        if lt.is_empty() {
            prev_blank = true;
            continue;
        }
        info.nonempty += 1;

        if let Some(label) = cues.paragraph_label(lt) {
            info.par_anchors
                .push((label, Anchor { page: idx, line: li, text: short(lt) }));
        } else if prev_blank && li < 15 && cues.is_paragraph_fallback(lt) {
            info.fallback_heading = true;
        }

        if cues.is_task_header(lt) && info.task_score == 0.0 {
            info.task_score = 0.85;
            info.other_anchors
                .push(Anchor { page: idx, line: li, text: short(lt) });
        }

        if li < 8 && cues.is_answers_header(lt) && !info.answers_header {
            info.answers_header = true;
            info.other_anchors
                .push(Anchor { page: idx, line: li, text: short(lt) });
        }

        if NUM_START_RE.is_match(lt)
            || cues.named_problem_starts(lt).first().map(|m| m.offset == 0).unwrap_or(false)
        {
            info.enum_lines += 1;
        }
        prev_blank = false;
    }

    if !info.par_anchors.is_empty() {
        // A heading at the very top opens a theory page; one buried mid-page
        // is a section switch inside another block and votes weaker.
        let first_line = info.par_anchors.first().map(|(_, a)| a.line).unwrap_or(0);
        info.paragraph_score = if first_line <= 1 { 0.9 } else { 0.75 };
    } else if info.fallback_heading && info.enum_lines < 3 {
        info.paragraph_score = 0.6;
    }

    let frac = info.enum_lines as f64 / info.nonempty.max(1) as f64;
    if info.enum_lines >= 3 && frac >= 0.2 {
        let density = (0.5 + 0.3 * frac).min(0.8);
        if answers_open {
            info.answers_score = info.answers_score.max(density.min(0.75));
        } else {
            info.task_score = info.task_score.max(density);
        }
    }

    if info.answers_header {
        info.answers_score = info.answers_score.max(positional_answers_score(idx, total));
    }

    info
}

/// "Ответы" cues are only trusted toward the back of the book.
fn positional_answers_score(idx: i64, total: i64) -> f64 {
    let ratio = idx as f64 / total.max(1) as f64;
    if ratio < 0.5 {
        // Below the vote floor: an "Ответы" line in the front half is noise.
        0.25
    } else if ratio >= 0.85 {
        0.95
    } else {
        0.5 + 0.45 * (ratio - 0.5) / 0.35
    }
}

fn detect_toc(pages: &[(i64, &str)], cues: &CueSet) -> Option<Span> {
    let mut run: Option<Span> = None;
    for (idx, text) in pages {
        if *idx > TOC_WINDOW {
            break;
        }
        let explicit = text
            .lines()
            .take(5)
            .any(|l| cues.is_toc_header(l.trim()));
        let density = toc_density(text);
        let qualifies = explicit || density >= 0.8;
        if qualifies {
            match &mut run {
                Some(span) if span.end_page + 1 == *idx => span.end_page = *idx,
                Some(_) => break,
                slot => {
                    *slot = Some(Span {
                        span_type: SpanType::Toc,
                        start_page: *idx,
                        end_page: *idx,
                        confidence: if explicit { 0.9 } else { 0.85 },
                        section_label: None,
                        anchors: Vec::new(),
                    });
                }
            }
        } else if run.is_some() {
            break;
        }
    }
    run
}

/// Many short enumerated lines mean a table of contents.
fn toc_density(text: &str) -> f64 {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.len() < 5 {
        return 0.0;
    }
    let short = lines.iter().filter(|l| l.chars().count() < 80).count();
    let numbered = lines.iter().filter(|l| TOC_LINE_RE.is_match(l)).count();
    if short * 10 >= lines.len() * 6 && numbered >= 3 {
        0.85
    } else {
        0.0
    }
}

fn detect_index(pages: &[(i64, &str)], total: i64, cues: &CueSet) -> Option<Span> {
    for (idx, text) in pages {
        if *idx < total - INDEX_WINDOW {
            continue;
        }
        if text.lines().take(5).any(|l| cues.is_index_header(l.trim())) {
            return Some(Span {
                span_type: SpanType::Index,
                start_page: *idx,
                end_page: total,
                confidence: 0.8,
                section_label: None,
                anchors: Vec::new(),
            });
        }
    }
    None
}

/// Re-merge adjacent same-type partitioning spans (used after gateway
/// re-typing). Confidence is the page-weighted mean; overlays pass through.
pub fn merge_spans(spans: Vec<Span>) -> Vec<Span> {
    let (parts, overlays): (Vec<Span>, Vec<Span>) =
        spans.into_iter().partition(|s| s.span_type.is_partitioning());
    let mut merged: Vec<Span> = Vec::new();
    for s in parts {
        match merged.last_mut() {
            Some(prev)
                if prev.span_type == s.span_type && prev.end_page + 1 == s.start_page =>
            {
                let prev_pages = (prev.end_page - prev.start_page + 1) as f64;
                let s_pages = (s.end_page - s.start_page + 1) as f64;
                prev.confidence = (prev.confidence * prev_pages + s.confidence * s_pages)
                    / (prev_pages + s_pages);
                prev.end_page = s.end_page;
                prev.anchors.extend(s.anchors);
                if prev.section_label.is_none() {
                    prev.section_label = s.section_label;
                }
            }
            _ => merged.push(s),
        }
    }
    merged.extend(overlays);
    merged
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cues::Cues;

    fn cues() -> CueSet {
        Cues::default().compile().unwrap()
    }

    fn pages(texts: &[&str]) -> Vec<(i64, String)> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| (i as i64 + 1, t.to_string()))
            .collect()
    }

    fn build_map(texts: &[&str]) -> DocumentMap {
        build(&pages(texts), 1, 1, 1, &cues())
    }

    fn part_types(map: &DocumentMap) -> Vec<(SpanType, i64, i64)> {
        map.spans
            .iter()
            .filter(|s| s.span_type.is_partitioning())
            .map(|s| (s.span_type, s.start_page, s.end_page))
            .collect()
    }

    #[test]
    fn mini_book_three_spans() {
        let map = build_map(&[
            "§3. Теория о смежных углах.",
            "Задачи\n1. Найти x.\n2. Найти y.",
            "Ответы\n1) x=5\n2) y=7",
        ]);
        assert_eq!(
            part_types(&map),
            vec![
                (SpanType::Paragraph, 1, 1),
                (SpanType::TaskBlock, 2, 2),
                (SpanType::Answers, 3, 3),
            ]
        );
        map.verify_partition(3).unwrap();
        assert_eq!(
            map.paragraph_spans().next().unwrap().section_label.as_deref(),
            Some("§3")
        );
    }

    #[test]
    fn unvoted_page_absorbed_with_reduced_confidence() {
        let map = build_map(&[
            "§1. Теория.",
            "Продолжение прозы без каких-либо маркеров.",
            "Задачи\n1. Найдите угол.\n2. Найдите сторону.\n3. Докажите.",
        ]);
        let parts = part_types(&map);
        assert_eq!(parts[0], (SpanType::Paragraph, 1, 2));
        assert_eq!(parts[1].0, SpanType::TaskBlock);
        map.verify_partition(3).unwrap();
        let para = map.paragraph_spans().next().unwrap();
        assert!(para.confidence < 0.9, "absorbed page must dilute confidence");
    }

    #[test]
    fn no_answers_cues_no_answers_span() {
        let map = build_map(&["§1. Теория.", "Задачи\n1. Найдите x."]);
        assert!(map.answers_range().is_none());
        map.verify_partition(2).unwrap();
    }

    #[test]
    fn answers_cue_early_in_book_distrusted() {
        let texts: Vec<String> = (0..10)
            .map(|i| {
                if i == 1 {
                    "Ответы".to_string()
                } else {
                    format!("§{}. Теория раздела.", i + 1)
                }
            })
            .collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let map = build_map(&refs);
        // Page 2 of 10 is far from the back: weak vote, absorbed by paragraphs.
        assert!(map.answers_range().is_none());
        map.verify_partition(10).unwrap();
    }

    #[test]
    fn new_paragraph_anchor_splits_spans() {
        let map = build_map(&[
            "§1. Первая тема.",
            "§2. Вторая тема.",
            "Задачи\n1. Найти.\n2. Доказать.\n3. Вычислить.",
        ]);
        let labels: Vec<Option<&str>> = map
            .paragraph_spans()
            .map(|s| s.section_label.as_deref())
            .collect();
        assert_eq!(labels, vec![Some("§1"), Some("§2")]);
        map.verify_partition(3).unwrap();
    }

    #[test]
    fn answers_continuation_pages_stay_answers() {
        let mut texts = vec![
            "§1. Теория.".to_string(),
            "Задачи\n1. Найти x.\n2. Найти y.\n3. Найти z.".to_string(),
        ];
        for _ in 0..6 {
            texts.push("Обычная страница теории и прозы без маркеров.".to_string());
        }
        texts.push("Ответы\n1) 5\n2) 7\n3) 9".to_string());
        texts.push("4) 11\n5) 13\n6) 15".to_string());
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let map = build_map(&refs);
        let (start, end) = map.answers_range().expect("answers span");
        assert_eq!((start, end), (9, 10));
        map.verify_partition(10).unwrap();
    }

    #[test]
    fn toc_suppresses_paragraph_anchors() {
        let map = build_map(&[
            "Содержание\n§ 1. Тема один 3\n§ 2. Тема два 8\n§ 3. Тема три 12\n§ 4. Тема четыре 20\n§ 5. Тема пять 28",
            "§1. Настоящая теория.",
            "Задачи\n1. Найти.\n2. Доказать.\n3. Вычислить.",
        ]);
        let toc: Vec<&Span> =
            map.spans.iter().filter(|s| s.span_type == SpanType::Toc).collect();
        assert_eq!(toc.len(), 1);
        assert_eq!(toc[0].start_page, 1);
        // TOC's § lines must not become labeled paragraph spans
        let labels: Vec<&str> = map
            .paragraph_spans()
            .filter_map(|s| s.section_label.as_deref())
            .collect();
        assert_eq!(labels, vec!["§1"]);
        map.verify_partition(3).unwrap();
    }

    #[test]
    fn front_matter_overlay_before_first_anchor() {
        let map = build_map(&[
            "Издательство. Авторы. Аннотация.",
            "§1. Теория.",
            "Задачи\n1. Найти.\n2. Доказать.\n3. Вычислить.",
        ]);
        let front: Vec<&Span> = map
            .spans
            .iter()
            .filter(|s| s.span_type == SpanType::FrontMatter)
            .collect();
        assert_eq!(front.len(), 1);
        assert_eq!((front[0].start_page, front[0].end_page), (1, 1));
        // Overlay does not break the partition
        map.verify_partition(3).unwrap();
    }

    #[test]
    fn section_for_page_walks_back() {
        let map = build_map(&[
            "§1. Первая тема.",
            "§2. Вторая тема.",
            "Задачи\n1. Найти.\n2. Доказать.\n3. Вычислить.",
        ]);
        assert_eq!(map.section_for_page(3).as_deref(), Some("§2"));
        assert_eq!(map.section_for_page(1).as_deref(), Some("§1"));
    }

    #[test]
    fn artifact_roundtrip() {
        let map = build_map(&[
            "§3. Теория.",
            "Задачи\n1. Найти x.\n2. Найти y.",
            "Ответы\n1) x=5\n2) y=7",
        ]);
        let json = serde_json::to_string_pretty(&map).unwrap();
        assert!(json.contains("\"task_block\""));
        let back: DocumentMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.spans.len(), map.spans.len());
        back.verify_partition(3).unwrap();
    }

    #[test]
    fn merge_spans_after_retype() {
        let map = build_map(&[
            "§1. Теория.",
            "Задачи\n1. Найти.\n2. Доказать.\n3. Вычислить.",
            "4. Ещё задача.\n5. И ещё.\n6. Последняя.",
        ]);
        map.verify_partition(3).unwrap();
        let merged = merge_spans(map.spans.clone());
        // Adjacent task pages collapse into one span
        let tasks: Vec<&Span> =
            merged.iter().filter(|s| s.span_type == SpanType::TaskBlock).collect();
        assert_eq!(tasks.len(), 1);
        assert_eq!((tasks[0].start_page, tasks[0].end_page), (2, 3));
    }
}
