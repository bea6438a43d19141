use std::sync::LazyLock;

use regex::Regex;

use crate::cues::CueSet;
use crate::docmap::DocumentMap;

/// Bare "N." / "N)" marker followed by whitespace or end of line.
static NUM_MARK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)[.)](?:\s+|\s*$)").unwrap());

/// Sub-part markers, tried in order: "1)", "а)", "a)".
static PART_RES: LazyLock<[(Regex, &'static str); 3]> = LazyLock::new(|| {
    [
        (Regex::new(r"\b([1-9])\)\s*").unwrap(), "123456789"),
        (Regex::new(r"\b([а-где])\)\s*").unwrap(), "абвгде"),
        (Regex::new(r"\b([a-e])\)\s*").unwrap(), "abcde"),
    ]
});

#[derive(Debug, Clone)]
pub struct Part {
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Problem {
    pub number: Option<String>,
    pub section: Option<String>,
    pub text: String,
    pub solution_text: Option<String>,
    pub answer_text: Option<String>,
    pub problem_type: &'static str,
    pub has_parts: bool,
    pub parts: Vec<Part>,
    pub start_page: i64,
    pub end_page: i64,
    pub line_offset: usize,
}

#[derive(PartialEq)]
enum Field {
    Body,
    Solution,
    Answer,
}

struct Acc {
    number: Option<String>,
    section: Option<String>,
    body: Vec<String>,
    solution: Vec<String>,
    answer: Vec<String>,
    field: Field,
    start_page: i64,
    end_page: i64,
    line_offset: usize,
}

impl Acc {
    fn new(number: Option<String>, section: Option<String>, page: i64, line: usize) -> Self {
        Self {
            number,
            section,
            body: Vec::new(),
            solution: Vec::new(),
            answer: Vec::new(),
            field: Field::Body,
            start_page: page,
            end_page: page,
            line_offset: line,
        }
    }

    fn push(&mut self, text: &str, page: i64) {
        self.end_page = self.end_page.max(page);
        match self.field {
            Field::Body => self.body.push(text.to_string()),
            Field::Solution => self.solution.push(text.to_string()),
            Field::Answer => self.answer.push(text.to_string()),
        }
    }

    fn push_blank(&mut self) {
        match self.field {
            Field::Body => self.body.push(String::new()),
            Field::Solution => self.solution.push(String::new()),
            Field::Answer => self.answer.push(String::new()),
        }
    }
}

/// Extract problems from the task-block spans of `map`, one record per
/// logical problem, ordered by first page then first line offset.
pub fn extract(map: &DocumentMap, pages: &[(i64, String)], cues: &CueSet) -> Vec<Problem> {
    let mut out = Vec::new();
    for span in map.task_spans() {
        let mut section = map.section_for_page(span.start_page);
        let mut acc: Option<Acc> = None;
        for page in span.start_page..=span.end_page {
            let Some(text) = page_text(pages, page) else { continue };
            for (li, line) in text.lines().enumerate() {
                let lt = line.trim();
                if lt.is_empty() {
                    if let Some(a) = acc.as_mut() {
                        a.push_blank();
                    }
                    continue;
                }

                // Section markers never start problems; they switch the
                // section for everything that follows.
                if let Some(label) = cues.paragraph_label(lt) {
                    flush(&mut acc, &mut out, cues);
                    section = Some(label);
                    continue;
                }

                // A block header ("Задачи", "Упражнения") is a boundary.
                if cues.is_task_header(lt) {
                    flush(&mut acc, &mut out, cues);
                    continue;
                }

                if let Some(end) = cues.solution_marker_end(lt) {
                    if let Some(a) = acc.as_mut() {
                        a.field = Field::Solution;
                        let rest = lt[end..].trim();
                        if !rest.is_empty() {
                            a.push(rest, page);
                        }
                    }
                    continue;
                }
                if let Some(end) = cues.answer_marker_end(lt) {
                    if let Some(a) = acc.as_mut() {
                        a.field = Field::Answer;
                        let rest = lt[end..].trim();
                        if !rest.is_empty() {
                            a.push(rest, page);
                        }
                    }
                    continue;
                }

                let starts = find_starts(lt, cues);
                if starts.is_empty() {
                    if let Some(a) = acc.as_mut() {
                        a.push(lt, page);
                    }
                    continue;
                }

                // Text before the first marker continues the open problem.
                if starts[0].0 > 0 {
                    if let Some(a) = acc.as_mut() {
                        let prefix = lt[..starts[0].0].trim();
                        if !prefix.is_empty() {
                            a.push(prefix, page);
                        }
                    }
                }
                // One fragment per marker, each its own record. This split
                // happens before accumulation, so a line with two markers can
                // never land in one record.
                for (k, (offset, _, number)) in starts.iter().enumerate() {
                    let frag_end = starts.get(k + 1).map(|s| s.0).unwrap_or(lt.len());
                    let frag = lt[*offset..frag_end].trim();
                    flush(&mut acc, &mut out, cues);
                    let mut a = Acc::new(Some(number.clone()), section.clone(), page, li);
                    a.push(frag, page);
                    acc = Some(a);
                }
            }
        }
        flush(&mut acc, &mut out, cues);
    }
    out
}

fn page_text(pages: &[(i64, String)], page: i64) -> Option<&str> {
    pages
        .iter()
        .find(|(idx, _)| *idx == page)
        .map(|(_, t)| t.as_str())
}

/// All problem-start markers in a line with byte offsets: named cues
/// ("Задача 5", "№ 12") plus bare "N." / "N)" markers. A bare marker only
/// counts at line start or right after a sentence boundary, so "углы равны
/// 180." never opens a problem.
fn find_starts(line: &str, cues: &CueSet) -> Vec<(usize, usize, String)> {
    let mut marks: Vec<(usize, usize, String)> = cues
        .named_problem_starts(line)
        .into_iter()
        .map(|m| (m.offset, m.end, m.number))
        .collect();

    for caps in NUM_MARK_RE.captures_iter(line) {
        let m = caps.get(0).unwrap();
        if !bare_marker_position_ok(line, m.start()) {
            continue;
        }
        marks.push((m.start(), m.end(), caps[1].to_string()));
    }

    marks.sort_by_key(|(start, _, _)| *start);
    let mut out: Vec<(usize, usize, String)> = Vec::new();
    let mut last_end = 0usize;
    for (start, end, number) in marks {
        if !out.is_empty() && start < last_end {
            continue;
        }
        last_end = end;
        out.push((start, end, number));
    }
    out
}

fn bare_marker_position_ok(line: &str, start: usize) -> bool {
    let before = line[..start].trim_end();
    if before.is_empty() {
        return true;
    }
    // ':' and ';' introduce sub-part enumerations, not new problems.
    before.ends_with(['.', '!', '?'])
}

fn flush(acc: &mut Option<Acc>, out: &mut Vec<Problem>, cues: &CueSet) {
    let Some(a) = acc.take() else { return };
    let text = join_field(&a.body);
    if text.is_empty() && a.number.is_none() {
        return;
    }
    let parts = detect_parts(&text);
    out.push(Problem {
        problem_type: cues.classify_problem_type(&text),
        has_parts: !parts.is_empty(),
        number: a.number,
        section: a.section,
        solution_text: none_if_empty(join_field(&a.solution)),
        answer_text: none_if_empty(join_field(&a.answer)),
        text,
        parts,
        start_page: a.start_page,
        end_page: a.end_page,
        line_offset: a.line_offset,
    });
}

fn join_field(lines: &[String]) -> String {
    lines.join("\n").trim().to_string()
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Split a multi-part problem body into sub-parts. Requires at least two
/// markers forming a mostly-correct sequence ("1) 2) 3)", "а) б) в)"), which
/// keeps stray ")" from creating phantom parts.
pub fn detect_parts(text: &str) -> Vec<Part> {
    for (re, order) in PART_RES.iter() {
        let marks: Vec<(usize, usize, String)> = re
            .captures_iter(text)
            .map(|caps| {
                let m = caps.get(0).unwrap();
                (m.start(), m.end(), caps[1].to_string())
            })
            .collect();
        if marks.len() < 2 {
            continue;
        }
        let expected: Vec<String> = order.chars().take(marks.len()).map(String::from).collect();
        let correct = marks
            .iter()
            .zip(expected.iter())
            .filter(|((_, _, got), want)| got == *want)
            .count();
        if correct * 10 < marks.len() * 7 {
            continue;
        }
        return marks
            .iter()
            .enumerate()
            .map(|(i, (_, end, label))| {
                let stop = marks.get(i + 1).map(|m| m.0).unwrap_or(text.len());
                Part {
                    label: label.clone(),
                    text: text[*end..stop].trim().trim_end_matches([';', ',']).to_string(),
                }
            })
            .collect();
    }
    Vec::new()
}

// ── Tests ──
