use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::cues::{section_label, CueSet};
use crate::docmap::DocumentMap;
use crate::extract::problems::detect_parts;

/// Answer values are clipped to this many chars, like every stored entity.
const MAX_ANSWER_LEN: usize = 2000;

/// "N." / "N)" opening an answer value, possibly mid-line.
static ANSWER_MARK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*[.)]\s*").unwrap());
/// Full-line section header inside the answers block: "§ 1." and nothing else.
static SECTION_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[§$]\s*(\d+(?:\.\d+)?)\s*[.,]?\s*$").unwrap());
/// Section marker embedded mid-line: "§ 8. 1. 45°".
static INLINE_SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[§$]\s*(\d+(?:\.\d+)?)[.,\s]").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerEntry {
    pub section: Option<String>,
    pub number: String,
    pub text: String,
}

struct OpenEntry {
    number: String,
    section: Option<String>,
    lines: Vec<String>,
}

/// Concatenated text of the answers span, if the map has one.
pub fn answers_span_text(map: &DocumentMap, pages: &[(i64, String)]) -> Option<String> {
    let (start, end) = map.answers_range()?;
    let chunks: Vec<&str> = pages
        .iter()
        .filter(|(idx, _)| *idx >= start && *idx <= end)
        .map(|(_, t)| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n\n"))
    }
}

/// Parse answer entries with a tolerant line grammar: a numeral marker opens
/// an entry, several markers on one line yield several entries, and any
/// non-marker line continues the open entry — OCR wraps answers across lines
/// routinely, and dropping those lines loses data. No numeric ceilings.
pub fn parse_answers(text: &str, cues: &CueSet) -> Vec<AnswerEntry> {
    let mut entries: Vec<AnswerEntry> = Vec::new();
    let mut section: Option<String> = None;
    let mut open: Option<OpenEntry> = None;

    for line in text.lines() {
        let lt = line.trim();
        if cues.is_answers_header(lt) {
            continue;
        }
        if lt.is_empty() {
            if let Some(o) = open.as_mut() {
                o.lines.push(String::new());
            }
            continue;
        }

        if let Some(caps) = SECTION_LINE_RE.captures(lt) {
            flush_entry(&mut open, &mut entries);
            section = Some(section_label(&caps[1]));
            continue;
        }

        if let Some(caps) = INLINE_SECTION_RE.captures(lt) {
            let m = caps.get(0).unwrap();
            let prefix = lt[..m.start()].trim();
            if !prefix.is_empty() {
                consume_segment(prefix, &section, &mut open, &mut entries);
            }
            flush_entry(&mut open, &mut entries);
            section = Some(section_label(&caps[1]));
            let rest = lt[m.end()..].trim();
            if !rest.is_empty() {
                consume_segment(rest, &section, &mut open, &mut entries);
            }
            continue;
        }

        consume_segment(lt, &section, &mut open, &mut entries);
    }

    flush_entry(&mut open, &mut entries);
    entries
}

/// Feed one marker-bearing segment through the grammar: emit every complete
/// entry, keep the last one open for continuation lines.
fn consume_segment(
    seg: &str,
    section: &Option<String>,
    open: &mut Option<OpenEntry>,
    entries: &mut Vec<AnswerEntry>,
) {
    let marks = answer_marks(seg);
    if marks.is_empty() {
        if let Some(o) = open.as_mut() {
            o.lines.push(seg.to_string());
        }
        return;
    }

    if marks[0].0 > 0 {
        let prefix = seg[..marks[0].0].trim();
        if !prefix.is_empty() {
            if let Some(o) = open.as_mut() {
                o.lines.push(prefix.to_string());
            }
        }
    }
    flush_entry(open, entries);

    for (i, (_, end, number)) in marks.iter().enumerate() {
        let value_end = marks.get(i + 1).map(|m| m.0).unwrap_or(seg.len());
        let value = seg[*end..value_end].trim();
        if i + 1 < marks.len() {
            let value = clean_value(value);
            if !value.is_empty() {
                entries.push(AnswerEntry {
                    section: section.clone(),
                    number: number.clone(),
                    text: value,
                });
            }
        } else {
            *open = Some(OpenEntry {
                number: number.clone(),
                section: section.clone(),
                lines: vec![value.to_string()],
            });
        }
    }
}

/// Marker positions in a line. A marker is rejected when it is the tail of a
/// number ("13,5.") or of a word ("равна 180."), both frequent inside answer
/// values.
fn answer_marks(line: &str) -> Vec<(usize, usize, String)> {
    let mut out = Vec::new();
    for caps in ANSWER_MARK_RE.captures_iter(line) {
        let m = caps.get(0).unwrap();
        if m.start() > 0 {
            let prev = line[..m.start()].chars().next_back().unwrap();
            if prev.is_ascii_digit() || prev == '.' || prev == ',' {
                continue;
            }
            let prev_word = line[..m.start()].trim_end().chars().next_back();
            if prev_word.is_some_and(|c| c.is_alphabetic()) {
                continue;
            }
        }
        out.push((m.start(), m.end(), caps[1].to_string()));
    }
    out
}

fn flush_entry(open: &mut Option<OpenEntry>, entries: &mut Vec<AnswerEntry>) {
    let Some(o) = open.take() else { return };
    let value = clean_value(&o.lines.join(" "));
    if value.is_empty() {
        return;
    }
    entries.push(AnswerEntry { section: o.section, number: o.number, text: value });
}

fn clean_value(raw: &str) -> String {
    let v = raw.trim().trim_end_matches(['.', ',', ';']).trim();
    v.chars().take(MAX_ANSWER_LEN).collect()
}

// ── Linking ──

/// The slice of a ProblemRecord the linker needs.
#[derive(Debug, Clone)]
pub struct ProblemKey {
    pub id: i64,
    pub number: Option<String>,
    pub section: Option<String>,
    pub has_answer: bool,
    pub has_parts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkConfidence {
    High,
    Low,
}

impl LinkConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkConfidence::High => "high",
            LinkConfidence::Low => "low",
        }
    }
}

#[derive(Debug)]
pub struct Link {
    pub entry: AnswerEntry,
    pub problem_id: Option<i64>,
    pub confidence: LinkConfidence,
    /// The number-only fallback matched several problems (numbering restarts
    /// per section); flagged rather than guessed.
    pub ambiguous: bool,
    /// Per-part answer values when the linked problem has sub-parts.
    pub part_answers: Vec<(String, String)>,
}

/// Join answer entries to problems: `(section, number)` first, then the
/// `(number)` fallback at reduced confidence when a section label is missing
/// on either side. Unmatched entries become orphaned links, never dropped.
pub fn link_entries(entries: Vec<AnswerEntry>, problems: &[ProblemKey]) -> Vec<Link> {
    let mut filled: HashSet<i64> = HashSet::new();
    let mut links = Vec::new();

    for entry in entries {
        let fillable = |p: &&ProblemKey| {
            p.number.as_deref() == Some(entry.number.as_str())
                && !p.has_answer
                && !filled.contains(&p.id)
        };

        let exact = entry.section.as_ref().and_then(|sec| {
            problems
                .iter()
                .filter(|p| fillable(p))
                .find(|p| p.section.as_deref() == Some(sec.as_str()))
        });

        let (problem, confidence, ambiguous) = match exact {
            Some(p) => (Some(p), LinkConfidence::High, false),
            None => {
                let pool: Vec<&ProblemKey> = problems
                    .iter()
                    .filter(|p| fillable(p))
                    .filter(|p| entry.section.is_none() || p.section.is_none())
                    .collect();
                match pool.len() {
                    0 => (None, LinkConfidence::Low, false),
                    1 => (Some(pool[0]), LinkConfidence::Low, false),
                    _ => (None, LinkConfidence::Low, true),
                }
            }
        };

        let part_answers = match problem {
            Some(p) if p.has_parts => detect_parts(&entry.text)
                .into_iter()
                .filter(|part| !part.text.is_empty())
                .map(|part| (part.label, part.text))
                .collect(),
            _ => Vec::new(),
        };

        if let Some(p) = problem {
            filled.insert(p.id);
        }
        links.push(Link {
            problem_id: problem.map(|p| p.id),
            confidence,
            ambiguous,
            part_answers,
            entry,
        });
    }
    links
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cues::Cues;

    fn parse(text: &str) -> Vec<AnswerEntry> {
        parse_answers(text, &Cues::default().compile().unwrap())
    }

    #[test]
    fn simple_entries() {
        let entries = parse("Ответы\n1) x=5\n2) y=7");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].number, "1");
        assert_eq!(entries[0].text, "x=5");
        assert_eq!(entries[1].text, "y=7");
    }

    #[test]
    fn continuation_line_appended_not_dropped() {
        let entries = parse("Ответы\n7. 25 см и\n13 см\n8. 45°");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].number, "7");
        assert_eq!(entries[0].text, "25 см и 13 см");
        assert_eq!(entries[1].number, "8");
    }

    #[test]
    fn multiple_answers_per_line() {
        let entries = parse("4. 25° 7. 13");
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].number.as_str(), entries[0].text.as_str()), ("4", "25°"));
        assert_eq!((entries[1].number.as_str(), entries[1].text.as_str()), ("7", "13"));
    }

    #[test]
    fn section_header_switches_section() {
        let entries = parse("§ 1.\n4. 25°\n§ 2.\n4. 13 см");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].section.as_deref(), Some("§1"));
        assert_eq!(entries[1].section.as_deref(), Some("§2"));
        assert_eq!(entries[1].text, "13 см");
    }

    #[test]
    fn inline_section_marker() {
        let entries = parse("4. 25° § 8. 1. 45°");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].section, None);
        assert_eq!(entries[1].section.as_deref(), Some("§8"));
        assert_eq!(entries[1].number, "1");
        assert_eq!(entries[1].text, "45°");
    }

    #[test]
    fn word_tail_number_not_a_marker() {
        let entries = parse("5. Сумма равна 180. Указание: смежные углы.");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].number, "5");
        assert!(entries[0].text.contains("180"));
        assert!(entries[0].text.contains("Указание"));
    }

    #[test]
    fn decimal_tail_not_a_marker() {
        let entries = parse("3. 13,5. 6. 42");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "13,5");
        assert_eq!(entries[1].number, "6");
    }

    #[test]
    fn no_ceiling_on_numbers() {
        let entries = parse("1287. 33°");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].number, "1287");
    }

    fn key(id: i64, number: &str, section: Option<&str>) -> ProblemKey {
        ProblemKey {
            id,
            number: Some(number.to_string()),
            section: section.map(String::from),
            has_answer: false,
            has_parts: false,
        }
    }

    #[test]
    fn section_match_wins_over_number_match() {
        let problems = vec![key(1, "4", Some("§1")), key(2, "4", Some("§2"))];
        let entries = vec![AnswerEntry {
            section: Some("§2".into()),
            number: "4".into(),
            text: "13".into(),
        }];
        let links = link_entries(entries, &problems);
        assert_eq!(links[0].problem_id, Some(2));
        assert_eq!(links[0].confidence, LinkConfidence::High);
    }

    #[test]
    fn fallback_is_low_confidence() {
        let problems = vec![key(1, "4", None)];
        let entries =
            vec![AnswerEntry { section: None, number: "4".into(), text: "13".into() }];
        let links = link_entries(entries, &problems);
        assert_eq!(links[0].problem_id, Some(1));
        assert_eq!(links[0].confidence, LinkConfidence::Low);
    }

    #[test]
    fn unmatched_entry_becomes_orphan() {
        let problems = vec![key(1, "4", None)];
        let entries =
            vec![AnswerEntry { section: None, number: "99".into(), text: "13".into() }];
        let links = link_entries(entries, &problems);
        assert_eq!(links.len(), 1, "orphans are persisted, not dropped");
        assert_eq!(links[0].problem_id, None);
    }

    #[test]
    fn ambiguous_fallback_stays_orphaned() {
        // numbering restarts per section; entry has no section to disambiguate
        let problems = vec![key(1, "4", None), key(2, "4", None)];
        let entries =
            vec![AnswerEntry { section: None, number: "4".into(), text: "13".into() }];
        let links = link_entries(entries, &problems);
        assert_eq!(links[0].problem_id, None);
        assert!(links[0].ambiguous);
    }

    #[test]
    fn part_answers_split_for_multipart_problem() {
        let problems = vec![ProblemKey {
            id: 1,
            number: Some("4".into()),
            section: None,
            has_answer: false,
            has_parts: true,
        }];
        let entries = vec![AnswerEntry {
            section: None,
            number: "4".into(),
            text: "1) 130° и 50° 2) 110° и 70° 3) 135° и 45°".into(),
        }];
        let links = link_entries(entries, &problems);
        assert_eq!(links[0].problem_id, Some(1));
        assert_eq!(links[0].part_answers.len(), 3);
        assert_eq!(links[0].part_answers[0], ("1".into(), "130° и 50°".into()));
    }

    #[test]
    fn each_problem_filled_once() {
        let problems = vec![key(1, "4", None)];
        let entries = vec![
            AnswerEntry { section: None, number: "4".into(), text: "13".into() },
            AnswerEntry { section: None, number: "4".into(), text: "99".into() },
        ];
        let links = link_entries(entries, &problems);
        assert_eq!(links[0].problem_id, Some(1));
        assert_eq!(links[1].problem_id, None, "second entry cannot refill");
    }
}
