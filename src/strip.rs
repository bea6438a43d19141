use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::cues::CueSet;

/// Only this many lines at the top and bottom of a page are candidates for
/// stripping; interior lines are never touched.
pub const DEFAULT_ZONE: usize = 4;

static PAGE_NUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{1,4}$").unwrap());
static ENUM_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+[.)]\s").unwrap());
static DIGIT_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

pub struct StripStats {
    pub stripped: usize,
    pub recurring: usize,
}

/// Remove recurring running headers/footers and bare page numbers from the
/// top/bottom zones of each page.
///
/// A zone line is stripped when it recurs (digits masked) in the same zone on
/// enough other pages, or matches a known noise shape. Enumerations, section
/// markers, and block headers are never stripped, even in-zone.
pub fn strip_pages(texts: &[String], zone: usize, cues: &CueSet) -> (Vec<String>, StripStats) {
    // Recurrence census over zone lines, digits masked so "82 8 класс" and
    // "83 8 класс" count as the same running header.
    let mut census: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for line in zone_lines(text, zone) {
            let key = mask_line(line);
            if !key.is_empty() {
                *census.entry(key).or_insert(0) += 1;
            }
        }
    }
    let recur_floor = (texts.len() * 3 / 10).max(3);

    let mut stats = StripStats { stripped: 0, recurring: 0 };
    let stripped_texts = texts
        .iter()
        .map(|text| {
            let lines: Vec<&str> = text.lines().collect();
            let top_end = zone.min(lines.len());
            let bottom_start = lines.len().saturating_sub(zone).max(top_end);
            let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
            for (i, line) in lines.iter().enumerate() {
                let in_zone = i < top_end || i >= bottom_start;
                if in_zone && strippable(line, &census, recur_floor, cues, &mut stats) {
                    stats.stripped += 1;
                    continue;
                }
                kept.push(line);
            }
            kept.join("\n").trim().to_string()
        })
        .collect();
    (stripped_texts, stats)
}

fn zone_lines(text: &str, zone: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let top_end = zone.min(lines.len());
    let bottom_start = lines.len().saturating_sub(zone).max(top_end);
    lines[..top_end]
        .iter()
        .chain(lines[bottom_start..].iter())
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect()
}

fn mask_line(line: &str) -> String {
    let lower = line.trim().to_lowercase();
    DIGIT_RUN_RE.replace_all(&lower, "#").into_owned()
}

fn strippable(
    line: &str,
    census: &HashMap<String, usize>,
    recur_floor: usize,
    cues: &CueSet,
    stats: &mut StripStats,
) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    // Content that must survive even in the zone.
    if ENUM_LINE_RE.is_match(trimmed)
        || cues.paragraph_label(trimmed).is_some()
        || cues.is_task_header(trimmed)
        || cues.is_answers_header(trimmed)
        || trimmed.chars().count() > 60
    {
        return false;
    }
    if PAGE_NUM_RE.is_match(trimmed) || cues.is_header_noise(trimmed) {
        return true;
    }
    if census.get(&mask_line(trimmed)).copied().unwrap_or(0) >= recur_floor {
        stats.recurring += 1;
        return true;
    }
    false
}

// ── Tests ──
