use std::collections::HashMap;

use crate::docmap::DocumentMap;

/// Theory shorter than this is a heading fragment, not a passage.
const MIN_THEORY_LEN: usize = 50;

#[derive(Debug, Clone)]
pub struct Theory {
    pub section: String,
    pub text: String,
    pub start_page: i64,
    pub end_page: i64,
}

/// One theory record per labeled paragraph span, reading paragraph-span pages
/// only. Spans sharing a section label merge into one record. Ordered by
/// section number, then page. Idempotent for a fixed map and pages.
pub fn extract(map: &DocumentMap, pages: &[(i64, String)]) -> Vec<Theory> {
    let by_page: HashMap<i64, &str> =
        pages.iter().map(|(idx, t)| (*idx, t.as_str())).collect();

    let mut merged: Vec<Theory> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for span in map.paragraph_spans() {
        let Some(section) = span.section_label.clone() else {
            // Unlabeled paragraph spans are absorbed prose (front matter and
            // the like), not theory of any section.
            continue;
        };
        let first_anchor_line = span
            .anchors
            .iter()
            .filter(|a| a.page == span.start_page)
            .map(|a| a.line)
            .min();

        let mut chunks: Vec<String> = Vec::new();
        for page in span.start_page..=span.end_page {
            let Some(text) = by_page.get(&page) else { continue };
            let chunk = if page == span.start_page {
                match first_anchor_line {
                    Some(line) => text
                        .lines()
                        .skip(line)
                        .collect::<Vec<_>>()
                        .join("\n"),
                    None => (*text).to_string(),
                }
            } else {
                (*text).to_string()
            };
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
        }
        if chunks.is_empty() {
            continue;
        }
        let text = chunks.join("\n\n");

        match index.get(&section) {
            Some(&i) => {
                let t = &mut merged[i];
                t.text.push_str("\n\n");
                t.text.push_str(&text);
                t.start_page = t.start_page.min(span.start_page);
                t.end_page = t.end_page.max(span.end_page);
            }
            None => {
                index.insert(section.clone(), merged.len());
                merged.push(Theory {
                    section,
                    text,
                    start_page: span.start_page,
                    end_page: span.end_page,
                });
            }
        }
    }

    merged.retain(|t| t.text.chars().count() >= MIN_THEORY_LEN);
    merged.sort_by(|a, b| {
        section_order(&a.section)
            .partial_cmp(&section_order(&b.section))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.start_page.cmp(&b.start_page))
    });
    merged
}

fn section_order(label: &str) -> f64 {
    label
        .trim_start_matches('§')
        .trim()
        .parse::<f64>()
        .unwrap_or(f64::INFINITY)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cues::Cues;
    use crate::docmap;

    fn extract_from(texts: &[&str]) -> Vec<Theory> {
        let pages: Vec<(i64, String)> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| (i as i64 + 1, t.to_string()))
            .collect();
        let cues = Cues::default().compile().unwrap();
        let map = docmap::build(&pages, 1, 1, 1, &cues);
        extract(&map, &pages)
    }

    const THEORY_1: &str = "§1. Смежные углы.\nДва угла называются смежными, если одна сторона у них общая, а две другие являются продолжениями одна другой.";
    const THEORY_2: &str = "§2. Вертикальные углы.\nДва угла называются вертикальными, если стороны одного являются продолжениями сторон другого.";

    #[test]
    fn one_record_per_labeled_span() {
        let records = extract_from(&[THEORY_1, THEORY_2]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].section, "§1");
        assert!(records[0].text.contains("смежными"));
        assert_eq!(records[1].section, "§2");
    }

    #[test]
    fn never_reads_task_text() {
        let records = extract_from(&[
            THEORY_1,
            "Задачи\n1. Найдите смежный угол.\n2. Докажите равенство.\n3. Вычислите сумму.",
        ]);
        assert_eq!(records.len(), 1);
        assert!(!records[0].text.contains("Найдите смежный угол"));
    }

    #[test]
    fn continuation_page_included() {
        let records = extract_from(&[
            THEORY_1,
            "Продолжение теории о смежных углах: их сумма равна 180 градусам.",
        ]);
        assert_eq!(records.len(), 1);
        assert!(records[0].text.contains("сумма равна 180"));
        assert_eq!((records[0].start_page, records[0].end_page), (1, 2));
    }

    #[test]
    fn short_heading_fragment_skipped() {
        let records = extract_from(&["§1. Короткий.", THEORY_2]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].section, "§2");
    }

    #[test]
    fn ordered_by_section_number() {
        // §10 after §2 numerically, even though "10" < "2" lexically
        let t10 = THEORY_1.replace("§1.", "§10.");
        let records = extract_from(&[t10.as_str(), THEORY_2]);
        let sections: Vec<&str> = records.iter().map(|t| t.section.as_str()).collect();
        assert_eq!(sections, vec!["§2", "§10"]);
    }

    #[test]
    fn idempotent() {
        let a = extract_from(&[THEORY_1, THEORY_2]);
        let b = extract_from(&[THEORY_1, THEORY_2]);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.section, y.section);
        }
    }
}
