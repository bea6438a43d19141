pub mod answers;
pub mod problems;
pub mod theory;

use crate::cues::CueSet;
use crate::docmap::DocumentMap;

pub struct ExtractedData {
    pub problems: Vec<problems::Problem>,
    pub theory: Vec<theory::Theory>,
    pub answers: Vec<answers::AnswerEntry>,
}

/// Run all three extractors over one document map. Each consumes only its own
/// span types; answers come back as parsed entries for the linker.
pub fn extract_all(map: &DocumentMap, pages: &[(i64, String)], cues: &CueSet) -> ExtractedData {
    let problems = problems::extract(map, pages, cues);
    let theory = theory::extract(map, pages);
    let answers = answers::answers_span_text(map, pages)
        .map(|text| answers::parse_answers(&text, cues))
        .unwrap_or_default();
    ExtractedData { problems, theory, answers }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cues::Cues;
    use crate::docmap;

    #[test]
    fn mini_book_end_to_end() {
        let pages: Vec<(i64, String)> = [
            "§3. Теория о смежных углах и их свойствах, достаточно длинная для записи.",
            "Задачи\n1. Найти x.\n2. Найти y.",
            "Ответы\n1) x=5\n2) y=7",
        ]
        .iter()
        .enumerate()
        .map(|(i, t)| (i as i64 + 1, t.to_string()))
        .collect();
        let cues = Cues::default().compile().unwrap();
        let map = docmap::build(&pages, 1, 1, 1, &cues);
        let data = extract_all(&map, &pages, &cues);

        assert_eq!(data.problems.len(), 2);
        assert_eq!(data.problems[0].number.as_deref(), Some("1"));
        assert_eq!(data.problems[1].number.as_deref(), Some("2"));
        assert_eq!(data.theory.len(), 1);
        assert_eq!(data.theory[0].section, "§3");
        assert_eq!(data.answers.len(), 2);
        assert_eq!(data.answers[0].text, "x=5");
        assert_eq!(data.answers[1].text, "y=7");
    }
}
