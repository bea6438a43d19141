use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Language-dependent cue patterns driving segmentation and extraction.
///
/// Defaults cover Russian textbooks. Any field can be overridden from a JSON
/// file (`--cues`), so a new book layout or language never requires code
/// changes. Patterns are regex fragments; where a number is expected, capture
/// group 1 holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cues {
    /// Section heading at line start: "§ 7.", "$ 7" (OCR confusion), "Параграф 7".
    pub paragraph_markers: Vec<String>,
    /// Fallback heading: bare "7. Заглавие" after a blank line.
    pub paragraph_fallback: String,
    /// Task-block openers: "Задачи", "Упражнения", ...
    pub task_headers: Vec<String>,
    /// Answers-section openers: "Ответы", "Ответы и указания", ...
    pub answer_headers: Vec<String>,
    pub toc_headers: Vec<String>,
    pub index_headers: Vec<String>,
    /// "Решение." marker, tolerant of OCR letter spacing.
    pub solution_markers: Vec<String>,
    /// "Ответ." marker inside a problem body.
    pub answer_markers: Vec<String>,
    /// Named problem-start cues ("Задача 5", "№ 12"); bare "N." / "N)" markers
    /// are structural and live in the extractor.
    pub problem_starts: Vec<String>,
    /// Leading phrases classifying a problem as a theoretical question.
    pub question_starts: Vec<String>,
    /// Leading phrases classifying a problem as a numeric exercise.
    pub exercise_starts: Vec<String>,
    /// Running header/footer noise beyond bare page numbers: "8 класс", "82 8 класс".
    pub header_noise: Vec<String>,
    /// Explicit problem-number tokens in a retrieval query, tried in order.
    pub number_tokens: Vec<String>,
    /// Requested sub-part in a retrieval query: "2 вариант", "пункт 3".
    pub part_requests: Vec<String>,
}

impl Default for Cues {
    fn default() -> Self {
        Self {
            paragraph_markers: vec![
                r"^\s*[§$]\s*(\d+(?:\.\d+)?)[.,]?(?:\s|$)".into(),
                r"^\s*Параграф\s+(\d+)[.,]?(?:\s|$)".into(),
            ],
            paragraph_fallback: r"^(\d+)[.)]\s+[А-ЯЁA-Z].{3,120}$".into(),
            task_headers: vec![
                r"^\s*(?:Задачи|Упражнения|Вопросы\s+к\s+параграфу|Контрольные\s+задания|Практические\s+задания)\s*[.:]?\s*$".into(),
            ],
            answer_headers: vec![
                r"^\s*Ответы(?:\s+и\s+(?:указания|решени[ея]))?\s*[.:]?\s*$".into(),
            ],
            toc_headers: vec![r"^\s*(?:Содержание|Оглавление)\s*$".into()],
            index_headers: vec![r"^\s*(?:Предметный\s+указатель|Указатель)\s*$".into()],
            solution_markers: vec![r"^\s*Р\s*е\s*ш\s*е\s*н\s*и\s*е\s*[.:]".into()],
            answer_markers: vec![r"^\s*О\s*т\s*в\s*е\s*т\s*[.:]".into()],
            problem_starts: vec![
                r"(?:Контрольное|Практическое)\s+задание\s*(?:№\s*)?\(?\s*(\d+)\s*\)?".into(),
                r"Задача\s*\(?\s*(\d+)\s*\)?".into(),
                r"Упражнение\s*\(?\s*(\d+)\s*\)?".into(),
                r"Вопрос\s*(?:№\s*)?\(?\s*(\d+)\s*\)?".into(),
                r"Задание\s*(?:№\s*)?\(?\s*(\d+)\s*\)?".into(),
                r"Exercise\s+(\d+)".into(),
                r"№\s*(\d+(?:\.\d+)?)".into(),
            ],
            question_starts: vec![
                r"^докажите".into(),
                r"^что\s+(?:такое|называется|означает)".into(),
                r"^как(?:ой|ая|ие)\s".into(),
                r"^как\s+(?:называ|обознача|доказ|определ)".into(),
                r"^сформулируйте".into(),
                r"^объясните".into(),
                r"^в\s+чём\s+состоит".into(),
                r"^когда\s+говорят".into(),
                r"^при\s+каком\s+условии".into(),
                r"^верно\s+ли".into(),
            ],
            exercise_starts: vec![
                r"^найдите".into(),
                r"^вычислите".into(),
                r"^решите".into(),
                r"^постройте".into(),
                r"^определите".into(),
                r"^дан[оыа]?\s".into(),
                r"^в\s+(?:треугольнике|параллелограмме|трапеции)".into(),
                r"^на\s+(?:прямой|отрезке|плоскости)".into(),
                r"^(?:отрезк|сторон|угол|диагонал|радиус|высота|медиана|биссектриса|окружност)".into(),
            ],
            header_noise: vec![r"^(?:\d{1,4}\s+)?\d{1,2}\s+класс\.?$".into()],
            number_tokens: vec![
                r"№\s*(\d+(?:\.\d+)?)".into(),
                r"(?:задач[ау]|упражнение|номер)\s*(\d+(?:\.\d+)?)".into(),
                r"^\s*(\d+(?:\.\d+)?)\s*$".into(),
            ],
            part_requests: vec![
                r"(\d)\s*(?:вариант|пункт|часть|подпункт)".into(),
                r"(?:вариант|пункт|часть)\s*(\d)\b".into(),
                r"(\d)\s*\)".into(),
            ],
        }
    }
}

impl Cues {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cues file {}", path.display()))?;
        let cues: Cues = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid cues JSON in {}", path.display()))?;
        Ok(cues)
    }

    pub fn compile(&self) -> Result<CueSet> {
        fn all(patterns: &[String]) -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(&format!("(?i){}", p))
                        .with_context(|| format!("Invalid cue pattern: {}", p))
                })
                .collect()
        }
        Ok(CueSet {
            paragraph: all(&self.paragraph_markers)?,
            paragraph_fallback: Regex::new(&self.paragraph_fallback)
                .with_context(|| "Invalid paragraph_fallback pattern")?,
            task_headers: all(&self.task_headers)?,
            answer_headers: all(&self.answer_headers)?,
            toc_headers: all(&self.toc_headers)?,
            index_headers: all(&self.index_headers)?,
            solution_markers: all(&self.solution_markers)?,
            answer_markers: all(&self.answer_markers)?,
            problem_starts: all(&self.problem_starts)?,
            header_noise: all(&self.header_noise)?,
            question_starts: all(&self.question_starts)?,
            exercise_starts: all(&self.exercise_starts)?,
            number_tokens: all(&self.number_tokens)?,
            part_requests: all(&self.part_requests)?,
        })
    }
}

/// Compiled form of [`Cues`]; built once per run, shared read-only.
pub struct CueSet {
    paragraph: Vec<Regex>,
    paragraph_fallback: Regex,
    task_headers: Vec<Regex>,
    answer_headers: Vec<Regex>,
    toc_headers: Vec<Regex>,
    index_headers: Vec<Regex>,
    solution_markers: Vec<Regex>,
    answer_markers: Vec<Regex>,
    problem_starts: Vec<Regex>,
    header_noise: Vec<Regex>,
    question_starts: Vec<Regex>,
    exercise_starts: Vec<Regex>,
    number_tokens: Vec<Regex>,
    part_requests: Vec<Regex>,
}

/// A named problem-start cue matched inside a line.
pub struct StartMark {
    pub offset: usize,
    pub end: usize,
    pub number: String,
}

impl CueSet {
    /// Section label ("§7") when the line is a paragraph heading, else None.
    pub fn paragraph_label(&self, line: &str) -> Option<String> {
        for re in &self.paragraph {
            if let Some(caps) = re.captures(line) {
                return Some(section_label(&caps[1]));
            }
        }
        None
    }

    /// Bare numbered heading ("7. Смежные углы") usable as a weak section cue.
    pub fn is_paragraph_fallback(&self, line: &str) -> bool {
        self.paragraph_fallback.is_match(line)
    }

    pub fn is_task_header(&self, line: &str) -> bool {
        self.task_headers.iter().any(|re| re.is_match(line))
    }

    pub fn is_answers_header(&self, line: &str) -> bool {
        self.answer_headers.iter().any(|re| re.is_match(line))
    }

    pub fn is_toc_header(&self, line: &str) -> bool {
        self.toc_headers.iter().any(|re| re.is_match(line))
    }

    pub fn is_index_header(&self, line: &str) -> bool {
        self.index_headers.iter().any(|re| re.is_match(line))
    }

    pub fn is_header_noise(&self, line: &str) -> bool {
        self.header_noise.iter().any(|re| re.is_match(line))
    }

    pub fn is_solution_marker(&self, line: &str) -> bool {
        self.solution_markers.iter().any(|re| re.is_match(line))
    }

    pub fn is_answer_marker(&self, line: &str) -> bool {
        self.answer_markers.iter().any(|re| re.is_match(line))
    }

    /// All named problem-start cues in the line, left to right, deduplicated
    /// by overlap (the earliest match wins inside an overlapping pair).
    pub fn named_problem_starts(&self, line: &str) -> Vec<StartMark> {
        let mut marks: Vec<(usize, usize, String)> = Vec::new();
        for re in &self.problem_starts {
            for caps in re.captures_iter(line) {
                let m = caps.get(0).unwrap();
                marks.push((m.start(), m.end(), caps[1].to_string()));
            }
        }
        marks.sort_by_key(|(start, _, _)| *start);
        let mut out: Vec<StartMark> = Vec::new();
        let mut last_end = 0usize;
        for (start, end, number) in marks {
            if !out.is_empty() && start < last_end {
                continue;
            }
            last_end = end;
            out.push(StartMark { offset: start, end, number });
        }
        out
    }

    /// Byte offset just past a "Решение." marker at line start, if present.
    pub fn solution_marker_end(&self, line: &str) -> Option<usize> {
        self.solution_markers
            .iter()
            .find_map(|re| re.find(line).map(|m| m.end()))
    }

    /// Byte offset just past an "Ответ." marker at line start, if present.
    pub fn answer_marker_end(&self, line: &str) -> Option<usize> {
        self.answer_markers
            .iter()
            .find_map(|re| re.find(line).map(|m| m.end()))
    }

    /// Classify a problem body as 'question' / 'exercise' / 'unknown' from its
    /// leading phrase, after dropping the numeric prefix.
    pub fn classify_problem_type(&self, text: &str) -> &'static str {
        let head: String = text.chars().take(200).collect();
        let head = head.trim().to_lowercase();
        let head = head
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')' || c == ' ');
        for re in &self.question_starts {
            if re.is_match(head) {
                return "question";
            }
        }
        for re in &self.exercise_starts {
            if re.is_match(head) {
                return "exercise";
            }
        }
        "unknown"
    }

    /// Explicit problem-number token in a query ("№2", "задача 15").
    pub fn number_token(&self, query: &str) -> Option<String> {
        self.number_tokens
            .iter()
            .find_map(|re| re.captures(query).map(|c| c[1].to_string()))
    }

    /// Requested sub-part in a query ("2 вариант" → "2").
    pub fn part_request(&self, query: &str) -> Option<String> {
        self.part_requests
            .iter()
            .find_map(|re| re.captures(query).map(|c| c[1].to_string()))
    }
}

/// Normalize a section number into the canonical "§N" label.
pub fn section_label(number: &str) -> String {
    let n = number.trim();
    if let Some(rest) = n.strip_prefix('§') {
        format!("§{}", rest.trim())
    } else {
        format!("§{}", n)
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn cues() -> CueSet {
        Cues::default().compile().unwrap()
    }

    #[test]
    fn paragraph_marker_variants() {
        let c = cues();
        assert_eq!(c.paragraph_label("§ 7. Смежные углы"), Some("§7".into()));
        assert_eq!(c.paragraph_label("$ 3 Вертикальные углы"), Some("§3".into()));
        assert_eq!(c.paragraph_label("Параграф 12."), Some("§12".into()));
        assert_eq!(c.paragraph_label("7. Найдите угол."), None);
    }

    #[test]
    fn task_and_answer_headers() {
        let c = cues();
        assert!(c.is_task_header("Задачи"));
        assert!(c.is_task_header("Контрольные задания:"));
        assert!(c.is_answers_header("Ответы"));
        assert!(c.is_answers_header("Ответы и указания."));
        assert!(!c.is_answers_header("Ответ. x = 5"));
    }

    #[test]
    fn solution_marker_tolerates_letter_spacing() {
        let c = cues();
        assert!(c.is_solution_marker("Решение."));
        assert!(c.is_solution_marker("Р е ш е н и е ."));
        assert!(c.is_answer_marker("Ответ: x = 5"));
    }

    #[test]
    fn named_starts_in_order() {
        let c = cues();
        let marks = c.named_problem_starts("Задача 5. Текст. № 6 ещё текст");
        assert_eq!(marks.len(), 2);
        assert_eq!(marks[0].number, "5");
        assert_eq!(marks[1].number, "6");
    }

    #[test]
    fn classify_types() {
        let c = cues();
        assert_eq!(c.classify_problem_type("12. Докажите, что углы равны."), "question");
        assert_eq!(c.classify_problem_type("4. Найдите смежные углы."), "exercise");
        assert_eq!(c.classify_problem_type("Дан угол в 60°."), "exercise");
        assert_eq!(c.classify_problem_type("Нечто иное."), "unknown");
    }

    #[test]
    fn number_token_extraction() {
        let c = cues();
        assert_eq!(c.number_token("реши №2 из учебника"), Some("2".into()));
        assert_eq!(c.number_token("задача 15 про углы"), Some("15".into()));
        assert_eq!(c.number_token("просто текст"), None);
    }

    #[test]
    fn custom_cues_roundtrip() {
        let cues = Cues {
            answer_headers: vec![r"^\s*Answers\s*$".into()],
            ..Cues::default()
        };
        let json = serde_json::to_string(&cues).unwrap();
        let parsed: Cues = serde_json::from_str(&json).unwrap();
        let c = parsed.compile().unwrap();
        assert!(c.is_answers_header("Answers"));
        assert!(!c.is_answers_header("Ответы"));
    }
}
