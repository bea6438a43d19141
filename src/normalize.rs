use std::sync::LazyLock;

use regex::Regex;

static HYPHEN_WRAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9A-Za-zА-Яа-яЁё]+)-\s*\n\s*([0-9a-zа-яё]+)").unwrap());
static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-zА-Яа-яЁё]+").unwrap());
static ENUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d)\)").unwrap());
static MIXED_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[а-яА-ЯёЁ]+[a-zA-Z]+[а-яА-ЯёЁ]*|[a-zA-Z]+[а-яА-ЯёЁ]+").unwrap()
});
static DIGIT_IN_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[а-яА-ЯёЁ]+\d+[а-яА-ЯёЁ]+").unwrap());
static UNUSUAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[@#%&*{}|<>]").unwrap());
static DOT_CAPITAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.([А-ЯЁA-Z])").unwrap());
static COMMA_LETTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",([а-яА-ЯёЁa-zA-Z])").unwrap());
static SPACE_PUNCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+([.,;:!?])").unwrap());
static MULTI_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
static MULTI_BLANK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Frequent OCR misreads: Latin sequences standing in for Russian words.
const LATIN_SEQUENCES: &[(&str, &str)] = &[
    ("pa3a", "раза"),
    ("pasa", "раза"),
    ("pa3", "раз"),
    ("paBHo", "равно"),
    ("paBHa", "равна"),
    ("paBHbI", "равны"),
    ("MeHbme", "меньше"),
    ("6oJIbme", "больше"),
    ("HafiTH", "найти"),
    ("HafiAHTe", "найдите"),
    ("yroJI", "угол"),
    ("yrJIa", "угла"),
    ("yrJIoB", "углов"),
    ("CMeXHbIe", "смежные"),
    ("CMeXHbIX", "смежных"),
    ("OHH", "они"),
    ("ux", "их"),
    ("OTBeT", "ответ"),
    ("OTBeTbI", "ответы"),
    ("pemeHHe", "решение"),
    ("3aAaqa", "задача"),
    ("3aAaqH", "задачи"),
    ("TeopeMa", "теорема"),
    ("AoKa3aTb", "доказать"),
];

/// Math notation normalization: OCR/keyboard forms to the canonical symbol.
const MATH_FIXES: &[(&str, &str)] = &[
    ("градусов", "°"),
    ("градуса", "°"),
    ("° °", "°"),
    ("м2", "м²"),
    ("см2", "см²"),
    ("м3", "м³"),
    ("см3", "см³"),
    ("<=", "≤"),
    (">=", "≥"),
    ("!=", "≠"),
    ("+-", "±"),
    ("~=", "≈"),
    ("_|_", "⊥"),
];

fn latin_lookalike(c: char) -> Option<char> {
    Some(match c {
        'a' => 'а',
        'A' => 'А',
        'e' => 'е',
        'E' => 'Е',
        'o' => 'о',
        'O' => 'О',
        'p' => 'р',
        'P' => 'Р',
        'c' => 'с',
        'C' => 'С',
        'x' => 'х',
        'X' => 'Х',
        'y' => 'у',
        'Y' => 'У',
        'H' => 'Н',
        'K' => 'К',
        'k' => 'к',
        'M' => 'М',
        'T' => 'Т',
        'B' => 'В',
        _ => return None,
    })
}

pub struct NormalizedPage {
    pub text: String,
    /// min(OCR collaborator's score, post-cleanup heuristic score), in [0, 1].
    pub quality: f64,
}

/// Clean one page of raw OCR text. Pure: same input, same output.
pub fn normalize_page(raw: &str, ocr_quality: f64) -> NormalizedPage {
    if raw.trim().is_empty() {
        return NormalizedPage { text: String::new(), quality: 0.0 };
    }

    let mut text = HYPHEN_WRAP_RE.replace_all(raw, "$1$2").into_owned();

    for (lat, cyr) in LATIN_SEQUENCES {
        text = text.replace(lat, cyr);
    }
    text = fix_mixed_words(&text);

    for (wrong, right) in MATH_FIXES {
        text = text.replace(wrong, right);
    }

    text = DOT_CAPITAL_RE.replace_all(&text, ". $1").into_owned();
    text = COMMA_LETTER_RE.replace_all(&text, ", $1").into_owned();
    text = SPACE_PUNCT_RE.replace_all(&text, "$1").into_owned();

    text = fix_enumeration(&text);

    text = MULTI_SPACE_RE.replace_all(&text, " ").into_owned();
    text = MULTI_BLANK_RE.replace_all(&text, "\n\n").into_owned();
    let text = text
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();

    let quality = ocr_quality.clamp(0.0, 1.0).min(quality_score(&text));
    NormalizedPage { text, quality }
}

/// Convert Latin lookalikes inside words that mix scripts; pure-Latin words
/// (variables, formulas) are left alone.
fn fix_mixed_words(text: &str) -> String {
    WORD_RE
        .replace_all(text, |caps: &regex::Captures| {
            let word = &caps[0];
            let has_cyr = word.chars().any(|c| ('\u{0400}'..='\u{04FF}').contains(&c));
            let has_lat = word.chars().any(|c| c.is_ascii_alphabetic());
            if has_cyr && has_lat {
                word.chars()
                    .map(|c| latin_lookalike(c).unwrap_or(c))
                    .collect::<String>()
            } else {
                word.to_string()
            }
        })
        .into_owned()
}

/// Repair broken enumeration sequences: "1) 2) 8)" → "1) 2) 3)".
/// Only off-by-more-than-one deviations are touched (an OCR misread, not a
/// legitimately skipped item).
fn fix_enumeration(text: &str) -> String {
    let marks: Vec<(usize, usize, u32)> = ENUM_RE
        .captures_iter(text)
        .map(|caps| {
            let m = caps.get(1).unwrap();
            (m.start(), m.end(), caps[1].parse::<u32>().unwrap())
        })
        .collect();
    if marks.len() < 2 {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    let mut expected = marks[0].2 + 1;
    for (start, end, num) in marks.iter().skip(1).copied() {
        out.push_str(&text[cursor..start]);
        if num != expected && expected <= 9 && num.abs_diff(expected) > 1 {
            out.push_str(&expected.to_string());
        } else {
            out.push_str(&text[start..end]);
        }
        expected += 1;
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Heuristic post-cleanup quality in [0, 1]: penalizes mixed-script tokens,
/// stray symbols, and digits embedded in words.
pub fn quality_score(text: &str) -> f64 {
    if text.trim().is_empty() {
        return 0.0;
    }
    let mixed = MIXED_TOKEN_RE.find_iter(text).count() as f64;
    let unusual = UNUSUAL_RE.find_iter(text).count() as f64;
    let digit_words = DIGIT_IN_WORD_RE.find_iter(text).count() as f64;

    let penalty = (mixed * 0.05).min(0.3) + (unusual * 0.02).min(0.1) + (digit_words * 0.05).min(0.2);
    (1.0 - penalty).max(0.0)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hyphen_wrap_joined() {
        let page = normalize_page("один из них на 80° боль-\nше другого", 1.0);
        assert!(page.text.contains("больше"), "got: {}", page.text);
    }

    #[test]
    fn latin_sequences_fixed() {
        let page = normalize_page("в 3 pasa меньше", 1.0);
        assert!(page.text.contains("раза"), "got: {}", page.text);
    }

    #[test]
    fn mixed_word_repaired() {
        let page = normalize_page("смежные yглы", 1.0);
        assert!(page.text.contains("углы"), "got: {}", page.text);
    }

    #[test]
    fn pure_latin_formula_untouched() {
        let page = normalize_page("y = 2x + 5", 1.0);
        assert!(page.text.contains("y = 2x + 5"), "got: {}", page.text);
    }

    #[test]
    fn math_symbols() {
        let page = normalize_page("угол 45 градусов, x >= 3", 1.0);
        assert!(page.text.contains('°'), "got: {}", page.text);
        assert!(page.text.contains('≥'), "got: {}", page.text);
    }

    #[test]
    fn enumeration_repaired() {
        let fixed = fix_enumeration("1) первый 2) второй 8) третий 4) четвёртый");
        assert!(fixed.contains("3) третий"), "got: {}", fixed);
        assert!(fixed.contains("4) четвёртый"), "got: {}", fixed);
    }

    #[test]
    fn enumeration_single_skip_kept() {
        // 1) then 3): plausibly a real gap, not an OCR error
        let fixed = fix_enumeration("1) a 3) b");
        assert!(fixed.contains("3) b"), "got: {}", fixed);
    }

    #[test]
    fn empty_page_zero_quality() {
        let page = normalize_page("   \n ", 0.9);
        assert_eq!(page.quality, 0.0);
        assert!(page.text.is_empty());
    }

    #[test]
    fn quality_penalizes_mixed_script() {
        let clean = quality_score("Найдите смежные углы.");
        let dirty = quality_score("HafiAHTe cMeжHbIe yrJIbI unknown4word");
        assert!(clean > dirty);
    }

    #[test]
    fn ocr_quality_caps_score() {
        let page = normalize_page("Нормальный текст.", 0.4);
        assert!(page.quality <= 0.4);
    }
}
