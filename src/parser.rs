// 🏗️ Field Parsers - one raw field in, one canonical value out
//
// Every function here is pure and total: bad input yields None, never an error.
// The token tables are ORDERED. A token must come before every other token
// that it contains as a substring, otherwise the shorter one shadows it
// ("femenino" contains "men", "female" contains "male").

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::model::{Gender, Round, Stroke};

// ============================================================================
// TABLES
// ============================================================================

/// Individual-event distances in meters
pub const VALID_DISTANCES: [u32; 6] = [50, 100, 200, 400, 800, 1500];

/// Literal tokens meaning "did not produce a time"
pub const NON_FINISH_TOKENS: [&str; 5] = ["NT", "DQ", "DNS", "DNF", "NS"];

/// Spanish then English; first substring hit wins
pub const STROKE_TOKENS: &[(&str, Stroke)] = &[
    ("libre", Stroke::Free),
    ("espalda", Stroke::Back),
    ("pecho", Stroke::Breast),
    ("mariposa", Stroke::Fly),
    ("ci", Stroke::Im),
    ("combinado", Stroke::Im),
    ("free", Stroke::Free),
    ("back", Stroke::Back),
    ("breast", Stroke::Breast),
    ("fly", Stroke::Fly),
    ("im", Stroke::Im),
];

/// Longer tokens first: no entry may be a substring of a later one
pub const GENDER_TOKENS: &[(&str, Gender)] = &[
    ("hombres", Gender::M),
    ("mujeres", Gender::F),
    ("femenino", Gender::F),
    ("masculino", Gender::M),
    ("female", Gender::F),
    ("women", Gender::F),
    ("male", Gender::M),
    ("men", Gender::M),
];

const DATE_LAYOUTS: [&str; 3] = ["%d/%m/%Y", "%Y-%m-%d", "%m/%d/%Y"];

static DISTANCE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(50|100|200|400|800|1500)\b").expect("distance pattern is valid")
});

// ============================================================================
// TIME
// ============================================================================

/// `mm:ss.cc` or `ss.cc` to milliseconds.
///
/// The fractional part is read as an integer count of centiseconds, so
/// "1:05.5" is 65_050 ms and "1:05.50" is 65_500 ms.
pub fn parse_time_ms(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || NON_FINISH_TOKENS.contains(&trimmed) {
        return None;
    }

    let (minutes, rest) = match trimmed.split_once(':') {
        Some((m, rest)) => (parse_part(m)?, rest),
        None => (0, trimmed),
    };
    if rest.contains(':') {
        return None;
    }

    let (seconds, centis) = match rest.split_once('.') {
        Some((s, c)) => (parse_part(s)?, parse_part(c)?),
        None => (parse_part(rest)?, 0),
    };

    let total = minutes
        .checked_mul(60)?
        .checked_add(seconds)?
        .checked_mul(1000)?
        .checked_add(centis.checked_mul(10)?)?;

    (total > 0).then_some(total)
}

fn parse_part(part: &str) -> Option<u32> {
    let part = part.trim();
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

// ============================================================================
// STROKE / GENDER / DISTANCE
// ============================================================================

pub fn parse_stroke(raw: &str) -> Option<Stroke> {
    let lower = raw.to_lowercase();
    STROKE_TOKENS
        .iter()
        .find(|(token, _)| lower.contains(token))
        .map(|(_, stroke)| *stroke)
}

pub fn parse_gender(raw: &str) -> Option<Gender> {
    let lower = raw.trim().to_lowercase();
    match lower.as_str() {
        "m" => return Some(Gender::M),
        "f" => return Some(Gender::F),
        _ => {}
    }
    GENDER_TOKENS
        .iter()
        .find(|(token, _)| lower.contains(token))
        .map(|(_, gender)| *gender)
}

/// Trust the distance column only when it holds a valid distance; it is
/// sometimes an age bracket. Otherwise take the first valid distance that
/// appears as a whole number in the event description.
pub fn resolve_distance(column: Option<&str>, style: &str) -> Option<u32> {
    let from_column = column
        .and_then(|c| c.trim().parse::<u32>().ok())
        .filter(|d| VALID_DISTANCES.contains(d));

    from_column.or_else(|| {
        DISTANCE_PATTERN
            .captures(style)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

// ============================================================================
// DATE / ROUND
// ============================================================================

/// Day-first wins on ambiguous input ("06/11/2025" is 6 November)
pub fn parse_event_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDate::parse_from_str(trimmed, layout).ok())
}

pub fn classify_round(style: &str) -> Option<Round> {
    let lower = style.to_lowercase();
    if lower.contains("final") {
        Some(Round::Final)
    } else if lower.contains("prelim") || lower.contains("elimin") {
        Some(Round::Prelim)
    } else if lower.contains("time trial") || lower.contains("chequeo") {
        Some(Round::TimeTrial)
    } else {
        None
    }
}

// ============================================================================
// NAMES
// ============================================================================

/// Strip diacritics, lowercase, collapse whitespace. Idempotent.
pub fn normalize_name(raw: &str) -> String {
    let ascii: String = raw.nfkd().filter(char::is_ascii).collect();
    ascii
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(parse_time_ms("1:02.45"), Some(62_450));
        assert_eq!(parse_time_ms("58.30"), Some(58_300));
        assert_eq!(parse_time_ms("1:05.5"), Some(65_050));
        assert_eq!(parse_time_ms("1:05.50"), Some(65_500));
        assert_eq!(parse_time_ms(" 2:10 "), Some(130_000));
        assert_eq!(parse_time_ms("17:45.12"), Some(1_065_120));
    }

    #[test]
    fn test_parse_time_rejects_sentinels_and_garbage() {
        for raw in ["", "   ", "NT", "DQ", "DNS", "DNF", "NS"] {
            assert_eq!(parse_time_ms(raw), None, "{raw:?} should not parse");
        }
        for raw in ["abc", "1:2:3", "1.2.3", "1:xx.10", "-5.00", "0.00", ":.", "1:"] {
            assert_eq!(parse_time_ms(raw), None, "{raw:?} should not parse");
        }
    }

    #[test]
    fn test_parse_stroke_spanish_and_english() {
        assert_eq!(parse_stroke("14 / 50 Libre"), Some(Stroke::Free));
        assert_eq!(parse_stroke("100 ESPALDA Final"), Some(Stroke::Back));
        assert_eq!(parse_stroke("Women 200 Breast"), Some(Stroke::Breast));
        assert_eq!(parse_stroke("18-20 400 CI Chequeo de Tiempo"), Some(Stroke::Im));
        assert_eq!(parse_stroke("200 Butterfly"), Some(Stroke::Fly));
        assert_eq!(parse_stroke("4x50 relay"), None);
        assert_eq!(parse_stroke(""), None);
    }

    #[test]
    fn test_parse_gender_prefers_specific_tokens() {
        assert_eq!(parse_gender("women's 200 free"), Some(Gender::F));
        assert_eq!(parse_gender("Men"), Some(Gender::M));
        assert_eq!(parse_gender("FEMENINO"), Some(Gender::F));
        assert_eq!(parse_gender("Masculino"), Some(Gender::M));
        assert_eq!(parse_gender("female"), Some(Gender::F));
        assert_eq!(parse_gender("Male"), Some(Gender::M));
        assert_eq!(parse_gender(" f "), Some(Gender::F));
        assert_eq!(parse_gender("m"), Some(Gender::M));
        assert_eq!(parse_gender("#4T"), None);
        assert_eq!(parse_gender(""), None);
    }

    #[test]
    fn test_gender_table_order_is_load_bearing() {
        for (i, (earlier, _)) in GENDER_TOKENS.iter().enumerate() {
            for (later, _) in &GENDER_TOKENS[i + 1..] {
                assert!(
                    !later.contains(earlier),
                    "{earlier:?} would shadow {later:?}"
                );
            }
        }
    }

    #[test]
    fn test_resolve_distance() {
        assert_eq!(resolve_distance(Some("17"), "18-20 400 CI Chequeo de Tiempo"), Some(400));
        assert_eq!(resolve_distance(Some("100"), "200 Libre"), Some(100));
        assert_eq!(resolve_distance(None, "14&O 100 Free Time Trial Finals"), Some(100));
        assert_eq!(resolve_distance(Some(""), "16-17 50 Espalda"), Some(50));
        assert_eq!(resolve_distance(Some("1500"), ""), Some(1500));
        assert_eq!(resolve_distance(None, "500 Libre"), None);
        assert_eq!(resolve_distance(Some("25"), "Libre"), None);
    }

    #[test]
    fn test_parse_event_date_layout_order() {
        assert_eq!(parse_event_date("11/06/2025"), NaiveDate::from_ymd_opt(2025, 6, 11));
        assert_eq!(parse_event_date("2025-06-11"), NaiveDate::from_ymd_opt(2025, 6, 11));
        assert_eq!(parse_event_date("06/13/2025"), NaiveDate::from_ymd_opt(2025, 6, 13));
        assert_eq!(parse_event_date("June 11"), None);
    }

    #[test]
    fn test_classify_round() {
        assert_eq!(classify_round("100 Free Time Trial Finals"), Some(Round::Final));
        assert_eq!(classify_round("50 Libre Prelims"), Some(Round::Prelim));
        assert_eq!(classify_round("50 Libre Eliminatoria"), Some(Round::Prelim));
        assert_eq!(classify_round("400 CI Chequeo de Tiempo"), Some(Round::TimeTrial));
        assert_eq!(classify_round("200 Pecho"), None);
    }

    #[test]
    fn test_normalize_name_is_idempotent() {
        assert_eq!(normalize_name("Andrés PÉREZ"), "andres perez");
        assert_eq!(normalize_name("andres perez"), "andres perez");
        assert_eq!(normalize_name("  María\tJosé   Núñez "), "maria jose nunez");

        for raw in ["Ñandú  Ávila", "  ", "Zoë O'Brien", "李 Wei"] {
            let once = normalize_name(raw);
            assert_eq!(normalize_name(&once), once);
        }
    }
}
