// 🧹 Raw Record Normalizer
//
// RawRecord → Option<CanonicalResult>. Checks run in a fixed order (time,
// stroke, distance, gender, name) and the first failure decides the drop
// reason. Relay rows fall out at the gender check: their gender column
// carries a team marker, not a person.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::model::{CanonicalResult, RawRecord};
use crate::parser::{
    classify_round, normalize_name, parse_event_date, parse_gender, parse_stroke, parse_time_ms,
    resolve_distance,
};

/// Why a raw record did not become a canonical result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    MissingTime,
    UnknownStroke,
    UnknownDistance,
    UnknownGender,
    MissingSwimmerName,
}

/// Outcome of normalizing a whole batch
#[derive(Debug, Default, Serialize)]
pub struct NormalizedBatch {
    pub results: Vec<CanonicalResult>,
    pub dropped: BTreeMap<DropReason, usize>,
}

impl NormalizedBatch {
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    source: String,
}

impl RecordNormalizer {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn normalize(&self, raw: &RawRecord) -> Option<CanonicalResult> {
        self.try_normalize(raw).ok()
    }

    /// Same as `normalize` but reports the first failed check
    pub fn try_normalize(&self, raw: &RawRecord) -> Result<CanonicalResult, DropReason> {
        let style = text(&raw.style).unwrap_or("");

        let final_time_ms = text(&raw.final_time)
            .and_then(parse_time_ms)
            .ok_or(DropReason::MissingTime)?;
        let stroke = parse_stroke(style).ok_or(DropReason::UnknownStroke)?;
        let distance_m =
            resolve_distance(text(&raw.distance), style).ok_or(DropReason::UnknownDistance)?;
        let gender = text(&raw.gender)
            .and_then(parse_gender)
            .ok_or(DropReason::UnknownGender)?;
        let swimmer_name = text(&raw.swimmer_name)
            .map(str::trim)
            .ok_or(DropReason::MissingSwimmerName)?
            .to_string();

        Ok(CanonicalResult {
            year: text(&raw.year).and_then(|y| y.trim().parse().ok()),
            tournament_name: text(&raw.tournament_name).unwrap_or("").trim().to_string(),
            event_date: text(&raw.event_date).and_then(parse_event_date),
            gender,
            distance_m,
            stroke,
            round: classify_round(style),
            age: positive(&raw.age),
            swimmer_name_norm: normalize_name(&swimmer_name),
            swimmer_name,
            team_code: text(&raw.team).map(|t| t.trim().to_string()),
            rank: positive(&raw.rank),
            final_time_ms,
            seed_time_ms: text(&raw.seed_time).and_then(parse_time_ms),
            source: self.source.clone(),
            athlete_id: None,
        })
    }

    pub fn normalize_batch(&self, records: &[RawRecord]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for raw in records {
            match self.try_normalize(raw) {
                Ok(result) => batch.results.push(result),
                Err(reason) => {
                    debug!(?reason, swimmer = ?raw.swimmer_name, "dropping raw record");
                    *batch.dropped.entry(reason).or_insert(0) += 1;
                }
            }
        }
        batch
    }
}

/// Non-blank field contents
fn text(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.trim().is_empty())
}

/// Strictly positive integer, else None. Accepts "15" and "15.0".
fn positive(field: &Option<String>) -> Option<u32> {
    let raw = text(field)?.trim();
    let value = raw
        .parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))?;
    u32::try_from(value).ok().filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Gender, Round, Stroke};
    use chrono::NaiveDate;

    fn raw(style: &str, gender: &str, distance: &str, time: &str) -> RawRecord {
        RawRecord {
            year: Some("2025".to_string()),
            tournament_name: Some("Copa Clubes".to_string()),
            event_date: Some("11/06/2025".to_string()),
            gender: Some(gender.to_string()),
            distance: Some(distance.to_string()),
            style: Some(style.to_string()),
            rank: Some("3".to_string()),
            swimmer_name: Some("Andrés Pérez".to_string()),
            age: Some("15".to_string()),
            team: Some("CNA".to_string()),
            seed_time: None,
            final_time: Some(time.to_string()),
        }
    }

    #[test]
    fn test_normalize_valid_record() {
        let normalizer = RecordNormalizer::new("external-system");
        let result = normalizer
            .normalize(&raw("18-20 400 CI Chequeo de Tiempo", "Hombres", "17", "5:01.22"))
            .unwrap();

        assert_eq!(result.distance_m, 400);
        assert_eq!(result.stroke, Stroke::Im);
        assert_eq!(result.gender, Gender::M);
        assert_eq!(result.round, Some(Round::TimeTrial));
        assert_eq!(result.final_time_ms, 301_220);
        assert_eq!(result.seed_time_ms, None);
        assert_eq!(result.year, Some(2025));
        assert_eq!(result.event_date, NaiveDate::from_ymd_opt(2025, 6, 11));
        assert_eq!(result.swimmer_name_norm, "andres perez");
        assert_eq!(result.age, Some(15));
        assert_eq!(result.rank, Some(3));
        assert_eq!(result.team_code.as_deref(), Some("CNA"));
        assert_eq!(result.source, "external-system");
        assert!(result.athlete_id.is_none());
    }

    #[test]
    fn test_drop_reasons_follow_check_order() {
        let n = RecordNormalizer::new("test");

        assert_eq!(
            n.try_normalize(&raw("400 Relay", "#4T", "", "DQ")).unwrap_err(),
            DropReason::MissingTime
        );
        assert_eq!(
            n.try_normalize(&raw("4x50 Relay", "#4T", "", "1:59.00")).unwrap_err(),
            DropReason::UnknownStroke
        );
        assert_eq!(
            n.try_normalize(&raw("Libre", "M", "17", "29.10")).unwrap_err(),
            DropReason::UnknownDistance
        );
        assert_eq!(
            n.try_normalize(&raw("200 Libre", "#4T", "", "1:59.00")).unwrap_err(),
            DropReason::UnknownGender
        );

        let mut nameless = raw("50 Libre", "F", "50", "29.10");
        nameless.swimmer_name = Some("   ".to_string());
        assert_eq!(
            n.try_normalize(&nameless).unwrap_err(),
            DropReason::MissingSwimmerName
        );
    }

    #[test]
    fn test_optional_fields_never_drop_a_record() {
        let n = RecordNormalizer::new("test");
        let mut record = raw("50 Espalda", "F", "50", "31.40");
        record.seed_time = Some("NT".to_string());
        record.age = Some("0".to_string());
        record.rank = Some("-1".to_string());
        record.event_date = Some("someday".to_string());
        record.year = None;
        record.team = None;

        let result = n.normalize(&record).unwrap();
        assert_eq!(result.seed_time_ms, None);
        assert_eq!(result.age, None);
        assert_eq!(result.rank, None);
        assert_eq!(result.event_date, None);
        assert_eq!(result.year, None);
        assert_eq!(result.team_code, None);
    }

    #[test]
    fn test_seed_time_parsed_independently() {
        let n = RecordNormalizer::new("test");
        let mut record = raw("100 Pecho Final", "Mujeres", "100", "1:20.05");
        record.seed_time = Some("1:21.50".to_string());
        record.age = Some("14.0".to_string());

        let result = n.normalize(&record).unwrap();
        assert_eq!(result.seed_time_ms, Some(81_500));
        assert_eq!(result.age, Some(14));
        assert_eq!(result.round, Some(Round::Final));
    }

    #[test]
    fn test_normalize_batch_counts_drops() {
        let n = RecordNormalizer::new("test");
        let records = vec![
            raw("50 Libre", "M", "50", "25.00"),
            raw("50 Libre", "M", "50", "DNS"),
            raw("50 Libre", "M", "50", "NT"),
            raw("4x100 Relay", "#4T", "", "4:10.00"),
        ];

        let batch = n.normalize_batch(&records);
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.dropped_total(), 3);
        assert_eq!(batch.dropped.get(&DropReason::MissingTime), Some(&2));
        assert_eq!(batch.dropped.get(&DropReason::UnknownStroke), Some(&1));
    }
}
