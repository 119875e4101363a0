// 📂 Raw-data sources
//
// Bulk snapshots (a local SQLite `results` table or a CSV export with the
// same headers) and the per-athlete remote source used by sync. The remote
// scraping client itself lives outside this crate; `CsvDirectorySource`
// reads a local mirror of what it returns.

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ReconcileError, Result};
use crate::model::RawRecord;
use crate::parser::{parse_event_date, NON_FINISH_TOKENS};

// ============================================================================
// TRAITS
// ============================================================================

/// Bulk, offline source of raw records
pub trait RawRecordSource {
    fn describe(&self) -> String;

    /// Rows in source order; `limit = None` reads everything after `offset`
    fn read_records(&self, limit: Option<usize>, offset: usize) -> Result<Vec<RawRecord>>;
}

/// Optional date window for a per-athlete fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl SyncWindow {
    /// Undated records are always inside the window
    pub fn contains(&self, date: Option<NaiveDate>) -> bool {
        let Some(date) = date else { return true };
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

/// Online, per-athlete source keyed by the foreign system's athlete id
pub trait AthleteResultSource {
    fn fetch_athlete_records(&self, foreign_id: &str, window: &SyncWindow)
        -> Result<Vec<RawRecord>>;
}

/// Pick a snapshot reader by file extension (.csv, anything else is SQLite)
pub fn open_snapshot(path: &Path) -> Result<Box<dyn RawRecordSource>> {
    if !path.exists() {
        return Err(ReconcileError::not_found("snapshot", path.display().to_string()));
    }
    let is_csv = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        Ok(Box::new(CsvSnapshot::new(path)))
    } else {
        Ok(Box::new(SqliteSnapshot::new(path)))
    }
}

// ============================================================================
// SQLITE SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DateRange {
    pub first: Option<String>,
    pub last: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotStats {
    pub total_records: usize,
    pub valid_records: usize,
    pub date_range: DateRange,
    pub unique_swimmers: usize,
    pub unique_tournaments: usize,
}

pub struct SqliteSnapshot {
    path: PathBuf,
}

// Only rows with a finishing time are worth reading
const VALID_TIME_FILTER: &str = "final_time IS NOT NULL
      AND final_time != ''
      AND final_time NOT IN ('NT', 'DQ', 'DNS', 'DNF', 'NS')";

impl SqliteSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Connection> {
        if !self.path.exists() {
            return Err(ReconcileError::not_found(
                "snapshot",
                self.path.display().to_string(),
            ));
        }
        Ok(Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }

    pub fn stats(&self) -> Result<SnapshotStats> {
        let conn = self.open()?;
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let date_range = conn.query_row(
            "SELECT MIN(event_date), MAX(event_date) FROM results",
            [],
            |row| {
                Ok(DateRange {
                    first: text_at(row, 0)?,
                    last: text_at(row, 1)?,
                })
            },
        )?;

        Ok(SnapshotStats {
            total_records: count("SELECT COUNT(*) FROM results")?,
            valid_records: count(&format!(
                "SELECT COUNT(*) FROM results WHERE {VALID_TIME_FILTER}"
            ))?,
            date_range,
            unique_swimmers: count("SELECT COUNT(DISTINCT swimmer_name) FROM results")?,
            unique_tournaments: count("SELECT COUNT(DISTINCT tournament_name) FROM results")?,
        })
    }
}

/// Any SQLite value as optional text; numbers keep their natural form
fn text_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get::<_, Value>(idx)? {
        Value::Null | Value::Blob(_) => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) if f.fract() == 0.0 => Some(format!("{}", f as i64)),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(s) => Some(s),
    })
}

impl RawRecordSource for SqliteSnapshot {
    fn describe(&self) -> String {
        format!("sqlite snapshot {}", self.path.display())
    }

    fn read_records(&self, limit: Option<usize>, offset: usize) -> Result<Vec<RawRecord>> {
        let conn = self.open()?;
        let sql = format!(
            "SELECT year, tournament_name, event_date, gender, distance, style, rank,
                    swimmer_name, age, team, seed_time, final_time
             FROM results
             WHERE {VALID_TIME_FILTER}
             ORDER BY event_date DESC, id
             LIMIT ?1 OFFSET ?2"
        );

        // LIMIT -1 means no limit in SQLite
        let limit = limit.map_or(-1, |l| l as i64);
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([limit, offset as i64], |row| {
                Ok(RawRecord {
                    year: text_at(row, 0)?,
                    tournament_name: text_at(row, 1)?,
                    event_date: text_at(row, 2)?,
                    gender: text_at(row, 3)?,
                    distance: text_at(row, 4)?,
                    style: text_at(row, 5)?,
                    rank: text_at(row, 6)?,
                    swimmer_name: text_at(row, 7)?,
                    age: text_at(row, 8)?,
                    team: text_at(row, 9)?,
                    seed_time: text_at(row, 10)?,
                    final_time: text_at(row, 11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        debug!(source = %self.describe(), rows = records.len(), "read snapshot rows");
        Ok(records)
    }
}

// ============================================================================
// CSV SNAPSHOT
// ============================================================================

pub struct CsvSnapshot {
    path: PathBuf,
}

impl CsvSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RawRecordSource for CsvSnapshot {
    fn describe(&self) -> String {
        format!("csv snapshot {}", self.path.display())
    }

    fn read_records(&self, limit: Option<usize>, offset: usize) -> Result<Vec<RawRecord>> {
        let mut rdr = csv::Reader::from_path(&self.path)?;
        let mut records = Vec::new();

        for row in rdr.deserialize::<RawRecord>().skip(offset) {
            if limit.map_or(false, |l| records.len() >= l) {
                break;
            }
            records.push(row?);
        }

        debug!(source = %self.describe(), rows = records.len(), "read snapshot rows");
        Ok(records)
    }
}

// ============================================================================
// LOCAL MIRROR OF THE REMOTE SOURCE
// ============================================================================

/// Reads `<dir>/<foreign_id>.csv`, one file per athlete, same headers as a
/// snapshot. Non-finishing rows and rows outside the window are skipped.
pub struct CsvDirectorySource {
    dir: PathBuf,
}

impl CsvDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl AthleteResultSource for CsvDirectorySource {
    fn fetch_athlete_records(
        &self,
        foreign_id: &str,
        window: &SyncWindow,
    ) -> Result<Vec<RawRecord>> {
        if foreign_id.is_empty()
            || foreign_id.contains(['/', '\\'])
            || foreign_id.starts_with('.')
        {
            return Err(ReconcileError::InvalidInput(format!(
                "unusable foreign id {foreign_id:?}"
            )));
        }

        let path = self.dir.join(format!("{foreign_id}.csv"));
        let records = CsvSnapshot::new(&path)
            .read_records(None, 0)
            .map_err(|e| ReconcileError::Upstream(format!("{}: {}", path.display(), e)))?;

        Ok(records
            .into_iter()
            .filter(|r| {
                r.final_time
                    .as_deref()
                    .map(str::trim)
                    .map_or(false, |t| !t.is_empty() && !NON_FINISH_TOKENS.contains(&t))
            })
            .filter(|r| window.contains(r.event_date.as_deref().and_then(parse_event_date)))
            .collect())
    }
}
