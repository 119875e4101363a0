// 🗄️ SQLite store backend
//
// Schema setup, the hash-keyed idempotent upsert for canonical results, the
// two mapping tables (one per EntityKind) and the audit event log. A club
// team code has at most one CONFIRMED owner, enforced by a partial index.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::{ReconcileError, Result};
use crate::model::{
    Athlete, CanonicalResult, Club, EntityKind, Event, ExternalEntityMapping, InternalEntity,
    MappingStatus, TEAM_CODE_KEY,
};
use crate::store::{
    LinkCounts, Page, ReconciliationStore, StatusCounts, TeamCodeStatus, TeamUnmatchedCounts,
    Transition, UnmatchedSwimmer, UpsertCounts,
};

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self { conn })
    }

    /// Raw connection, for ad hoc queries and tests
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // ROSTER (owned by another system; mirrored here for matching)
    // ========================================================================

    pub fn upsert_athlete(&self, athlete: &Athlete) -> Result<()> {
        write_athlete(&self.conn, athlete)
    }

    pub fn upsert_club(&self, club: &Club) -> Result<()> {
        self.conn.execute(
            "INSERT INTO clubs (id, name, active) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, active = excluded.active",
            params![club.id, club.name, club.active],
        )?;
        Ok(())
    }

    /// Load an athlete roster CSV (id, first_name, last_name, birth_date, club_id, active)
    pub fn load_athletes_csv(&self, path: &Path) -> Result<usize> {
        let mut rdr = csv::Reader::from_path(path)?;
        let tx = self.conn.unchecked_transaction()?;
        let mut loaded = 0;
        for row in rdr.deserialize() {
            let athlete: Athlete = row?;
            write_athlete(&tx, &athlete)?;
            loaded += 1;
        }
        tx.commit()?;
        Ok(loaded)
    }

    /// Load a club roster CSV (id, name, active)
    pub fn load_clubs_csv(&self, path: &Path) -> Result<usize> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut loaded = 0;
        for row in rdr.deserialize() {
            let club: Club = row?;
            self.upsert_club(&club)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

fn write_athlete(conn: &Connection, athlete: &Athlete) -> Result<()> {
    conn.execute(
        "INSERT INTO athletes (id, first_name, last_name, birth_date, club_id, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            first_name = excluded.first_name,
            last_name = excluded.last_name,
            birth_date = excluded.birth_date,
            club_id = excluded.club_id,
            active = excluded.active",
        params![
            athlete.id,
            athlete.first_name,
            athlete.last_name,
            athlete.birth_date,
            athlete.club_id,
            athlete.active,
        ],
    )?;
    Ok(())
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery (in-memory databases report "memory")
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

    // ==========================================================================
    // Roster tables (mirrors of the owning system)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS clubs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS athletes (
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            birth_date TEXT,
            club_id TEXT,
            active INTEGER NOT NULL DEFAULT 1
        );",
    )?;

    // ==========================================================================
    // Canonical results (identity_hash carries the dedup constraint)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS competition_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_hash TEXT UNIQUE NOT NULL,
            year INTEGER,
            tournament_name TEXT NOT NULL,
            event_date TEXT,
            gender TEXT NOT NULL,
            distance_m INTEGER NOT NULL,
            stroke TEXT NOT NULL,
            round TEXT,
            age INTEGER,
            swimmer_name TEXT NOT NULL,
            swimmer_name_norm TEXT NOT NULL,
            team_code TEXT,
            rank INTEGER,
            final_time_ms INTEGER NOT NULL,
            seed_time_ms INTEGER,
            source TEXT NOT NULL,
            athlete_id TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Mapping tables, one per entity kind
    // ==========================================================================
    for kind in [EntityKind::Athlete, EntityKind::Club] {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                external_name TEXT NOT NULL,
                external_name_norm TEXT NOT NULL,
                {id_field} TEXT,
                confidence_score REAL NOT NULL DEFAULT 0,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING'
                    CHECK (status IN ('PENDING', 'CONFIRMED', 'REJECTED')),
                metadata TEXT NOT NULL DEFAULT '{{}}',
                reviewed_by TEXT,
                reviewed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status, confidence_score);
            CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table}(external_name_norm);",
            table = kind.mapping_table(),
            id_field = kind.id_field(),
        ))?;
    }

    // One CONFIRMED owner per result team code
    conn.execute(
        &format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_club_team_code_owner
                ON {table}(json_extract(metadata, '$.{key}'))
                WHERE status = 'CONFIRMED'",
            table = EntityKind::Club.mapping_table(),
            key = TEAM_CODE_KEY,
        ),
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_results_name_norm
            ON competition_results(swimmer_name_norm);
        CREATE INDEX IF NOT EXISTS idx_results_athlete ON competition_results(athlete_id);
        CREATE INDEX IF NOT EXISTS idx_results_team ON competition_results(team_code);
        CREATE INDEX IF NOT EXISTS idx_athletes_club ON athletes(club_id);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

// ============================================================================
// ROW HELPERS
// ============================================================================

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn mapping_select(kind: EntityKind) -> String {
    format!(
        "SELECT id, external_name, external_name_norm, {id_field}, confidence_score, source,
                status, metadata, reviewed_by, reviewed_at, created_at
         FROM {table}",
        id_field = kind.id_field(),
        table = kind.mapping_table(),
    )
}

fn mapping_from_row(kind: EntityKind, row: &Row<'_>) -> rusqlite::Result<ExternalEntityMapping> {
    let metadata: String = row.get(7)?;
    let reviewed_at: Option<String> = row.get(9)?;
    let created_at: String = row.get(10)?;

    Ok(ExternalEntityMapping {
        id: row.get(0)?,
        kind,
        external_name: row.get(1)?,
        external_name_norm: row.get(2)?,
        internal_id: row.get(3)?,
        confidence_score: row.get(4)?,
        source: row.get(5)?,
        status: row.get(6)?,
        metadata: parse_json(7, &metadata)?,
        reviewed_by: row.get(8)?,
        reviewed_at: reviewed_at.map(|t| parse_timestamp(9, &t)).transpose()?,
        created_at: parse_timestamp(10, &created_at)?,
    })
}

/// Unlinked results grouped per normalized name, most results first
fn unmatched_select(filter: &str, limit: &str) -> String {
    format!(
        "SELECT MIN(swimmer_name) AS name, swimmer_name_norm, MIN(gender), MIN(team_code),
                COUNT(*) AS n
         FROM competition_results
         WHERE athlete_id IS NULL AND ({filter})
         GROUP BY swimmer_name_norm
         ORDER BY n DESC, name
         LIMIT {limit}"
    )
}

fn unmatched_from_row(row: &Row<'_>) -> rusqlite::Result<UnmatchedSwimmer> {
    let n: i64 = row.get(4)?;
    Ok(UnmatchedSwimmer {
        swimmer_name: row.get(0)?,
        swimmer_name_norm: row.get(1)?,
        gender: row.get(2)?,
        team_code: row.get(3)?,
        result_count: n as usize,
    })
}

fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
    let n: i64 = conn.query_row(sql, params, |row| row.get(0))?;
    Ok(n as usize)
}

// ============================================================================
// STORE IMPLEMENTATION
// ============================================================================

impl ReconciliationStore for SqliteStore {
    fn upsert_results(&self, batch: &[CanonicalResult]) -> Result<UpsertCounts> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut counts = UpsertCounts::default();

        {
            // Update only when something actually differs; athlete_id is
            // filled when unset and never overwritten.
            let mut update = tx.prepare(
                "UPDATE competition_results SET
                    event_date = ?2, gender = ?3, round = ?4, age = ?5, team_code = ?6,
                    rank = ?7, seed_time_ms = ?8, source = ?9, swimmer_name_norm = ?10,
                    athlete_id = COALESCE(athlete_id, ?11), updated_at = ?12
                 WHERE identity_hash = ?1
                   AND (event_date IS NOT ?2 OR gender IS NOT ?3 OR round IS NOT ?4
                        OR age IS NOT ?5 OR team_code IS NOT ?6 OR rank IS NOT ?7
                        OR seed_time_ms IS NOT ?8 OR source IS NOT ?9
                        OR swimmer_name_norm IS NOT ?10
                        OR (athlete_id IS NULL AND ?11 IS NOT NULL))",
            )?;
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO competition_results (
                    identity_hash, year, tournament_name, event_date, gender, distance_m,
                    stroke, round, age, swimmer_name, swimmer_name_norm, team_code, rank,
                    final_time_ms, seed_time_ms, source, athlete_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                          ?16, ?17, ?18, ?18)",
            )?;

            for result in batch {
                let hash = result.identity_hash();

                let updated = update.execute(params![
                    hash,
                    result.event_date,
                    result.gender,
                    result.round,
                    result.age,
                    result.team_code,
                    result.rank,
                    result.seed_time_ms,
                    result.source,
                    result.swimmer_name_norm,
                    result.athlete_id,
                    now,
                ])?;
                if updated > 0 {
                    counts.updated += 1;
                    continue;
                }

                let inserted = insert.execute(params![
                    hash,
                    result.year,
                    result.tournament_name,
                    result.event_date,
                    result.gender,
                    result.distance_m,
                    result.stroke,
                    result.round,
                    result.age,
                    result.swimmer_name,
                    result.swimmer_name_norm,
                    result.team_code,
                    result.rank,
                    result.final_time_ms,
                    result.seed_time_ms,
                    result.source,
                    result.athlete_id,
                    now,
                ])?;
                if inserted > 0 {
                    counts.inserted += 1;
                } else {
                    counts.unchanged += 1;
                }
            }
        }

        tx.commit()?;
        debug!(?counts, "upserted result batch");
        Ok(counts)
    }

    fn link_results(&self, name_norm: &str, athlete_id: &str) -> Result<usize> {
        let linked = self.conn.execute(
            "UPDATE competition_results SET athlete_id = ?1, updated_at = ?3
             WHERE swimmer_name_norm = ?2 AND athlete_id IS NULL",
            params![athlete_id, name_norm, Utc::now().to_rfc3339()],
        )?;
        Ok(linked)
    }

    fn result_link_counts(&self) -> Result<LinkCounts> {
        Ok(LinkCounts {
            linked: count(
                &self.conn,
                "SELECT COUNT(*) FROM competition_results WHERE athlete_id IS NOT NULL",
                [],
            )?,
            unlinked: count(
                &self.conn,
                "SELECT COUNT(*) FROM competition_results WHERE athlete_id IS NULL",
                [],
            )?,
        })
    }

    fn count_results(&self) -> Result<usize> {
        count(&self.conn, "SELECT COUNT(*) FROM competition_results", [])
    }

    fn unmatched_swimmers(
        &self,
        team_code: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UnmatchedSwimmer>> {
        let sql = unmatched_select("?1 IS NULL OR team_code = ?1", "?2");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![team_code, limit as i64], unmatched_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn unmatched_swimmers_in(
        &self,
        team_codes: &[String],
        limit: usize,
    ) -> Result<Vec<UnmatchedSwimmer>> {
        if team_codes.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; team_codes.len()].join(", ");
        let sql = unmatched_select(&format!("team_code IN ({placeholders})"), "?");

        let limit = limit as i64;
        let mut values: Vec<&dyn rusqlite::ToSql> =
            team_codes.iter().map(|c| c as &dyn rusqlite::ToSql).collect();
        values.push(&limit);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(values.as_slice(), unmatched_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn unmatched_team_counts(&self) -> Result<Vec<TeamUnmatchedCounts>> {
        let mut stmt = self.conn.prepare(
            "SELECT NULLIF(TRIM(team_code), '') AS team,
                    COUNT(DISTINCT swimmer_name_norm),
                    COUNT(DISTINCT CASE WHEN gender = 'M' THEN swimmer_name_norm END),
                    COUNT(DISTINCT CASE WHEN gender = 'F' THEN swimmer_name_norm END)
             FROM competition_results
             WHERE athlete_id IS NULL
             GROUP BY team
             ORDER BY team IS NULL, team",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let swimmers: i64 = row.get(1)?;
                let male: i64 = row.get(2)?;
                let female: i64 = row.get(3)?;
                Ok(TeamUnmatchedCounts {
                    team_code: row.get(0)?,
                    swimmers: swimmers as usize,
                    male: male as usize,
                    female: female as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    fn team_codes(&self) -> Result<Vec<TeamCodeStatus>> {
        let sql = format!(
            "SELECT t.team_code, t.results, t.unlinked, t.club_id, c.name
             FROM (
                SELECT r.team_code AS team_code,
                       COUNT(*) AS results,
                       SUM(CASE WHEN r.athlete_id IS NULL THEN 1 ELSE 0 END) AS unlinked,
                       (SELECT m.club_id FROM {table} m
                         WHERE m.status = 'CONFIRMED'
                           AND json_extract(m.metadata, '$.{key}') = r.team_code) AS club_id
                FROM competition_results r
                WHERE r.team_code IS NOT NULL AND TRIM(r.team_code) <> ''
                GROUP BY r.team_code
             ) t
             LEFT JOIN clubs c ON c.id = t.club_id
             ORDER BY t.team_code",
            table = EntityKind::Club.mapping_table(),
            key = TEAM_CODE_KEY,
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let results: i64 = row.get(1)?;
                let unlinked: i64 = row.get(2)?;
                Ok(TeamCodeStatus {
                    team_code: row.get(0)?,
                    result_count: results as usize,
                    unlinked_results: unlinked as usize,
                    club_id: row.get(3)?,
                    club_name: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    fn club_team_codes(&self, club_id: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT json_extract(metadata, '$.{key}') AS code FROM {table}
             WHERE status = 'CONFIRMED' AND club_id = ?1
               AND json_extract(metadata, '$.{key}') IS NOT NULL
             ORDER BY code",
            table = EntityKind::Club.mapping_table(),
            key = TEAM_CODE_KEY,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let codes = stmt
            .query_map(params![club_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(codes)
    }

    fn team_code_link(&self, team_code: &str) -> Result<Option<ExternalEntityMapping>> {
        let kind = EntityKind::Club;
        let sql = format!(
            "{} WHERE status = 'CONFIRMED' AND json_extract(metadata, '$.{}') = ?1 LIMIT 1",
            mapping_select(kind),
            TEAM_CODE_KEY
        );
        let mapping = self
            .conn
            .query_row(&sql, params![team_code], |row| mapping_from_row(kind, row))
            .optional()?;
        Ok(mapping)
    }

    fn fetch_entities(
        &self,
        kind: EntityKind,
        scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InternalEntity>> {
        let (table, name) = match kind {
            EntityKind::Athlete => ("athletes", "first_name || ' ' || last_name"),
            EntityKind::Club => ("clubs", "name"),
        };
        let scope_column = match (kind.scope_field(), scope) {
            (Some(column), _) => column,
            (None, None) => "NULL",
            (None, Some(_)) => {
                return Err(ReconcileError::InvalidInput(format!(
                    "{} candidates cannot be scoped",
                    kind.as_str()
                )))
            }
        };
        let sql = format!(
            "SELECT id, {name}, {scope_column} FROM {table}
             WHERE active = 1 AND (?1 IS NULL OR {scope_column} = ?1)
             ORDER BY rowid LIMIT ?2"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let entities = stmt
            .query_map(params![scope, limit as i64], |row| {
                Ok(InternalEntity {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    scope_id: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entities)
    }

    fn get_entity(&self, kind: EntityKind, id: &str) -> Result<Option<InternalEntity>> {
        let sql = match kind {
            EntityKind::Athlete => {
                "SELECT id, first_name || ' ' || last_name, club_id FROM athletes WHERE id = ?1"
            }
            EntityKind::Club => "SELECT id, name, NULL FROM clubs WHERE id = ?1",
        };

        let entity = self
            .conn
            .query_row(sql, params![id], |row| {
                Ok(InternalEntity {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    scope_id: row.get(2)?,
                })
            })
            .optional()?;

        Ok(entity)
    }

    fn insert_mapping(&self, mapping: &ExternalEntityMapping) -> Result<()> {
        let metadata = serde_json::to_string(&mapping.metadata)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {table} (
                    id, external_name, external_name_norm, {id_field}, confidence_score,
                    source, status, metadata, reviewed_by, reviewed_at, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                table = mapping.kind.mapping_table(),
                id_field = mapping.kind.id_field(),
            ),
            params![
                mapping.id,
                mapping.external_name,
                mapping.external_name_norm,
                mapping.internal_id,
                mapping.confidence_score,
                mapping.source,
                mapping.status,
                metadata,
                mapping.reviewed_by,
                mapping.reviewed_at.map(|t| t.to_rfc3339()),
                mapping.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_mapping(&self, kind: EntityKind, id: &str) -> Result<Option<ExternalEntityMapping>> {
        let sql = format!("{} WHERE id = ?1", mapping_select(kind));
        let mapping = self
            .conn
            .query_row(&sql, params![id], |row| mapping_from_row(kind, row))
            .optional()?;
        Ok(mapping)
    }

    fn find_mapping_by_name(
        &self,
        kind: EntityKind,
        name_norm: &str,
    ) -> Result<Option<ExternalEntityMapping>> {
        let sql = format!(
            "{} WHERE external_name_norm = ?1 ORDER BY created_at DESC LIMIT 1",
            mapping_select(kind)
        );
        let mapping = self
            .conn
            .query_row(&sql, params![name_norm], |row| mapping_from_row(kind, row))
            .optional()?;
        Ok(mapping)
    }

    fn transition_mapping(
        &self,
        kind: EntityKind,
        id: &str,
        transition: &Transition,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE {table}
                 SET status = ?1, {id_field} = ?2, reviewed_by = ?3, reviewed_at = ?4
                 WHERE id = ?5 AND status = ?6",
                table = kind.mapping_table(),
                id_field = kind.id_field(),
            ),
            params![
                transition.to,
                transition.internal_id,
                transition.reviewed_by,
                transition.reviewed_at.map(|t| t.to_rfc3339()),
                id,
                transition.from,
            ],
        )?;
        Ok(changed == 1)
    }

    fn list_mappings(
        &self,
        kind: EntityKind,
        status: MappingStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Page<ExternalEntityMapping>> {
        let total = count(
            &self.conn,
            &format!("SELECT COUNT(*) FROM {} WHERE status = ?1", kind.mapping_table()),
            params![status],
        )?;

        let sql = format!(
            "{} WHERE status = ?1 ORDER BY confidence_score DESC, rowid LIMIT ?2 OFFSET ?3",
            mapping_select(kind)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![status, limit as i64, offset as i64], |row| {
                mapping_from_row(kind, row)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page { total, items })
    }

    fn mapping_status_counts(&self, kind: EntityKind) -> Result<StatusCounts> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            kind.mapping_table()
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, MappingStatus>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let n = n as usize;
            match status {
                MappingStatus::Pending => counts.pending = n,
                MappingStatus::Confirmed => counts.confirmed = n,
                MappingStatus::Rejected => counts.rejected = n,
            }
        }
        Ok(counts)
    }

    fn auto_confirm_candidates(
        &self,
        kind: EntityKind,
        min_confidence: f64,
    ) -> Result<Vec<ExternalEntityMapping>> {
        let sql = format!(
            "{} WHERE status = 'PENDING' AND confidence_score >= ?1 AND {} IS NOT NULL
             ORDER BY confidence_score DESC, rowid",
            mapping_select(kind),
            kind.id_field()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(params![min_confidence], |row| mapping_from_row(kind, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }

    fn find_confirmed_mapping(
        &self,
        kind: EntityKind,
        internal_id: &str,
        source: Option<&str>,
    ) -> Result<Option<ExternalEntityMapping>> {
        let sql = format!(
            "{} WHERE status = 'CONFIRMED' AND {} = ?1 AND (?2 IS NULL OR source = ?2)
             ORDER BY reviewed_at DESC LIMIT 1",
            mapping_select(kind),
            kind.id_field()
        );
        let mapping = self
            .conn
            .query_row(&sql, params![internal_id, source], |row| {
                mapping_from_row(kind, row)
            })
            .optional()?;
        Ok(mapping)
    }

    fn update_mapping_metadata(
        &self,
        kind: EntityKind,
        id: &str,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let changed = self.conn.execute(
            &format!("UPDATE {} SET metadata = ?1 WHERE id = ?2", kind.mapping_table()),
            params![serde_json::to_string(metadata)?, id],
        )?;
        if changed == 0 {
            return Err(ReconcileError::not_found("mapping", id));
        }
        Ok(())
    }

    fn record_event(&self, event: &Event) -> Result<()> {
        let data_json = serde_json::to_string(&event.data)?;

        self.conn.execute(
            "INSERT INTO events (
                event_id, timestamp, event_type, entity_type, entity_id, data, actor
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.entity_type,
                event.entity_id,
                data_json,
                event.actor,
            ],
        )?;

        Ok(())
    }

    fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
             FROM events
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY timestamp DESC, id DESC",
        )?;

        let events = stmt
            .query_map(params![entity_type, entity_id], |row| {
                let timestamp: String = row.get(1)?;
                let data: String = row.get(5)?;

                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: parse_timestamp(1, &timestamp)?,
                    event_type: row.get(2)?,
                    entity_type: row.get(3)?,
                    entity_id: row.get(4)?,
                    data: parse_json(5, &data)?,
                    actor: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(events)
    }
}

// ============================================================================
// TEST FIXTURES (shared with the other modules' tests)
// ============================================================================


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let batch = vec![
            result("Ana Soto", 61_000),
            result("Ana Soto", 62_000),
            result("Luis Mora", 58_300),
        ];

        let first = store.upsert_results(&batch).unwrap();
        assert_eq!(first, UpsertCounts { inserted: 3, updated: 0, unchanged: 0 });

        let second = store.upsert_results(&batch).unwrap();
        assert_eq!(second, UpsertCounts { inserted: 0, updated: 0, unchanged: 3 });
        assert_eq!(store.count_results().unwrap(), 3);
    }

    #[test]
    fn test_separator_in_names_does_not_merge_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let mut a = result("Soto", 61_000);
        a.tournament_name = "Copa|Ana".to_string();
        let mut b = result("Ana|Soto", 61_000);
        b.tournament_name = "Copa".to_string();

        let counts = store.upsert_results(&[a, b]).unwrap();
        assert_eq!(counts.inserted, 2);
        assert_eq!(store.count_results().unwrap(), 2);
    }

    #[test]
    fn test_upsert_updates_non_key_fields() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_results(&[result("Ana Soto", 61_000)]).unwrap();

        let mut changed = result("Ana Soto", 61_000);
        changed.rank = Some(4);
        let counts = store.upsert_results(&[changed]).unwrap();

        assert_eq!(counts.updated, 1);
        assert_eq!(store.count_results().unwrap(), 1);
        let rank: i64 = store
            .conn()
            .query_row("SELECT rank FROM competition_results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rank, 4);
    }

    #[test]
    fn test_upsert_never_overwrites_athlete_link() {
        let store = SqliteStore::in_memory().unwrap();
        let mut linked = result("Ana Soto", 61_000);
        linked.athlete_id = Some("ath-3".to_string());
        store.upsert_results(&[linked]).unwrap();

        // plain re-import carries no athlete id: unchanged, link kept
        let counts = store.upsert_results(&[result("Ana Soto", 61_000)]).unwrap();
        assert_eq!(counts.unchanged, 1);

        let mut other = result("Ana Soto", 61_000);
        other.athlete_id = Some("ath-9".to_string());
        assert_eq!(store.upsert_results(&[other]).unwrap().unchanged, 1);

        let athlete: String = store
            .conn()
            .query_row("SELECT athlete_id FROM competition_results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(athlete, "ath-3");
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .conn()
            .execute_batch(
                "CREATE TRIGGER boom BEFORE INSERT ON competition_results
                 WHEN NEW.swimmer_name = 'BOOM'
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();

        let batch = vec![result("Ana Soto", 61_000), result("BOOM", 1_000)];
        assert!(store.upsert_results(&batch).is_err());
        assert_eq!(store.count_results().unwrap(), 0);
    }

    #[test]
    fn test_link_results_only_touches_unlinked_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let mut already = result("Ana Soto", 60_000);
        already.athlete_id = Some("ath-other".to_string());
        store
            .upsert_results(&[already, result("Ana Soto", 61_000), result("Ana  SOTO", 62_000)])
            .unwrap();

        assert_eq!(store.link_results("ana soto", "ath-3").unwrap(), 2);
        assert_eq!(store.link_results("ana soto", "ath-3").unwrap(), 0);
        assert_eq!(
            store.result_link_counts().unwrap(),
            LinkCounts { linked: 3, unlinked: 0 }
        );
    }

    #[test]
    fn test_fetch_entities_scoped_and_ordered() {
        let store = seeded_store();

        let all = store.fetch_entities(EntityKind::Athlete, None, 10).unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["ath-1", "ath-2", "ath-3"]);
        assert_eq!(all[0].name, "María Fernanda López");

        let scoped = store
            .fetch_entities(EntityKind::Athlete, Some("club-2"), 10)
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, "ath-3");

        assert_eq!(store.fetch_entities(EntityKind::Athlete, None, 2).unwrap().len(), 2);
        assert_eq!(store.fetch_entities(EntityKind::Club, None, 10).unwrap().len(), 2);
        assert!(matches!(
            store.fetch_entities(EntityKind::Club, Some("x"), 10),
            Err(ReconcileError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_inactive_athletes_are_not_candidates() {
        let store = seeded_store();
        let mut retired = athlete("ath-4", "Old", "Timer", None);
        retired.active = false;
        store.upsert_athlete(&retired).unwrap();

        let all = store.fetch_entities(EntityKind::Athlete, None, 10).unwrap();
        assert!(all.iter().all(|e| e.id != "ath-4"));
        assert!(store.get_entity(EntityKind::Athlete, "ath-4").unwrap().is_some());
    }

    #[test]
    fn test_mapping_round_trip_and_cas() {
        let store = seeded_store();
        let mut mapping = pending(EntityKind::Athlete, "Ana Soto", Some("ath-3"), 0.9);
        mapping
            .metadata
            .insert("foreign_id".to_string(), serde_json::json!("F-1"));
        store.insert_mapping(&mapping).unwrap();

        let loaded = store
            .get_mapping(EntityKind::Athlete, &mapping.id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.external_name_norm, "ana soto");
        assert_eq!(loaded.internal_id.as_deref(), Some("ath-3"));
        assert_eq!(loaded.foreign_id().as_deref(), Some("F-1"));
        assert!(store.get_mapping(EntityKind::Club, &mapping.id).unwrap().is_none());

        let confirm = Transition {
            from: MappingStatus::Pending,
            to: MappingStatus::Confirmed,
            internal_id: Some("ath-3".to_string()),
            reviewed_by: Some("coach".to_string()),
            reviewed_at: Some(Utc::now()),
        };
        assert!(store
            .transition_mapping(EntityKind::Athlete, &mapping.id, &confirm)
            .unwrap());
        // second CAS from PENDING loses
        assert!(!store
            .transition_mapping(EntityKind::Athlete, &mapping.id, &confirm)
            .unwrap());

        let loaded = store
            .get_mapping(EntityKind::Athlete, &mapping.id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, MappingStatus::Confirmed);
        assert_eq!(loaded.reviewed_by.as_deref(), Some("coach"));
        assert!(loaded.reviewed_at.is_some());

        let found = store
            .find_confirmed_mapping(EntityKind::Athlete, "ath-3", None)
            .unwrap();
        assert_eq!(found.map(|m| m.id), Some(mapping.id.clone()));
        assert!(store
            .find_confirmed_mapping(EntityKind::Athlete, "ath-3", Some("elsewhere"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_list_and_count_mappings() {
        let store = seeded_store();
        let low = pending(EntityKind::Athlete, "A One", None, 0.2);
        let high = pending(EntityKind::Athlete, "B Two", Some("ath-1"), 0.95);
        let mid = pending(EntityKind::Athlete, "C Three", Some("ath-2"), 0.7);
        for m in [&low, &high, &mid] {
            store.insert_mapping(m).unwrap();
        }

        let page = store
            .list_mappings(EntityKind::Athlete, MappingStatus::Pending, 2, 0)
            .unwrap();
        assert_eq!(page.total, 3);
        let names: Vec<_> = page.items.iter().map(|m| m.external_name.as_str()).collect();
        assert_eq!(names, vec!["B Two", "C Three"]);

        let rest = store
            .list_mappings(EntityKind::Athlete, MappingStatus::Pending, 2, 2)
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0].external_name, "A One");

        let candidates = store
            .auto_confirm_candidates(EntityKind::Athlete, 0.8)
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, high.id);

        let counts = store.mapping_status_counts(EntityKind::Athlete).unwrap();
        assert_eq!(counts, StatusCounts { pending: 3, confirmed: 0, rejected: 0 });
        assert_eq!(
            store.mapping_status_counts(EntityKind::Club).unwrap(),
            StatusCounts::default()
        );
    }

    #[test]
    fn test_unmatched_swimmers_grouping_and_order() {
        let store = SqliteStore::in_memory().unwrap();
        let mut other_team = result("Luis Mora", 58_000);
        other_team.team_code = Some("HER".to_string());
        store
            .upsert_results(&[
                result("Ana Soto", 61_000),
                result("Ana Soto", 62_000),
                result("Bea Rojas", 70_000),
                other_team,
            ])
            .unwrap();

        let all = store.unmatched_swimmers(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].swimmer_name_norm, "ana soto");
        assert_eq!(all[0].result_count, 2);
        assert_eq!(all[1].swimmer_name, "Bea Rojas");

        let team = store.unmatched_swimmers(Some("HER"), 10).unwrap();
        assert_eq!(team.len(), 1);
        assert_eq!(team[0].swimmer_name, "Luis Mora");

        store.link_results("ana soto", "ath-3").unwrap();
        assert_eq!(store.unmatched_swimmers(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_unmatched_swimmers_in_team_codes() {
        let store = SqliteStore::in_memory().unwrap();
        let mut her = result("Luis Mora", 58_000);
        her.team_code = Some("HER".to_string());
        let mut sjo = result("Eva Ruiz", 66_000);
        sjo.team_code = Some("SJO".to_string());
        store
            .upsert_results(&[result("Ana Soto", 61_000), her, sjo])
            .unwrap();

        let codes = vec!["CNA".to_string(), "SJO".to_string()];
        let found = store.unmatched_swimmers_in(&codes, 10).unwrap();
        let names: Vec<_> = found.iter().map(|s| s.swimmer_name.as_str()).collect();
        assert_eq!(names, vec!["Ana Soto", "Eva Ruiz"]);

        assert_eq!(store.unmatched_swimmers_in(&codes, 1).unwrap().len(), 1);
        assert!(store.unmatched_swimmers_in(&[], 10).unwrap().is_empty());
    }

    #[test]
    fn test_team_code_owner_lookup() {
        let store = seeded_store();
        store.upsert_results(&[result("Ana Soto", 61_000)]).unwrap();
        assert!(store.team_code_link("CNA").unwrap().is_none());

        let mut link = pending(EntityKind::Club, "CNA", Some("club-1"), 1.0);
        link.status = MappingStatus::Confirmed;
        link.metadata
            .insert(TEAM_CODE_KEY.to_string(), serde_json::json!("CNA"));
        store.insert_mapping(&link).unwrap();

        // a PENDING club mapping for the same code is no owner
        let mut proposal = pending(EntityKind::Club, "CNA", Some("club-2"), 0.5);
        proposal
            .metadata
            .insert(TEAM_CODE_KEY.to_string(), serde_json::json!("CNA"));
        store.insert_mapping(&proposal).unwrap();

        let owner = store.team_code_link("CNA").unwrap().unwrap();
        assert_eq!(owner.id, link.id);
        assert_eq!(store.club_team_codes("club-1").unwrap(), vec!["CNA".to_string()]);
        assert!(store.club_team_codes("club-2").unwrap().is_empty());

        let codes = store.team_codes().unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].club_id.as_deref(), Some("club-1"));
        assert_eq!(codes[0].club_name.as_deref(), Some("Club Natación Alajuela"));
    }

    #[test]
    fn test_event_log() {
        let store = SqliteStore::in_memory().unwrap();
        let first = Event::new(
            "mapping_created",
            "athlete_mapping",
            "m-1",
            serde_json::json!({"confidence": 0.9}),
            "reviewer",
        );
        let second = Event::new(
            "mapping_confirmed",
            "athlete_mapping",
            "m-1",
            serde_json::json!({"results_linked": 4}),
            "reviewer",
        );
        store.record_event(&first).unwrap();
        store.record_event(&second).unwrap();

        let events = store.events_for("athlete_mapping", "m-1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "mapping_confirmed");
        assert_eq!(events[0].data["results_linked"], 4);
        assert!(store.events_for("athlete_mapping", "m-2").unwrap().is_empty());
    }

    #[test]
    fn test_load_roster_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("athletes.csv");
        std::fs::write(
            &path,
            "id,first_name,last_name,birth_date,club_id,active\n\
             a1,Ana,Soto,2010-02-01,club-1,true\n\
             a2,Luis,Mora,,,false\n",
        )
        .unwrap();

        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.load_athletes_csv(&path).unwrap(), 2);

        let active = store.fetch_entities(EntityKind::Athlete, None, 10).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].scope_id.as_deref(), Some("club-1"));
    }
}
