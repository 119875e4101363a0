// Swim Results Reconciliation - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod db;
pub mod error;
pub mod importer;
pub mod mapping;
pub mod matcher;
pub mod model;
pub mod normalizer;
pub mod parser;
pub mod similarity;
pub mod sources;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use config::ReconcileConfig;
pub use db::{setup_database, SqliteStore};
pub use error::{ReconcileError, Result};
pub use importer::{ImportPreview, ImportReport, Importer};
pub use mapping::{
    AutoConfirmReport, ConfirmOutcome, MappingManager, MappingStats, ProposeReport, TeamCodeReport,
};
pub use matcher::{
    Candidate, CandidateMatcher, ClubUnmatched, GroupBy, MatchQuery, Suggestion, TeamSummary,
    UnmatchedReport, UnmatchedSummary,
};
pub use model::{
    Athlete, CanonicalResult, Club, EntityKind, Event, ExternalEntityMapping, Gender,
    InternalEntity, MappingStatus, NewMapping, RawRecord, Round, Stroke,
};
pub use normalizer::{DropReason, RecordNormalizer};
pub use similarity::score as similarity_score;
pub use sources::{
    open_snapshot, AthleteResultSource, CsvDirectorySource, CsvSnapshot, RawRecordSource,
    SnapshotStats, SqliteSnapshot, SyncWindow,
};
pub use store::{ReconciliationStore, TeamCodeStatus};
pub use sync::{AthleteSync, SyncAllReport, SyncReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
