// 🏊 swim-reconcile CLI
//
// Each subcommand runs one library operation against the configured store (or
// a snapshot) and prints the result as pretty JSON on stdout. Logs go to stderr.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swim_reconcile::importer;
use swim_reconcile::{
    open_snapshot, AthleteSync, CandidateMatcher, CsvDirectorySource, EntityKind, GroupBy,
    Importer, MappingManager, MatchQuery, NewMapping, RawRecord, ReconcileConfig, ReconciliationStore,
    RecordNormalizer, SqliteSnapshot, SqliteStore, SyncWindow,
};

#[derive(Parser)]
#[command(name = "swim-reconcile", version, about = "Swim results normalization and athlete reconciliation")]
struct Cli {
    /// Config file (falls back to $SWIM_RECONCILE_CONFIG, then ./reconcile.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store location, overrides the configured database_path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Normalize a snapshot and upsert it into the store
    Import {
        #[command(flatten)]
        snapshot: SnapshotArgs,
        /// Provenance tag (defaults to the configured source_tag)
        #[arg(long)]
        source: Option<String>,
    },
    /// Normalize a snapshot without writing anything
    Preview {
        #[command(flatten)]
        snapshot: SnapshotArgs,
        #[arg(long, default_value_t = 5)]
        sample: usize,
    },
    /// Row counts, date range and distinct names of a SQLite snapshot
    SnapshotStats {
        path: PathBuf,
    },
    /// Load athlete and/or club CSV exports into the store
    LoadRoster {
        #[arg(long)]
        athletes: Option<PathBuf>,
        #[arg(long)]
        clubs: Option<PathBuf>,
    },
    /// Rank internal entities against one external name
    Search {
        name: String,
        #[command(flatten)]
        kind: KindArg,
        /// Club id to restrict athlete candidates to
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        min_similarity: Option<f64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Top candidates for several external names at once
    Suggest {
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        kind: KindArg,
        #[arg(long)]
        min_similarity: Option<f64>,
    },
    /// Create PENDING mappings for names that have none yet
    Propose {
        names: Vec<String>,
        /// Also propose for up to N unmatched swimmer names from the results
        #[arg(long)]
        from_unmatched: Option<usize>,
        #[command(flatten)]
        kind: KindArg,
        #[arg(long)]
        min_similarity: Option<f64>,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Review queue, highest confidence first
    Pending {
        #[command(flatten)]
        kind: KindArg,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Create one PENDING mapping by hand
    Create {
        #[arg(long)]
        name: String,
        #[command(flatten)]
        kind: KindArg,
        #[arg(long)]
        internal_id: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        confidence: f64,
        #[arg(long)]
        source: Option<String>,
        /// Foreign-system id, stored in the mapping metadata
        #[arg(long)]
        foreign_id: Option<String>,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Confirm a PENDING mapping (links unlinked results for athletes)
    Confirm {
        mapping_id: String,
        #[command(flatten)]
        kind: KindArg,
        /// Defaults to the mapping's suggested id
        #[arg(long)]
        internal_id: Option<String>,
        #[arg(long)]
        reviewer: Option<String>,
    },
    /// Reject a PENDING mapping
    Reject {
        mapping_id: String,
        #[command(flatten)]
        kind: KindArg,
        #[arg(long)]
        reviewer: Option<String>,
    },
    /// Confirm every PENDING mapping at or above the confidence floor
    AutoConfirm {
        #[command(flatten)]
        kind: KindArg,
        #[arg(long)]
        min_confidence: Option<f64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Mapping counts by status and result link counts
    Stats {
        #[command(flatten)]
        kind: KindArg,
    },
    /// External swimmer names whose results are not linked to an athlete
    Unmatched {
        #[arg(long)]
        team: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value = "team")]
        group_by: GroupBy,
    },
    /// Unlinked swimmer counts per team code
    UnmatchedSummary,
    /// Every result team code with the club it is linked to
    TeamCodes,
    /// Team codes linked to one club
    ClubTeamCodes {
        club_id: String,
    },
    /// Link a result team code to a club (one owner per code)
    LinkTeamCode {
        club_id: String,
        team_code: String,
        #[arg(long)]
        reviewer: Option<String>,
    },
    /// Unmatched swimmers under a club's linked team codes
    ClubUnmatched {
        club_id: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Audit trail of one mapping
    Events {
        mapping_id: String,
        #[command(flatten)]
        kind: KindArg,
    },
    /// Pull one athlete's results from a local mirror of the foreign system
    Sync {
        athlete_id: String,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Sync every athlete with a CONFIRMED mapping
    SyncAll {
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

#[derive(Args)]
struct KindArg {
    /// athlete or club
    #[arg(long, default_value = "athlete")]
    kind: EntityKind,
}

#[derive(Args)]
struct SnapshotArgs {
    /// SQLite snapshot, or a .csv export with the same columns
    path: PathBuf,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Args)]
struct RemoteArgs {
    /// Directory holding one <foreign_id>.csv per athlete
    #[arg(long)]
    mirror: PathBuf,
    /// First event date, YYYY-MM-DD (default: two years back)
    #[arg(long)]
    from: Option<NaiveDate>,
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Only use mappings created by this source
    #[arg(long)]
    mapping_source: Option<String>,
}

impl RemoteArgs {
    fn window(&self) -> SyncWindow {
        SyncWindow {
            from: self.from,
            to: self.to,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("swim_reconcile=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config =
        ReconcileConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    run(cli.command, &config)
}

fn run(command: Command, config: &ReconcileConfig) -> Result<()> {
    match command {
        Command::Preview { snapshot, sample } => {
            let records = read_snapshot(&snapshot)?;
            let normalizer = RecordNormalizer::new(config.source_tag.as_str());
            print_json(&importer::preview(&normalizer, &records, sample))
        }
        Command::SnapshotStats { path } => {
            let stats = SqliteSnapshot::new(&path)
                .stats()
                .with_context(|| format!("failed to read snapshot {}", path.display()))?;
            print_json(&stats)
        }
        command => {
            let store = open_store(config)?;
            run_with_store(command, &store, config)
        }
    }
}

fn run_with_store(command: Command, store: &SqliteStore, config: &ReconcileConfig) -> Result<()> {
    let matcher = CandidateMatcher::new(store, config.candidate_fetch_factor);
    let manager = MappingManager::new(store, config.source_tag.as_str())
        .with_fetch_factor(config.candidate_fetch_factor);
    let min_or_default = |value: Option<f64>| value.unwrap_or(config.search_min_similarity);

    match command {
        Command::Import { snapshot, source } => {
            let records = read_snapshot(&snapshot)?;
            let source = source.unwrap_or_else(|| config.source_tag.clone());
            let report = Importer::new(store, source, config.import_batch_size).import(&records);
            print_json(&report)
        }
        Command::LoadRoster { athletes, clubs } => {
            if athletes.is_none() && clubs.is_none() {
                bail!("nothing to load: pass --athletes and/or --clubs");
            }
            // clubs first so athlete club ids resolve
            let clubs_loaded = match clubs {
                Some(path) => store
                    .load_clubs_csv(&path)
                    .with_context(|| format!("failed to load clubs from {}", path.display()))?,
                None => 0,
            };
            let athletes_loaded = match athletes {
                Some(path) => store
                    .load_athletes_csv(&path)
                    .with_context(|| format!("failed to load athletes from {}", path.display()))?,
                None => 0,
            };
            info!(clubs = clubs_loaded, athletes = athletes_loaded, "roster loaded");
            print_json(&json!({ "clubs": clubs_loaded, "athletes": athletes_loaded }))
        }
        Command::Search {
            name,
            kind,
            scope,
            min_similarity,
            limit,
        } => {
            let query = MatchQuery {
                external_name: &name,
                scope: scope.as_deref(),
                min_similarity: min_or_default(min_similarity),
                limit: limit.unwrap_or(config.match_limit),
            };
            print_json(&matcher.find_matches(kind.kind, &query)?)
        }
        Command::Suggest {
            names,
            kind,
            min_similarity,
        } => print_json(&matcher.suggest_batch(kind.kind, &names, min_or_default(min_similarity))?),
        Command::Propose {
            mut names,
            from_unmatched,
            kind,
            min_similarity,
            actor,
        } => {
            if let Some(limit) = from_unmatched {
                names.extend(
                    store
                        .unmatched_swimmers(None, limit)?
                        .into_iter()
                        .map(|s| s.swimmer_name),
                );
            }
            if names.is_empty() {
                bail!("no names to propose: pass names or --from-unmatched");
            }
            let report = manager.propose(
                kind.kind,
                &names,
                min_or_default(min_similarity),
                actor.as_deref(),
            )?;
            print_json(&report)
        }
        Command::Pending {
            kind,
            limit,
            offset,
        } => print_json(&manager.pending(kind.kind, limit, offset)?),
        Command::Create {
            name,
            kind,
            internal_id,
            confidence,
            source,
            foreign_id,
            actor,
        } => {
            let mut metadata = HashMap::new();
            if let Some(foreign_id) = foreign_id {
                metadata.insert("foreign_id".to_string(), json!(foreign_id));
            }
            let input = NewMapping {
                external_name: name,
                internal_id,
                confidence_score: confidence,
                source,
                metadata,
            };
            print_json(&manager.create(kind.kind, input, actor.as_deref())?)
        }
        Command::Confirm {
            mapping_id,
            kind,
            internal_id,
            reviewer,
        } => {
            let internal_id = match internal_id {
                Some(id) => id,
                None => match manager.get(kind.kind, &mapping_id)?.internal_id {
                    Some(id) => id,
                    None => bail!("mapping {mapping_id} has no suggested id; pass --internal-id"),
                },
            };
            let outcome = manager.confirm(kind.kind, &mapping_id, &internal_id, reviewer.as_deref())?;
            print_json(&outcome)
        }
        Command::Reject {
            mapping_id,
            kind,
            reviewer,
        } => print_json(&manager.reject(kind.kind, &mapping_id, reviewer.as_deref())?),
        Command::AutoConfirm {
            kind,
            min_confidence,
            dry_run,
        } => {
            let floor = min_confidence.unwrap_or(config.auto_confirm_min_confidence);
            print_json(&manager.auto_confirm(kind.kind, floor, dry_run)?)
        }
        Command::Stats { kind } => print_json(&manager.stats(kind.kind)?),
        Command::Unmatched {
            team,
            limit,
            group_by,
        } => print_json(&matcher.unmatched_names(team.as_deref(), limit, group_by)?),
        Command::UnmatchedSummary => print_json(&matcher.unmatched_summary()?),
        Command::TeamCodes => print_json(&manager.team_codes()?),
        Command::ClubTeamCodes { club_id } => print_json(&manager.club_team_codes(&club_id)?),
        Command::LinkTeamCode {
            club_id,
            team_code,
            reviewer,
        } => print_json(&manager.link_team_code(&club_id, &team_code, reviewer.as_deref())?),
        Command::ClubUnmatched { club_id, limit } => {
            print_json(&matcher.club_unmatched(&club_id, limit)?)
        }
        Command::Events { mapping_id, kind } => print_json(&manager.history(kind.kind, &mapping_id)?),
        Command::Sync { athlete_id, remote } => {
            let mirror = CsvDirectorySource::new(&remote.mirror);
            let report = AthleteSync::new(store, &mirror, config.source_tag.as_str())
                .with_mapping_source(remote.mapping_source.clone())
                .with_batch_size(config.import_batch_size)
                .sync_athlete(&athlete_id, remote.window())?;
            print_json(&report)
        }
        Command::SyncAll { remote } => {
            let mirror = CsvDirectorySource::new(&remote.mirror);
            let report = AthleteSync::new(store, &mirror, config.source_tag.as_str())
                .with_mapping_source(remote.mapping_source.clone())
                .with_batch_size(config.import_batch_size)
                .sync_all(remote.window())?;
            print_json(&report)
        }
        Command::Preview { .. } | Command::SnapshotStats { .. } => {
            bail!("command does not use the store")
        }
    }
}

fn open_store(config: &ReconcileConfig) -> Result<SqliteStore> {
    let path = &config.database_path;
    SqliteStore::open(path).with_context(|| format!("failed to open store {}", path.display()))
}

fn read_snapshot(args: &SnapshotArgs) -> Result<Vec<RawRecord>> {
    let source = open_snapshot(&args.path)
        .with_context(|| format!("failed to open snapshot {}", args.path.display()))?;
    let records = source
        .read_records(args.limit, args.offset)
        .with_context(|| format!("failed to read {}", source.describe()))?;
    info!(source = %source.describe(), records = records.len(), "snapshot read");
    Ok(records)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
