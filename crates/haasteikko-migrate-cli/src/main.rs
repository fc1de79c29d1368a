use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use haasteikko_migrate_core::{
    fetch_all, parse_answer_batches, parse_challenges, parse_library_items, plan_migration,
    MigrationPlan, MigrationScope, PlanStats, RekeyEngine, RekeyReport, ANSWERS_CONTAINER,
    CHALLENGES_CONTAINER, LIBRARY_CONTAINER,
};
use haasteikko_migrate_docstore::NdjsonDocumentStore;
use haasteikko_migrate_store_sqlite::{IntegrityReport, SqliteDestination, TableCounts};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "migrate.v1";

#[derive(Debug, Parser)]
#[command(name = "haasteikko-migrate")]
#[command(about = "Move Haasteikko document data into SQLite and re-key user data")]
struct Cli {
    /// Print the run summary as JSON.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Migrate challenges, library items and answers into the relational destination.
    Bulk(BulkArgs),
    /// Copy one user's library items and answers to another user id.
    Rekey(RekeyArgs),
}

#[derive(Debug, Args)]
struct BulkArgs {
    #[arg(long, env = "HAASTEIKKO_SOURCE_DIR")]
    source_dir: Option<PathBuf>,
    #[arg(long, env = "HAASTEIKKO_SOURCE_DB", default_value = "haasteikkoprod-db")]
    db: String,
    #[arg(long, env = "HAASTEIKKO_SQLITE_PATH", default_value = "database.sqlite")]
    sqlite: PathBuf,
    #[arg(long, env = "HAASTEIKKO_TARGET_USER")]
    target_user: Option<String>,
    #[arg(long = "valid-user", env = "HAASTEIKKO_VALID_USERS", value_delimiter = ',')]
    valid_users: Vec<String>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct RekeyArgs {
    #[arg(long, env = "HAASTEIKKO_SOURCE_DIR")]
    source_dir: Option<PathBuf>,
    #[arg(long)]
    db: Option<String>,
    #[arg(long)]
    old_user: Option<String>,
    #[arg(long)]
    new_user: Option<String>,
}

#[derive(Debug, Serialize)]
struct PlannedCounts {
    challenges: usize,
    questions: usize,
    library_items: usize,
    associations: usize,
    answers: usize,
}

#[derive(Debug, Serialize)]
struct DestinationSummary {
    path: String,
    counts: TableCounts,
    digest: String,
    integrity: IntegrityReport,
}

#[derive(Debug, Serialize)]
struct BulkSummary {
    command: &'static str,
    dry_run: bool,
    target_user: String,
    planned: PlannedCounts,
    trimmed: PlanStats,
    destination: Option<DestinationSummary>,
}

#[derive(Debug, Serialize)]
struct RekeySummary<'a> {
    command: &'static str,
    database: &'a str,
    old_user: &'a str,
    new_user: &'a str,
    #[serde(flatten)]
    report: &'a RekeyReport,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Bulk(args) => run_bulk(args, cli.json),
        Command::Rekey(args) => run_rekey(args, cli.json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn required<T>(value: Option<T>, flag: &str, env: Option<&str>) -> Result<T> {
    value.ok_or_else(|| match env {
        Some(env) => anyhow!("missing required configuration: {flag} (or {env})"),
        None => anyhow!("missing required configuration: {flag}"),
    })
}

fn run_bulk(args: BulkArgs, json: bool) -> Result<()> {
    let source_dir = required(args.source_dir, "--source-dir", Some("HAASTEIKKO_SOURCE_DIR"))?;
    let target_user =
        required(args.target_user, "--target-user", Some("HAASTEIKKO_TARGET_USER"))?;

    let store = NdjsonDocumentStore::open(&source_dir, &args.db)?;
    let challenges = parse_challenges(&fetch_all(&store, CHALLENGES_CONTAINER, None))?;
    let items = parse_library_items(&fetch_all(&store, LIBRARY_CONTAINER, None))?;
    let answers = parse_answer_batches(&fetch_all(&store, ANSWERS_CONTAINER, None))?;
    tracing::info!(
        challenges = challenges.len(),
        library_items = items.len(),
        answers = answers.len(),
        "parsed source documents"
    );

    let scope = MigrationScope::new(target_user.clone(), args.valid_users);
    let plan = plan_migration(challenges, items, answers, &scope)?;

    let destination = if args.dry_run {
        tracing::info!("dry run; destination left untouched");
        None
    } else {
        Some(write_destination(&args.sqlite, &plan)?)
    };

    let summary = BulkSummary {
        command: "bulk",
        dry_run: args.dry_run,
        target_user,
        planned: PlannedCounts {
            challenges: plan.challenges.len(),
            questions: plan.question_count(),
            library_items: plan.items.len(),
            associations: plan.association_count(),
            answers: plan.answers.len(),
        },
        trimmed: plan.stats,
        destination,
    };

    if json {
        emit_json(serde_json::to_value(&summary)?)
    } else {
        print_bulk_summary(&summary);
        Ok(())
    }
}

fn write_destination(path: &Path, plan: &MigrationPlan) -> Result<DestinationSummary> {
    let mut destination = SqliteDestination::open(path)?;
    destination.migrate()?;
    destination.write_plan(plan)?;

    let integrity = destination.integrity_check()?;
    if !integrity.quick_check_ok || !integrity.foreign_key_violations.is_empty() {
        tracing::warn!(
            quick_check = %integrity.quick_check_message,
            violations = integrity.foreign_key_violations.len(),
            "destination integrity check reported problems"
        );
    }

    Ok(DestinationSummary {
        path: path.display().to_string(),
        counts: destination.table_counts()?,
        digest: destination.content_digest()?,
        integrity,
    })
}

fn run_rekey(args: RekeyArgs, json: bool) -> Result<()> {
    let source_dir = required(args.source_dir, "--source-dir", Some("HAASTEIKKO_SOURCE_DIR"))?;
    let database = required(args.db, "--db", None)?;
    let old_user = required(args.old_user, "--old-user", None)?;
    let new_user = required(args.new_user, "--new-user", None)?;
    if old_user == new_user {
        return Err(anyhow!("--old-user and --new-user must differ (both are {old_user})"));
    }

    let mut store = NdjsonDocumentStore::open(&source_dir, &database)?;
    let report = RekeyEngine::new(&mut store).run(&old_user, &new_user);
    for unresolved in &report.unresolved {
        tracing::warn!(
            answer_id = %unresolved.answer_id,
            item_ids = ?unresolved.item_ids,
            "answer copied with unresolved library item reference"
        );
    }

    let summary = RekeySummary {
        command: "rekey",
        database: &database,
        old_user: &old_user,
        new_user: &new_user,
        report: &report,
    };

    if json {
        emit_json(serde_json::to_value(&summary)?)
    } else {
        print_rekey_summary(&summary);
        Ok(())
    }
}

fn print_bulk_summary(summary: &BulkSummary) {
    let planned = &summary.planned;
    let trimmed = &summary.trimmed;
    let verb = if summary.dry_run { "would migrate" } else { "migrated" };

    println!(
        "{verb}: {} challenges, {} questions, {} library items, {} associations, {} answers",
        planned.challenges,
        planned.questions,
        planned.library_items,
        planned.associations,
        planned.answers
    );
    println!(
        "trimmed answers: {} for removed challenges, {} for unknown questions, {} out of scope",
        trimmed.stale_challenge_answers,
        trimmed.unknown_question_answers,
        trimmed.out_of_scope_answers
    );
    println!(
        "skipped: {} library items of out-of-scope users, {} associations to unknown challenges",
        trimmed.out_of_scope_items, trimmed.unknown_challenge_associations
    );
    println!("repaired: {} answer references to {}", trimmed.repairs.len(), summary.target_user);
    for repair in &trimmed.repairs {
        println!("  answer {}: {} -> {}", repair.answer_id, repair.from_item_id, repair.to_item_id);
    }

    if let Some(destination) = &summary.destination {
        let counts = &destination.counts;
        println!(
            "destination {}: challenge={} question={} library={} associations={} answer={}",
            destination.path,
            counts.challenge,
            counts.question,
            counts.library,
            counts.activated_item_challenge,
            counts.answer
        );
        println!("digest: {}", destination.digest);
    }
}

fn print_rekey_summary(summary: &RekeySummary<'_>) {
    let report = summary.report;
    println!(
        "re-keyed {} -> {} in {}",
        summary.old_user, summary.new_user, summary.database
    );
    println!("library items copied: {} (failed: {})", report.items_copied, report.items_failed);
    println!(
        "answers migrated: {} (failed: {})",
        report.answers_migrated, report.answers_failed
    );
    println!("unresolved references: {}", report.unresolved.len());
    for unresolved in &report.unresolved {
        if unresolved.item_ids.is_empty() {
            println!("  answer {}: no library item reference", unresolved.answer_id);
        } else {
            println!("  answer {}: {}", unresolved.answer_id, unresolved.item_ids.join(", "));
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}
