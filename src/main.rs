//! # Cadence Sequence Engine Daemon
//!
//! Runs the dispatcher workers against a shared SQLite database. Delivery is
//! dry-run in the standalone binary; production deployments embed the engine
//! crates and plug in real transport/variable/task implementations.
//!
//! Usage:
//!   cadence                          # Start workers with ~/.cadence/config.toml
//!   cadence --workers 4              # Override worker count
//!   cadence --seed-demo              # Seed a demo sequence + enrollment first

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cadence_core::{CadenceConfig, DelayUnit, Sequence, SequenceStatus, Step, StepKind};
use cadence_engine::{
    enroll, spawn_workers, DryRunTransport, NoopTaskSink, StaticVariables, StepProcessor,
};
use cadence_store::SequenceDb;

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "📬 Cadence: multi-step, time-aware outbound sequence engine"
)]
struct Cli {
    /// Config file path (default ~/.cadence/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database path (overrides config)
    #[arg(long)]
    db_path: Option<String>,

    /// Number of dispatcher workers (overrides config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Seconds between due-work polls (overrides config)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Seed a demo sequence and enrollment, then run
    #[arg(long)]
    seed_demo: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "cadence=debug,cadence_core=debug,cadence_store=debug,cadence_engine=debug"
    } else {
        "cadence=info,cadence_core=info,cadence_store=info,cadence_engine=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    // Load config, then apply CLI overrides
    let mut config = match &cli.config {
        Some(path) => CadenceConfig::load_from(std::path::Path::new(&expand_path(path)))?,
        None => CadenceConfig::load()?,
    };
    if let Some(db_path) = &cli.db_path {
        config.db_path = db_path.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(poll_interval) = cli.poll_interval {
        config.poll_interval_secs = poll_interval;
    }

    let db_path = expand_path(&config.db_path);
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(SequenceDb::open(std::path::Path::new(&db_path))?);

    if cli.seed_demo {
        seed_demo(&db)?;
    }

    println!("📬 Cadence v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:      {db_path}");
    println!("   👷 Workers:       {}", config.workers);
    println!("   ⏱️  Poll interval: {}s", config.poll_interval_secs);
    println!("   📨 Transport:     dry-run (messages are logged, not sent)");
    println!();
    info!(
        "🚀 Starting {} worker(s) against {} ({} enrollment(s) due now)",
        config.workers,
        db_path,
        db.due_count(chrono::Utc::now())?
    );

    let processor = StepProcessor::new(
        Arc::new(DryRunTransport::new()),
        Arc::new(StaticVariables(demo_variables())),
        Arc::new(NoopTaskSink),
        config.retry.clone(),
        config.advance_on_permanent_failure,
    );
    let handles = spawn_workers(db, processor, &config);

    tokio::signal::ctrl_c().await?;
    info!("👋 Shutdown signal received, stopping workers");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// Variables served to every enrollment in the standalone demo binary.
fn demo_variables() -> cadence_core::Variables {
    [
        ("email", "demo@example.com"),
        ("phone", "+15550100"),
        ("first_name", "Demo"),
        ("company_name", "Acme"),
        ("sender_name", "Cadence"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Create a small active sequence with one immediately-due enrollment so a
/// fresh install has something to process.
fn seed_demo(db: &SequenceDb) -> Result<()> {
    let mut sequence = Sequence::new("demo-tenant", "Demo outreach");
    sequence.status = SequenceStatus::Active;
    db.save_sequence(&sequence)?;

    db.save_step(&Step::new(
        &sequence.id,
        1,
        StepKind::Email {
            subject: "Hello {{first_name}}".into(),
            body: "Hi {{first_name}}, greetings from {{sender_name}} at {{company_name}}!".into(),
        },
    ))?;
    db.save_step(&Step::new(
        &sequence.id,
        2,
        StepKind::Delay {
            amount: 1,
            unit: DelayUnit::Minutes,
        },
    ))?;
    db.save_step(&Step::new(
        &sequence.id,
        3,
        StepKind::Sms {
            body: "Quick follow-up for {{first_name}}".into(),
        },
    ))?;

    let enrollment = enroll(db, &sequence.id, "demo-person", chrono::Utc::now())?;

    info!(
        "🌱 Seeded demo sequence {} with enrollment {}",
        sequence.id, enrollment.id
    );
    Ok(())
}
