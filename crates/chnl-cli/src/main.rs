use std::sync::Arc;

use anyhow::{Context, Result};
use chnl_core::{Entity, EntityKind};
use chnl_storage::LocalStore;
use chnl_sync::{coordinator_from_config, maybe_build_scheduler, SyncConfig};
use chnl_view::{parse_deep_link, DeepLinkResolver, ListModel, Resolution};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "chnl-cli")]
#[command(about = "CocoaHeadsNL record sync command-line interface")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull remote records into the local store.
    Sync {
        /// Only this kind (company, contributor, job, meetup, affiliate_link).
        #[arg(long)]
        kind: Option<EntityKind>,
    },
    /// Print the cached rows of one kind.
    List { kind: EntityKind },
    /// Print cached meetups grouped into Upcoming and past years.
    Meetups,
    /// Resolve a `<type>:<identifier>` deep link against the cache.
    Open { link: String },
    /// Sync on remote record creation and on the configured schedule.
    Watch {
        #[arg(long)]
        kind: Option<EntityKind>,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {e}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { kind: None }) {
        Commands::Sync { kind } => sync(kind).await,
        Commands::List { kind } => list(&config, kind),
        Commands::Meetups => meetups(&config),
        Commands::Open { link } => open(&config, &link),
        Commands::Watch { kind } => watch(&config, kind).await,
    }
}

async fn sync(kind: Option<EntityKind>) -> Result<()> {
    let outcomes = chnl_sync::run_sync_once_from_env(kind).await?;

    let mut failed = 0usize;
    for (kind, outcome) in outcomes {
        match outcome {
            Ok(summary) => println!(
                "sync {kind}: pass_id={} synced={} inserted={} updated={} deleted={} skipped={}",
                summary.pass_id,
                summary.synced,
                summary.inserted,
                summary.updated,
                summary.deleted,
                summary.malformed
            ),
            Err(err) => {
                failed += 1;
                eprintln!("sync {kind} failed: {err}");
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} sync pass(es) failed");
    }
    Ok(())
}

fn open_store(config: &SyncConfig) -> Result<Arc<LocalStore>> {
    let store = LocalStore::open(&config.store_path)
        .with_context(|| format!("opening local store {}", config.store_path.display()))?;
    Ok(Arc::new(store))
}

fn describe(entity: &Entity) -> String {
    match entity {
        Entity::Contributor(c) => format!("{} ({} commits)", c.name, c.commit_count),
        Entity::Job(j) => match &j.company_name {
            Some(company) => format!("{} {} at {company}", j.date.format("%Y-%m-%d"), j.title),
            None => format!("{} {}", j.date.format("%Y-%m-%d"), j.title),
        },
        Entity::Meetup(m) => match m.time {
            Some(time) => format!("{} {} @ {}", time.format("%Y-%m-%d"), m.name, m.location_name),
            None => format!("(no date) {}", m.name),
        },
        other => other.display_name().to_string(),
    }
}

fn list(config: &SyncConfig, kind: EntityKind) -> Result<()> {
    let store = open_store(config)?;
    let mut model = ListModel::flat(kind);
    model.load(&store.snapshot());
    for entity in model.rows() {
        println!("{}\t{}", entity.id(), describe(entity));
    }
    Ok(())
}

fn meetups(config: &SyncConfig) -> Result<()> {
    let store = open_store(config)?;
    let mut model = ListModel::grouped_by_year(EntityKind::Meetup, Utc::now());
    model.load(&store.snapshot());
    for section in model.sections() {
        println!("{}", section.label);
        for entity in &section.items {
            println!("  {}\t{}", entity.id(), describe(entity));
        }
    }
    Ok(())
}

fn open(config: &SyncConfig, raw: &str) -> Result<()> {
    let link = parse_deep_link(raw).with_context(|| format!("parsing deep link {raw:?}"))?;
    let mut resolver = DeepLinkResolver::new(link.kind, open_store(config)?);
    resolver.activate();
    match resolver.handle_link(&link) {
        Resolution::Display(entity) => println!("{}\t{}", entity.id(), describe(&entity)),
        Resolution::NotFound => println!("{link} is not in the local cache"),
        Resolution::Deferred | Resolution::Ignored => {}
    }
    Ok(())
}

async fn watch(config: &SyncConfig, kind: Option<EntityKind>) -> Result<()> {
    let coordinator = Arc::new(coordinator_from_config(config)?);
    let mut scheduler = maybe_build_scheduler(coordinator.clone(), config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduler started");
    }

    let kinds = kind.map_or_else(|| EntityKind::ALL.to_vec(), |kind| vec![kind]);
    for kind in kinds {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(err) = coordinator.watch(kind).await {
                warn!(%kind, error = %err, "watch stopped");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
