//! Reflex Trader - Main Entry Point
//!
//! Runs the worker pool and recurring reconciliation/sync passes against
//! the configured exchanges.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reflex_trader::config::Config;
use reflex_trader::engine::orders::OrderOrchestrator;
use reflex_trader::engine::reactions::ReactionDispatcher;
use reflex_trader::engine::reconcile::ReconciliationEngine;
use reflex_trader::engine::sync::ExchangeSync;
use reflex_trader::exchange::{AdapterFactory, LiveAdapterFactory};
use reflex_trader::ledger::FundLedger;
use reflex_trader::store::Store;
use reflex_trader::worker::{spawn_scheduler, spawn_workers, WorkerContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Reflex Trader CLI
#[derive(Parser)]
#[command(name = "reflex-trader")]
#[command(version, about = "Alert-driven multi-exchange trading core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool and recurring passes
    Run,

    /// Show open orders and budgets from the database
    Status {
        /// Path to SQLite database (overrides configuration)
        #[arg(short, long)]
        db: Option<String>,

        /// Strategy to show budgets for
        #[arg(short, long)]
        strategy: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Some(Commands::Status { db, strategy }) => {
            let path = db.unwrap_or_else(|| config.database.path.clone());
            return show_status(&path, strategy);
        }
        Some(Commands::Run) | None => {}
    }

    info!("reflex-trader v{} starting", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(Store::open(&config.database.path).context("Failed to open store")?);
    let ledger = Arc::new(FundLedger::new(Arc::clone(&store)));
    let adapters: Arc<dyn AdapterFactory> = Arc::new(LiveAdapterFactory);

    let orchestrator = Arc::new(OrderOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&ledger),
        Arc::clone(&adapters),
    ));
    let context = Arc::new(WorkerContext {
        store: Arc::clone(&store),
        orchestrator: Arc::clone(&orchestrator),
        reconciler: Arc::new(ReconciliationEngine::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&adapters),
        )),
        dispatcher: Arc::new(ReactionDispatcher::new(
            Arc::clone(&store),
            orchestrator,
            Arc::clone(&adapters),
        )),
        sync: Arc::new(ExchangeSync::new(Arc::clone(&store), adapters)),
    });

    let (queue, workers) = spawn_workers(config.worker.count, config.worker.queue_depth, context);
    let scheduler = spawn_scheduler(
        queue.clone(),
        Arc::clone(&store),
        Duration::from_secs(config.schedule.reconcile_interval_secs),
        Duration::from_secs(config.schedule.sync_interval_secs),
    );
    info!(
        workers = config.worker.count,
        reconcile_secs = config.schedule.reconcile_interval_secs,
        sync_secs = config.schedule.sync_interval_secs,
        "worker pool running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining queue");

    scheduler.abort();
    drop(queue);
    for worker in workers {
        // workers exit once the queue is drained and closed
        let _ = worker.await;
    }
    info!("reflex-trader shutdown complete");
    Ok(())
}

fn show_status(path: &str, strategy: Option<i64>) -> Result<()> {
    let store = Store::open(path).context("Failed to open store")?;

    let open = store.open_orders()?;
    println!("open orders: {}", open.len());
    for order in &open {
        println!(
            "  #{} {} {} {} qty={} status={}",
            order.id,
            order.source_id,
            order.direction,
            order.order_type,
            order.quantity,
            order.status
        );
    }

    if let Some(strategy_id) = strategy {
        let budgets = store.strategy_budgets(strategy_id)?;
        println!("budgets for strategy {strategy_id}: {}", budgets.len());
        for budget in &budgets {
            println!(
                "  {} available={} reserved={} total={}",
                budget.currency,
                budget.available,
                budget.reserved,
                budget.total()
            );
        }
    }
    Ok(())
}

/// Initialize logging with file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "reflex-trader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("reflex_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}
