use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use relay_bus::hooks::{ContentLimitHook, EmptyDeltaFilter};
use relay_bus::{EventBus, LockFactory, RunGate, Subscriber};
use relay_server::{EventPersister, LiveTransport, ModelRates, ReaperConfig, RunReaper, UsageMeter};
use relay_store::Database;
use relay_telemetry::MetricsRecorder;

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Run/event orchestration daemon")]
struct Args {
    /// Path to the database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Use database-backed expiring locks instead of in-process mutexes.
    /// Required when more than one relay process shares the database.
    #[arg(long, default_value_t = false)]
    distributed_locks: bool,

    /// Seconds between stale-run sweeps.
    #[arg(long, default_value_t = 30)]
    reaper_interval_secs: u64,

    /// Seconds a run may stay RUNNING before it is reclaimed.
    #[arg(long, default_value_t = 600)]
    run_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    relay_telemetry::init_logging("info");

    let args = Args::parse();
    tracing::info!("starting relay");

    let db_path = args
        .db_path
        .unwrap_or_else(|| dirs_home().join(".relay").join("database").join("relay.db"));
    let db = Database::open(&db_path).expect("failed to open database");

    let metrics = Arc::new(MetricsRecorder::new());

    let gate = Arc::new(RunGate::new(db.clone()));
    let bus = Arc::new(EventBus::new(gate));
    bus.register_hook(Arc::new(EmptyDeltaFilter));
    bus.register_hook(Arc::new(ContentLimitHook::default()));

    let live = Arc::new(LiveTransport::new());
    bus.subscribe(Arc::clone(&live) as Arc<dyn Subscriber>);
    bus.subscribe(Arc::new(EventPersister::new(db.clone())));
    bus.subscribe(Arc::new(UsageMeter::new(
        Arc::clone(&metrics),
        ModelRates {
            input_cents_per_1k: 0.3,
            output_cents_per_1k: 1.5,
        },
    )));

    let locks = if args.distributed_locks {
        Arc::new(LockFactory::distributed(db.clone(), process_tag()))
    } else {
        Arc::new(LockFactory::in_process())
    };
    let registry = relay_server::build_registry(db.clone(), Arc::clone(&bus), locks);
    tracing::info!(commands = ?registry.command_types(), "command registry built");

    let reaper = Arc::new(
        RunReaper::new(
            db,
            Arc::clone(&bus),
            ReaperConfig {
                interval: Duration::from_secs(args.reaper_interval_secs),
                run_timeout: Duration::from_secs(args.run_timeout_secs),
                ..Default::default()
            },
        )
        .with_metrics(metrics),
    );
    let shutdown = CancellationToken::new();
    let reaper_handle = reaper.start(shutdown.clone());

    tracing::info!(distributed_locks = args.distributed_locks, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
    shutdown.cancel();
    let _ = reaper_handle.await;
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn process_tag() -> String {
    format!("relay:{}", std::process::id())
}
