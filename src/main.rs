use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use media_producer::config;
use media_producer::db::{self, SqliteWorkItemRepository};
use media_producer::guard::{ExitTerminator, TickGuard, TickOutcome};
use media_producer::producer::{MediaProducer, ProducerSettings};
use media_producer::queue::HttpQueueSender;
use media_producer::scheduler::{Drain, Scheduler};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let repo = Arc::new(SqliteWorkItemRepository::new(pool));
    let sender = Arc::new(HttpQueueSender::from_config(&cfg)?);
    let producer = Arc::new(MediaProducer::new(
        repo,
        sender,
        ProducerSettings::from_config(&cfg),
    ));
    let guard = Arc::new(TickGuard::new(
        cfg.app.skipping_counter_limit,
        Arc::new(ExitTerminator::default()),
    ));
    let scheduler = Scheduler::new(producer, guard, cfg.app.poll_interval());

    if args.once {
        info!(source = %cfg.app.source, "running a single tick");
        if let TickOutcome::Ran(Err(err)) = scheduler.tick().await {
            return Err(err.into());
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    info!(
        source = %cfg.app.source,
        interval_ms = cfg.app.poll_interval_ms,
        fetch_mode = cfg.app.fetch_mode.as_str(),
        "starting media producer"
    );
    match scheduler.run(shutdown_rx).await {
        Drain::Clean => Ok(()),
        Drain::Abandoned { aborted } => Err(anyhow!(
            "shutdown abandoned {} stuck tick(s)",
            aborted
        )),
    }
}

/// Resolves on SIGINT or SIGTERM. If no listener can be installed it never
/// resolves, so the sender stays alive and the scheduler keeps running.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received"),
            Err(err) => {
                error!(?err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(err) => {
                error!(?err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
