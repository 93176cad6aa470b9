use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use signalpress_api::{router, AppState};
use signalpress_common::{AppConfig, FileConfig};
use signalpress_pipeline::generation::{GenerationRunner, ProgressTracker};
use signalpress_pipeline::http::{HttpAnalyzer, HttpComposer};
use signalpress_pipeline::{LocalQueue, PipelineDeps, PipelineExecutor};
use signalpress_store::{MemoryStore, PgStore, Store};
use signalpress_supervisor::notify::{AlertNotifier, NoopNotifier, SlackWebhook};
use signalpress_supervisor::{AlertEvaluator, RecoverySweeper, Supervisor};

#[derive(Parser)]
#[command(name = "signalpress", about = "Budget-capped article analysis and newsletter generation")]
struct Cli {
    /// Path to the TOML tunables file.
    #[arg(long, env = "SIGNALPRESS_CONFIG", default_value = "./config/signalpress.toml")]
    config: PathBuf,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("signalpress=info".parse()?);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => warn!("Failed to install Ctrl+C handler: {e}"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM, shutting down");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let app_config = AppConfig::from_env()?;
    app_config.log_redacted();

    let config = if cli.config.exists() {
        FileConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
        FileConfig::default()
    };

    let store: Arc<dyn Store> = match &app_config.database_url {
        Some(url) => {
            let pg = PgStore::connect(url, 10)
                .await
                .context("Failed to connect to Postgres")?;
            pg.migrate().await?;
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store (state is lost on exit)");
            Arc::new(MemoryStore::new())
        }
    };

    let analyzer = HttpAnalyzer::new(
        &app_config.analysis_service_url,
        &app_config.analysis_api_key,
        config.batch.item_timeout(),
    )?;
    let composer = HttpComposer::new(
        &app_config.analysis_service_url,
        &app_config.analysis_api_key,
        config.generation.stage_timeout(),
    )?;

    let queue = Arc::new(LocalQueue::new(
        config.batch.queue_concurrency,
        config.generation.queue_concurrency,
    ));
    let progress = Arc::new(ProgressTracker::new(
        store.clone(),
        config.generation.weights,
    ));

    let notifier: Arc<dyn AlertNotifier> = match &app_config.slack_webhook_url {
        Some(url) => Arc::new(SlackWebhook::new(url.clone())),
        None => {
            info!("SLACK_WEBHOOK_URL not set, alerts are stored but not forwarded");
            Arc::new(NoopNotifier)
        }
    };

    let recovery_interval = config.recovery.interval();
    let alert_config = config.alerts.clone();
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let deps = PipelineDeps::builder()
        .store(store.clone())
        .analyzer(Arc::new(analyzer))
        .composer(Arc::new(composer))
        .queue(queue.clone())
        .progress(progress)
        .config(Arc::new(config))
        .build();

    let runner = Arc::new(GenerationRunner::new(deps.clone()));
    let executor = Arc::new(PipelineExecutor::new(deps.clone(), runner.clone()));
    let queue_handle = queue.start(executor).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(
        Arc::new(RecoverySweeper::new(deps.clone(), notifier.clone())),
        Arc::new(AlertEvaluator::new(
            store,
            notifier,
            alert_config.clone(),
        )),
        recovery_interval,
        alert_config.interval(),
    )
    .spawn(shutdown_rx);

    let state = Arc::new(AppState::new(deps, runner));
    let app = router(state);

    info!("signalpress starting on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    // A dead supervisor ends the process.
    tokio::select! {
        served = server => served?,
        joined = &mut supervisor => {
            queue_handle.abort();
            return match joined {
                Ok(()) => Err(anyhow!("supervisor exited while the server was running")),
                Err(e) => Err(anyhow!("supervisor task failed: {e}")),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = supervisor.await {
        warn!(error = %e, "Supervisor task ended abnormally");
    }
    queue_handle.abort();
    info!("signalpress stopped");
    Ok(())
}
