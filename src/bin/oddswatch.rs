use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use oddswatch::classifier::{NoReferences, ReferenceQuotes, StaticReferences};
use oddswatch::config::{AppConfig, CONFIG_PATH};
use oddswatch::controller::{ControllerConfig, PollController};
use oddswatch::feed;
use oddswatch::navigator::RetryNavigator;
use oddswatch::provider::HttpSnapshotProvider;
use oddswatch::sink::{AnomalySink, FanoutSink, JsonlSink, MemorySink};
use oddswatch::telegram::TelegramNotifier;

#[derive(Parser)]
#[command(name = "oddswatch", about = "Betting-odds anomaly monitor")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Override the provider endpoint from the config file
    #[arg(long)]
    endpoint: Option<String>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,

    /// Disable the HTTP feed server
    #[arg(long)]
    no_feed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    info!("Loaded config from {}", args.config.display());

    if let Some(endpoint) = args.endpoint {
        config.provider.endpoint = endpoint;
    }
    if config.provider.endpoint.is_empty() {
        anyhow::bail!("provider endpoint must not be empty");
    }
    if config.navigator.max_attempts == 0 {
        anyhow::bail!("navigator.max_attempts must be at least 1");
    }

    // Secrets can come from the environment instead of the config file.
    if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
        if let Some(telegram) = &mut config.telegram {
            telegram.bot_token = token;
        }
    }

    let references: Arc<dyn ReferenceQuotes> = if config.references.is_empty() {
        Arc::new(NoReferences)
    } else {
        info!("Loaded {} reference quotes", config.references.len());
        Arc::new(StaticReferences::from_entries(&config.references))
    };

    let memory = Arc::new(MemorySink::new(10_000));
    let mut sinks: Vec<Arc<dyn AnomalySink>> = vec![memory.clone()];
    if let Some(path) = &config.settings.anomaly_log {
        info!("Appending anomalies to {}", path.display());
        sinks.push(Arc::new(JsonlSink::new(path.clone())));
    }
    if let Some(telegram) = config.telegram.clone() {
        if telegram.bot_token.is_empty() || telegram.chat_id.is_empty() {
            warn!("Telegram config incomplete, alerts disabled");
        } else {
            info!("Telegram alerts enabled (chat {})", telegram.chat_id);
            sinks.push(Arc::new(TelegramNotifier::new(telegram)));
        }
    }
    let sink = Arc::new(FanoutSink::new(sinks));

    let provider = HttpSnapshotProvider::new(config.provider.endpoint.clone());
    let navigator = RetryNavigator::new(provider, config.navigator.clone());
    let mut controller = PollController::new(
        navigator,
        config.detector.clone(),
        references,
        sink,
        ControllerConfig {
            poll_interval_secs: config.settings.poll_interval_secs,
            state_path: config.settings.state_path.clone(),
        },
    );

    info!(
        "Starting oddswatch — endpoint={} poll={}s attempts={}",
        config.provider.endpoint, config.settings.poll_interval_secs, config.navigator.max_attempts,
    );

    if args.once {
        controller.load_state();
        let report = controller.run_cycle().await;
        info!(
            "Single cycle complete: fetched={} anomalies={} skipped={}",
            report.fetched, report.anomalies, report.skipped
        );
        println!("{}", serde_json::to_string_pretty(&controller.summary())?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed_handle = if args.no_feed {
        None
    } else {
        let router = feed::create_router(memory.clone());
        let bind_addr = config.feed.bind_addr.clone();
        let feed_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = feed::serve(router, &bind_addr, feed_shutdown).await {
                tracing::error!("Feed server error: {e:#}");
            }
        }))
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    controller.run(shutdown_rx).await?;

    if let Some(handle) = feed_handle {
        let _ = handle.await;
    }

    println!("{}", serde_json::to_string_pretty(&controller.summary())?);
    Ok(())
}
