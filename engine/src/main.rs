use anyhow::Result;
use common::MarketEvent;
use data_ingestion::connectors::feed::{self, open_file};
use data_ingestion::{run_rate_fetcher, BcbPtaxSource, ReferenceRateSource, StaticRateSource};
use engine::{create_config_template, run_event_logger, Control, Engine, EngineConfig, EngineInputs, JsonLinesSink};
use signal_generation::SignalSink;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const USAGE: &str = "usage: tape-engine [CONFIG.toml] | tape-engine --template PATH";

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = match args.next() {
        Some(flag) if flag == "--template" => {
            let path = args.next().ok_or_else(|| anyhow::anyhow!(USAGE))?;
            create_config_template(&path)?;
            println!("Configuration template written to {}", path);
            return Ok(());
        }
        Some(flag) if flag == "--help" || flag == "-h" => {
            println!("{}", USAGE);
            return Ok(());
        }
        other => other,
    };

    let config = EngineConfig::load(config_path.as_deref().map(Path::new))?;

    // Initialize logging; standard output carries the signals
    tracing_subscriber::fmt()
        .with_max_level(config.runtime.level())
        .with_writer(std::io::stderr)
        .init();

    info!("🚀 Starting Tape Signal Engine");

    let engine = Engine::new(config.clone())?;
    let logger = tokio::spawn(run_event_logger(engine.bus().subscribe()));

    // Market events
    let (event_tx, event_rx) = mpsc::channel::<MarketEvent>(config.ingestion.feed.channel_capacity);
    let feed_task = match &config.ingestion.feed.path {
        Some(path) => {
            let reader = open_file::<MarketEvent>(path).await?;
            tokio::spawn(reader.run(event_tx))
        }
        None => {
            info!("Reading market events from standard input");
            tokio::spawn(feed::stdin().run(event_tx))
        }
    };

    // Reference rate
    let rate_config = &config.ingestion.reference_rate;
    let source: Arc<dyn ReferenceRateSource> = if rate_config.enabled {
        Arc::new(BcbPtaxSource::new(rate_config)?)
    } else {
        info!("Reference rate fetch disabled, using the fallback rate only");
        Arc::new(StaticRateSource::new(rate_config.fallback_rate))
    };
    let (rate_tx, rate_rx) = mpsc::channel(16);
    let rate_task = tokio::spawn(run_rate_fetcher(
        source,
        Duration::from_secs(rate_config.refresh_secs),
        rate_config.fallback_rate,
        rate_tx,
    ));

    let mut inputs = EngineInputs::new(event_rx).with_rates(rate_rx);

    // Outcome / regime / breaker commands
    if let Some(path) = &config.runtime.control_path {
        let (control_tx, control_rx) = mpsc::channel(64);
        let reader = open_file::<Control>(path).await?;
        tokio::spawn(reader.run(control_tx));
        inputs = inputs.with_controls(control_rx);
    }

    let sink: Arc<dyn SignalSink> = match &config.runtime.output_path {
        Some(path) => Arc::new(JsonLinesSink::append_file(path).await?),
        None => Arc::new(JsonLinesSink::stdout()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine_task = tokio::spawn(engine.run(inputs, sink, shutdown_rx));

    let report = tokio::select! {
        result = &mut engine_task => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("👋 Shutting down gracefully...");
            let _ = shutdown_tx.send(true);
            engine_task.await??
        }
    };

    rate_task.abort();
    if feed_task.is_finished() {
        match feed_task.await? {
            Ok(stats) => info!(lines = stats.lines, events = stats.events, malformed = stats.malformed, "Feed stats"),
            Err(e) => warn!("Feed ended with error: {}", e),
        }
    } else {
        feed_task.abort();
    }

    let counts = logger.await?;
    info!(events = ?counts, "Observability events");
    info!("Final report: {}", serde_json::to_string(&report)?);

    Ok(())
}
