//! pubsub-bridge command line entry point

use clap::{Parser, Subcommand};
use pubsub_bridge::config::PubSubConfig;
use pubsub_bridge::lifecycle_span;
use pubsub_bridge::middleware::{ConfigServiceLocator, NativeMiddleware};
use pubsub_bridge::observability::init_default_logging;
use pubsub_bridge::transport::mqtt::{ConnectionRole, ConnectionState, Handler};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn, Instrument};

/// Dual-connection MQTT pub/sub client
#[derive(Parser)]
#[command(name = "pubsub-bridge")]
#[command(about = "Publish and subscribe to MQTT topics through the pub/sub bridge")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "PUBSUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a single text message
    Publish {
        topic: String,
        payload: String,
        /// Seconds to wait for the publisher connection
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
    /// Subscribe to topic filters and log every message until interrupted
    Monitor {
        #[arg(required = true)]
        topics: Vec<String>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting pubsub-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            topic,
            payload,
            wait_secs,
        } => publish_once(&config, &topic, &payload, wait_secs).await,
        Commands::Monitor { topics } => monitor(&config, &topics).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<PubSubConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(PubSubConfig::load_from_file(path)?);
    }

    for path_str in ["pubsub.toml", "config/pubsub.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(PubSubConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create pubsub.toml".into())
}

async fn start_middleware(
    config: &PubSubConfig,
) -> Result<NativeMiddleware, Box<dyn std::error::Error>> {
    let locator = ConfigServiceLocator::from_config(config);
    let middleware = NativeMiddleware::new(&locator, config.tuning()?)?;

    middleware
        .start()
        .instrument(lifecycle_span!(step = "init"))
        .await?;
    middleware.wait_until_ready().await;
    Ok(middleware)
}

async fn publish_once(
    config: &PubSubConfig,
    topic: &str,
    payload: &str,
    wait_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let middleware = start_middleware(config).await?;
    let client = middleware.pubsub_client();
    client.run()?;

    let mut state = client.watch_state(ConnectionRole::Publisher);
    let connected = matches!(
        timeout(
            Duration::from_secs(wait_secs),
            state.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await,
        Ok(Ok(_))
    );
    if !connected {
        warn!("Publisher not connected after {}s, queueing anyway", wait_secs);
    }

    let receipt = client.publish_event(topic, payload)?;
    info!("Published to {} (qos {:?})", receipt.topic, receipt.qos);

    middleware.stop().await;
    Ok(())
}

async fn monitor(
    config: &PubSubConfig,
    topics: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let middleware = start_middleware(config).await?;
    let client = middleware.pubsub_client();

    for topic in topics {
        let filter = topic.clone();
        client.subscribe_topic(
            topic,
            Handler::asynchronous(move |message| {
                let filter = filter.clone();
                async move {
                    info!(filter = %filter, "{}", message);
                }
            }),
        )?;
    }
    client.run()?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Monitoring {} topic filter(s)", topics.len());

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    middleware
        .stop()
        .instrument(lifecycle_span!(step = "shutdown"))
        .await;
    Ok(())
}

fn handle_config_command(
    config: &PubSubConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Resolving the transport catches location and certificate problems
    let locator = ConfigServiceLocator::from_config(config);
    pubsub_bridge::middleware::native::resolve_transport_settings(&locator)?;
    config.tuning()?;

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
