//! flowtap - passive HTTP/1.x observer
//!
//! Captures TCP traffic from an interface or a trace file, reassembles each
//! connection and reports every HTTP message boundary as an event.

use chrono::Utc;
use clap::{Parser, Subcommand};
use flowtap_capture::synthetic::{demo_traffic, DemoConfig};
use flowtap_capture::{
    list_interfaces, CaptureController, FrameSource, MemorySource, SessionConfig, SessionEnd,
};
use flowtap_core::config::{ConfigLoader, SensorConfig};
use flowtap_core::publisher::channel;
use flowtap_core::{create_metrics, DecoderFactory, OverflowPolicy, SharedMetrics};
use flowtap_decode::{DecoderLimits, HttpDecoderFactory};
use flowtap_export::{create_sinks, drain, OutputFormat};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "flowtap")]
#[command(version)]
#[command(about = "Passive HTTP/1.x observer", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Console output format (text, json)
    #[arg(short, long, global = true)]
    format: Option<OutputFormat>,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "FLOWTAP_CONFIG")]
    config: Option<PathBuf>,

    /// Also write events to this JSONL file
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// BPF capture filter
    #[arg(long, global = true)]
    filter: Option<String>,

    /// Seconds of capture time after which an idle flow is flushed
    #[arg(long, global = true)]
    idle_window: Option<u64>,

    /// Event channel overflow policy (block, drop_newest, drop_oldest)
    #[arg(long, global = true)]
    overflow: Option<OverflowPolicy>,

    /// Print the final metrics to stderr (json, prometheus)
    #[arg(long, global = true)]
    metrics_format: Option<MetricsFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture live traffic (requires capture privileges)
    Record {
        /// Interface to capture on
        #[arg(short, long)]
        interface: Option<String>,

        /// Do not put the interface into promiscuous mode
        #[arg(long)]
        no_promisc: bool,
    },

    /// Replay a pcap trace file
    Replay {
        /// Trace file
        file: PathBuf,

        /// Keep in-flight flows unflushed at the end of the trace
        #[arg(long)]
        no_final_flush: bool,
    },

    /// Run synthetic HTTP traffic through the full pipeline
    Demo {
        /// Number of client connections
        #[arg(long, default_value = "4")]
        conversations: usize,

        /// Segment size
        #[arg(long, default_value = "64")]
        mss: usize,

        /// Deliver every segment in order
        #[arg(long)]
        in_order: bool,
    },

    /// List capture interfaces
    Interfaces,
}

/// Rendering of the exit metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricsFormat {
    Json,
    Prometheus,
}

impl FromStr for MetricsFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(MetricsFormat::Json),
            "prometheus" | "prom" => Ok(MetricsFormat::Prometheus),
            other => Err(format!(
                "Invalid metrics format: {}. Must be json or prometheus",
                other
            )),
        }
    }
}

impl fmt::Display for MetricsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricsFormat::Json => f.write_str("json"),
            MetricsFormat::Prometheus => f.write_str("prometheus"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration file
    let sensor_config = load_config(cli.config.clone());

    // Setup logging - CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match sensor_config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = merge_cli_config(sensor_config, &cli);
    let metrics_format = cli.metrics_format;

    match cli.command {
        Commands::Record {
            interface,
            no_promisc,
        } => {
            if let Some(interface) = interface {
                config.capture.interface = Some(interface);
            }
            if no_promisc {
                config.capture.promiscuous = false;
            }
            if config.capture.interface.is_none() {
                anyhow::bail!("no interface given; use --interface or set capture.interface");
            }
            config.capture.file = None;
            run_pipeline(config, None, metrics_format).await
        }
        Commands::Replay {
            file,
            no_final_flush,
        } => {
            config.capture.interface = None;
            config.capture.file = Some(file.display().to_string());
            if no_final_flush {
                config.capture.flush_on_end_of_trace = false;
            }
            run_pipeline(config, None, metrics_format).await
        }
        Commands::Demo {
            conversations,
            mss,
            in_order,
        } => {
            let frames = demo_traffic(&DemoConfig {
                conversations,
                mss,
                start: Utc::now(),
                disorder: !in_order,
            })?;
            info!("Generated {} demo frames", frames.len());
            run_pipeline(
                config,
                Some(Box::new(MemorySource::new(frames))),
                metrics_format,
            )
            .await
        }
        Commands::Interfaces => interfaces_command(cli.format.unwrap_or_default()),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> SensorConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            SensorConfig::default()
        }
    }
}

/// Global CLI arguments take precedence over the configuration file
fn merge_cli_config(mut config: SensorConfig, cli: &Cli) -> SensorConfig {
    if let Some(format) = cli.format {
        config.export.stdout.format = format.to_string();
    }
    if let Some(output) = &cli.output {
        config.export.jsonl.enabled = true;
        config.export.jsonl.path = output.display().to_string();
    }
    if let Some(filter) = &cli.filter {
        config.capture.filter = filter.clone();
    }
    if let Some(secs) = cli.idle_window {
        config.reassembly.idle_window_secs = secs;
    }
    if let Some(policy) = cli.overflow {
        config.publisher.overflow = policy;
    }
    config
}

/// Wire source, reassembly, decoder, publisher and sinks, then run until the
/// source ends or Ctrl+C
async fn run_pipeline(
    config: SensorConfig,
    source: Option<Box<dyn FrameSource>>,
    metrics_format: Option<MetricsFormat>,
) -> anyhow::Result<()> {
    ConfigLoader::validate(&config)?;

    let metrics = create_metrics();
    let factory: Arc<dyn DecoderFactory> = Arc::new(HttpDecoderFactory::new(
        DecoderLimits::from(&config.decoder),
        metrics.clone(),
    ));
    let (publisher, stream) = channel(
        config.publisher.capacity,
        config.publisher.overflow,
        metrics.clone(),
    );
    let sinks = create_sinks(&config.export)?;

    let session_config = SessionConfig::from_sensor_config(&config);
    let controller = match source {
        Some(source) => CaptureController::with_source(
            session_config,
            source,
            factory,
            publisher,
            metrics.clone(),
        ),
        None => CaptureController::open(session_config, factory, publisher, metrics.clone())?,
    };

    let consumer = tokio::spawn(drain(stream, sinks, metrics.clone()));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            let _ = signal_tx.send(());
        }
    });

    let end = controller.run(shutdown_rx).await;
    let exported = consumer.await?;
    drop(shutdown_tx);

    if end == SessionEnd::ConsumerGone {
        warn!("Event consumer stopped before the capture finished");
    }
    log_summary(&metrics, exported);
    if let Some(format) = metrics_format {
        eprint!("{}", render_metrics(&metrics, format)?);
    }
    Ok(())
}

fn log_summary(metrics: &SharedMetrics, exported: u64) {
    info!("Sensor stopped after {}s, {} events consumed", metrics.uptime_seconds(), exported);
    info!("Metrics: {}", metrics.to_json());
}

fn render_metrics(metrics: &SharedMetrics, format: MetricsFormat) -> anyhow::Result<String> {
    Ok(match format {
        MetricsFormat::Json => format!("{}\n", serde_json::to_string_pretty(&metrics.to_json())?),
        MetricsFormat::Prometheus => metrics.to_prometheus(),
    })
}

fn interfaces_command(format: OutputFormat) -> anyhow::Result<()> {
    let interfaces = list_interfaces()?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&interfaces)?);
        return Ok(());
    }

    if interfaces.is_empty() {
        println!("No capture interfaces found (capture privileges may be required)");
        return Ok(());
    }
    for interface in &interfaces {
        let addresses: Vec<String> = interface.addresses.iter().map(|a| a.to_string()).collect();
        println!(
            "{:<16} {:<40} {}",
            interface.name,
            interface.description.as_deref().unwrap_or("-"),
            addresses.join(", ")
        );
    }
    Ok(())
}
