//! Flowmeter CLI
//!
//! Meters a packet trace (JSON lines, one packet per line) into flows.
//!
//! # Usage
//!
//! ```bash
//! flowmeter trace.jsonl
//! flowmeter trace.jsonl --n-meters 4 --idle-timeout 30 --format csv -o flows.csv
//! flowmeter trace.jsonl --filter "tcp and port 443" --statistical-analysis --splt 10
//! flowmeter --config flowmeter.toml --anonymize --performance-report 5
//! ```

use anyhow::Result;
use clap::Parser;
use flowmeter::{FlowStreamer, KeyedAnonymizer, PortClassifier, RawConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod output;

#[derive(Parser)]
#[command(name = "flowmeter")]
#[command(version)]
#[command(about = "Aggregate packets into expiring bidirectional flows", long_about = None)]
struct Cli {
    /// Packet trace, one JSON packet per line
    source: Option<PathBuf>,

    /// Config file (TOML, or JSON with a .json extension)
    #[arg(long, short, env = "FLOWMETER_CONFIG")]
    config: Option<PathBuf>,

    /// Packet filter expression
    #[arg(long, short)]
    filter: Option<String>,

    /// Keep the outer header of tunnelled packets
    #[arg(long)]
    no_decode_tunnels: bool,

    /// Capture length applied to payloads
    #[arg(long)]
    snapshot_length: Option<i64>,

    /// Idle timeout in seconds, or "disabled"
    #[arg(long)]
    idle_timeout: Option<String>,

    /// Active timeout in seconds, or "disabled"
    #[arg(long)]
    active_timeout: Option<String>,

    /// Byte accounting: 0 raw, 1 ip, 2 transport, 3 payload
    #[arg(long)]
    accounting_mode: Option<i64>,

    /// Packets inspected per flow before classification gives up
    #[arg(long)]
    n_dissections: Option<i64>,

    /// Per-flow packet size and inter-arrival statistics
    #[arg(long)]
    statistical_analysis: bool,

    /// Length of the early packet sequence features
    #[arg(long)]
    splt: Option<i64>,

    /// Meter workers; 0 meters on the calling thread
    #[arg(long, short)]
    n_meters: Option<i64>,

    /// Seconds between performance reports on stderr
    #[arg(long)]
    performance_report: Option<i64>,

    /// Replace addresses with keyed digests
    #[arg(long)]
    anonymize: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "json")]
    format: output::OutputFormat,

    /// Output file; stdout when omitted
    #[arg(long, short)]
    output: Option<PathBuf>,
}

impl Cli {
    /// Flags that were actually given, as a config overlay
    fn overrides(&self) -> RawConfig {
        let mut raw = RawConfig::default();
        raw.source = self.source.clone();
        raw.bpf_filter = self.filter.clone();
        raw.snapshot_length = self.snapshot_length;
        raw.idle_timeout = self.idle_timeout.as_deref().map(timeout_arg);
        raw.active_timeout = self.active_timeout.as_deref().map(timeout_arg);
        raw.accounting_mode = self.accounting_mode;
        raw.n_dissections = self.n_dissections;
        raw.splt_analysis = self.splt;
        raw.n_meters = self.n_meters;
        raw.performance_report = self.performance_report;
        if self.no_decode_tunnels {
            raw.decode_tunnels = Some(false);
        }
        if self.statistical_analysis {
            raw.statistical_analysis = Some(true);
        }
        raw
    }
}

/// Numeric values are seconds; anything else is a keyword checked at build
fn timeout_arg(value: &str) -> flowmeter::config::RawTimeout {
    match value.parse::<i64>() {
        Ok(secs) => secs.into(),
        Err(_) => value.into(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Flowmeter v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = config::resolve(cli.config.as_deref(), cli.overrides())?.build()?;

    let streamer = FlowStreamer::new(config)
        .with_classifier(PortClassifier::new())
        .with_report_sink(|report| eprintln!("{}", report.to_json_line()));
    let stream = streamer.stream()?;

    let stop = stream.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, flushing open flows");
            stop.stop();
        }
    });

    let anonymizer = cli.anonymize.then(KeyedAnonymizer::new);
    let (format, path) = (cli.format, cli.output);
    let rows = tokio::task::spawn_blocking(move || {
        output::write(
            stream,
            format,
            path,
            anonymizer.as_ref().map(|a| a as &dyn flowmeter::Anonymizer),
        )
    })
    .await??;

    tracing::info!(flows = rows, "done");
    Ok(())
}
