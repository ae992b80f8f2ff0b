use std::io::{self, BufWriter};
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use exec_tracker::server::{AppState, start_http_server};
use exec_tracker::settings::{OutputFormat, Settings};
use exec_tracker::sink::OutputSink;
use exec_tracker::store::ExecutionStorage;

/// Print every process that calls execve.
#[derive(Debug, Parser)]
#[command(name = "exec-tracker", version)]
struct Opt {
    /// YAML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format for events on stdout
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Serve recent executions over HTTP on this address (e.g. 127.0.0.1:3000)
    #[arg(long)]
    listen: Option<String>,

    /// How long one poll waits for new events
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    // stdout carries the events, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if opt.verbose { "debug" } else { "info" })),
        )
        .with_writer(io::stderr)
        .init();

    let mut settings = Settings::new(opt.config.as_deref()).context("Failed to load settings")?;
    if let Some(format) = opt.format {
        settings.output.format = format;
    }
    if let Some(listen) = opt.listen {
        settings.api.listen = Some(listen);
    }
    if let Some(timeout_ms) = opt.timeout_ms {
        settings.output.poll_timeout_ms = timeout_ms;
    }
    debug!(?settings, "Settings loaded");

    let mut handle = exec_tracker::attach(&settings.collector).context("Failed to attach exec probe")?;

    let storage = ExecutionStorage::new(settings.api.max_executions);
    let server_handle = match settings.api.listen.as_deref() {
        Some(listen) => Some(
            start_http_server(
                listen,
                AppState {
                    storage: storage.clone(),
                    stats: handle.stats(),
                    activity: handle.activity(),
                },
            )
            .await
            .with_context(|| format!("Failed to start HTTP server on {}", listen))?,
        ),
        None => None,
    };

    let mut sink = OutputSink::new(BufWriter::new(io::stdout().lock()), settings.output.format);
    let timeout = settings.output.poll_timeout();

    info!("Monitoring execve. Press Ctrl-C to exit.");
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        let batch = tokio::select! {
            res = &mut ctrl_c => {
                res?;
                break;
            }
            batch = handle.poll(timeout) => batch?,
        };

        let received_at = Utc::now();
        for event in batch.iter() {
            debug!(pid = event.pid, comm = %event.comm, cpu = event.cpu, "Process execution captured");
            sink.emit(&event, received_at).context("Failed to write event")?;
            storage.add_event(&event, received_at).await;
        }
        sink.flush().context("Failed to flush output")?;
    }

    info!("Exiting...");
    let stats = handle.stats_snapshot();
    handle.close();
    handle.join_readers().await;
    info!(
        received = stats.received,
        dropped = stats.dropped,
        decode_errors = stats.decode_errors,
        "Collector closed"
    );

    if let Some(server_handle) = server_handle {
        server_handle.abort();
    }
    Ok(())
}
