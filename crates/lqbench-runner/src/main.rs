//! # lqbench
//!
//! Live-query load generator. Each virtual user repeatedly signs in,
//! subscribes to a live query, fires a write burst, and checks that every
//! write is acknowledged before the session deadline. Writes a JSON summary
//! of all sessions.

#![deny(unsafe_code)]

mod scenario;
mod summary;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use lqbench_core::logging::{LogFormat, init_subscriber};
use lqbench_settings::{BenchSettings, DeadlinePolicy, load_settings};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::scenario::Scenario;
use crate::summary::Summary;

#[derive(Debug, Parser)]
#[command(name = "lqbench", about = "Live-query subscription load generator")]
struct Args {
    /// Settings file (JSON). Missing file means defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket RPC endpoint (overrides settings and `SUT_URL`).
    #[arg(long)]
    url: Option<String>,

    /// Number of virtual users.
    #[arg(long)]
    vus: Option<usize>,

    /// Load window in seconds.
    #[arg(long)]
    duration: Option<u64>,

    /// Writes per burst.
    #[arg(long)]
    burst: Option<usize>,

    /// How to report a session whose deadline fires: `fail` or `slowPass`.
    #[arg(long)]
    deadline_policy: Option<DeadlinePolicy>,

    /// Optional output path for the JSON summary (stdout otherwise).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Optional output path for Prometheus text metrics.
    #[arg(long)]
    metrics_output: Option<PathBuf>,

    /// Keep transcripts of non-passing sessions in the summary.
    #[arg(long, default_value_t = false)]
    include_transcripts: bool,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl Args {
    /// Command-line values win over file and environment settings.
    fn apply(&self, settings: &mut BenchSettings) {
        if let Some(url) = &self.url {
            settings.target.url.clone_from(url);
        }
        if let Some(vus) = self.vus {
            settings.scenario.vus = vus;
        }
        if let Some(duration) = self.duration {
            settings.scenario.duration_secs = duration;
        }
        if let Some(burst) = self.burst {
            settings.workload.burst_size = burst;
        }
        if let Some(policy) = self.deadline_policy {
            settings.deadline_policy = policy;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&args.log_level, format);

    let mut settings = load_settings(args.config.as_deref()).context("failed to load settings")?;
    args.apply(&mut settings);
    settings.validate().context("invalid settings")?;

    let metrics = match args.metrics_output {
        Some(_) => Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("failed to install metrics recorder")?,
        ),
        None => None,
    };

    let cancel = CancellationToken::new();
    let _signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping virtual users");
                cancel.cancel();
            }
        })
    };

    info!(
        target_url = %settings.target.url,
        vus = settings.scenario.vus,
        duration_secs = settings.scenario.duration_secs,
        burst = settings.workload.burst_size,
        "starting scenario"
    );
    let reports = Scenario::from_settings(&settings).run(cancel).await;
    let summary = Summary::build(reports, &settings, args.include_transcripts);

    let encoded = serde_json::to_string_pretty(&summary)?;
    match &args.output {
        Some(path) => {
            write_output(path, &encoded).context("failed to write summary")?;
            println!("{}", path.display());
        }
        None => println!("{encoded}"),
    }

    if let (Some(path), Some(handle)) = (&args.metrics_output, &metrics) {
        write_metrics(path, handle).context("failed to write metrics")?;
    }

    info!(
        sessions = summary.totals.sessions,
        passed = summary.totals.passed,
        slow = summary.totals.slow,
        failed = summary.totals.failed,
        "scenario complete"
    );
    if summary.totals.failed > 0 {
        anyhow::bail!(
            "{} of {} sessions failed",
            summary.totals.failed,
            summary.totals.sessions
        );
    }
    Ok(())
}

fn write_output(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output dir: {}", parent.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write file: {}", path.display()))
}

fn write_metrics(path: &Path, handle: &PrometheusHandle) -> Result<()> {
    write_output(path, &handle.render())
}
