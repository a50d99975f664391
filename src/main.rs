use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use optic_poll_rs::config::PollerConfig;
use optic_poll_rs::error::CycleError;
use optic_poll_rs::inventory;
use optic_poll_rs::mib::MibRegistry;
use optic_poll_rs::net::NetTransport;
use optic_poll_rs::resolver::OidResolver;
use optic_poll_rs::scheduler::Poller;
use optic_poll_rs::server::{self, AppState};
use optic_poll_rs::sink::MemorySink;
use optic_poll_rs::types::{Measured, Report, Severity};
use optic_poll_rs::vendor::ProfileTable;

/// optic-poll-rs: batch SNMP/ICMP poller for switch liveness and SFP optical levels.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "optic-poll-rs",
    version,
    about = "Batch SNMP/ICMP poller for switch liveness, uptime and SFP optical levels.",
    long_about = None
)]
struct Cli {
    /// YAML poller configuration. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Inventory file: one IP or CIDR per line, optional hostname and key=value attributes.
    #[arg(long, default_value = "inventory.txt")]
    inventory: PathBuf,

    /// YAML vendor profiles, merged over the built-in table.
    #[arg(long)]
    profiles: Option<PathBuf>,

    /// Devices per batch.
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,

    /// Max devices polled concurrently within a batch.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Timeout of a single SNMP/ICMP request in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Retries per SNMP/ICMP request.
    #[arg(long)]
    retries: Option<u8>,

    /// Default SNMP v2c community.
    #[arg(long)]
    community: Option<String>,

    /// Write each cycle report as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Poll once and exit instead of looping every cycle interval.
    #[arg(long = "run-once", default_value_t = false)]
    run_once: bool,

    /// Serve the HTTP API on this address.
    #[arg(long, value_name = "ADDR", num_args = 0..=1, default_missing_value = "127.0.0.1:8080")]
    serve: Option<String>,
}

impl Cli {
    fn apply(&self, cfg: &mut PollerConfig) {
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.concurrency {
            cfg.max_concurrency = v;
        }
        if let Some(v) = self.timeout_ms {
            cfg.probe_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.retries {
            cfg.retries = v;
        }
        if let Some(v) = &self.community {
            cfg.community = v.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,optic_poll_rs=debug")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = match cli.config.as_deref() {
        Some(path) => PollerConfig::load(path)?,
        None => PollerConfig::default(),
    };
    cli.apply(&mut cfg);
    cfg.validate().context("invalid configuration")?;
    print_banner(&cli, &cfg);

    let devices = inventory::load_inventory(&cli.inventory)?;
    let profiles = match cli.profiles.as_deref() {
        Some(path) => ProfileTable::load(path)?,
        None => ProfileTable::builtin(),
    };
    let mut mibs = MibRegistry::with_core();
    for dir in &cfg.mib_dirs {
        match mibs.load_dir(dir) {
            Ok(n) => tracing::info!(dir = %dir.display(), modules = n, "MIB modules loaded"),
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "MIB directory skipped"),
        }
    }
    println!("Devices: {}  vendor profiles: {}", devices.len(), profiles.len());

    let transport = NetTransport::bind("0.0.0.0:0").await?;
    let sink = MemorySink::with_thresholds(cfg.thresholds);
    sink.seed(&devices).await;
    let resolver = OidResolver::new(Arc::new(profiles), Arc::new(mibs));
    let poller = Poller::new(Arc::new(transport), resolver, Arc::new(sink.clone()));

    // Ctrl-C stops dispatch; in-flight devices finish or time out.
    let shutdown = CancellationToken::new();
    let shutdown_ctrlc = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupt received, stopping after in-flight devices");
        shutdown_ctrlc.cancel();
    });

    let state = AppState::new(poller, sink, devices, cfg, shutdown.clone());

    let server_task = cli.serve.clone().map(|bind| {
        let state = state.clone();
        println!("API server starting at http://{bind}/api (Ctrl+C to stop)");
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state).await {
                tracing::error!(error = %e, "HTTP server error");
            }
        })
    });

    if cli.run_once {
        let report = state.poll_once().await?;
        emit_report(&report, cli.output.as_deref());
        if server_task.is_some() {
            println!("Press Ctrl+C to stop the server...");
            shutdown.cancelled().await;
        }
    } else {
        run_loop(&state, cli.output.as_deref(), &shutdown).await?;
    }

    if let Some(task) = server_task {
        let _ = task.await;
    }
    Ok(())
}

async fn run_loop(state: &AppState, output: Option<&Path>, shutdown: &CancellationToken) -> Result<()> {
    let interval = state.config().cycle_interval;
    while !shutdown.is_cancelled() {
        let started = Instant::now();
        match state.poll_once().await {
            Ok(report) => emit_report(&report, output),
            Err(CycleError::AlreadyRunning) => {
                tracing::info!("cycle skipped, an API-triggered cycle is running");
            }
            Err(e) => return Err(e.into()),
        }
        let wait = interval.saturating_sub(started.elapsed());
        tracing::debug!(wait_ms = wait.as_millis() as u64, "next cycle scheduled");
        tokio::select! {
            _ = time::sleep(wait) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    Ok(())
}

fn print_banner(cli: &Cli, cfg: &PollerConfig) {
    println!("optic-poll-rs configuration:");
    println!("  inventory          : {}", cli.inventory.display());
    println!(
        "  profiles           : {}",
        cli.profiles
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<built-in>".to_string())
    );
    println!("  batch_size         : {}", cfg.batch_size);
    println!("  max_concurrency    : {}", cfg.max_concurrency);
    println!("  per_device_timeout : {}", humantime::format_duration(cfg.per_device_timeout));
    println!("  probe_timeout      : {}", humantime::format_duration(cfg.probe_timeout));
    println!("  retries            : {}", cfg.retries);
    println!("  cycle_interval     : {}", humantime::format_duration(cfg.cycle_interval));
    println!(
        "  output             : {}",
        cli.output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("  mode               : {}", if cli.run_once { "run once" } else { "loop" });
    println!("  serve              : {}", cli.serve.as_deref().unwrap_or("<off>"));
}

fn emit_report(report: &Report, output: Option<&Path>) {
    print_report_table(report);
    if let Some(path) = output {
        if let Err(e) = write_report_json(path, report) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON report to {}", path.display());
        }
    }
}

fn fmt_dbm(m: Option<Measured<f64>>) -> String {
    match m {
        Some(Measured::Value(v)) => format!("{v:.2}"),
        Some(Measured::Unknown) => "unknown".to_string(),
        None => "-".to_string(),
    }
}

fn print_report_table(report: &Report) {
    let mut ip_w = "ip".len();
    let mut vendor_w = "vendor".len();
    let mut model_w = "model".len();
    for o in &report.outcomes {
        ip_w = ip_w.max(o.ip.to_string().len());
        if let Some(id) = &o.identity {
            vendor_w = vendor_w.max(id.vendor.as_deref().map_or(1, str::len).min(16));
            model_w = model_w.max(id.model.as_deref().map_or(1, str::len).min(20));
        }
    }

    println!(
        "\nPolled: {} (ok: {}, failed: {}, batches: {}, {} ms{})",
        report.total,
        report.succeeded,
        report.failed,
        report.batches,
        report.elapsed_ms,
        if report.cancelled { ", cancelled" } else { "" }
    );
    println!(
        "Optical ports: {} warning, {} critical",
        report.ports_warning, report.ports_critical
    );
    println!(
        "{:<ip_w$}  {:<5}  {:<vendor_w$}  {:<model_w$}  {:>5}  {:>6}  {:<8}  {:>6}",
        "ip", "alive", "vendor", "model", "ports", "optics", "severity", "errors",
    );
    println!(
        "{:-<ip_w$}  {:-<5}  {:-<vendor_w$}  {:-<model_w$}  {:->5}  {:->6}  {:-<8}  {:->6}",
        "", "", "", "", "", "", "", "",
    );
    for o in &report.outcomes {
        let vendor = o.identity.as_ref().and_then(|i| i.vendor.as_deref()).unwrap_or("-");
        let model = o.identity.as_ref().and_then(|i| i.model.as_deref()).unwrap_or("-");
        let optics = o.ports.iter().filter(|p| !p.optics.is_empty()).count();
        let worst = o
            .ports
            .iter()
            .filter_map(|p| p.optics.severity)
            .filter(|s| *s != Severity::Unknown)
            .max()
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<ip_w$}  {:<5}  {:<vendor_w$.vendor_w$}  {:<model_w$.model_w$}  {:>5}  {:>6}  {:<8}  {:>6}",
            o.ip,
            if o.alive { "yes" } else { "no" },
            vendor,
            model,
            o.ports.len(),
            optics,
            worst,
            o.errors.len(),
        );
        for p in o.ports.iter().filter(|p| p.optics.rx_dbm.is_some() || p.optics.tx_dbm.is_some()) {
            println!(
                "    {:<24.24} rx {:>8} dBm  tx {:>8} dBm{}",
                p.name,
                fmt_dbm(p.optics.rx_dbm),
                fmt_dbm(p.optics.tx_dbm),
                if p.uplink { "  (uplink)" } else { "" }
            );
        }
    }
}

fn write_report_json(path: &Path, report: &Report) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
