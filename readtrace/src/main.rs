//! readtrace - inspect configuration and replay scripted page visits
//!
//! This tool provides commands for:
//! - Showing the resolved configuration and whether the store is usable
//! - Replaying a scripted visit through the real tracker
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/readtrace/config.toml (~/.config/readtrace/config.toml)
//! - Logs: $XDG_STATE_HOME/readtrace/readtrace.log (~/.local/state/readtrace/readtrace.log)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use readtrace_core::replay::{self, ReplayReport, ReplayScript};
use readtrace_core::{Config, RecordingTransport, RestTransport, Transport};

#[derive(Parser)]
#[command(name = "readtrace")]
#[command(about = "Reader engagement telemetry tools")]
#[command(version)]
struct Args {
    /// Verbose output (also writes the log file)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and store status
    Config,

    /// Replay a scripted page visit through the tracker
    Replay {
        /// Path to the replay script (TOML)
        script: PathBuf,

        /// Print requests instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(readtrace_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Config => cmd_config(&config),
        Command::Replay { script, dry_run } => cmd_replay(&config, &script, dry_run),
    }
}

fn cmd_config(config: &Config) -> Result<()> {
    println!("readtrace Configuration");
    println!("=======================");
    println!();
    println!("Config file:     {}", Config::config_path().display());
    println!("Log file:        {}", Config::log_path().display());
    println!();

    let store = &config.store;
    println!("Store");
    println!("  URL:           {}", store.url.as_deref().unwrap_or("(not set)"));
    println!(
        "  Anon key:      {}",
        if store.anon_key.is_some() {
            "(set)"
        } else {
            "(not set)"
        }
    );
    println!("  Timeout:       {}s", store.timeout_secs);

    match store.validate() {
        Ok(()) => println!("  Status:        ready"),
        Err(e) => {
            println!("  Status:        not configured ({})", e);
            println!();
            println!("Set [store] url and anon_key in config.toml, or export:");
            println!("  READTRACE_STORE_URL=https://<project>.example.co");
            println!("  READTRACE_ANON_KEY=<anon key>");
        }
    }
    println!();

    let tracking = &config.tracking;
    println!("Tracking");
    println!("  Update interval:   {}s", tracking.update_interval_secs);
    println!("  Session timeout:   {} min", tracking.session_timeout_mins);
    println!("  Read complete at:  {}%", tracking.read_complete_depth);
    println!("  Bounce below:      {}% and {}s", tracking.bounce_depth, tracking.bounce_secs);
    println!("  Canvas signature:  {}", tracking.canvas_fingerprint);
    println!();

    let selectors = &config.selectors;
    println!("Selectors");
    println!("  Share button:      #{}", selectors.share_button_id);
    println!("  Subscribe form:    .{}", selectors.subscribe_form_class);

    Ok(())
}

fn cmd_replay(config: &Config, path: &Path, dry_run: bool) -> Result<()> {
    let script = ReplayScript::load(path)
        .with_context(|| format!("failed to load replay script {}", path.display()))?;

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the Unix epoch")?
        .as_millis() as i64;
    let env = Arc::new(script.environment(now_ms)?);

    let live = !dry_run && config.store.is_ready();
    if !dry_run && !live {
        println!("Store not configured; running as a dry run.");
        println!();
    }

    let recorder = Arc::new(RecordingTransport::new());
    let transport: Arc<dyn Transport> = if live {
        Arc::new(
            RestTransport::new(&config.store, env.clone())
                .context("failed to create store transport")?,
        )
    } else {
        recorder.clone()
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let report = runtime.block_on(replay::run(&script, config, env.clone(), transport));
    tracing::info!(
        script = %path.display(),
        live,
        steps = report.steps,
        delivered = report.stats.delivered,
        failed = report.stats.failed,
        "Replay finished"
    );

    if !live {
        println!("Requests");
        println!("--------");
        for call in recorder.calls() {
            println!("{}", serde_json::to_string(&call.to_json())?);
        }
        println!();
    } else {
        let beacons = env.beacons();
        if !beacons.is_empty() {
            println!("Final flush handed to the beacon");
            println!("--------------------------------");
            for beacon in beacons {
                println!("{} {}", beacon.url, beacon.body);
            }
            println!();
        }
    }

    print_report(&script, &report);
    Ok(())
}

fn print_report(script: &ReplayScript, report: &ReplayReport) {
    println!("Replay of {}", script.page.url);
    println!("=========={}", "=".repeat(script.page.url.len()));
    println!();

    if let Some(identity) = &report.identity {
        println!("Visitor:         {}", identity.visitor_id);
        println!("Session:         {}", identity.session_id);
    }
    println!("Steps:           {}", report.steps);
    println!(
        "Scripted time:   {}s",
        replay::scripted_duration(script).as_secs()
    );
    println!("Revisions:       {}", report.ticks);
    println!("Events:          {}", report.events);
    println!("Final flushes:   {}", report.flushes);
    println!("Phase:           {:?}", report.phase);

    if let Some(metrics) = &report.metrics {
        println!();
        println!("Engagement");
        println!("  Time on page:  {}s", metrics.time_on_page);
        println!("  Max scroll:    {}%", metrics.max_scroll_depth);
        println!("  Read complete: {}", metrics.read_complete);
        println!("  Bounced:       {}", metrics.bounced);
    }

    println!();
    println!(
        "Deliveries:      {} delivered, {} degraded, {} failed",
        report.stats.delivered, report.stats.degraded, report.stats.failed
    );
}
