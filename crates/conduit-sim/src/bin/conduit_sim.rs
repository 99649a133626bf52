//! conduit-sim
//!
//! Replays a scenario file against the engine and a simulated modem, logs
//! every notification and prints the final engine state.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use conduit_sim::Scenario;

/// Bearer orchestration scenario runner.
#[derive(Parser, Debug)]
#[command(name = "conduit-sim", about = "Replay a bearer orchestration scenario")]
struct Cli {
    /// Scenario TOML file.
    #[arg(long)]
    scenario: PathBuf,

    /// How long to run. Defaults to two seconds past the last event.
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Print the final snapshot as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let scenario = Scenario::from_file(&cli.scenario)
        .with_context(|| format!("loading {}", cli.scenario.display()))?;
    let duration = cli
        .duration_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| scenario.span() + Duration::from_secs(2));

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl-C handler")?;

    tracing::info!(
        scenario = %cli.scenario.display(),
        steps = scenario.steps.len(),
        duration_ms = duration.as_millis() as u64,
        "conduit-sim starting"
    );

    let report = conduit_sim::run(scenario, duration, stop)?;

    if cli.json {
        println!("{}", report.snapshot.to_json_pretty()?);
        return Ok(());
    }

    println!(
        "{} notifications, power off acked: {}",
        report.notifications.len(),
        report.power_off_acked
    );
    println!("ready: {}", report.snapshot.ready);
    for b in report.snapshot.bindings.iter().filter(|b| b.enabled) {
        let bearer = b
            .bearer
            .map(|slot| slot.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<8} {:<3} prio={:<4} {:<10} bearer={:<5} retries={}{}",
            b.service.as_str(),
            b.ip_version.as_str(),
            b.priority,
            format!("{:?}", b.state).to_lowercase(),
            bearer,
            b.retry_attempts,
            if b.retry_forever { " (forever)" } else { "" }
        );
    }
    for bearer in &report.snapshot.bearers {
        if let Some(profile) = &bearer.profile {
            println!("  {} {:?} {}", bearer.slot, bearer.state, profile);
        }
    }
    Ok(())
}
