//! wakewatch: report host sleep/wake cycles inferred from wall-clock drift.

#![deny(unsafe_code)]

use clap::{Args, Parser, Subcommand};
use detector::clock::VirtualClock;
use detector::{Detector, DetectorConfig, LEG_COUNT};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use wake_core::config::ConfigError;
use wake_core::record::WakeRecord;

#[derive(Parser, Debug)]
#[command(name = "wakewatch", about = "Detect host sleep/wake cycles from wall-clock drift")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the system clock and print one JSON line per detected wake
    Watch {
        #[command(flatten)]
        timing: TimingArgs,
        /// Exit after this many events (0 = run until Ctrl-C)
        #[arg(long, default_value_t = 0)]
        max_events: u64,
    },
    /// Drive a virtual clock through the given jumps and print what is detected
    Simulate {
        #[command(flatten)]
        timing: TimingArgs,
        /// Virtual time jump in milliseconds; repeat for several wakes
        #[arg(long = "jump-ms", required = true)]
        jumps: Vec<u64>,
        /// Real time to wait for an event before nudging the virtual clock
        #[arg(long, default_value_t = 200)]
        settle_ms: u64,
    },
}

/// Timing flags layered over `WAKEWATCH_PERIOD_MS` / `WAKEWATCH_MARGIN_MS`.
#[derive(Args, Debug, Clone, Copy)]
struct TimingArgs {
    /// Checkpoint period per leg in milliseconds
    #[arg(long)]
    period_ms: Option<u64>,
    /// Minimum drift in milliseconds that counts as a wake
    #[arg(long)]
    margin_ms: Option<u64>,
}

impl TimingArgs {
    fn resolve(self) -> Result<DetectorConfig, ConfigError> {
        let mut cfg = DetectorConfig::from_env()?;
        if let Some(ms) = self.period_ms {
            cfg = cfg.with_period_ms(ms);
        }
        if let Some(ms) = self.margin_ms {
            cfg = cfg.with_margin_ms(ms);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_json_logging();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Watch { timing, max_events } => {
            cmd_watch(timing.resolve()?, max_events, &mut std::io::stdout()).await?;
        }
        Command::Simulate { timing, jumps, settle_ms } => {
            let jumps: Vec<Duration> = jumps.into_iter().map(Duration::from_millis).collect();
            let detected =
                cmd_simulate(timing.resolve()?, &jumps, Duration::from_millis(settle_ms)).await;
            let mut out = std::io::stdout();
            for slept in detected {
                writeln!(out, "{}", WakeRecord::new(slept).to_json_line()?)?;
            }
        }
    }
    Ok(())
}

async fn cmd_watch<W: Write>(
    config: DetectorConfig,
    max_events: u64,
    out: &mut W,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut det = Detector::from_config(config);
    let mut events = det.start();
    let mut seen = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            slept = events.recv() => {
                let Some(slept) = slept else { break };
                writeln!(out, "{}", WakeRecord::new(slept).to_json_line()?)?;
                out.flush()?;
                seen += 1;
                if max_events > 0 && seen >= max_events {
                    break;
                }
            }
        }
    }
    det.stop().await;
    Ok(())
}

/// Run a detector on a virtual clock, jumping it forward once per entry in
/// `jumps`, and collect what it reports.
///
/// After a jump, if no event shows up within `settle` of real time while a
/// pairing timer is still pending, the clock is nudged forward by the margin
/// until the timer fires. A nudge no larger than the margin cannot push a leg
/// past its checkpoint by more than the margin, so it adds no reports. With a
/// zero margin the nudge is half a period, which lands both legs exactly on
/// their checkpoints only when the clock already sits on the half-period grid.
async fn cmd_simulate(config: DetectorConfig, jumps: &[Duration], settle: Duration) -> Vec<Duration> {
    let clock = Arc::new(VirtualClock::new());
    let mut det = Detector::with_clock(config, clock.clone());
    let mut events = det.start();
    let legs = LEG_COUNT as usize;
    let nudge = if config.margin.is_zero() { config.period / LEG_COUNT } else { config.margin };

    let mut detected = Vec::new();
    for &jump in jumps {
        clock.wait_for_sleepers(legs).await;
        clock.advance(jump);
        loop {
            match timeout(settle, events.recv()).await {
                Ok(Some(slept)) => {
                    detected.push(slept);
                    break;
                }
                Ok(None) => break,
                Err(_) if clock.pending_timers() > 0 => {
                    clock.wait_for_sleepers(legs).await;
                    clock.advance(nudge);
                }
                // nothing in flight: the jump stayed within the margin
                Err(_) => break,
            }
        }
    }
    det.stop().await;
    detected
}
