//! Daemon main loop
//!
//! The monitor does all the work on its own threads. The main
//! thread only waits for a shutdown signal and prints a status
//! line now and then:
//!
//! ```txt
//! 12:00:05 88.6M  -23.41 dBFS  OK    alerts 0  restarts 0  up 3600 s  FIP / Now playing
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Local;
use log::{info, warn};

use fmwatch::{Monitor, MetadataReading, StatsSnapshot};

// how often the shutdown flag is checked
const TICK: Duration = Duration::from_millis(200);

/// Run until `quit` is raised
///
/// Starts the `monitor`, prints a status line every
/// `status_interval` (if non-zero) unless `quiet`, and stops
/// the monitor on the way out.
pub fn run(
    monitor: &Monitor,
    quit: &AtomicBool,
    status_interval: Duration,
    quiet: bool,
) -> anyhow::Result<()> {
    monitor.start().context("unable to start monitoring")?;
    info!("monitoring; send SIGINT or SIGTERM to stop");

    let mut last_status = Instant::now();
    let mut alerts_seen = 0u64;

    while !quit.load(Ordering::SeqCst) {
        thread::sleep(TICK);

        let snap = monitor.stats();
        if snap.alerts_sent_count > alerts_seen {
            alerts_seen = snap.alerts_sent_count;
            warn!("alert dispatched ({} so far)", alerts_seen);
            if !quiet {
                println!("{}", format_alert(&snap));
            }
        }

        if quiet || status_interval.is_zero() || last_status.elapsed() < status_interval {
            continue;
        }
        last_status = Instant::now();
        println!("{} {}", Local::now().format("%H:%M:%S"), format_status(&snap));
    }

    info!("shutdown requested");
    monitor.stop();
    Ok(())
}

/// Read metadata once and print it
///
/// Starts the `monitor`, reads the metadata feed for at most
/// `duration`, and stops the monitor.
pub fn read_metadata(monitor: &Monitor, duration: Duration) -> anyhow::Result<()> {
    monitor.start().context("unable to start monitoring")?;
    let reading = monitor.read_metadata_once(duration);
    monitor.stop();

    let reading = reading.context("unable to read metadata")?;
    println!("{}", format_reading(&reading));
    Ok(())
}

/// One-line status summary
pub fn format_status(snap: &StatsSnapshot) -> String {
    let mut out = format!(
        "{}  {:.2} dBFS  {:<4}  alerts {}  restarts {}  up {} s",
        snap.frequency,
        snap.level_db,
        if snap.signal_ok { "OK" } else { "LOST" },
        snap.alerts_sent_count,
        snap.pipeline_restarts,
        snap.uptime_seconds
    );

    match (snap.station_name.is_empty(), snap.rolling_text.is_empty()) {
        (true, true) => {}
        (false, true) => out.push_str(&format!("  {}", snap.station_name)),
        (true, false) => out.push_str(&format!("  {}", snap.rolling_text)),
        (false, false) => out.push_str(&format!(
            "  {} / {}",
            snap.station_name, snap.rolling_text
        )),
    }
    out
}

fn format_alert(snap: &StatsSnapshot) -> String {
    let at = snap
        .last_alert_timestamp
        .map(|t| t.format("%d/%m/%Y %H:%M:%S").to_string())
        .unwrap_or_default();
    format!(
        "ALERT {}: {} at {:.2} dBFS",
        at,
        if snap.signal_ok {
            "signal recovered"
        } else {
            "signal lost"
        },
        snap.level_db
    )
}

fn format_reading(reading: &MetadataReading) -> String {
    format!(
        "station: {}\nradiotext: {}",
        reading.station_name.as_deref().unwrap_or("(none)"),
        reading.rolling_text.as_deref().unwrap_or("(none)")
    )
}
