//! Pipeline watchdog
//!
//! Checks the process chain on a fixed period. A chain with
//! a dead stage is torn down and started again, unless the
//! watchdog service is switched off. Detection happens either
//! way, so the log always shows the failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(not(test))]
use log::{debug, error, info, warn};

#[cfg(test)]
use std::println as debug;
#[cfg(test)]
use std::println as error;
#[cfg(test)]
use std::println as info;
#[cfg(test)]
use std::println as warn;

use crate::supervisor::Supervise;

// longest sleep between checks of the running flag
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Result of one watchdog check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The chain is running
    Healthy,

    /// The chain was dead and has been restarted
    Restarted,

    /// The chain is dead, but restarts are switched off
    RestartSuppressed,

    /// The chain is dead and could not be restarted
    RestartFailed,
}

/// Check `sup` once, restarting it if needed
///
/// A dead chain is restarted only if `restart_enabled`.
pub fn check<S>(sup: &mut S, restart_enabled: bool) -> WatchdogOutcome
where
    S: Supervise + ?Sized,
{
    if sup.is_alive() {
        return WatchdogOutcome::Healthy;
    }

    if !restart_enabled {
        warn!("pipeline is down; watchdog is disabled, not restarting");
        return WatchdogOutcome::RestartSuppressed;
    }

    error!("pipeline is down; restarting");
    match sup.restart() {
        Ok(()) => {
            info!("pipeline restarted");
            WatchdogOutcome::Restarted
        }
        Err(e) => {
            error!("pipeline restart failed: {}", e);
            WatchdogOutcome::RestartFailed
        }
    }
}

/// Run checks every `period` until `running` is cleared
///
/// `enabled` is consulted before each check. Returns the
/// number of successful restarts.
pub(crate) fn run<S, F>(sup: &Mutex<S>, running: &AtomicBool, period: Duration, enabled: F) -> u64
where
    S: Supervise,
    F: Fn() -> bool,
{
    debug!("watchdog started; period {} s", period.as_secs_f32());
    let mut restarts = 0u64;

    while sleep_while_running(running, period) {
        let mut sup = sup.lock().unwrap_or_else(PoisonError::into_inner);
        if check(&mut *sup, enabled()) == WatchdogOutcome::Restarted {
            restarts += 1;
        }
    }

    debug!("watchdog stopped after {} restarts", restarts);
    restarts
}

// Sleep for `period`, waking early if `running` is cleared.
// Returns the final state of `running`.
pub(crate) fn sleep_while_running(running: &AtomicBool, period: Duration) -> bool {
    let deadline = Instant::now() + period;
    while running.load(Ordering::Acquire) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(remaining));
    }
    false
}
