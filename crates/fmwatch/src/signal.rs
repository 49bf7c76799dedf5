//! Silence detection and alert dispatch
//!
//! The state machine has three states:
//!
//! 1. `Ok`: the level is at or above the silence threshold
//!
//! 2. `Degraded`: the level has been below the threshold
//!    since some instant `t0`, but no alert has been
//!    dispatched yet
//!
//! 3. `AlertSent`: an alert for the current silence episode
//!    has been accepted by the notifier
//!
//! ```txt
//!   start
//!   ||
//!   \/
//! +------+  level < thr   +--------------+  now - t0 ≥ dur  +---------------+
//! |  Ok  | =============> | Degraded(t0) | ===============> | AlertSent(t0) |
//! +------+                +--------------+   notifier ok    +---------------+
//!   /\                         ||   /\                            ||
//!   ||====== level ≥ thr ======||   ||== notifier failed ==||     ||
//!   ||                                                            ||
//!   ||========================== level ≥ thr =====================||
//! ```
//!
//! A failed dispatch leaves the machine in `Degraded`, so the
//! alert is retried on the next evaluation for as long as the
//! level stays below the threshold. Only one alert is ever
//! accepted per silence episode.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use strum::EnumMessage;

#[cfg(not(test))]
use log::{error, info, warn};

#[cfg(test)]
use std::println as error;
#[cfg(test)]
use std::println as info;
#[cfg(test)]
use std::println as warn;

/// Kind of outbound alert
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum_macros::AsRefStr,
    strum_macros::EnumMessage,
    strum_macros::EnumString,
)]
pub enum AlertKind {
    /// Signal below threshold for the configured duration
    #[strum(serialize = "signal_lost", detailed_message = "Signal lost")]
    #[serde(rename = "signal_lost")]
    SignalLost,

    /// Signal back above threshold after an alert
    #[strum(serialize = "signal_recovered", detailed_message = "Signal recovered")]
    #[serde(rename = "signal_recovered")]
    SignalRecovered,
}

impl AlertKind {
    /// Machine-readable name, like `signal_lost`
    pub fn as_str(&self) -> &'static str {
        self.get_serializations()[0]
    }

    /// Human-readable name, like "`Signal lost`"
    pub fn as_display_str(&self) -> &'static str {
        self.get_detailed_message().unwrap_or("Alert")
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_display_str().fmt(f)
    }
}

/// A dispatched alert, as recorded in history
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    /// What happened
    pub kind: AlertKind,

    /// Signal level at dispatch (dBFS)
    pub level_db: f32,

    /// How long the signal had been lost (s)
    pub duration_secs: u64,

    /// One-line summary
    pub message: String,

    /// True if the notifier accepted the alert
    pub notified: bool,

    /// Local time of dispatch
    pub timestamp: DateTime<Local>,
}

/// Outbound alert channel
///
/// Implementations deliver an alert to a human somehow and
/// report whether they succeeded. Rate limiting, if any, is
/// the notifier's business: a notifier which declines to send
/// returns `false`, exactly as if delivery failed.
pub trait Notifier: Send {
    /// Deliver an alert of the given `kind`
    ///
    /// `details` is a human-readable description of the
    /// signal condition. Returns `true` on successful
    /// delivery.
    fn send_alert(&mut self, kind: AlertKind, details: &str) -> bool;
}

impl<N> Notifier for Box<N>
where
    N: Notifier + ?Sized,
{
    fn send_alert(&mut self, kind: AlertKind, details: &str) -> bool {
        (**self).send_alert(kind, details)
    }
}

/// Signal state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalState {
    /// Level at or above threshold
    Ok,

    /// Below threshold since the given instant; no alert yet
    Degraded(Instant),

    /// Below threshold since the given instant; alert accepted
    AlertSent(Instant),
}

impl SignalState {
    /// True if the signal is currently good
    pub fn is_ok(&self) -> bool {
        matches!(self, SignalState::Ok)
    }

    /// Start of the current silence episode, if any
    pub fn silence_start(&self) -> Option<Instant> {
        match self {
            SignalState::Ok => None,
            SignalState::Degraded(t0) | SignalState::AlertSent(t0) => Some(*t0),
        }
    }
}

/// Result of a single evaluation
#[derive(Clone, Debug, PartialEq)]
pub enum Evaluation {
    /// No state change
    Unchanged,

    /// The level just dropped below threshold
    SilenceStarted,

    /// An alert was dispatched and accepted
    AlertDispatched(AlertEvent),

    /// An alert was due but the notifier refused it
    AlertFailed,

    /// The level came back
    ///
    /// Carries the recovery alert, if one was attempted.
    Recovered(Option<AlertEvent>),
}

/// Silence detector
///
/// Evaluate the current level on a fixed cadence with
/// [`evaluate()`](SignalMonitor::evaluate). Time is supplied by
/// the caller, which keeps the machine deterministic.
#[derive(Clone, Debug)]
pub struct SignalMonitor {
    threshold_db: f32,
    silence_duration: Duration,
    notify_recovery: bool,
    state: SignalState,
}

impl SignalMonitor {
    /// New detector, initially `Ok`
    ///
    /// Levels strictly below `threshold_db` are silence.
    /// Silence which lasts at least `silence_duration` triggers
    /// an alert.
    pub fn new(threshold_db: f32, silence_duration: Duration) -> Self {
        Self {
            threshold_db,
            silence_duration,
            notify_recovery: false,
            state: SignalState::Ok,
        }
    }

    /// Also send a "signal recovered" alert
    ///
    /// If `enable`, recovery from `AlertSent` dispatches an
    /// [`AlertKind::SignalRecovered`] alert. Recovery from
    /// `Degraded` never does, since no one was told about the
    /// loss.
    pub fn with_recovery_notification(mut self, enable: bool) -> Self {
        self.notify_recovery = enable;
        self
    }

    /// Current state
    pub fn state(&self) -> SignalState {
        self.state
    }

    /// Silence threshold (dBFS)
    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    /// Evaluate the current level
    ///
    /// Advances the state machine with the `level_db` observed
    /// at time `now`. The `notifier` is invoked at most once.
    pub fn evaluate<N>(&mut self, level_db: f32, now: Instant, notifier: &mut N) -> Evaluation
    where
        N: Notifier + ?Sized,
    {
        if level_db < self.threshold_db {
            self.evaluate_silent(level_db, now, notifier)
        } else {
            self.evaluate_good(level_db, now, notifier)
        }
    }

    fn evaluate_silent<N>(&mut self, level_db: f32, now: Instant, notifier: &mut N) -> Evaluation
    where
        N: Notifier + ?Sized,
    {
        match self.state {
            SignalState::Ok => {
                warn!("weak signal detected: {:.2} dB", level_db);
                self.state = SignalState::Degraded(now);
                Evaluation::SilenceStarted
            }
            SignalState::Degraded(since) => {
                let elapsed = now.saturating_duration_since(since);
                if elapsed < self.silence_duration {
                    return Evaluation::Unchanged;
                }

                error!(
                    "signal lost for {} s; dispatching alert",
                    elapsed.as_secs()
                );
                let details = format!(
                    "Level: {:.2} dB, duration: {} s",
                    level_db,
                    elapsed.as_secs()
                );
                if notifier.send_alert(AlertKind::SignalLost, &details) {
                    self.state = SignalState::AlertSent(since);
                    Evaluation::AlertDispatched(AlertEvent {
                        kind: AlertKind::SignalLost,
                        level_db,
                        duration_secs: elapsed.as_secs(),
                        message: format!("Signal lost - {:.2} dB", level_db),
                        notified: true,
                        timestamp: Local::now(),
                    })
                } else {
                    warn!("alert not accepted by notifier; will retry");
                    Evaluation::AlertFailed
                }
            }
            SignalState::AlertSent(_) => Evaluation::Unchanged,
        }
    }

    fn evaluate_good<N>(&mut self, level_db: f32, now: Instant, notifier: &mut N) -> Evaluation
    where
        N: Notifier + ?Sized,
    {
        let prev = self.state;
        self.state = SignalState::Ok;

        match prev {
            SignalState::Ok => Evaluation::Unchanged,
            SignalState::Degraded(_) => {
                info!("signal restored: {:.2} dB", level_db);
                Evaluation::Recovered(None)
            }
            SignalState::AlertSent(since) => {
                info!("signal restored after alert: {:.2} dB", level_db);
                if !self.notify_recovery {
                    return Evaluation::Recovered(None);
                }

                let outage = now.saturating_duration_since(since).as_secs();
                let details = format!("Level: {:.2} dB, outage: {} s", level_db, outage);
                let notified = notifier.send_alert(AlertKind::SignalRecovered, &details);
                Evaluation::Recovered(Some(AlertEvent {
                    kind: AlertKind::SignalRecovered,
                    level_db,
                    duration_secs: outage,
                    message: format!("Signal recovered - {:.2} dB", level_db),
                    notified,
                    timestamp: Local::now(),
                }))
            }
        }
    }
}
