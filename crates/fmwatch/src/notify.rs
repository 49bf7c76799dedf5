//! Alert notifiers
//!
//! [`CommandNotifier`] hands each alert to an external hook
//! program. [`CooldownNotifier`] wraps any other notifier and
//! enforces a minimum spacing between alerts of the same kind.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;

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

use crate::signal::{AlertKind, Notifier};

/// Rate-limiting notifier
///
/// Refuses to send an alert of a given [`AlertKind`] until
/// `cooldown` has passed since the last *successful* alert of
/// the same kind. A refused alert reports failure, which keeps
/// the signal state machine retrying on later ticks. Once the
/// cooldown expires, the retry goes through.
///
/// When `enabled` is false, every alert is refused.
#[derive(Debug)]
pub struct CooldownNotifier<N> {
    inner: N,
    cooldown: Duration,
    enabled: bool,
    last_sent: HashMap<AlertKind, Instant>,
}

impl<N> CooldownNotifier<N>
where
    N: Notifier,
{
    /// Wrap `inner` with the given `cooldown`
    pub fn new(inner: N, cooldown: Duration) -> Self {
        Self {
            inner,
            cooldown,
            enabled: true,
            last_sent: HashMap::new(),
        }
    }

    /// Enable or disable all alerts
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// True if an alert of `kind` may be sent at `now`
    pub fn can_send(&self, kind: AlertKind, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_sent.get(&kind) {
            Some(last) => now.saturating_duration_since(*last) >= self.cooldown,
            None => true,
        }
    }

    /// Wrapped notifier
    pub fn inner(&self) -> &N {
        &self.inner
    }
}

impl<N> Notifier for CooldownNotifier<N>
where
    N: Notifier,
{
    fn send_alert(&mut self, kind: AlertKind, details: &str) -> bool {
        let now = Instant::now();
        if !self.enabled {
            debug!("alert not sent: alerts are disabled");
            return false;
        }
        if !self.can_send(kind, now) {
            info!("alert not sent: cooldown active for {}", kind.as_str());
            return false;
        }

        let ok = self.inner.send_alert(kind, details);
        if ok {
            self.last_sent.insert(kind, now);
        }
        ok
    }
}

/// Notifier which only writes to the log
///
/// Useful when no alert hook is configured. Always succeeds.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier {}

impl Notifier for LogNotifier {
    fn send_alert(&mut self, kind: AlertKind, details: &str) -> bool {
        error!("ALERT {}: {}", kind, details);
        true
    }
}

/// Alert hook program
///
/// Spawns the configured program once per alert. The alert is
/// described in environment variables (see [`hookenv`]); the
/// hook's standard input is closed. The alert is delivered if
/// the hook exits successfully within the timeout. A hook which
/// overruns is killed and counts as a failure.
#[derive(Clone, Debug)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
    frequency: String,
    timeout: Duration,
}

impl CommandNotifier {
    /// Default time allowed for the hook to finish
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Run `program` with `args` for each alert
    ///
    /// The `frequency` is passed through to the hook.
    pub fn new<P, A, S>(program: P, args: A, frequency: &str) -> Self
    where
        P: Into<String>,
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            frequency: frequency.to_owned(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Build from an argv vector
    ///
    /// Returns `None` if `argv` is empty.
    pub fn from_argv(argv: &[String], frequency: &str) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.as_str(), args.iter().cloned(), frequency))
    }

    /// Change the hook timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, kind: AlertKind, details: &str) -> io::Result<ExitStatus> {
        let mut child = spawn(
            &self.program,
            &self.args,
            kind,
            details,
            &self.frequency,
        )?;
        debug!("spawned alert hook PID {}", child.id());
        wait_timeout(&mut child, self.timeout)
    }
}

impl Notifier for CommandNotifier {
    fn send_alert(&mut self, kind: AlertKind, details: &str) -> bool {
        match self.run(kind, details) {
            Ok(exit) if exit.success() => {
                info!("alert hook delivered: {}", kind);
                true
            }
            Ok(exit) => {
                warn!(
                    "alert hook exited abnormally with status {}",
                    exit.code().unwrap_or(1)
                );
                false
            }
            Err(err) => {
                error!("unable to run alert hook \"{}\": {}", self.program, err);
                false
            }
        }
    }
}

// Spawn the hook program for one alert
fn spawn<C, A, B>(
    cmd: C,
    args: A,
    kind: AlertKind,
    details: &str,
    frequency: &str,
) -> io::Result<Child>
where
    C: AsRef<OsStr>,
    B: AsRef<OsStr>,
    A: IntoIterator<Item = B>,
{
    let timestamp = Local::now();

    Command::new(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .args(args)
        .env(hookenv::FMWATCH_ALERT_TYPE, kind.as_str())
        .env(hookenv::FMWATCH_ALERT_TITLE, kind.as_display_str())
        .env(hookenv::FMWATCH_ALERT_DETAILS, details)
        .env(hookenv::FMWATCH_FREQUENCY, frequency)
        .env(hookenv::FMWATCH_TIMESTAMP, timestamp.format("%s").to_string())
        .env(
            hookenv::FMWATCH_LOCAL_TIME,
            timestamp.format("%d/%m/%Y %H:%M:%S").to_string(),
        )
        .spawn()
}

// Wait for `child`, killing it after `timeout`
fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            warn!("alert hook timed out after {} s; killing it", timeout.as_secs());
            drop(child.kill());
            child.wait()?;
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "alert hook timed out",
            ));
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Environment variables passed to the alert hook
pub mod hookenv {
    /// Alert type (machine-readable)
    ///
    /// Either `signal_lost` or `signal_recovered`.
    pub const FMWATCH_ALERT_TYPE: &str = "FMWATCH_ALERT_TYPE";

    /// Alert type (human-readable)
    ///
    /// Like "`Signal lost`".
    pub const FMWATCH_ALERT_TITLE: &str = "FMWATCH_ALERT_TITLE";

    /// Signal condition
    ///
    /// ```txt
    /// Level: -62.10 dB, duration: 30 s
    /// ```
    pub const FMWATCH_ALERT_DETAILS: &str = "FMWATCH_ALERT_DETAILS";

    /// Monitored frequency, as configured
    pub const FMWATCH_FREQUENCY: &str = "FMWATCH_FREQUENCY";

    /// Dispatch time (UNIX timestamp, in seconds)
    pub const FMWATCH_TIMESTAMP: &str = "FMWATCH_TIMESTAMP";

    /// Dispatch time (local time, `dd/mm/YYYY HH:MM:SS`)
    pub const FMWATCH_LOCAL_TIME: &str = "FMWATCH_LOCAL_TIME";
}
