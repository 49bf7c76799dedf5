//! Level and alert history
//!
//! Workers never write history themselves. They post
//! [`HistoryRecord`]s to a bounded queue, and a single drain
//! worker hands them to the [`HistoryStore`]. Level samples
//! are dropped when the queue is full. Alerts wait briefly
//! for room.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;

#[cfg(not(test))]
use log::{debug, info, trace, warn};

#[cfg(test)]
use std::println as debug;
#[cfg(test)]
use std::println as info;
#[cfg(test)]
use std::println as trace;
#[cfg(test)]
use std::println as warn;

use crate::error::Result;
use crate::signal::AlertEvent;

/// Capacity of the history queue, in records
pub const HISTORY_QUEUE_CAPACITY: usize = 100;

/// Longest wait for room in the queue when posting an alert
pub const ALERT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Persistence for level samples and alerts
///
/// Errors are logged by the caller and otherwise ignored.
pub trait HistoryStore: Send {
    /// Record a level sample
    fn save_level(&mut self, level_db: f32, signal_ok: bool) -> Result<()>;

    /// Record an alert
    fn save_alert(&mut self, event: &AlertEvent) -> Result<()>;
}

impl<S> HistoryStore for Box<S>
where
    S: HistoryStore + ?Sized,
{
    fn save_level(&mut self, level_db: f32, signal_ok: bool) -> Result<()> {
        (**self).save_level(level_db, signal_ok)
    }

    fn save_alert(&mut self, event: &AlertEvent) -> Result<()> {
        (**self).save_alert(event)
    }
}

/// Store which discards everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStore {}

impl HistoryStore for NullStore {
    fn save_level(&mut self, _level_db: f32, _signal_ok: bool) -> Result<()> {
        Ok(())
    }

    fn save_alert(&mut self, _event: &AlertEvent) -> Result<()> {
        Ok(())
    }
}

/// Store which appends JSON lines to a file
///
/// Each record is one JSON object on its own line:
///
/// ```txt
/// {"type":"level","timestamp":"2024-05-01T12:00:05+02:00","levelDb":-23.5,"signalOk":true}
/// {"type":"alert","kind":"signal_lost","levelDb":-61.2,"durationSecs":30,...}
/// ```
///
/// Lines are flushed as they are written.
#[derive(Debug)]
pub struct JsonLinesStore {
    path: PathBuf,
    out: BufWriter<File>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LevelLine {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: DateTime<Local>,
    level_db: f32,
    signal_ok: bool,
}

#[derive(Serialize)]
struct AlertLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    event: &'a AlertEvent,
}

impl JsonLinesStore {
    /// Open `path` for appending, creating it if needed
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: Into<PathBuf>,
    {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("history: appending to {}", path.display());
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    /// Path of the history file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        serde_json::to_writer(&mut self.out, value).map_err(std::io::Error::from)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

impl HistoryStore for JsonLinesStore {
    fn save_level(&mut self, level_db: f32, signal_ok: bool) -> Result<()> {
        self.write_line(&LevelLine {
            kind: "level",
            timestamp: Local::now(),
            level_db,
            signal_ok,
        })
    }

    fn save_alert(&mut self, event: &AlertEvent) -> Result<()> {
        self.write_line(&AlertLine {
            kind: "alert",
            event,
        })
    }
}

/// An entry in the history queue
#[derive(Clone, Debug, PartialEq)]
pub enum HistoryRecord {
    /// Periodic level sample
    Level { level_db: f32, signal_ok: bool },

    /// Dispatched alert
    Alert(AlertEvent),
}

/// Create the bounded history queue
pub fn channel() -> (Sender<HistoryRecord>, Receiver<HistoryRecord>) {
    crossbeam_channel::bounded(HISTORY_QUEUE_CAPACITY)
}

/// Post a level sample without blocking
///
/// Returns false if the sample was dropped.
pub fn post_level(tx: &Sender<HistoryRecord>, level_db: f32, signal_ok: bool) -> bool {
    match tx.try_send(HistoryRecord::Level {
        level_db,
        signal_ok,
    }) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            trace!("history: queue full; level sample dropped");
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

/// Post an alert, waiting at most [`ALERT_SEND_TIMEOUT`]
///
/// Returns false if the alert could not be queued.
pub fn post_alert(tx: &Sender<HistoryRecord>, event: AlertEvent) -> bool {
    match tx.send_timeout(HistoryRecord::Alert(event), ALERT_SEND_TIMEOUT) {
        Ok(()) => true,
        Err(_) => {
            warn!("history: queue full; alert not recorded");
            false
        }
    }
}

/// Move records from `rx` into `store`
///
/// Runs until `running` is cleared or every sender is gone.
/// Records still queued at shutdown are written before
/// returning. Store errors are logged and the record is
/// discarded. Returns the number of records stored.
pub fn drain<S>(rx: &Receiver<HistoryRecord>, store: &mut S, running: &AtomicBool) -> u64
where
    S: HistoryStore + ?Sized,
{
    debug!("history: drain started");
    let mut stored = 0u64;

    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(DRAIN_POLL) {
            Ok(record) => stored += u64::from(save(store, &record)),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for record in rx.try_iter() {
        stored += u64::from(save(store, &record));
    }

    debug!("history: drain stopped after {} records", stored);
    stored
}

fn save<S>(store: &mut S, record: &HistoryRecord) -> bool
where
    S: HistoryStore + ?Sized,
{
    let res = match record {
        HistoryRecord::Level {
            level_db,
            signal_ok,
        } => store.save_level(*level_db, *signal_ok),
        HistoryRecord::Alert(event) => store.save_alert(event),
    };

    match res {
        Ok(()) => true,
        Err(e) => {
            warn!("history: unable to save record: {}", e);
            false
        }
    }
}
