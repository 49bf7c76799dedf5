//! # fmwatch: FM Broadcast Signal Monitoring
//!
//! This crate watches one broadcast FM station around the
//! clock. It supervises a chain of external programs which
//! capture and demodulate the station with a software-defined
//! radio, then:
//!
//! * measures the signal level of the demodulated audio;
//! * raises an alert when the station has been silent for
//!   too long;
//! * relays the encoded audio to streaming clients; and
//! * reconstructs the station name and radiotext (RDS) from
//!   the decoder's partial, line-oriented output.
//!
//! The external programs are `rtl_fm`, `redsea`, and `sox` by
//! default. Each can be replaced in the configuration.
//!
//! ## Disclaimer
//!
//! This crate is dual-licensed MIT and Apache 2.0. Read these
//! licenses carefully as they may affect your rights.
//!
//! Signal-loss detection is best-effort. Alerts may be late or
//! lost. Do not rely on this crate as your only means of
//! monitoring a transmitter.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use fmwatch::{CooldownNotifier, LogNotifier, Monitor, MonitorConfig, NullStore};
//!
//! let mut config = MonitorConfig::default();
//! config.radio.frequency = "88.6M".to_owned();
//!
//! // at most one alert of each kind every 30 minutes
//! let notifier = CooldownNotifier::new(LogNotifier::default(), config.cooldown());
//!
//! let monitor = Monitor::new(config, notifier, NullStore::default())?;
//! monitor.start()?;
//!
//! let stats = monitor.stats();
//! println!("{} dBFS, signal ok: {}", stats.level_db, stats.signal_ok);
//!
//! let reading = monitor.read_metadata_once(Duration::from_secs(10))?;
//! println!("station: {:?}", reading.station_name);
//!
//! if let Some(frame) = monitor.audio_frame() {
//!     println!("{} bytes of audio", frame.len());
//! }
//!
//! monitor.stop();
//! # Ok::<(), fmwatch::MonitorError>(())
//! ```
//!
//! ## Services
//!
//! Several subsystems can be switched off and on at runtime
//! with [`Monitor::toggle_service()`]. A switched-off service
//! stops *using* its data, but the process chain and every
//! reader keep running, so nothing upstream ever stalls.
//!
//! | name              | aliases    | default |
//! |-------------------|------------|---------|
//! | `level_analysis`  | `vu_meter` | on      |
//! | `audio_relay`     | `audio`    | on      |
//! | `watchdog`        |            | on      |
//! | `metadata_reader` | `rds`      | off     |
//! | `history`         |            | on      |

mod audio;
mod config;
mod error;
mod feed;
mod history;
mod level;
mod metadata;
mod monitor;
mod notify;
mod pipeline;
mod signal;
mod stats;
mod supervisor;
mod sys;
mod watchdog;

pub use audio::{AudioFrame, AudioQueue, AUDIO_QUEUE_CAPACITY};
pub use config::{
    AlertConfig, AudioConfig, MonitorConfig, PipelineConfig, RadioConfig, ServicesConfig,
    TimingConfig,
};
pub use error::{MonitorError, Result};
pub use feed::{read_once, FeedTail, MetadataReading, FEED_BACKLOG_LINES};
pub use history::{HistoryRecord, HistoryStore, JsonLinesStore, NullStore};
pub use level::{rms_dbfs, LevelMeter, LEVEL_FLOOR_DB};
pub use metadata::{FeedParseErr, MetadataRecord, MetadataState, MetadataUpdate, TextFlag};
pub use monitor::{Monitor, AUDIO_FRAME_TIMEOUT};
pub use notify::{hookenv, CommandNotifier, CooldownNotifier, LogNotifier};
pub use pipeline::Stage;
pub use signal::{AlertEvent, AlertKind, Evaluation, Notifier, SignalMonitor, SignalState};
pub use stats::{
    EngineStatus, MonitorStatus, Service, ServiceStatus, ServiceToggles, StatsSnapshot,
    ToggleResult,
};
pub use supervisor::Supervise;
pub use watchdog::{check as watchdog_check, WatchdogOutcome};
