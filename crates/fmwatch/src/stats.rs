//! Shared operational state
//!
//! All workers write through one lock. Readers take a
//! [`StatsSnapshot`], which copies every field under the lock
//! and releases it before the caller does anything else with
//! the data.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::config::ServicesConfig;
use crate::level::LEVEL_FLOOR_DB;
use crate::metadata::{MetadataRecord, MetadataState, MetadataUpdate};

/// A subsystem which can be switched on and off at runtime
///
/// Parses from its name, like `"audio_relay"`. The short
/// names `vu_meter`, `audio` and `rds` are accepted too.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum_macros::EnumIter,
    strum_macros::EnumString,
)]
pub enum Service {
    /// Level computation on the raw stream
    #[strum(serialize = "level_analysis", serialize = "vu_meter")]
    LevelAnalysis,

    /// Queueing of encoded audio for clients
    #[strum(serialize = "audio_relay", serialize = "audio")]
    AudioRelay,

    /// Automatic restart of a dead process chain
    #[strum(serialize = "watchdog")]
    Watchdog,

    /// Background metadata feed reader
    #[strum(serialize = "metadata_reader", serialize = "rds")]
    MetadataReader,

    /// Level samples sent to history
    #[strum(serialize = "history")]
    History,
}

impl Service {
    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::LevelAnalysis => "level_analysis",
            Service::AudioRelay => "audio_relay",
            Service::Watchdog => "watchdog",
            Service::MetadataReader => "metadata_reader",
            Service::History => "history",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Outcome of a toggle request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToggleResult {
    /// The service is now in the requested state
    Toggled { service: Service, enabled: bool },

    /// No service has this name
    UnknownService(String),
}

impl ToggleResult {
    /// True if the toggle was applied
    pub fn is_toggled(&self) -> bool {
        matches!(self, ToggleResult::Toggled { .. })
    }
}

/// Runtime service switches
///
/// Switching a service off only stops the *use* of its
/// results. The process chain and every reader keep running.
#[derive(Debug)]
pub struct ServiceToggles {
    level_analysis: AtomicBool,
    audio_relay: AtomicBool,
    watchdog: AtomicBool,
    metadata_reader: AtomicBool,
    history: AtomicBool,
}

impl ServiceToggles {
    fn flag(&self, service: Service) -> &AtomicBool {
        match service {
            Service::LevelAnalysis => &self.level_analysis,
            Service::AudioRelay => &self.audio_relay,
            Service::Watchdog => &self.watchdog,
            Service::MetadataReader => &self.metadata_reader,
            Service::History => &self.history,
        }
    }

    /// True if `service` is on
    pub fn is_enabled(&self, service: Service) -> bool {
        self.flag(service).load(Ordering::Acquire)
    }

    /// Switch `service`, returning its previous state
    pub fn set(&self, service: Service, enabled: bool) -> bool {
        self.flag(service).swap(enabled, Ordering::AcqRel)
    }

    /// Switch a service by name
    pub fn set_by_name(&self, name: &str, enabled: bool) -> ToggleResult {
        match Service::from_str(name) {
            Ok(service) => {
                self.set(service, enabled);
                ToggleResult::Toggled { service, enabled }
            }
            Err(_) => ToggleResult::UnknownService(name.to_owned()),
        }
    }

    /// Copy of all switches
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            level_analysis: self.is_enabled(Service::LevelAnalysis),
            audio_relay: self.is_enabled(Service::AudioRelay),
            watchdog: self.is_enabled(Service::Watchdog),
            metadata_reader: self.is_enabled(Service::MetadataReader),
            history: self.is_enabled(Service::History),
        }
    }
}

impl From<&ServicesConfig> for ServiceToggles {
    fn from(cfg: &ServicesConfig) -> Self {
        Self {
            level_analysis: AtomicBool::new(cfg.level_analysis),
            audio_relay: AtomicBool::new(cfg.audio_relay),
            watchdog: AtomicBool::new(cfg.watchdog),
            metadata_reader: AtomicBool::new(cfg.metadata_reader),
            history: AtomicBool::new(cfg.history),
        }
    }
}

/// State of every service switch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub level_analysis: bool,
    pub audio_relay: bool,
    pub watchdog: bool,
    pub metadata_reader: bool,
    pub history: bool,
}

/// Service switches plus the engine's run state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    #[serde(flatten)]
    pub services: ServiceStatus,
    pub running: bool,
}

/// Engine run state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Stopped,
    Running,
}

/// Point-in-time copy of the engine's state
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub level_db: f32,
    pub station_name: String,
    pub rolling_text: String,
    pub uptime_seconds: u64,
    pub alerts_sent_count: u64,
    pub last_alert_timestamp: Option<DateTime<Local>>,
    pub signal_ok: bool,
    pub status: MonitorStatus,
    pub service_toggles: ServiceStatus,
    pub frequency: String,
    pub started_at: Option<DateTime<Local>>,
    pub pipeline_restarts: u64,
}

#[derive(Debug)]
struct StatsState {
    level_db: f32,
    metadata: MetadataState,
    alerts_sent: u64,
    last_alert: Option<DateTime<Local>>,
    signal_ok: bool,
    status: MonitorStatus,
    started: Option<(Instant, DateTime<Local>)>,
    pipeline_restarts: u64,
}

impl Default for StatsState {
    fn default() -> Self {
        Self {
            level_db: LEVEL_FLOOR_DB,
            metadata: MetadataState::new(),
            alerts_sent: 0,
            last_alert: None,
            signal_ok: true,
            status: MonitorStatus::Stopped,
            started: None,
            pipeline_restarts: 0,
        }
    }
}

/// The single shared state record
#[derive(Debug, Default)]
pub struct Stats {
    state: Mutex<StatsState>,
}

impl Stats {
    /// Fresh record: stopped, at the level floor
    pub fn new() -> Self {
        Self::default()
    }

    // every field is valid after any partial writer, so a
    // poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, StatsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest signal level (dBFS)
    pub fn level_db(&self) -> f32 {
        self.lock().level_db
    }

    /// Publish a new signal level
    pub fn set_level_db(&self, level_db: f32) {
        self.lock().level_db = level_db;
    }

    /// True unless the signal is currently lost
    pub fn signal_ok(&self) -> bool {
        self.lock().signal_ok
    }

    /// Publish the signal state
    pub fn set_signal_ok(&self, ok: bool) {
        self.lock().signal_ok = ok;
    }

    /// Count a dispatched alert
    pub fn record_alert(&self, at: DateTime<Local>) {
        let mut st = self.lock();
        st.alerts_sent += 1;
        st.last_alert = Some(at);
    }

    /// Count a watchdog restart
    pub fn record_restart(&self) {
        self.lock().pipeline_restarts += 1;
    }

    /// Merge a metadata record into the current metadata
    pub fn apply_metadata(&self, record: &MetadataRecord) -> MetadataUpdate {
        self.lock().metadata.apply(record)
    }

    /// Overwrite the station name
    pub fn set_station_name(&self, name: &str) {
        self.lock().metadata.set_station_name(name);
    }

    /// Publish radiotext if it is longer than the current one
    pub fn offer_rolling_text(&self, text: &str) -> bool {
        self.lock().metadata.offer_rolling_text(text)
    }

    /// Mark the engine started at `now`
    pub fn mark_started(&self, now: Instant) {
        let mut st = self.lock();
        st.status = MonitorStatus::Running;
        st.started = Some((now, Local::now()));
    }

    /// Mark the engine stopped
    pub fn mark_stopped(&self) {
        self.lock().status = MonitorStatus::Stopped;
    }

    /// Copy the whole record
    ///
    /// The lock is held only while copying. `toggles` and
    /// `frequency` are not part of the locked record and are
    /// read afterwards.
    pub fn snapshot(&self, toggles: &ServiceToggles, frequency: &str) -> StatsSnapshot {
        let (mut snap, started) = {
            let st = self.lock();
            (
                StatsSnapshot {
                    level_db: st.level_db,
                    station_name: st.metadata.station_name().to_owned(),
                    rolling_text: st.metadata.rolling_text().to_owned(),
                    uptime_seconds: 0,
                    alerts_sent_count: st.alerts_sent,
                    last_alert_timestamp: st.last_alert,
                    signal_ok: st.signal_ok,
                    status: st.status,
                    service_toggles: toggles.status(),
                    frequency: String::new(),
                    started_at: st.started.map(|(_, at)| at),
                    pipeline_restarts: st.pipeline_restarts,
                },
                st.started.map(|(since, _)| since),
            )
        };

        if snap.status == MonitorStatus::Running {
            snap.uptime_seconds = started.map(|s| s.elapsed().as_secs()).unwrap_or(0);
        }
        snap.frequency = frequency.to_owned();
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    use strum::IntoEnumIterator;

    use crate::metadata::TextFlag;

    #[test]
    fn test_service_names() {
        for svc in Service::iter() {
            assert_eq!(Service::from_str(svc.as_str()), Ok(svc));
        }
        assert_eq!(Service::from_str("vu_meter"), Ok(Service::LevelAnalysis));
        assert_eq!(Service::from_str("audio"), Ok(Service::AudioRelay));
        assert_eq!(Service::from_str("rds"), Ok(Service::MetadataReader));
        assert!(Service::from_str("teleporter").is_err());
        assert_eq!(format!("{}", Service::History), "history");
    }

    #[test]
    fn test_toggles() {
        let toggles = ServiceToggles::from(&ServicesConfig::default());
        assert!(toggles.is_enabled(Service::LevelAnalysis));
        assert!(!toggles.is_enabled(Service::MetadataReader));

        assert_eq!(
            toggles.set_by_name("rds", true),
            ToggleResult::Toggled {
                service: Service::MetadataReader,
                enabled: true
            }
        );
        assert!(toggles.is_enabled(Service::MetadataReader));

        let res = toggles.set_by_name("nope", false);
        assert_eq!(res, ToggleResult::UnknownService("nope".to_owned()));
        assert!(!res.is_toggled());

        assert!(toggles.set(Service::Watchdog, false));
        let status = toggles.status();
        assert!(!status.watchdog);
        assert!(status.metadata_reader);
    }

    #[test]
    fn test_snapshot() {
        let stats = Stats::new();
        let toggles = ServiceToggles::from(&ServicesConfig::default());

        let snap = stats.snapshot(&toggles, "88.6M");
        assert_eq!(snap.level_db, LEVEL_FLOOR_DB);
        assert_eq!(snap.status, MonitorStatus::Stopped);
        assert_eq!(snap.uptime_seconds, 0);
        assert!(snap.signal_ok);
        assert_eq!(snap.frequency, "88.6M");

        stats.mark_started(Instant::now());
        stats.set_level_db(-12.5);
        stats.set_signal_ok(false);
        stats.record_alert(Local::now());
        stats.apply_metadata(&MetadataRecord {
            ps: Some("FIP".to_owned()),
            partial_radiotext: Some("Hello".to_owned()),
            rt_ab: Some(TextFlag::A),
            ..Default::default()
        });

        let snap = stats.snapshot(&toggles, "88.6M");
        assert_eq!(snap.level_db, -12.5);
        assert_eq!(snap.status, MonitorStatus::Running);
        assert!(!snap.signal_ok);
        assert_eq!(snap.alerts_sent_count, 1);
        assert!(snap.last_alert_timestamp.is_some());
        assert!(snap.started_at.is_some());
        assert_eq!(snap.station_name, "FIP");
        assert_eq!(snap.rolling_text, "Hello");

        // snapshots are copies
        stats.set_level_db(-1.0);
        assert_eq!(snap.level_db, -12.5);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = Stats::new();
        let toggles = ServiceToggles::from(&ServicesConfig::default());
        let json = serde_json::to_value(stats.snapshot(&toggles, "88.6M")).expect("json");
        assert_eq!(json["levelDb"], -100.0);
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["serviceToggles"]["audioRelay"], true);
        assert_eq!(json["lastAlertTimestamp"], serde_json::Value::Null);

        let status = EngineStatus {
            services: toggles.status(),
            running: true,
        };
        let json = serde_json::to_value(status).expect("json");
        assert_eq!(json["running"], true);
        assert_eq!(json["metadataReader"], false);
    }

    #[test]
    fn test_offer_rolling_text() {
        let stats = Stats::new();
        assert!(stats.offer_rolling_text("Hello"));
        assert!(!stats.offer_rolling_text("Hi"));
        stats.set_station_name(" FIP ");
        let toggles = ServiceToggles::from(&ServicesConfig::default());
        let snap = stats.snapshot(&toggles, "");
        assert_eq!(snap.rolling_text, "Hello");
        assert_eq!(snap.station_name, "FIP");
    }

    #[test]
    fn test_concurrent_writers() {
        let stats = Arc::new(Stats::new());
        let toggles = ServiceToggles::from(&ServicesConfig::default());
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.set_level_db(-(i as f32));
                        stats.record_alert(Local::now());
                    }
                })
            })
            .collect();
        for _ in 0..100 {
            let snap = stats.snapshot(&toggles, "");
            assert!(snap.level_db <= 0.0);
        }
        for w in writers {
            w.join().expect("join");
        }
        assert_eq!(stats.snapshot(&toggles, "").alerts_sent_count, 4000);
    }
}
