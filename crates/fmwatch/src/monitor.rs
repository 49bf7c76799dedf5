//! The monitoring engine
//!
//! A [`Monitor`] ties every component together. While it
//! runs, it owns a scoped temporary directory for the metadata
//! feed, the process chain, and these workers:
//!
//! | worker      | does                                       |
//! |-------------|--------------------------------------------|
//! | raw reader  | level analysis and fan-out                 |
//! | relay       | encoded audio into the queue               |
//! | evaluator   | silence detection and alerts               |
//! | watchdog    | restarts a dead chain                      |
//! | history     | moves records to the history store         |
//! | metadata    | merges the feed into the current metadata  |
//!
//! All methods take `&self`, so one `Monitor` may be shared
//! between threads.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tempfile::TempDir;

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

use crate::audio::AudioFrame;
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::feed::{self, FeedTail, MetadataReading, FEED_BACKLOG_LINES, FEED_POLL_INTERVAL};
use crate::history::{self, HistoryRecord, HistoryStore};
use crate::level::LEVEL_FLOOR_DB;
use crate::metadata::MetadataRecord;
use crate::signal::{Evaluation, Notifier, SignalMonitor};
use crate::stats::{EngineStatus, Service, StatsSnapshot, ToggleResult};
use crate::supervisor::{Shared, Supervisor};
use crate::watchdog;

/// Longest wait in [`Monitor::audio_frame()`]
pub const AUDIO_FRAME_TIMEOUT: Duration = Duration::from_millis(100);

/// Name of the metadata feed file in the scoped directory
pub const FEED_FILE_NAME: &str = "rds.jsonl";

/// Broadcast monitoring engine
///
/// Construct with [`new()`](Monitor::new), then
/// [`start()`](Monitor::start). Dropping a running monitor
/// stops it.
pub struct Monitor {
    config: Arc<MonitorConfig>,
    shared: Arc<Shared>,
    alerting: Arc<Mutex<Alerting>>,
    store: Arc<Mutex<Box<dyn HistoryStore>>>,
    history_rx: Receiver<HistoryRecord>,
    session: Mutex<Option<Session>>,
}

// silence detector and its notifier
struct Alerting {
    signal: SignalMonitor,
    notifier: Box<dyn Notifier>,
}

// everything which exists only while running
struct Session {
    dir: TempDir,
    feed_path: PathBuf,
    supervisor: Arc<Mutex<Supervisor>>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    metadata: Option<JoinHandle<()>>,
}

impl Monitor {
    /// New, stopped engine
    ///
    /// Alerts go to `notifier`, and level samples and alerts
    /// are recorded in `store`. Fails if `config` does not
    /// validate.
    pub fn new<N, S>(config: MonitorConfig, notifier: N, store: S) -> Result<Self>
    where
        N: Notifier + 'static,
        S: HistoryStore + 'static,
    {
        config.validate()?;

        let (history_tx, history_rx) = history::channel();
        let shared = Arc::new(Shared::new(&config, history_tx));
        let alerting = Alerting {
            signal: new_signal_monitor(&config),
            notifier: Box::new(notifier),
        };

        Ok(Self {
            config: Arc::new(config),
            shared,
            alerting: Arc::new(Mutex::new(alerting)),
            store: Arc::new(Mutex::new(Box::new(store))),
            history_rx,
            session: Mutex::new(None),
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// True between a successful `start()` and `stop()`
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Path of the metadata feed, while running
    pub fn feed_path(&self) -> Option<PathBuf> {
        self.lock_session().as_ref().map(|s| s.feed_path.clone())
    }

    /// Start monitoring
    ///
    /// Creates the scoped feed directory, spawns the process
    /// chain, and starts every worker. Fails with
    /// [`MonitorError::AlreadyRunning`] if already started, or
    /// with the spawn error if the chain cannot be started.
    /// Nothing is left running after a failure.
    pub fn start(&self) -> Result<()> {
        let mut session = self.lock_session();
        if session.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let dir = tempfile::Builder::new().prefix("fmwatch-").tempdir()?;
        let feed_path = dir.path().join(FEED_FILE_NAME);
        info!(
            "starting monitor on {} (feed {})",
            self.config.radio.frequency,
            feed_path.display()
        );

        self.shared.stats.set_level_db(LEVEL_FLOOR_DB);
        self.shared.stats.set_signal_ok(true);
        self.lock_alerting().signal = new_signal_monitor(&self.config);
        self.shared.running.store(true, Ordering::Release);

        let mut supervisor =
            Supervisor::new(self.config.clone(), self.shared.clone(), feed_path.clone());
        if let Err(e) = supervisor.start() {
            error!("unable to start pipeline: {}", e);
            self.shared.running.store(false, Ordering::Release);
            return Err(e);
        }

        let mut new_session = Session {
            dir,
            feed_path,
            supervisor: Arc::new(Mutex::new(supervisor)),
            workers: Vec::with_capacity(3),
            metadata: None,
        };

        if let Err(e) = self.spawn_workers(&mut new_session) {
            error!("unable to start workers: {}", e);
            self.shutdown(new_session);
            return Err(e);
        }

        self.shared.stats.mark_started(Instant::now());
        *session = Some(new_session);
        info!("monitor started");
        Ok(())
    }

    /// Stop monitoring
    ///
    /// Terminates the process chain, joins every worker, and
    /// removes the scoped feed directory. Idempotent.
    ///
    /// An alert which is being delivered is allowed to finish
    /// and is recorded in history. `stop()` may therefore block
    /// for as long as the notifier takes, which is up to
    /// [`CommandNotifier::DEFAULT_TIMEOUT`](crate::CommandNotifier::DEFAULT_TIMEOUT)
    /// for an alert hook.
    pub fn stop(&self) {
        let mut session = self.lock_session();
        if let Some(s) = session.take() {
            info!("stopping monitor");
            self.shutdown(s);
            info!("monitor stopped");
        }
    }

    /// Current statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.shared
            .stats
            .snapshot(&self.shared.toggles, &self.config.radio.frequency)
    }

    /// Next frame of encoded audio
    ///
    /// Waits at most [`AUDIO_FRAME_TIMEOUT`]. Returns `None` on
    /// timeout or while the audio relay is switched off.
    pub fn audio_frame(&self) -> Option<AudioFrame> {
        if !self.shared.toggles.is_enabled(Service::AudioRelay) {
            return None;
        }
        self.shared.audio.next_frame(AUDIO_FRAME_TIMEOUT)
    }

    /// Service switches and run state
    pub fn service_status(&self) -> EngineStatus {
        EngineStatus {
            services: self.shared.toggles.status(),
            running: self.is_running(),
        }
    }

    /// Switch a service on or off by name
    ///
    /// Switching the metadata reader on while running starts
    /// it if it is not running already. Switching the audio
    /// relay off discards any queued audio.
    pub fn toggle_service(&self, name: &str, enabled: bool) -> ToggleResult {
        let res = self.shared.toggles.set_by_name(name, enabled);
        let service = match &res {
            ToggleResult::Toggled { service, .. } => *service,
            ToggleResult::UnknownService(name) => {
                warn!("toggle for unknown service \"{}\"", name);
                return res;
            }
        };
        info!(
            "service {} {}",
            service,
            if enabled { "enabled" } else { "disabled" }
        );

        match (service, enabled) {
            (Service::AudioRelay, false) => self.shared.audio.clear(),
            (Service::MetadataReader, true) => {
                let mut session = self.lock_session();
                if let Some(s) = session.as_mut() {
                    if let Err(e) = self.ensure_metadata_reader(s) {
                        error!("unable to start metadata reader: {}", e);
                    }
                }
            }
            _ => {}
        }
        res
    }

    /// Read the metadata feed for at most `duration`
    ///
    /// Returns as soon as both a station name and a radiotext
    /// have been seen. Anything found is also merged into the
    /// current statistics. Fails with
    /// [`MonitorError::FeedUnavailable`] if the engine is not
    /// running.
    pub fn read_metadata_once(&self, duration: Duration) -> Result<MetadataReading> {
        let path = self.feed_path().ok_or(MonitorError::FeedUnavailable)?;
        let reading = feed::read_once(&path, duration)?;

        if let Some(name) = &reading.station_name {
            self.shared.stats.set_station_name(name);
        }
        if let Some(text) = &reading.rolling_text {
            self.shared.stats.offer_rolling_text(text);
        }
        Ok(reading)
    }

    fn spawn_workers(&self, session: &mut Session) -> Result<()> {
        let shared = self.shared.clone();
        let alerting = self.alerting.clone();
        let interval = self.config.evaluate_interval();
        session.workers.push((
            "evaluator",
            thread::Builder::new()
                .name("fmwatch-evaluator".to_owned())
                .spawn(move || evaluate_signal(&shared, &alerting, interval))?,
        ));

        let shared = self.shared.clone();
        let supervisor = session.supervisor.clone();
        let period = self.config.watchdog_period();
        session.workers.push((
            "watchdog",
            thread::Builder::new()
                .name("fmwatch-watchdog".to_owned())
                .spawn(move || {
                    watchdog::run(&*supervisor, &shared.running, period, || {
                        shared.toggles.is_enabled(Service::Watchdog)
                    });
                })?,
        ));

        let shared = self.shared.clone();
        let store = self.store.clone();
        let rx = self.history_rx.clone();
        session.workers.push((
            "history",
            thread::Builder::new()
                .name("fmwatch-history".to_owned())
                .spawn(move || {
                    let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
                    history::drain(&rx, &mut *store, &shared.running);
                })?,
        ));

        if self.shared.toggles.is_enabled(Service::MetadataReader) {
            self.ensure_metadata_reader(session)?;
        }
        Ok(())
    }

    // Start the metadata reader unless it is already running.
    // Once started, it lives until the session ends.
    fn ensure_metadata_reader(&self, session: &mut Session) -> Result<()> {
        if session.metadata.is_some() {
            debug!("metadata reader already running");
            return Ok(());
        }

        let shared = self.shared.clone();
        let feed_path = session.feed_path.clone();
        session.metadata = Some(
            thread::Builder::new()
                .name("fmwatch-metadata".to_owned())
                .spawn(move || read_metadata(&shared, &feed_path))?,
        );
        Ok(())
    }

    // Tear down a session, in dependency order
    fn shutdown(&self, mut session: Session) {
        self.shared.running.store(false, Ordering::Release);

        // the watchdog must be gone before the chain is stopped
        // so that it cannot start another one
        let mut history_worker = None;
        for (name, worker) in session.workers.drain(..) {
            if name == "history" {
                history_worker = Some(worker);
                continue;
            }
            join_worker(name, worker);
        }
        if let Some(worker) = session.metadata.take() {
            join_worker("metadata", worker);
        }

        session
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();

        if let Some(worker) = history_worker {
            join_worker("history", worker);
        }

        self.shared.stats.mark_stopped();
        if let Err(e) = session.dir.close() {
            warn!("unable to remove feed directory: {}", e);
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_alerting(&self) -> MutexGuard<'_, Alerting> {
        self.alerting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("frequency", &self.config.radio.frequency)
            .field("running", &self.is_running())
            .finish()
    }
}

fn new_signal_monitor(config: &MonitorConfig) -> SignalMonitor {
    SignalMonitor::new(config.audio.silence_threshold_db, config.silence_duration())
        .with_recovery_notification(config.alerts.notify_recovery)
}

fn join_worker(name: &str, worker: JoinHandle<()>) {
    if worker.join().is_err() {
        error!("{} worker panicked", name);
    }
}

// Evaluate the signal level on a fixed cadence
//
// Evaluation pauses while level analysis is switched off,
// since the level would be stale.
fn evaluate_signal(shared: &Shared, alerting: &Mutex<Alerting>, interval: Duration) {
    debug!("evaluator started");
    while watchdog::sleep_while_running(&shared.running, interval) {
        if !shared.toggles.is_enabled(Service::LevelAnalysis) {
            continue;
        }

        let level_db = shared.stats.level_db();
        // held for the whole delivery; stop() waits for it
        let mut guard = alerting.lock().unwrap_or_else(PoisonError::into_inner);
        let Alerting { signal, notifier } = &mut *guard;
        let eval = signal.evaluate(level_db, Instant::now(), notifier);
        let signal_ok = signal.state().is_ok();
        drop(guard);

        shared.stats.set_signal_ok(signal_ok);
        match eval {
            Evaluation::AlertDispatched(event) => {
                shared.stats.record_alert(event.timestamp);
                history::post_alert(&shared.history, event);
            }
            Evaluation::Recovered(Some(event)) => {
                if event.notified {
                    shared.stats.record_alert(event.timestamp);
                }
                history::post_alert(&shared.history, event);
            }
            _ => {}
        }
    }
    debug!("evaluator stopped");
}

// Tail the metadata feed while the service is switched on
fn read_metadata(shared: &Shared, feed_path: &Path) {
    info!("metadata reader started");
    let mut feed = FeedFollower::new(feed_path);

    while shared.is_running() {
        if !shared.toggles.is_enabled(Service::MetadataReader) {
            feed.pause();
            thread::sleep(FEED_POLL_INTERVAL);
            continue;
        }

        let line = match feed.next_line(shared.generation()) {
            Ok(Some(line)) => line,
            Ok(None) => {
                thread::sleep(FEED_POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                warn!("metadata feed read failed: {}", e);
                thread::sleep(FEED_POLL_INTERVAL);
                continue;
            }
        };

        match MetadataRecord::parse(&line) {
            Ok(record) => {
                let update = shared.stats.apply_metadata(&record);
                if update.station_name || update.rolling_text {
                    debug!("metadata updated: {:?}", update);
                }
            }
            Err(e) => debug!("skipping metadata line: {}", e),
        }
    }
    info!("metadata reader stopped");
}

// Metadata feed as seen across pipeline restarts
//
// Every chain generation starts the feed over. A paused
// follower rejoins at the recent end of the feed.
#[derive(Debug)]
struct FeedFollower {
    path: PathBuf,
    tail: Option<FeedTail>,
    generation: u64,
}

impl FeedFollower {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            tail: None,
            generation: 0,
        }
    }

    fn pause(&mut self) {
        self.tail = None;
    }

    // Next line written by chain `generation`
    fn next_line(&mut self, generation: u64) -> io::Result<Option<String>> {
        if self.tail.is_none() {
            self.tail = Some(FeedTail::new(&self.path).with_backlog(FEED_BACKLOG_LINES));
            self.generation = generation;
        }
        let tail = match self.tail.as_mut() {
            Some(tail) => tail,
            None => return Ok(None),
        };

        if generation != self.generation {
            info!("pipeline generation {}: reading feed from the start", generation);
            tail.rewind();
            self.generation = generation;
        }
        tail.next_line()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::history::NullStore;
    use crate::signal::{AlertEvent, AlertKind};
    use crate::stats::MonitorStatus;

    #[derive(Debug, Clone, Default)]
    struct Counter(Arc<AtomicUsize>);

    impl Notifier for Counter {
        fn send_alert(&mut self, _kind: AlertKind, _details: &str) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<AlertEvent>>>);

    impl HistoryStore for Recorder {
        fn save_level(&mut self, _level_db: f32, _signal_ok: bool) -> Result<()> {
            Ok(())
        }

        fn save_alert(&mut self, event: &AlertEvent) -> Result<()> {
            self.0.lock().expect("lock").push(event.clone());
            Ok(())
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    // silent capture; decoder emits a station name and radiotext
    fn test_config() -> MonitorConfig {
        let mut cfg = MonitorConfig::default();
        cfg.pipeline.capture_command = sh("exec cat /dev/zero");
        cfg.pipeline.decoder_command = sh(concat!(
            "printf '%s\\n' '{\"ps\":\"FIP\"}' 'garbage' ",
            "'{\"partial_radiotext\":\"Hello\",\"rt_ab\":\"A\"}'; ",
            "exec cat > /dev/null"
        ));
        cfg.pipeline.encoder_command = vec!["cat".to_owned()];
        cfg.audio.silence_duration_secs = 1;
        cfg.timing.evaluate_interval_ms = 50;
        cfg.timing.restart_settle_ms = 10;
        cfg
    }

    fn wait_for<F>(mut cond: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_invalid_config() {
        let mut cfg = MonitorConfig::default();
        cfg.audio.silence_duration_secs = 0;
        assert!(matches!(
            Monitor::new(cfg, Counter::default(), NullStore::default()),
            Err(MonitorError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_lifecycle() {
        let mon = Monitor::new(test_config(), Counter::default(), NullStore::default())
            .expect("new");
        assert!(!mon.is_running());
        assert!(!mon.service_status().running);
        assert_eq!(mon.stats().status, MonitorStatus::Stopped);

        mon.start().expect("start");
        assert!(mon.is_running());
        assert!(matches!(mon.start(), Err(MonitorError::AlreadyRunning)));

        let feed = mon.feed_path().expect("feed path");
        let dir = feed.parent().expect("dir").to_owned();
        assert!(dir.exists());

        let snap = mon.stats();
        assert_eq!(snap.status, MonitorStatus::Running);
        assert_eq!(snap.frequency, "88.6M");
        assert!(mon.service_status().running);
        assert!(wait_for(|| mon.audio_frame().is_some()));

        mon.stop();
        assert!(!mon.is_running());
        assert!(!dir.exists());
        assert_eq!(mon.stats().status, MonitorStatus::Stopped);
        assert!(mon.feed_path().is_none());
        mon.stop();

        // and again
        mon.start().expect("restart");
        mon.stop();
    }

    #[test]
    fn test_start_failure() {
        let mut cfg = test_config();
        cfg.pipeline.capture_command = vec!["/nonexistent/fmwatch-capture".to_owned()];
        let mon = Monitor::new(cfg, Counter::default(), NullStore::default()).expect("new");
        assert!(matches!(mon.start(), Err(MonitorError::Spawn { .. })));
        assert!(!mon.is_running());
        assert!(mon.feed_path().is_none());
    }

    #[test]
    fn test_silence_alert() {
        let notifier = Counter::default();
        let store = Recorder::default();
        let mon = Monitor::new(test_config(), notifier.clone(), store.clone()).expect("new");
        mon.start().expect("start");

        assert!(wait_for(|| mon.stats().alerts_sent_count == 1));
        let snap = mon.stats();
        assert!(!snap.signal_ok);
        assert!(snap.last_alert_timestamp.is_some());
        assert_eq!(snap.level_db, LEVEL_FLOOR_DB);

        // one alert per episode
        thread::sleep(Duration::from_millis(300));
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);

        mon.stop();
        let alerts = store.0.lock().expect("lock").clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SignalLost);
        assert!(alerts[0].notified);
    }

    #[test]
    fn test_stop_waits_for_alert_in_flight() {
        #[derive(Debug, Clone, Default)]
        struct SlowNotifier {
            entered: Arc<AtomicUsize>,
            delivered: Arc<AtomicUsize>,
        }

        impl Notifier for SlowNotifier {
            fn send_alert(&mut self, _kind: AlertKind, _details: &str) -> bool {
                self.entered.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(500));
                self.delivered.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let notifier = SlowNotifier::default();
        let store = Recorder::default();
        let mon = Monitor::new(test_config(), notifier.clone(), store.clone()).expect("new");
        mon.start().expect("start");

        assert!(wait_for(|| notifier.entered.load(Ordering::SeqCst) == 1));
        mon.stop();

        assert_eq!(notifier.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(mon.stats().alerts_sent_count, 1);
        assert_eq!(store.0.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_toggles() {
        let mon = Monitor::new(test_config(), Counter::default(), NullStore::default())
            .expect("new");
        assert_eq!(
            mon.toggle_service("flux_capacitor", true),
            ToggleResult::UnknownService("flux_capacitor".to_owned())
        );

        mon.start().expect("start");
        assert!(wait_for(|| mon.shared.audio.len() > 2));

        let res = mon.toggle_service("audio_relay", false);
        assert_eq!(
            res,
            ToggleResult::Toggled {
                service: Service::AudioRelay,
                enabled: false
            }
        );
        assert!(mon.shared.audio.len() <= 1);
        assert!(mon.audio_frame().is_none());
        assert!(!mon.service_status().services.audio_relay);

        // the chain keeps running with the relay off; at most
        // one read already in flight may still land
        thread::sleep(Duration::from_millis(200));
        assert!(mon.shared.audio.len() <= 1);
        assert!(mon.is_running());

        assert!(mon.toggle_service("audio", true).is_toggled());
        assert!(wait_for(|| mon.audio_frame().is_some()));
        mon.stop();
    }

    #[test]
    fn test_metadata_reader_toggle() {
        let mon = Monitor::new(test_config(), Counter::default(), NullStore::default())
            .expect("new");
        mon.start().expect("start");

        // off by default
        thread::sleep(Duration::from_millis(300));
        assert_eq!(mon.stats().station_name, "");

        assert!(mon.toggle_service("metadata_reader", true).is_toggled());
        assert!(mon.toggle_service("rds", true).is_toggled());
        assert!(wait_for(|| {
            let snap = mon.stats();
            snap.station_name == "FIP" && snap.rolling_text == "Hello"
        }));
        mon.stop();
    }

    #[test]
    fn test_read_metadata_once() {
        let mon = Monitor::new(test_config(), Counter::default(), NullStore::default())
            .expect("new");
        assert!(matches!(
            mon.read_metadata_once(Duration::from_millis(10)),
            Err(MonitorError::FeedUnavailable)
        ));

        mon.start().expect("start");
        let mut reading = MetadataReading::default();
        assert!(wait_for(|| {
            reading = mon
                .read_metadata_once(Duration::from_millis(500))
                .expect("read");
            reading.is_complete()
        }));
        assert_eq!(reading.station_name.as_deref(), Some("FIP"));
        assert_eq!(reading.rolling_text.as_deref(), Some("Hello"));

        // merged into the statistics
        let snap = mon.stats();
        assert_eq!(snap.station_name, "FIP");
        assert_eq!(snap.rolling_text, "Hello");
        mon.stop();
    }

    #[test]
    fn test_watchdog_restarts_dead_chain() {
        let mut cfg = test_config();
        cfg.pipeline.capture_command = sh("head -c 100000 /dev/zero");
        cfg.timing.watchdog_period_secs = 1;
        let mon = Monitor::new(cfg, Counter::default(), NullStore::default()).expect("new");
        mon.start().expect("start");

        assert!(wait_for(|| mon.stats().pipeline_restarts >= 1));
        assert!(mon.is_running());
        mon.stop();
    }

    #[test]
    fn test_watchdog_disabled() {
        let mut cfg = test_config();
        cfg.pipeline.capture_command = sh("head -c 100000 /dev/zero");
        cfg.timing.watchdog_period_secs = 1;
        cfg.services.watchdog = false;
        let mon = Monitor::new(cfg, Counter::default(), NullStore::default()).expect("new");
        mon.start().expect("start");

        thread::sleep(Duration::from_millis(2500));
        assert_eq!(mon.stats().pipeline_restarts, 0);
        mon.stop();
    }

    #[test]
    fn test_feed_follower_restart_and_pause() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(FEED_FILE_NAME);
        std::fs::write(&path, "{\"ps\":\"GEN1\"}\n").expect("write");

        let mut feed = FeedFollower::new(&path);
        assert_eq!(
            feed.next_line(1).expect("read").as_deref(),
            Some("{\"ps\":\"GEN1\"}")
        );
        assert_eq!(feed.next_line(1).expect("read"), None);

        // the next chain writes past the old offset before we look
        std::fs::write(&path, "{\"ps\":\"GEN2-STATION\"}\n{\"ps\":\"GEN2-B\"}\n")
            .expect("write");
        assert_eq!(
            feed.next_line(2).expect("read").as_deref(),
            Some("{\"ps\":\"GEN2-STATION\"}")
        );
        assert_eq!(
            feed.next_line(2).expect("read").as_deref(),
            Some("{\"ps\":\"GEN2-B\"}")
        );

        // rejoining after a pause skips the old lines
        feed.pause();
        let text: String = (0..20).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, text).expect("write");
        assert_eq!(feed.next_line(2).expect("read").as_deref(), Some("line 10"));
    }
}
