//! Process chain supervision
//!
//! The [`Supervisor`] owns at most one [`PipelineHandle`] at a
//! time, along with the two workers which read its outputs:
//!
//! - the *raw reader* measures the signal level and feeds the
//!   downstream stages through the fan-out;
//! - the *audio relay* moves encoded audio into the queue.
//!
//! Both workers end by themselves when their stream closes,
//! which happens when the chain is terminated.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ChildStdout;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Sender;

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

use crate::audio::{self, AudioQueue};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::history::{self, HistoryRecord};
use crate::level::LevelMeter;
use crate::pipeline::{FanOut, PipelineHandle, PipelineOutputs, Stage};
use crate::stats::{Service, ServiceToggles, Stats};

/// State shared by every worker
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) stats: Stats,
    pub(crate) toggles: ServiceToggles,
    pub(crate) audio: AudioQueue,
    pub(crate) history: Sender<HistoryRecord>,
    pub(crate) running: AtomicBool,
    generation: AtomicU64,
}

impl Shared {
    pub(crate) fn new(cfg: &MonitorConfig, history: Sender<HistoryRecord>) -> Self {
        Self {
            stats: Stats::new(),
            toggles: ServiceToggles::from(&cfg.services),
            audio: AudioQueue::new(),
            history,
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Generation of the most recently spawned process chain
    ///
    /// Changes whenever the metadata feed has been started over.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Something the watchdog can check and restart
pub trait Supervise {
    /// True if the supervised chain is running normally
    fn is_alive(&mut self) -> bool;

    /// Tear down the chain, if any, and start a fresh one
    fn restart(&mut self) -> Result<()>;
}

/// Owner of the process chain and its readers
#[derive(Debug)]
pub(crate) struct Supervisor {
    config: Arc<MonitorConfig>,
    shared: Arc<Shared>,
    feed_path: PathBuf,
    generation: u64,
    current: Option<Generation>,
}

#[derive(Debug)]
struct Generation {
    handle: PipelineHandle,
    workers: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// New supervisor; nothing is started yet
    ///
    /// The metadata decoder will write to `feed_path`.
    pub(crate) fn new(config: Arc<MonitorConfig>, shared: Arc<Shared>, feed_path: PathBuf) -> Self {
        Self {
            config,
            shared,
            feed_path,
            generation: 0,
            current: None,
        }
    }

    /// Start the process chain and its readers
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.current.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let generation = self.generation + 1;
        let (handle, outputs) = PipelineHandle::spawn(&self.config, &self.feed_path, generation)?;
        self.generation = generation;
        self.shared.generation.store(generation, Ordering::Release);

        let PipelineOutputs {
            raw,
            fanout,
            encoded,
        } = outputs;

        let mut workers = Vec::with_capacity(2);

        let shared = self.shared.clone();
        let config = self.config.clone();
        workers.push(
            thread::Builder::new()
                .name("fmwatch-raw".to_owned())
                .spawn(move || read_raw(raw, fanout, &shared, &config))?,
        );

        let shared = self.shared.clone();
        let read_size = self.config.timing.audio_read_bytes;
        workers.push(
            thread::Builder::new()
                .name("fmwatch-relay".to_owned())
                .spawn(move || relay_audio(encoded, &shared, read_size))?,
        );

        self.current = Some(Generation { handle, workers });
        Ok(())
    }

    /// Terminate the process chain and join its readers
    ///
    /// Idempotent.
    pub(crate) fn stop(&mut self) {
        if let Some(mut gen) = self.current.take() {
            info!(
                "stopping pipeline generation {} (started {}, up {} s)",
                gen.handle.generation(),
                gen.handle.started_at().format("%H:%M:%S"),
                gen.handle.age().as_secs()
            );
            gen.handle.terminate();
            for worker in gen.workers.drain(..) {
                if worker.join().is_err() {
                    error!("pipeline reader thread panicked");
                }
            }
        }
    }
}

impl Supervise for Supervisor {
    fn is_alive(&mut self) -> bool {
        match self.current.as_mut() {
            Some(gen) => gen.handle.is_alive(),
            None => false,
        }
    }

    fn restart(&mut self) -> Result<()> {
        info!("restarting pipeline");
        self.stop();
        thread::sleep(self.config.restart_settle());
        self.start()?;
        self.shared.stats.record_restart();
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

// Read the raw stream until it closes
//
// Every chunk goes to the fan-out. The level is computed only
// while level analysis is enabled, but reading never stops.
fn read_raw(mut raw: ChildStdout, mut fanout: FanOut, shared: &Shared, config: &MonitorConfig) {
    let history_interval = config.history_interval();
    let mut meter = LevelMeter::new();
    let mut buf = vec![0u8; config.timing.level_chunk_bytes];
    let mut last_history: Option<Instant> = None;

    debug!("raw reader started");
    while shared.is_running() {
        let n = match raw.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("raw stream read failed: {}", e);
                break;
            }
        };
        let chunk = &buf[..n];
        fanout.offer(chunk);

        if !shared.toggles.is_enabled(Service::LevelAnalysis) {
            meter.reset();
            continue;
        }

        let level_db = match meter.measure(chunk) {
            Some(level_db) => level_db,
            None => continue,
        };
        shared.stats.set_level_db(level_db);

        if !shared.toggles.is_enabled(Service::History) {
            continue;
        }
        let now = Instant::now();
        if last_history.map_or(true, |t| now.duration_since(t) >= history_interval) {
            history::post_level(&shared.history, level_db, shared.stats.signal_ok());
            last_history = Some(now);
        }
    }
    debug!(
        "raw reader stopped; chunks dropped: {} decoder, {} encoder",
        fanout.dropped(Stage::Decoder),
        fanout.dropped(Stage::Encoder)
    );
}

fn relay_audio(encoded: ChildStdout, shared: &Shared, read_size: usize) {
    if let Err(e) = audio::relay(
        encoded,
        &shared.audio,
        &shared.toggles,
        &shared.running,
        read_size,
    ) {
        warn!("encoded audio read failed: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::level::LEVEL_FLOOR_DB;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    fn setup(cfg: MonitorConfig) -> (Supervisor, Arc<Shared>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, _rx) = history::channel();
        let shared = Arc::new(Shared::new(&cfg, tx));
        shared.running.store(true, Ordering::Release);
        let sup = Supervisor::new(Arc::new(cfg), shared.clone(), dir.path().join("rds.jsonl"));
        (sup, shared, dir)
    }

    fn wait_for<F>(mut cond: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn loud_chain() -> MonitorConfig {
        let mut cfg = MonitorConfig::default();
        // 0x7f7f is a loud, constant sample
        cfg.pipeline.capture_command =
            sh("exec tr '\\000' '\\177' < /dev/zero");
        cfg.pipeline.decoder_command = sh("exec cat > /dev/null");
        cfg.pipeline.encoder_command = vec!["cat".to_owned()];
        cfg.timing.restart_settle_ms = 10;
        cfg
    }

    #[test]
    fn test_level_and_audio() {
        let (mut sup, shared, _dir) = setup(loud_chain());
        sup.start().expect("start");
        assert!(sup.current.is_some());
        assert!(matches!(sup.start(), Err(MonitorError::AlreadyRunning)));

        assert!(wait_for(|| shared.stats.level_db() > -1.0));
        assert!(wait_for(|| !shared.audio.is_empty()));
        assert!(sup.is_alive());

        sup.stop();
        assert!(sup.current.is_none());
        assert!(!sup.is_alive());
        sup.stop();
    }

    #[test]
    fn test_level_analysis_disabled_keeps_draining() {
        let (mut sup, shared, _dir) = setup(loud_chain());
        shared.toggles.set(Service::LevelAnalysis, false);
        sup.start().expect("start");

        // audio still flows, so the raw stream is being read
        assert!(wait_for(|| shared.audio.len() > 10));
        assert_eq!(shared.stats.level_db(), LEVEL_FLOOR_DB);
        sup.stop();
    }

    #[test]
    fn test_restart() {
        let (mut sup, shared, _dir) = setup(loud_chain());
        sup.start().expect("start");
        sup.restart().expect("restart");
        assert!(sup.is_alive());
        assert_eq!(sup.generation, 2);
        assert_eq!(shared.generation(), 2);
        assert_eq!(
            shared
                .stats
                .snapshot(&shared.toggles, "")
                .pipeline_restarts,
            1
        );
        sup.stop();
    }

    #[test]
    fn test_spawn_failure() {
        let mut cfg = loud_chain();
        cfg.pipeline.capture_command = vec!["/nonexistent/fmwatch-capture".to_owned()];
        let (mut sup, _shared, _dir) = setup(cfg);
        assert!(matches!(sup.start(), Err(MonitorError::Spawn { .. })));
        assert!(sup.current.is_none());
    }
}
