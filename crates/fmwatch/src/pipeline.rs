//! External process chain
//!
//! Three programs cooperate to turn the radio into data:
//!
//! ```txt
//!                                 +-----------+
//!                          +====> |  decoder  | ====> metadata feed file
//! +-----------+   raw PCM  |      +-----------+
//! |  capture  | ===> engine
//! +-----------+            |      +-----------+
//!                          +====> |  encoder  | ====> encoded audio
//!                                 +-----------+
//! ```
//!
//! The engine reads the capture stage itself and duplicates
//! every chunk into one bounded branch per downstream stage.
//! A writer thread copies each branch into its stage's
//! standard input. When a stage cannot keep up, its branch
//! fills and further chunks are dropped for that stage only.
//! The capture stage is never slowed down by its consumers.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

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

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::sys;

/// Capacity of each fan-out branch, in chunks
pub const FANOUT_CAPACITY: usize = 64;

/// Time allowed for a stage to exit after `SIGTERM`
pub const TERMINATE_GRACE: Duration = Duration::from_millis(1500);

const WRITER_POLL: Duration = Duration::from_millis(100);

/// A stage of the process chain
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::AsRefStr, strum_macros::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    /// Radio capture and demodulation; emits raw PCM
    Capture,

    /// Metadata decoder; emits JSON lines
    Decoder,

    /// Audio encoder; emits a compressed stream
    Encoder,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

/// Command line for the capture stage
///
/// `pipeline.capture_command`, if set, is used verbatim.
pub fn capture_argv(cfg: &MonitorConfig) -> Vec<String> {
    if !cfg.pipeline.capture_command.is_empty() {
        return cfg.pipeline.capture_command.clone();
    }

    let rate = cfg.radio.capture_rate.to_string();
    vec![
        cfg.pipeline.capture_program.clone(),
        "-f".to_owned(),
        cfg.radio.frequency.clone(),
        "-M".to_owned(),
        "wbfm".to_owned(),
        "-s".to_owned(),
        rate.clone(),
        "-r".to_owned(),
        rate,
        "-g".to_owned(),
        cfg.radio.gain.to_string(),
        "-p".to_owned(),
        cfg.radio.ppm_error.to_string(),
        "-A".to_owned(),
        "fast".to_owned(),
        "-".to_owned(),
    ]
}

/// Command line for the metadata decoder stage
///
/// `pipeline.decoder_command`, if set, is used verbatim.
pub fn decoder_argv(cfg: &MonitorConfig) -> Vec<String> {
    if !cfg.pipeline.decoder_command.is_empty() {
        return cfg.pipeline.decoder_command.clone();
    }

    vec![
        cfg.pipeline.decoder_program.clone(),
        "-r".to_owned(),
        cfg.radio.capture_rate.to_string(),
        "-p".to_owned(),
    ]
}

/// Command line for the audio encoder stage
///
/// `pipeline.encoder_command`, if set, is used verbatim.
pub fn encoder_argv(cfg: &MonitorConfig) -> Vec<String> {
    if !cfg.pipeline.encoder_command.is_empty() {
        return cfg.pipeline.encoder_command.clone();
    }

    vec![
        cfg.pipeline.encoder_program.clone(),
        "-t".to_owned(),
        "raw".to_owned(),
        "-r".to_owned(),
        cfg.radio.capture_rate.to_string(),
        "-e".to_owned(),
        "signed".to_owned(),
        "-b".to_owned(),
        "16".to_owned(),
        "-c".to_owned(),
        "1".to_owned(),
        "-".to_owned(),
        "-t".to_owned(),
        "mp3".to_owned(),
        "-r".to_owned(),
        cfg.audio.output_rate.to_string(),
        "-C".to_owned(),
        cfg.audio.bitrate_kbps.to_string(),
        "-".to_owned(),
    ]
}

/// Duplicates the raw stream to the downstream stages
///
/// Owned by the raw stream reader. Dropping it closes the
/// standard input of every downstream stage.
#[derive(Debug)]
pub struct FanOut {
    branches: Vec<Branch>,
}

#[derive(Debug)]
struct Branch {
    stage: Stage,
    tx: Sender<Arc<[u8]>>,
    dropped: u64,
}

impl FanOut {
    /// Offer a chunk of raw samples to every stage
    ///
    /// Never blocks. A stage whose branch is full misses this
    /// chunk. A stage which has exited is skipped.
    pub fn offer(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        let shared: Arc<[u8]> = Arc::from(chunk);
        for branch in &mut self.branches {
            match branch.tx.try_send(shared.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    branch.dropped += 1;
                    trace!(
                        "{} stage is behind; chunk dropped ({} total)",
                        branch.stage,
                        branch.dropped
                    );
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    /// Chunks dropped so far for `stage`
    pub fn dropped(&self, stage: Stage) -> u64 {
        self.branches
            .iter()
            .find(|b| b.stage == stage)
            .map(|b| b.dropped)
            .unwrap_or(0)
    }
}

/// Streams produced by a freshly-spawned chain
#[derive(Debug)]
pub struct PipelineOutputs {
    /// Raw PCM from the capture stage
    pub raw: ChildStdout,

    /// Feeds the downstream stages
    pub fanout: FanOut,

    /// Compressed audio from the encoder stage
    pub encoded: ChildStdout,
}

/// A running process chain
///
/// At most one exists at a time, since the capture device is
/// exclusive. Dropping the handle terminates the chain.
#[derive(Debug)]
pub struct PipelineHandle {
    generation: u64,
    started_at: DateTime<Local>,
    started: Instant,
    children: Vec<(Stage, Child)>,
    writers: Vec<JoinHandle<()>>,
    feeding: Arc<AtomicBool>,
}

impl PipelineHandle {
    /// Spawn the process chain
    ///
    /// The decoder's output is written to a freshly truncated
    /// file at `feed_path`. `generation` numbers the chain for
    /// logging. If any stage fails to start, the stages already
    /// started are terminated and the error is returned.
    pub fn spawn(
        cfg: &MonitorConfig,
        feed_path: &Path,
        generation: u64,
    ) -> Result<(PipelineHandle, PipelineOutputs)> {
        let mut handle = PipelineHandle {
            generation,
            started_at: Local::now(),
            started: Instant::now(),
            children: Vec::with_capacity(3),
            writers: Vec::with_capacity(2),
            feeding: Arc::new(AtomicBool::new(true)),
        };

        match handle.spawn_stages(cfg, feed_path) {
            Ok(outputs) => {
                info!(
                    "pipeline generation {} started (PIDs {:?})",
                    generation,
                    handle.pids()
                );
                Ok((handle, outputs))
            }
            Err(e) => {
                handle.terminate();
                Err(e)
            }
        }
    }

    fn spawn_stages(&mut self, cfg: &MonitorConfig, feed_path: &Path) -> Result<PipelineOutputs> {
        let capture = self.start_stage(
            Stage::Capture,
            &capture_argv(cfg),
            Stdio::null(),
            Stdio::piped(),
        )?;
        let raw = capture.stdout.take().ok_or(MonitorError::MissingPipe {
            stage: Stage::Capture,
            pipe: "stdout",
        })?;

        let feed = File::create(feed_path)?;
        let decoder = self.start_stage(
            Stage::Decoder,
            &decoder_argv(cfg),
            Stdio::piped(),
            Stdio::from(feed),
        )?;
        let decoder_in = decoder.stdin.take().ok_or(MonitorError::MissingPipe {
            stage: Stage::Decoder,
            pipe: "stdin",
        })?;

        let encoder = self.start_stage(
            Stage::Encoder,
            &encoder_argv(cfg),
            Stdio::piped(),
            Stdio::piped(),
        )?;
        let encoder_in = encoder.stdin.take().ok_or(MonitorError::MissingPipe {
            stage: Stage::Encoder,
            pipe: "stdin",
        })?;
        let encoded = encoder.stdout.take().ok_or(MonitorError::MissingPipe {
            stage: Stage::Encoder,
            pipe: "stdout",
        })?;

        let mut branches = Vec::with_capacity(2);
        for (stage, stdin) in [(Stage::Decoder, decoder_in), (Stage::Encoder, encoder_in)] {
            let (tx, rx) = crossbeam_channel::bounded(FANOUT_CAPACITY);
            let feeding = self.feeding.clone();
            let writer = thread::Builder::new()
                .name(format!("fmwatch-{}-in", stage))
                .spawn(move || feed_stage(stage, rx, stdin, &feeding))?;
            self.writers.push(writer);
            branches.push(Branch {
                stage,
                tx,
                dropped: 0,
            });
        }

        Ok(PipelineOutputs {
            raw,
            fanout: FanOut { branches },
            encoded,
        })
    }

    // Spawn one stage and take ownership of it
    fn start_stage(
        &mut self,
        stage: Stage,
        argv: &[String],
        stdin: Stdio,
        stdout: Stdio,
    ) -> Result<&mut Child> {
        let (program, args) = argv.split_first().ok_or_else(|| MonitorError::Spawn {
            stage,
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
        })?;

        debug!("spawning {} stage: {:?}", stage, argv);
        let child = Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| MonitorError::Spawn { stage, source })?;

        let idx = self.children.len();
        self.children.push((stage, child));
        Ok(&mut self.children[idx].1)
    }

    /// Generation number of this chain
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Local time the chain was started
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Time since the chain was started
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Process IDs of every stage which was started
    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().map(|(_, c)| c.id()).collect()
    }

    /// True if every stage is still running
    ///
    /// Reaps any stage which has exited and logs its status.
    pub fn is_alive(&mut self) -> bool {
        let mut alive = !self.children.is_empty();
        for (stage, child) in &mut self.children {
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    warn!(
                        "pipeline generation {}: {} stage exited with {}",
                        self.generation, stage, status
                    );
                    alive = false;
                }
                Err(e) => {
                    warn!(
                        "pipeline generation {}: unable to poll {} stage: {}",
                        self.generation, stage, e
                    );
                    alive = false;
                }
            }
        }
        alive
    }

    /// Stop every stage
    ///
    /// Each stage gets `SIGTERM` and [`TERMINATE_GRACE`] to
    /// exit before it is killed. All stages are reaped. Safe to
    /// call more than once.
    pub fn terminate(&mut self) {
        if self.children.is_empty() && self.writers.is_empty() {
            return;
        }
        self.feeding.store(false, Ordering::Release);

        for (stage, child) in &mut self.children {
            if let Ok(Some(_)) = child.try_wait() {
                continue;
            }
            if let Err(e) = sys::terminate(child.id()) {
                debug!("unable to signal {} stage: {}; killing it", stage, e);
                drop(child.kill());
            }
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        for (stage, mut child) in self.children.drain(..) {
            if let Err(e) = reap(&mut child, deadline) {
                warn!("unable to reap {} stage: {}", stage, e);
            }
        }

        for writer in self.writers.drain(..) {
            if writer.join().is_err() {
                warn!("stage writer thread panicked");
            }
        }

        info!("pipeline generation {} stopped", self.generation);
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

// Wait for `child` until `deadline`, then kill it
fn reap(child: &mut Child, deadline: Instant) -> io::Result<()> {
    loop {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            child.kill()?;
            child.wait()?;
            return Ok(());
        }
        thread::sleep(Duration::from_millis(20));
    }
}

// Copy a fan-out branch into a stage's standard input
//
// Runs until the fan-out is dropped, the stage stops reading,
// or `feeding` is cleared.
fn feed_stage(stage: Stage, rx: Receiver<Arc<[u8]>>, mut stdin: ChildStdin, feeding: &AtomicBool) {
    let mut total = 0u64;
    while feeding.load(Ordering::Acquire) {
        let chunk = match rx.recv_timeout(WRITER_POLL) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(e) = stdin.write_all(&chunk) {
            debug!("{} stage input closed: {}", stage, e);
            break;
        }
        total += chunk.len() as u64;
    }
    debug!("{} stage writer finished after {} bytes", stage, total);
}
