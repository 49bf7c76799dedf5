//! Encoded audio relay
//!
//! The encoder stage writes a continuous compressed stream.
//! The relay cuts it into [`AudioFrame`]s of at most a fixed
//! size and keeps the most recent ones in a bounded
//! [`AudioQueue`] for streaming clients. Clients that fall
//! behind lose the oldest audio, never the newest, and never
//! slow down the encoder.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arraydeque::{ArrayDeque, Wrapping};

#[cfg(not(test))]
use log::{debug, info, trace};

#[cfg(test)]
use std::println as debug;
#[cfg(test)]
use std::println as info;
#[cfg(test)]
use std::println as trace;

use crate::stats::{Service, ServiceToggles};

/// Capacity of the [`AudioQueue`], in frames
pub const AUDIO_QUEUE_CAPACITY: usize = 500;

/// A chunk of the encoded audio stream
///
/// Frames are opaque bytes. Frame boundaries are where the
/// reads happened to fall, not codec frame boundaries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioFrame(Vec<u8>);

impl AudioFrame {
    /// Frame contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the contents
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    /// Frame length, in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for an empty frame
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(bytes: Vec<u8>) -> Self {
        AudioFrame(bytes)
    }
}

impl From<&[u8]> for AudioFrame {
    fn from(bytes: &[u8]) -> Self {
        AudioFrame(bytes.to_vec())
    }
}

impl AsRef<[u8]> for AudioFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Bounded drop-oldest frame queue
///
/// Holds at most [`AUDIO_QUEUE_CAPACITY`] frames. Pushing onto
/// a full queue evicts the single oldest frame. Pushing never
/// blocks. Frames are popped in the order they were pushed.
#[derive(Debug, Default)]
pub struct AudioQueue {
    frames: Mutex<ArrayDeque<AudioFrame, AUDIO_QUEUE_CAPACITY, Wrapping>>,
    ready: Condvar,
    dropped: AtomicU64,
}

impl AudioQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame, evicting the oldest if full
    ///
    /// Returns the evicted frame, if any.
    pub fn push(&self, frame: AudioFrame) -> Option<AudioFrame> {
        let evicted = {
            let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
            frames.push_back(frame)
        };
        self.ready.notify_one();

        if evicted.is_some() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            trace!("audio queue full; dropped oldest frame ({} total)", total);
        }
        evicted
    }

    /// Next frame, waiting at most `timeout`
    ///
    /// Returns `None` if no frame arrives in time.
    pub fn next_frame(&self, timeout: Duration) -> Option<AudioFrame> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(frame) = frames.pop_front() {
                return Some(frame);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            frames = self
                .ready
                .wait_timeout(frames, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Discard all queued frames
    pub fn clear(&self) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of queued frames
    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True if no frames are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifetime count of frames evicted on overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Relay an encoded stream into `queue`
///
/// Reads `source` in reads of at most `read_size` bytes and
/// pushes each read as one frame. While the audio relay
/// service is disabled in `toggles`, the stream is still read
/// and the bytes are thrown away, so the encoder never stalls
/// on a full pipe.
///
/// Returns the number of bytes read when `source` reaches
/// end-of-file or when `running` is cleared.
pub fn relay<R>(
    mut source: R,
    queue: &AudioQueue,
    toggles: &ServiceToggles,
    running: &AtomicBool,
    read_size: usize,
) -> io::Result<u64>
where
    R: Read,
{
    info!("audio relay started");
    let mut buf = vec![0u8; read_size.max(1)];
    let mut total = 0u64;

    while running.load(Ordering::Acquire) {
        let n = match source.read(&mut buf) {
            Ok(0) => {
                debug!("audio relay: end of stream");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        total += n as u64;

        if toggles.is_enabled(Service::AudioRelay) {
            queue.push(AudioFrame::from(&buf[..n]));
        }
    }

    info!("audio relay stopped after {} bytes", total);
    Ok(total)
}
