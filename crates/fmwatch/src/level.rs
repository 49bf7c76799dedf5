//! Signal level estimation
//!
//! Each chunk of raw PCM is an independent estimate: there
//! is no windowing or overlap between chunks.

use byteorder::{ByteOrder, LittleEndian};

/// Level reported for a chunk of pure digital silence (dBFS)
pub const LEVEL_FLOOR_DB: f32 = -100.0;

/// Chunks shorter than this are too noisy to estimate
pub const MIN_CHUNK_SAMPLES: usize = 10;

// full-scale amplitude of an i16 sample
const FULL_SCALE: f32 = 32768.0;

/// RMS level of a chunk of samples (dBFS)
///
/// Computes the root-mean-square amplitude of `samples` and
/// converts it to decibels relative to full scale. A chunk
/// with zero RMS, including the empty chunk, reports
/// [`LEVEL_FLOOR_DB`]. The result never exceeds 0 dB.
pub fn rms_dbfs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return LEVEL_FLOOR_DB;
    }

    let sum_sq: f64 = samples
        .iter()
        .map(|&sa| {
            let sa = sa as f64;
            sa * sa
        })
        .sum();
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;

    if rms > 0.0 {
        20.0 * f32::log10(rms / FULL_SCALE)
    } else {
        LEVEL_FLOOR_DB
    }
}

/// Level meter for raw `s16le` mono PCM
///
/// The meter decodes byte chunks as read off the capture
/// stage's output. A trailing odd byte is carried over to the
/// next chunk so that sample alignment survives short reads
/// from a pipe.
#[derive(Clone, Debug, Default)]
pub struct LevelMeter {
    // odd byte left over from the previous chunk
    carry: Option<u8>,

    // decoded samples, reused between chunks
    samples: Vec<i16>,
}

impl LevelMeter {
    /// New meter
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimate the level of one chunk of raw bytes
    ///
    /// Returns `None` if the chunk holds fewer than
    /// [`MIN_CHUNK_SAMPLES`] samples.
    pub fn measure(&mut self, chunk: &[u8]) -> Option<f32> {
        self.samples.clear();

        let mut bytes = chunk;
        if let Some(lo) = self.carry.take() {
            match bytes.split_first() {
                Some((&hi, rest)) => {
                    self.samples.push(LittleEndian::read_i16(&[lo, hi]));
                    bytes = rest;
                }
                None => {
                    self.carry = Some(lo);
                    return None;
                }
            }
        }

        let pairs = bytes.chunks_exact(2);
        self.carry = pairs.remainder().first().copied();
        self.samples
            .extend(pairs.map(|pair| LittleEndian::read_i16(pair)));

        if self.samples.len() < MIN_CHUNK_SAMPLES {
            None
        } else {
            Some(rms_dbfs(&self.samples))
        }
    }

    /// Forget any partial sample
    pub fn reset(&mut self) {
        self.carry = None;
        self.samples.clear();
    }
}
