//! Seeding buffers with a known pattern and checking what comes back.

use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A running checksum that can be shared between threads.
///
/// Clones share the same total.
#[derive(Debug, Clone, Default)]
pub struct ChecksumAccumulator {
    /// The running total.
    total: Arc<AtomicU64>,
}

impl ChecksumAccumulator {
    /// Creates an accumulator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` to the total.
    pub fn add(&self, value: u64) {
        self.total.fetch_add(value, Ordering::Relaxed);
    }

    /// The current total.
    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }
}

/// The contents each file's buffer is seeded with, and how a buffer is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPattern {
    /// Every byte of every buffer holds the same value. A buffer measures as the sum of its bytes.
    Byte(u8),
    /// Buffer `i` holds `i` as a little-endian `u64` at its start and zeros after. A buffer
    /// measures as that stamp, and is measured both when it is written and when it is read back.
    IndexStamp,
}

impl Default for FillPattern {
    fn default() -> Self {
        FillPattern::Byte(2)
    }
}

/// The width of an index stamp.
const STAMP_LEN: usize = std::mem::size_of::<u64>();

impl FillPattern {
    /// Fills the buffer of file `index`.
    pub fn seed(&self, index: usize, buf: &mut [u8]) {
        match self {
            FillPattern::Byte(value) => buf.fill(*value),
            FillPattern::IndexStamp => {
                buf.fill(0);
                let stamp = (index as u64).to_le_bytes();
                let n = buf.len().min(STAMP_LEN);
                buf[..n].copy_from_slice(&stamp[..n]);
            }
        }
    }

    /// Measures the bytes of one buffer.
    pub fn measure(&self, buf: &[u8]) -> u64 {
        match self {
            FillPattern::Byte(_) => buf.iter().map(|&b| u64::from(b)).sum(),
            FillPattern::IndexStamp => {
                let mut stamp = [0u8; STAMP_LEN];
                let n = buf.len().min(STAMP_LEN);
                stamp[..n].copy_from_slice(&buf[..n]);
                u64::from_le_bytes(stamp)
            }
        }
    }

    /// Whether a buffer is also measured when its write completes.
    pub fn counts_writes(&self) -> bool {
        matches!(self, FillPattern::IndexStamp)
    }

    /// The smallest buffer the pattern fits in without losing information.
    pub fn min_size(&self) -> usize {
        match self {
            FillPattern::Byte(_) => 1,
            FillPattern::IndexStamp => STAMP_LEN,
        }
    }

    /// The checksum a full round trip of `count` files of `file_size` bytes must produce.
    pub fn expected(&self, file_size: usize, count: usize) -> u64 {
        match self {
            FillPattern::Byte(value) => file_size as u64 * count as u64 * u64::from(*value),
            FillPattern::IndexStamp => (0..count as u64).sum::<u64>() * 2,
        }
    }
}

impl Display for FillPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillPattern::Byte(value) => write!(f, "byte:{value}"),
            FillPattern::IndexStamp => f.write_str("index"),
        }
    }
}

/// The error returned when a fill pattern cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid fill pattern {0:?} (expected `index` or `byte:<0-255>`)")]
pub struct ParsePatternError(String);

impl FromStr for FillPattern {
    type Err = ParsePatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "index" {
            return Ok(FillPattern::IndexStamp);
        }
        s.strip_prefix("byte:")
            .and_then(|value| value.parse().ok())
            .map(FillPattern::Byte)
            .ok_or_else(|| ParsePatternError(s.to_owned()))
    }
}

/// The result of comparing an observed checksum against the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// The checksum a correct run produces.
    pub expected: u64,
    /// The checksum this run produced.
    pub observed: u64,
}

impl Verdict {
    /// Returns true if the checksums match.
    pub fn passed(&self) -> bool {
        self.expected == self.observed
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sum of all values is {}, expected result is {}",
            self.observed, self.expected
        )
    }
}
