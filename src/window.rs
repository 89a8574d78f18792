//! Rolling liveness window.
//!
//! Each account keeps a 64-slot bit window of signed heartbeats, indexed by
//! block height modulo the window size. Offsets coming from outside are
//! turned into a [`WindowOffset`] at the boundary; the window itself only
//! ever indexes with one.

use std::fmt;
use thiserror::Error;

/// Number of slots in the window.
pub const WINDOW_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window offset {0} out of range 0..64")]
    OutOfRange(u64),
    #[error("window encoding must be 8 bytes, got {0}")]
    Encoding(usize),
}

/// An index into the window. Always below [`WINDOW_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowOffset(u8);

impl WindowOffset {
    /// Validates a raw offset.
    pub fn new(offset: u64) -> Result<Self, WindowError> {
        if offset < WINDOW_SIZE as u64 {
            Ok(Self(offset as u8))
        } else {
            Err(WindowError::OutOfRange(offset))
        }
    }

    /// Slot used by a block height.
    pub fn from_height(height: u64) -> Self {
        Self((height % WINDOW_SIZE as u64) as u8)
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u64> for WindowOffset {
    type Error = WindowError;

    fn try_from(offset: u64) -> Result<Self, Self::Error> {
        Self::new(offset)
    }
}

impl fmt::Display for WindowOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bit per slot: set when the account signed at that slot's last height.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessWindow {
    bits: u64,
}

impl LivenessWindow {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WindowError> {
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| WindowError::Encoding(bytes.len()))?;
        Ok(Self {
            bits: u64::from_be_bytes(bytes),
        })
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.bits.to_be_bytes()
    }

    pub fn record(&mut self, offset: WindowOffset, signed: bool) {
        let mask = 1u64 << offset.get();
        if signed {
            self.bits |= mask;
        } else {
            self.bits &= !mask;
        }
    }

    pub fn signed_at(&self, offset: WindowOffset) -> bool {
        self.bits & (1u64 << offset.get()) != 0
    }

    /// Number of signed slots.
    pub fn signed_count(&self) -> u32 {
        self.bits.count_ones()
    }

    pub fn missed_count(&self) -> u32 {
        WINDOW_SIZE as u32 - self.signed_count()
    }
}
