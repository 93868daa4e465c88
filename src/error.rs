//! Error types for bus decoding, encoding and control

use crate::core::{Timestamp, UnitId};
use thiserror::Error;

/// Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Result type for the command encoder
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;

/// Identifier handed out for every accepted command request
pub type CommandId = u32;

/// Why a run of edges could not be turned into bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimingFault {
    /// Run shorter than half a quantum
    Glitch,
    /// Run length outside the drift tolerance of the nearest quantum multiple
    OutOfTolerance,
    /// Frame grew past 34 bits or the maximum frame duration
    Overrun,
    /// Two consecutive edges in the same direction
    LevelMismatch,
    /// Edge timestamp earlier than the previous edge
    NonMonotonic,
    /// Line held low for longer than a whole frame
    StuckLow,
}

impl std::fmt::Display for TimingFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimingFault::Glitch => write!(f, "glitch"),
            TimingFault::OutOfTolerance => write!(f, "out of tolerance"),
            TimingFault::Overrun => write!(f, "frame overrun"),
            TimingFault::LevelMismatch => write!(f, "level mismatch"),
            TimingFault::NonMonotonic => write!(f, "non-monotonic edge"),
            TimingFault::StuckLow => write!(f, "line stuck low"),
        }
    }
}

/// Edge timing violation; the frame in progress is abandoned
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("{fault} at {at} after {bits_recovered} bits (run {run_us} us)")]
pub struct EdgeTimingError {
    /// What went wrong
    pub fault: TimingFault,
    /// Timestamp of the offending edge (or poll)
    pub at: Timestamp,
    /// Duration of the offending run in microseconds
    pub run_us: u64,
    /// Bits recovered before the frame was abandoned
    pub bits_recovered: usize,
}

/// Reason code attached to a rejected frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RejectReason {
    /// Fewer than 34 bits were recovered
    InsufficientBits,
    /// Checksum nibble or parity bit does not match the body
    ChecksumMismatch,
    /// Start/stop bits, channel marker or mode code is not a known pattern
    UnknownPattern,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InsufficientBits => write!(f, "insufficient-bits"),
            RejectReason::ChecksumMismatch => write!(f, "checksum-mismatch"),
            RejectReason::UnknownPattern => write!(f, "unknown-pattern"),
        }
    }
}

/// Errors from the command encoder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EncodeError {
    /// The desired state does not fit the 34-bit / 56 ms frame budget
    #[error("Unrepresentable state: {0}")]
    Unrepresentable(String),
}

impl EncodeError {
    /// Create a new Unrepresentable error
    pub fn unrepresentable(msg: impl Into<String>) -> Self {
        EncodeError::Unrepresentable(msg.into())
    }
}

/// Error types surfaced by the bus pipeline and controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BusError {
    /// Edge timing outside tolerance
    #[error("Edge timing error: {0}")]
    EdgeTiming(EdgeTimingError),

    /// Frame failed structural checks
    #[error("Frame rejected: {0}")]
    FrameRejected(RejectReason),

    /// Frame older than the state already held for the unit
    #[error("Stale observation for {unit}: frame at {frame_at}, state at {last_updated}")]
    StaleObservation {
        unit: UnitId,
        frame_at: Timestamp,
        last_updated: Timestamp,
    },

    /// Desired state cannot be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Bus never became available before the scheduling deadline
    #[error("Command {id} timed out waiting for the bus")]
    CommandTimeout { id: CommandId },

    /// Command already on the wire or finished
    #[error("Command {id} cannot be cancelled: {reason}")]
    NotCancellable { id: CommandId, reason: String },

    /// Controller asked to accept work before `start`
    #[error("Controller not started")]
    NotStarted,

    /// Command queue or edge queue has no room
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Bitvector operation outside the 34-bit capacity or bad text form
    #[error("Invalid bitvector: {0}")]
    InvalidBitvector(String),

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Captured trace could not be parsed or is unreliable
    #[error("Invalid trace: {0}")]
    InvalidTrace(String),

    /// Output driver failed to realize a waveform
    #[error("Output driver error: {0}")]
    Driver(String),
}

impl BusError {
    /// Create a new QueueFull error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        BusError::QueueFull(msg.into())
    }

    /// Create a new InvalidBitvector error
    pub fn invalid_bitvector(msg: impl Into<String>) -> Self {
        BusError::InvalidBitvector(msg.into())
    }

    /// Create a new InvalidConfig error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        BusError::InvalidConfig(msg.into())
    }

    /// Create a new InvalidTrace error
    pub fn invalid_trace(msg: impl Into<String>) -> Self {
        BusError::InvalidTrace(msg.into())
    }

    /// Create a new Driver error
    pub fn driver(msg: impl Into<String>) -> Self {
        BusError::Driver(msg.into())
    }

    /// Whether the error belongs to the decode path and is recovered locally
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BusError::EdgeTiming(_) | BusError::FrameRejected(_) | BusError::StaleObservation { .. }
        )
    }
}

impl From<EdgeTimingError> for BusError {
    fn from(e: EdgeTimingError) -> Self {
        BusError::EdgeTiming(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BusError::invalid_config("tolerance");
        assert!(err.to_string().contains("Invalid configuration"));

        let err = BusError::from(EncodeError::unrepresentable("fan level 9"));
        assert_eq!(err.to_string(), "Unrepresentable state: fan level 9");
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(RejectReason::InsufficientBits.to_string(), "insufficient-bits");
        assert_eq!(RejectReason::ChecksumMismatch.to_string(), "checksum-mismatch");
        assert_eq!(RejectReason::UnknownPattern.to_string(), "unknown-pattern");
    }

    #[test]
    fn test_recoverable() {
        let timing = EdgeTimingError {
            fault: TimingFault::Glitch,
            at: Timestamp::from_micros(10),
            run_us: 3,
            bits_recovered: 0,
        };
        assert!(BusError::from(timing).is_recoverable());
        assert!(BusError::FrameRejected(RejectReason::UnknownPattern).is_recoverable());
        assert!(!BusError::CommandTimeout { id: 1 }.is_recoverable());
        assert!(!BusError::NotStarted.is_recoverable());
        assert!(!BusError::from(EncodeError::unrepresentable("x")).is_recoverable());
    }
}
