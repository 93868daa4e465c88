//! # TwinFresh Bus
//!
//! Decoder, encoder and bus controller for the undocumented two-wire bus
//! that links Duka One C6 / Vents TwinFresh Comfo heat-recovery ventilation
//! units.
//!
//! Each unit repeats a 34-bit NRZ pattern roughly every 99 ms on a line that
//! idles high. The bus alternates between an IN and an OUT channel about
//! every 70 s. This library provides:
//!
//! - Bit recovery from timestamped signal edges
//! - Frame validation and channel tracking
//! - A per-unit device state model with staleness detection
//! - Command encoding into pulse-timed waveforms
//! - A bus controller that schedules commands around ongoing traffic
//! - Golden-trace loading for logic-analyser CSV captures
//!
//! ## Features
//!
//! - `serde`: Enable serialization/deserialization support and JSON configuration
//!
//! ## Example
//!
//! ```
//! use twinfresh_bus::{Channel, CommandEncoder, FrameDecoder, Mode, Timestamp, UnitId, UnitSettings};
//! use twinfresh_bus::config::BusConfig;
//!
//! let config = BusConfig::default();
//! let encoder = CommandEncoder::new(config.timing.clone());
//! let target = UnitSettings::new(UnitId::new(1), 2, Mode::HeatRecovery);
//!
//! let bits = encoder.encode(&target, Channel::In)?;
//! let mut decoder = FrameDecoder::new(config.channel_switch_interval);
//! let frame = decoder.decode(&bits, Timestamp::ZERO);
//! assert_eq!(frame.valid().map(|f| f.settings), Some(target));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod controller;
pub mod core;
pub mod decoder;
pub mod encoding;
pub mod error;
pub mod frame;
pub mod recovery;
pub mod sampler;
pub mod state;
pub mod trace;

pub use crate::core::{Bitvector, Channel, Direction, Edge, Mode, Timestamp, UnitId};
pub use controller::{BusController, BusControllerBuilder, BusEvent, BusState, CommandOutcome, CommandRequest};
pub use decoder::{ChannelSwitch, ChannelWindow, FrameDecoder};
pub use encoding::{CommandEncoder, Waveform};
pub use error::{BusError, EncodeError, RejectReason, Result};
pub use frame::{Frame, RejectedFrame, UnitSettings, ValidFrame};
pub use recovery::{BitRecovery, RecoveredBits};
pub use state::{DeviceModel, DeviceState};
pub use trace::{RepeatedFrame, Trace};

/// Protocol constants measured from captured traces
pub mod wire {
    /// Duration of one bit quantum in microseconds
    pub const PULSE_WIDTH_US: u64 = 1_650;

    /// Frame repeat period in microseconds
    pub const FRAME_PERIOD_US: u64 = 99_000;

    /// Bits in a complete frame
    pub const FRAME_BITS: usize = 34;

    /// Longest bit pattern in microseconds (34 quanta)
    pub const MAX_FRAME_DURATION_US: u64 = PULSE_WIDTH_US * FRAME_BITS as u64;

    /// High run, in quanta, that separates consecutive frames
    pub const IDLE_QUANTA: u32 = 20;

    /// Approximate interval between IN/OUT channel alternations in seconds
    pub const CHANNEL_SWITCH_SECS: u64 = 70;
}
