//! Frame decoding and channel tracking

use crate::core::{Bitvector, Channel, Timestamp};
use crate::error::RejectReason;
use crate::frame::{parse_bits, Frame, RejectedFrame, ValidFrame};
use log::{debug, info, warn};
use std::time::Duration;

/// What caused the channel assumption to flip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SwitchCause {
    /// Switch interval elapsed without contrary evidence
    Elapsed,
    /// A frame's channel marker named the other channel
    Evidence,
}

/// A flip of the active channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelSwitch {
    /// Channel before the flip
    pub from: Channel,
    /// Channel after the flip
    pub to: Channel,
    /// When the flip was recorded
    pub at: Timestamp,
    /// Why it happened
    pub cause: SwitchCause,
}

/// Tracks which channel the bus is carrying
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelWindow {
    active: Channel,
    switched_at: Option<Timestamp>,
    interval: Duration,
}

impl ChannelWindow {
    /// Create a window starting on IN
    pub fn new(interval: Duration) -> Self {
        ChannelWindow {
            active: Channel::In,
            switched_at: None,
            interval,
        }
    }

    /// Currently assumed channel
    pub fn active(&self) -> Channel {
        self.active
    }

    /// Timestamp of the last flip, or of the first observation
    pub fn switched_at(&self) -> Option<Timestamp> {
        self.switched_at
    }

    /// Flip the assumption if the switch interval has elapsed
    pub fn advance(&mut self, now: Timestamp) -> Option<ChannelSwitch> {
        let since = match self.switched_at {
            Some(since) => since,
            None => {
                self.switched_at = Some(now);
                return None;
            }
        };
        if now.saturating_since(since) < self.interval {
            return None;
        }
        Some(self.flip(now, SwitchCause::Elapsed))
    }

    /// Correct the assumption from a frame's channel marker
    pub fn observe(&mut self, marker: Channel, at: Timestamp) -> Option<ChannelSwitch> {
        if marker == self.active {
            return None;
        }
        Some(self.flip(at, SwitchCause::Evidence))
    }

    fn flip(&mut self, at: Timestamp, cause: SwitchCause) -> ChannelSwitch {
        let switch = ChannelSwitch {
            from: self.active,
            to: self.active.other(),
            at,
            cause,
        };
        self.active = switch.to;
        self.switched_at = Some(at);
        info!("Channel {} -> {} at {} ({:?})", switch.from, switch.to, at, cause);
        switch
    }
}

/// Counters kept by the decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecoderStats {
    /// Frames that passed validation
    pub valid: u32,
    /// Frames rejected for too few bits
    pub insufficient_bits: u32,
    /// Frames rejected for checksum or parity
    pub checksum_mismatch: u32,
    /// Frames rejected for an unknown pattern
    pub unknown_pattern: u32,
}

impl DecoderStats {
    /// Total rejected frames
    pub fn rejected(&self) -> u32 {
        self.insufficient_bits + self.checksum_mismatch + self.unknown_pattern
    }
}

/// Validates recovered bitvectors and tags them with a channel
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    window: ChannelWindow,
    stats: DecoderStats,
    switches: Vec<ChannelSwitch>,
}

impl FrameDecoder {
    /// Create a decoder whose channel flips after `switch_interval`
    pub fn new(switch_interval: Duration) -> Self {
        FrameDecoder {
            window: ChannelWindow::new(switch_interval),
            stats: DecoderStats::default(),
            switches: Vec::new(),
        }
    }

    /// Decode one bitvector recovered from a frame starting at `at`
    ///
    /// Never fails: a frame that does not pass validation is returned as
    /// [`Frame::Rejected`] with its reason code.
    pub fn decode(&mut self, bits: &Bitvector, at: Timestamp) -> Frame {
        if let Some(switch) = self.window.advance(at) {
            self.switches.push(switch);
        }

        match parse_bits(bits) {
            Ok((marker, settings)) => {
                if let Some(switch) = self.window.observe(marker, at) {
                    self.switches.push(switch);
                }
                self.stats.valid += 1;
                debug!("Frame at {} on {}: {}", at, marker, settings);
                Frame::Valid(ValidFrame {
                    channel: self.window.active(),
                    settings,
                    timestamp: at,
                    raw: *bits,
                })
            }
            Err(reason) => {
                match reason {
                    RejectReason::InsufficientBits => self.stats.insufficient_bits += 1,
                    RejectReason::ChecksumMismatch => self.stats.checksum_mismatch += 1,
                    RejectReason::UnknownPattern => self.stats.unknown_pattern += 1,
                }
                warn!(
                    "Frame at {} rejected ({}): {} bits [{}]",
                    at,
                    reason,
                    bits.len(),
                    bits
                );
                Frame::Rejected(RejectedFrame {
                    reason,
                    channel: self.window.active(),
                    timestamp: at,
                    raw: *bits,
                })
            }
        }
    }

    /// Let the channel window age without a frame
    pub fn tick(&mut self, now: Timestamp) {
        if let Some(switch) = self.window.advance(now) {
            self.switches.push(switch);
        }
    }

    /// Channel switches recorded since the last call
    pub fn take_switches(&mut self) -> Vec<ChannelSwitch> {
        std::mem::take(&mut self.switches)
    }

    /// Currently assumed channel
    pub fn channel(&self) -> Channel {
        self.window.active()
    }

    /// The channel window
    pub fn window(&self) -> &ChannelWindow {
        &self.window
    }

    /// Decode counters
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}
