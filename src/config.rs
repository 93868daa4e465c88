//! Timing and controller configuration
//!
//! Defaults follow the protocol constants in [`crate::wire`]. The real
//! bus jitter is only known from captured traces, so every threshold here
//! is tunable.

use crate::error::{BusError, Result};
use crate::wire;
use std::time::Duration;

/// Timing references used to recover and generate bits
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimingConfig {
    /// Duration of one bit quantum
    pub pulse_width: Duration,
    /// Nominal repeat period of frames
    pub frame_period: Duration,
    /// Longest bit pattern a frame may occupy
    pub max_frame_duration: Duration,
    /// Relative clock-drift tolerance (0.15 = ±15%)
    pub tolerance: f64,
    /// Minimum high run, in quanta, that separates frames
    pub idle_quanta: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            pulse_width: Duration::from_micros(wire::PULSE_WIDTH_US),
            frame_period: Duration::from_micros(wire::FRAME_PERIOD_US),
            max_frame_duration: Duration::from_micros(wire::MAX_FRAME_DURATION_US),
            tolerance: 0.15,
            idle_quanta: wire::IDLE_QUANTA,
        }
    }
}

impl TimingConfig {
    /// Minimum high time that counts as inter-frame idle
    pub fn idle_threshold(&self) -> Duration {
        self.pulse_width * self.idle_quanta
    }

    /// Longest high run, in quanta, that stays below the idle threshold
    /// even when the sender's clock runs slow by the full tolerance
    pub fn max_high_run(&self) -> usize {
        let limit = self.idle_quanta as f64 / (1.0 + self.tolerance);
        (limit.ceil() as usize).saturating_sub(1)
    }

    /// Longest a frame may run, including drift, before it is abandoned
    pub fn frame_deadline(&self) -> Duration {
        self.max_frame_duration.mul_f64(1.0 + self.tolerance)
    }

    /// Check that the timing references are usable
    pub fn validate(&self) -> Result<()> {
        if self.pulse_width.is_zero() {
            return Err(BusError::invalid_config("pulse width must be non-zero"));
        }
        if !(self.tolerance > 0.0 && self.tolerance < 0.5) {
            return Err(BusError::invalid_config(format!(
                "tolerance {} outside (0, 0.5)",
                self.tolerance
            )));
        }
        if self.idle_quanta < 2 {
            return Err(BusError::invalid_config("idle gap must span at least 2 quanta"));
        }
        if self.max_frame_duration < self.pulse_width {
            return Err(BusError::invalid_config(
                "max frame duration shorter than one pulse",
            ));
        }
        if self.max_frame_duration + self.idle_threshold() > self.frame_period.mul_f64(1.0 + self.tolerance) {
            return Err(BusError::invalid_config(
                "frame plus idle gap does not fit the frame period",
            ));
        }
        Ok(())
    }
}

/// Bus controller configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusConfig {
    /// Bit timing
    pub timing: TimingConfig,
    /// Time without contrary evidence after which the channel flips
    pub channel_switch_interval: Duration,
    /// Missed frame periods before a unit is reported stale
    pub stale_periods: u32,
    /// Frame periods a command may wait for the bus before timing out
    pub schedule_timeout_periods: u32,
    /// Maximum number of pending commands
    pub command_queue_depth: usize,
    /// Finished command outcomes kept for `take_outcome`; oldest commands dropped first
    pub outcome_history: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            timing: TimingConfig::default(),
            channel_switch_interval: Duration::from_secs(wire::CHANNEL_SWITCH_SECS),
            stale_periods: 3,
            schedule_timeout_periods: 3,
            command_queue_depth: 8,
            outcome_history: 32,
        }
    }
}

impl BusConfig {
    /// Age after which a unit's state is stale
    pub fn stale_timeout(&self) -> Duration {
        self.timing.frame_period * self.stale_periods
    }

    /// Longest a command may wait before it is rejected with a timeout
    pub fn schedule_timeout(&self) -> Duration {
        self.timing.frame_period * self.schedule_timeout_periods
    }

    /// Check the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.timing.validate()?;
        if self.channel_switch_interval <= self.timing.frame_period {
            return Err(BusError::invalid_config(
                "channel switch interval must exceed the frame period",
            ));
        }
        if self.stale_periods == 0 {
            return Err(BusError::invalid_config("stale periods must be at least 1"));
        }
        if self.schedule_timeout_periods == 0 {
            return Err(BusError::invalid_config(
                "schedule timeout must be at least one frame period",
            ));
        }
        if self.command_queue_depth == 0 {
            return Err(BusError::invalid_config("command queue depth must be non-zero"));
        }
        if self.outcome_history == 0 {
            return Err(BusError::invalid_config("outcome history must be non-zero"));
        }
        Ok(())
    }

    /// Load and validate a configuration from JSON
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BusConfig = serde_json::from_str(json)
            .map_err(|e| BusError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to pretty JSON
    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| BusError::invalid_config(e.to_string()))
    }
}
