//! Believed state of every unit seen on the bus

use crate::core::{Channel, Timestamp, UnitId};
use crate::error::{BusError, Result};
use crate::frame::{UnitSettings, ValidFrame};
use log::{debug, info};
use std::collections::BTreeMap;
use std::time::Duration;

/// Believed operational state of one ventilation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceState {
    /// Last decoded settings
    pub settings: UnitSettings,
    /// Channel the last frame arrived on
    pub channel: Channel,
    /// Timestamp of the last accepted frame
    pub last_updated: Timestamp,
    /// Timestamp of the first accepted frame
    pub first_seen: Timestamp,
    /// Number of accepted frames
    pub frames_observed: u32,
}

impl DeviceState {
    fn from_frame(frame: &ValidFrame) -> Self {
        DeviceState {
            settings: frame.settings,
            channel: frame.channel,
            last_updated: frame.timestamp,
            first_seen: frame.timestamp,
            frames_observed: 1,
        }
    }

    /// Unit this state belongs to
    pub fn unit(&self) -> UnitId {
        self.settings.unit
    }

    /// Time since the last accepted frame
    pub fn age(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.last_updated)
    }

    /// Whether no frame arrived within `timeout`
    pub fn is_stale(&self, now: Timestamp, timeout: Duration) -> bool {
        self.age(now) > timeout
    }
}

/// Effect of one observed frame on the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First frame from a new unit
    Created,
    /// Later frame; `changed` is set when the settings or channel moved
    Updated { changed: bool },
    /// Same frame as the last one, already applied
    Duplicate,
}

/// Aggregates valid frames into per-unit state
///
/// Only the decode path writes to the model; readers get copies.
#[derive(Debug, Clone)]
pub struct DeviceModel {
    units: BTreeMap<UnitId, DeviceState>,
    stale_timeout: Duration,
    stale_rejections: u32,
}

impl DeviceModel {
    /// Create an empty model
    pub fn new(stale_timeout: Duration) -> Self {
        DeviceModel {
            units: BTreeMap::new(),
            stale_timeout,
            stale_rejections: 0,
        }
    }

    /// Apply a valid frame
    ///
    /// A frame older than the held state, or with the same timestamp but
    /// different content, is rejected with [`BusError::StaleObservation`].
    pub fn observe(&mut self, frame: &ValidFrame) -> Result<Observation> {
        let unit = frame.settings.unit;
        let state = match self.units.get_mut(&unit) {
            Some(state) => state,
            None => {
                info!("New {} on {}: {}", unit, frame.channel, frame.settings);
                self.units.insert(unit, DeviceState::from_frame(frame));
                return Ok(Observation::Created);
            }
        };

        let same_content = state.settings == frame.settings && state.channel == frame.channel;
        if frame.timestamp == state.last_updated && same_content {
            return Ok(Observation::Duplicate);
        }
        if frame.timestamp <= state.last_updated {
            self.stale_rejections += 1;
            return Err(BusError::StaleObservation {
                unit,
                frame_at: frame.timestamp,
                last_updated: state.last_updated,
            });
        }

        if !same_content {
            info!("{} changed: {} -> {} on {}", unit, state.settings, frame.settings, frame.channel);
        } else {
            debug!("{} confirmed at {}", unit, frame.timestamp);
        }
        state.settings = frame.settings;
        state.channel = frame.channel;
        state.last_updated = frame.timestamp;
        state.frames_observed = state.frames_observed.saturating_add(1);
        Ok(Observation::Updated {
            changed: !same_content,
        })
    }

    /// Current state of a unit
    pub fn current_state(&self, unit: UnitId) -> Option<DeviceState> {
        self.units.get(&unit).copied()
    }

    /// Whether a unit has gone quiet; unknown units are always stale
    pub fn is_stale(&self, unit: UnitId, now: Timestamp) -> bool {
        match self.units.get(&unit) {
            Some(state) => state.is_stale(now, self.stale_timeout),
            None => true,
        }
    }

    /// Units with no frame within the stale timeout
    pub fn stale_units(&self, now: Timestamp) -> Vec<UnitId> {
        self.units
            .values()
            .filter(|s| s.is_stale(now, self.stale_timeout))
            .map(|s| s.unit())
            .collect()
    }

    /// All known units in address order
    pub fn units(&self) -> impl Iterator<Item = &DeviceState> {
        self.units.values()
    }

    /// Number of known units
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Configured stale timeout
    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    /// Frames dropped as out of order
    pub fn stale_rejections(&self) -> u32 {
        self.stale_rejections
    }
}
