//! Bus controller: owns the decode pipeline and arbitrates the shared line
//!
//! ```text
//!   edges ──▶ BitRecovery ──▶ FrameDecoder ──▶ DeviceModel      (read path)
//!   CommandRequest ──▶ CommandEncoder ──▶ Waveform ──▶ PulseSink (write path)
//! ```
//!
//! The controller is driven cooperatively: the host calls [`BusController::poll`]
//! whenever an edge is captured or [`BusController::next_deadline`] passes.
//! A command is only put on the wire while no frame is being received and
//! the line has been idle for a full inter-frame gap.

use crate::config::{BusConfig, TimingConfig};
use crate::core::{Bitvector, Channel, Timestamp, UnitId};
use crate::decoder::{ChannelSwitch, FrameDecoder};
use crate::encoding::{CommandEncoder, Waveform};
use crate::error::{BusError, CommandId, EdgeTimingError, Result};
use crate::frame::{Frame, RejectedFrame, UnitSettings, ValidFrame};
use crate::recovery::{BitRecovery, Recovery};
use crate::sampler::{EdgeSource, PulseSink};
use crate::state::{DeviceModel, DeviceState, Observation};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

/// Bus arbitration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BusState {
    /// Not started
    Idle,
    /// Decoding traffic, ready to transmit
    Listening,
    /// Driving a command waveform
    Transmitting,
    /// Recording a channel flip; returns to the previous state at once
    ChannelSwitch,
}

impl std::fmt::Display for BusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusState::Idle => write!(f, "Idle"),
            BusState::Listening => write!(f, "Listening"),
            BusState::Transmitting => write!(f, "Transmitting"),
            BusState::ChannelSwitch => write!(f, "ChannelSwitch"),
        }
    }
}

/// Desired unit settings submitted by a control policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandRequest {
    /// Settings to command
    pub target: UnitSettings,
    /// Scheduling timeout; the configured default when `None`
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    /// Request with the default scheduling timeout
    pub fn new(target: UnitSettings) -> Self {
        CommandRequest {
            target,
            timeout: None,
        }
    }

    /// Override the scheduling timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final result of a command request
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CommandOutcome {
    /// Waveform ran to completion
    Transmitted {
        /// When the waveform started
        started_at: Timestamp,
        /// When the line was released
        finished_at: Timestamp,
    },
    /// Request was dropped without transmitting
    Rejected(BusError),
    /// Submitter cancelled while pending
    Cancelled,
}

/// Structured diagnostics and notifications for the host
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BusEvent {
    /// Controller state changed
    StateChanged {
        from: BusState,
        to: BusState,
        at: Timestamp,
    },
    /// Valid frame applied to the device model
    FrameDecoded(ValidFrame),
    /// Frame failed validation
    FrameRejected(RejectedFrame),
    /// Frame abandoned on an edge timing fault
    TimingError(EdgeTimingError),
    /// Valid frame dropped as out of order
    StaleObservation(BusError),
    /// Channel assumption flipped
    ChannelSwitched(ChannelSwitch),
    /// Unit has not been heard within the stale timeout
    UnitStale { unit: UnitId, at: Timestamp },
    /// Submitted settings could not be encoded
    EncodeFailed {
        target: UnitSettings,
        error: BusError,
    },
    /// Command waveform started
    CommandStarted {
        id: CommandId,
        bits: Bitvector,
        at: Timestamp,
    },
    /// Command waveform completed
    CommandCompleted { id: CommandId, at: Timestamp },
    /// Command dropped without transmitting
    CommandRejected { id: CommandId, error: BusError },
}

#[derive(Debug, Clone)]
struct PendingCommand {
    id: CommandId,
    target: UnitSettings,
    deadline: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct ActiveTransmission {
    id: CommandId,
    started_at: Timestamp,
    ends_at: Timestamp,
}

/// Orchestrates sampling, decoding, state tracking and command transmission
#[derive(Debug)]
pub struct BusController {
    config: BusConfig,
    state: BusState,
    recovery: BitRecovery,
    decoder: FrameDecoder,
    model: DeviceModel,
    encoder: CommandEncoder,
    pending: VecDeque<PendingCommand>,
    active: Option<ActiveTransmission>,
    outcomes: BTreeMap<CommandId, CommandOutcome>,
    events: Vec<BusEvent>,
    stale_reported: BTreeSet<UnitId>,
    next_id: CommandId,
}

impl BusController {
    /// Create a controller in the `Idle` state
    pub fn new(config: BusConfig) -> Result<Self> {
        config.validate()?;
        Ok(BusController {
            recovery: BitRecovery::new(config.timing.clone()),
            decoder: FrameDecoder::new(config.channel_switch_interval),
            model: DeviceModel::new(config.stale_timeout()),
            encoder: CommandEncoder::new(config.timing.clone()),
            state: BusState::Idle,
            pending: VecDeque::new(),
            active: None,
            outcomes: BTreeMap::new(),
            events: Vec::new(),
            stale_reported: BTreeSet::new(),
            next_id: 1,
            config,
        })
    }

    /// Begin listening; the line is assumed idle from `now`
    pub fn start(&mut self, now: Timestamp) {
        if self.state != BusState::Idle {
            return;
        }
        self.recovery.prime_idle(now);
        self.set_state(BusState::Listening, now);
    }

    /// Current arbitration state
    pub fn state(&self) -> BusState {
        self.state
    }

    /// Channel currently assumed
    pub fn channel(&self) -> Channel {
        self.decoder.channel()
    }

    /// Controller configuration
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Read-only view of the device model
    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    /// Believed state of a unit
    pub fn device_state(&self, unit: UnitId) -> Option<DeviceState> {
        self.model.current_state(unit)
    }

    /// Whether a unit has gone quiet
    pub fn is_stale(&self, unit: UnitId, now: Timestamp) -> bool {
        self.model.is_stale(unit, now)
    }

    /// Number of commands waiting for the bus
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue a command
    ///
    /// The settings are encoded immediately, so an unrepresentable target
    /// is returned to the caller here rather than later.
    pub fn submit(&mut self, request: CommandRequest, now: Timestamp) -> Result<CommandId> {
        if self.state == BusState::Idle {
            return Err(BusError::NotStarted);
        }
        if let Err(e) = self.encoder.encode(&request.target, self.channel()) {
            let error = BusError::from(e);
            warn!("Command for {} not encodable: {}", request.target, error);
            self.events.push(BusEvent::EncodeFailed {
                target: request.target,
                error: error.clone(),
            });
            return Err(error);
        }
        if self.pending.len() >= self.config.command_queue_depth {
            return Err(BusError::queue_full(format!(
                "{} commands already pending",
                self.pending.len()
            )));
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let timeout = request.timeout.unwrap_or_else(|| self.config.schedule_timeout());
        self.pending.push_back(PendingCommand {
            id,
            target: request.target,
            deadline: now + timeout,
        });
        debug!("Command {} queued for {}: {}", id, now + timeout, request.target);
        Ok(id)
    }

    /// Cancel a command that has not started transmitting
    pub fn cancel(&mut self, id: CommandId) -> Result<()> {
        if let Some(pos) = self.pending.iter().position(|c| c.id == id) {
            self.pending.remove(pos);
            self.record_outcome(id, CommandOutcome::Cancelled);
            debug!("Command {} cancelled", id);
            return Ok(());
        }
        let reason = if self.active.map(|a| a.id) == Some(id) {
            "transmission in progress"
        } else if self.outcomes.contains_key(&id) {
            "already finished"
        } else {
            "unknown command"
        };
        Err(BusError::NotCancellable {
            id,
            reason: reason.to_string(),
        })
    }

    /// Final outcome of a command, removed once taken
    pub fn take_outcome(&mut self, id: CommandId) -> Option<CommandOutcome> {
        self.outcomes.remove(&id)
    }

    /// Events recorded since the last call
    pub fn drain_events(&mut self) -> Vec<BusEvent> {
        std::mem::take(&mut self.events)
    }

    /// Earliest time at which polling can make progress without a new edge
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let idle = self.config.timing.idle_threshold();
        let mut deadlines = Vec::with_capacity(4);
        if let Some(active) = self.active {
            deadlines.push(active.ends_at);
        }
        if let Some(front) = self.pending.front() {
            deadlines.push(front.deadline + Duration::from_micros(1));
            if let Some(since) = self.recovery.idle_since() {
                deadlines.push(since + idle);
            }
        }
        if self.recovery.in_frame() {
            if let Some(last) = self.recovery.last_edge() {
                deadlines.push(last + idle);
            }
        }
        deadlines.into_iter().min()
    }

    /// Run the controller up to `now`
    ///
    /// Drains `source`, feeds the decode pipeline, retires finished or
    /// expired commands and starts the next one on `sink` when the bus is
    /// free. Decode-path faults become events; only an output driver
    /// failure is returned.
    pub fn poll<S, P>(&mut self, source: &mut S, sink: &mut P, now: Timestamp) -> Result<()>
    where
        S: EdgeSource + ?Sized,
        P: PulseSink + ?Sized,
    {
        if self.state == BusState::Idle {
            return Ok(());
        }

        while let Some(edge) = source.next_edge() {
            let step = self.recovery.push_edge(edge);
            self.handle_recovery(step);
        }
        let step = self.recovery.poll(now);
        self.handle_recovery(step);
        self.decoder.tick(now);
        self.record_switches();

        self.finish_transmission(now);
        self.expire_pending(now);
        self.report_stale(now);
        self.start_transmission(sink, now)
    }

    fn handle_recovery(&mut self, step: Recovery) {
        match step {
            None => {}
            Some(Err(timing)) => self.events.push(BusEvent::TimingError(timing)),
            Some(Ok(recovered)) => {
                let frame = self.decoder.decode(&recovered.bits, recovered.started_at);
                self.record_switches();
                match frame {
                    Frame::Valid(valid) => match self.model.observe(&valid) {
                        Ok(observation) => {
                            if observation != Observation::Duplicate {
                                self.stale_reported.remove(&valid.settings.unit);
                            }
                            self.events.push(BusEvent::FrameDecoded(valid));
                        }
                        Err(e) => {
                            warn!("Frame dropped: {}", e);
                            self.events.push(BusEvent::StaleObservation(e));
                        }
                    },
                    Frame::Rejected(rejected) => self.events.push(BusEvent::FrameRejected(rejected)),
                }
            }
        }
    }

    fn record_switches(&mut self) {
        for switch in self.decoder.take_switches() {
            let resume = self.state;
            self.set_state(BusState::ChannelSwitch, switch.at);
            self.events.push(BusEvent::ChannelSwitched(switch));
            self.set_state(resume, switch.at);
        }
    }

    fn finish_transmission(&mut self, now: Timestamp) {
        let active = match self.active {
            Some(active) if now >= active.ends_at => active,
            _ => return,
        };
        self.active = None;
        info!("Command {} completed at {}", active.id, active.ends_at);
        self.record_outcome(
            active.id,
            CommandOutcome::Transmitted {
                started_at: active.started_at,
                finished_at: active.ends_at,
            },
        );
        self.events.push(BusEvent::CommandCompleted {
            id: active.id,
            at: active.ends_at,
        });
        self.set_state(BusState::Listening, active.ends_at);
    }

    fn expire_pending(&mut self, now: Timestamp) {
        let (expired, kept): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|c| c.deadline < now);
        self.pending = kept.into();
        for command in expired {
            let error = BusError::CommandTimeout { id: command.id };
            warn!("{}", error);
            self.reject(command.id, error);
        }
    }

    fn report_stale(&mut self, now: Timestamp) {
        for unit in self.model.stale_units(now) {
            if self.stale_reported.insert(unit) {
                info!("{} stale at {}", unit, now);
                self.events.push(BusEvent::UnitStale { unit, at: now });
            }
        }
    }

    fn bus_available(&self, now: Timestamp) -> bool {
        if self.state != BusState::Listening || self.active.is_some() || self.recovery.in_frame() {
            return false;
        }
        self.recovery
            .idle_since()
            .is_some_and(|since| now.saturating_since(since) >= self.config.timing.idle_threshold())
    }

    fn start_transmission<P>(&mut self, sink: &mut P, now: Timestamp) -> Result<()>
    where
        P: PulseSink + ?Sized,
    {
        if self.pending.is_empty() || !self.bus_available(now) {
            return Ok(());
        }
        let command = match self.pending.pop_front() {
            Some(command) => command,
            None => return Ok(()),
        };

        let channel = self.channel();
        let bits = match self.encoder.encode(&command.target, channel) {
            Ok(bits) => bits,
            Err(e) => {
                warn!("Command {} not encodable on {}: {}", command.id, channel, e);
                self.reject(command.id, BusError::from(e));
                return Ok(());
            }
        };
        let waveform: Waveform = self.encoder.waveform(&bits);

        if let Err(e) = sink.transmit(&waveform, now) {
            warn!("Command {} failed to start: {}", command.id, e);
            self.reject(command.id, e.clone());
            return Err(e);
        }

        let ends_at = now + waveform.duration();
        info!("Command {} on {} at {}: [{}]", command.id, channel, now, bits);
        self.active = Some(ActiveTransmission {
            id: command.id,
            started_at: now,
            ends_at,
        });
        self.events.push(BusEvent::CommandStarted {
            id: command.id,
            bits,
            at: now,
        });
        self.set_state(BusState::Transmitting, now);
        Ok(())
    }

    fn reject(&mut self, id: CommandId, error: BusError) {
        self.record_outcome(id, CommandOutcome::Rejected(error.clone()));
        self.events.push(BusEvent::CommandRejected { id, error });
    }

    fn record_outcome(&mut self, id: CommandId, outcome: CommandOutcome) {
        self.outcomes.insert(id, outcome);
        while self.outcomes.len() > self.config.outcome_history {
            if let Some((dropped, _)) = self.outcomes.pop_first() {
                debug!("Outcome of command {} dropped untaken", dropped);
            }
        }
    }

    fn set_state(&mut self, to: BusState, at: Timestamp) {
        if self.state == to {
            return;
        }
        info!("Bus {} -> {} at {}", self.state, to, at);
        self.events.push(BusEvent::StateChanged {
            from: self.state,
            to,
            at,
        });
        self.state = to;
    }
}

/// Builder for [`BusController`]
pub struct BusControllerBuilder {
    config: BusConfig,
}

impl BusControllerBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        BusControllerBuilder {
            config: BusConfig::default(),
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the bit timing
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.config.timing = timing;
        self
    }

    /// Set the channel switch interval
    pub fn with_channel_switch_interval(mut self, interval: Duration) -> Self {
        self.config.channel_switch_interval = interval;
        self
    }

    /// Set the number of missed frame periods before a unit is stale
    pub fn with_stale_periods(mut self, periods: u32) -> Self {
        self.config.stale_periods = periods;
        self
    }

    /// Set the number of frame periods a command may wait for the bus
    pub fn with_schedule_timeout_periods(mut self, periods: u32) -> Self {
        self.config.schedule_timeout_periods = periods;
        self
    }

    /// Set how many finished outcomes are kept for `take_outcome`
    pub fn with_outcome_history(mut self, outcomes: usize) -> Self {
        self.config.outcome_history = outcomes;
        self
    }

    /// Build the controller
    pub fn build(self) -> Result<BusController> {
        BusController::new(self.config)
    }
}

impl Default for BusControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Edge, Mode};
    use crate::sampler::RecordingSink;

    fn controller() -> BusController {
        let mut bc = BusControllerBuilder::new().build().unwrap();
        bc.start(Timestamp::ZERO);
        bc
    }

    fn target(fan: u8) -> UnitSettings {
        UnitSettings::new(UnitId::new(1), fan, Mode::HeatRecovery)
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        assert!(BusControllerBuilder::new().with_stale_periods(0).build().is_err());
        assert!(BusControllerBuilder::default()
            .with_schedule_timeout_periods(5)
            .build()
            .is_ok());
    }

    #[test]
    fn test_start_moves_to_listening() {
        let mut bc = BusControllerBuilder::new().build().unwrap();
        assert_eq!(bc.state(), BusState::Idle);
        bc.start(Timestamp::ZERO);
        assert_eq!(bc.state(), BusState::Listening);
        assert!(matches!(
            bc.drain_events().as_slice(),
            [BusEvent::StateChanged {
                from: BusState::Idle,
                to: BusState::Listening,
                ..
            }]
        ));
    }

    #[test]
    fn test_unrepresentable_submit_fails_synchronously() {
        let mut bc = controller();
        let err = bc.submit(CommandRequest::new(target(9)), Timestamp::ZERO).unwrap_err();
        assert!(matches!(err, BusError::Encode(_)));
        assert_eq!(bc.pending_count(), 0);
        assert!(bc
            .drain_events()
            .iter()
            .any(|e| matches!(e, BusEvent::EncodeFailed { .. })));
    }

    #[test]
    fn test_transmits_on_idle_bus() -> Result<()> {
        let mut bc = controller();
        let mut sink = RecordingSink::default();
        let mut source: VecDeque<Edge> = VecDeque::new();

        let id = bc.submit(CommandRequest::new(target(2)), Timestamp::from_millis(10))?;
        bc.poll(&mut source, &mut sink, Timestamp::from_millis(10))?;
        assert_eq!(bc.state(), BusState::Listening);
        assert!(sink.sent.is_empty());

        bc.poll(&mut source, &mut sink, Timestamp::from_millis(40))?;
        assert_eq!(bc.state(), BusState::Transmitting);
        assert_eq!(sink.sent.len(), 1);
        assert_eq!(bc.cancel(id).unwrap_err().to_string(), format!(
            "Command {} cannot be cancelled: transmission in progress",
            id
        ));

        let end = Timestamp::from_millis(40) + sink.sent[0].1.duration();
        bc.poll(&mut source, &mut sink, end)?;
        assert_eq!(bc.state(), BusState::Listening);
        assert_eq!(
            bc.take_outcome(id),
            Some(CommandOutcome::Transmitted {
                started_at: Timestamp::from_millis(40),
                finished_at: end,
            })
        );
        Ok(())
    }

    #[test]
    fn test_echo_updates_model() -> Result<()> {
        let mut bc = controller();
        let mut sink = RecordingSink::default();
        let mut source: VecDeque<Edge> = VecDeque::new();

        bc.submit(CommandRequest::new(target(5)), Timestamp::ZERO)?;
        bc.poll(&mut source, &mut sink, Timestamp::from_millis(50))?;
        source.extend(sink.echo());
        bc.poll(&mut source, &mut sink, Timestamp::from_millis(120))?;

        let state = bc.device_state(UnitId::new(1)).unwrap();
        assert_eq!(state.settings, target(5));
        assert!(!bc.is_stale(UnitId::new(1), Timestamp::from_millis(120)));
        Ok(())
    }

    #[test]
    fn test_cancel_pending() -> Result<()> {
        let mut bc = controller();
        let id = bc.submit(CommandRequest::new(target(1)), Timestamp::ZERO)?;
        bc.cancel(id)?;
        assert_eq!(bc.pending_count(), 0);
        assert_eq!(bc.take_outcome(id), Some(CommandOutcome::Cancelled));
        assert!(bc.cancel(id).is_err());
        assert!(bc.cancel(999).is_err());
        Ok(())
    }

    #[test]
    fn test_untaken_outcomes_are_bounded() -> Result<()> {
        let mut bc = BusControllerBuilder::new().with_outcome_history(2).build()?;
        bc.start(Timestamp::ZERO);
        let mut ids = Vec::new();
        for fan in 1..=3 {
            let id = bc.submit(CommandRequest::new(target(fan)), Timestamp::ZERO)?;
            bc.cancel(id)?;
            ids.push(id);
        }
        assert_eq!(bc.take_outcome(ids[0]), None);
        assert_eq!(bc.take_outcome(ids[1]), Some(CommandOutcome::Cancelled));
        assert_eq!(bc.take_outcome(ids[2]), Some(CommandOutcome::Cancelled));
        assert!(BusControllerBuilder::new().with_outcome_history(0).build().is_err());
        Ok(())
    }

    #[test]
    fn test_submit_requires_start() -> Result<()> {
        let mut bc = BusControllerBuilder::new().build()?;
        assert_eq!(
            bc.submit(CommandRequest::new(target(1)), Timestamp::ZERO),
            Err(BusError::NotStarted)
        );
        assert_eq!(bc.pending_count(), 0);

        bc.start(Timestamp::ZERO);
        bc.submit(CommandRequest::new(target(1)), Timestamp::ZERO)?;
        assert_eq!(bc.pending_count(), 1);
        Ok(())
    }

    #[test]
    fn test_command_times_out_on_busy_bus() -> Result<()> {
        let mut bc = controller();
        let mut sink = RecordingSink::default();
        // line pulled low and held: a frame is always in progress
        let mut source: VecDeque<Edge> = VecDeque::from(vec![Edge::falling(Timestamp::from_millis(40))]);

        let id = bc.submit(
            CommandRequest::new(target(1)).with_timeout(Duration::from_millis(20)),
            Timestamp::from_millis(40),
        )?;
        bc.poll(&mut source, &mut sink, Timestamp::from_millis(45))?;
        assert_eq!(bc.pending_count(), 1);

        bc.poll(&mut source, &mut sink, Timestamp::from_millis(61))?;
        assert_eq!(bc.pending_count(), 0);
        assert!(sink.sent.is_empty());
        assert_eq!(
            bc.take_outcome(id),
            Some(CommandOutcome::Rejected(BusError::CommandTimeout { id }))
        );
        Ok(())
    }

    #[test]
    fn test_queue_depth_limit() -> Result<()> {
        let mut bc = controller();
        for _ in 0..bc.config().command_queue_depth {
            bc.submit(CommandRequest::new(target(1)), Timestamp::ZERO)?;
        }
        assert!(matches!(
            bc.submit(CommandRequest::new(target(1)), Timestamp::ZERO),
            Err(BusError::QueueFull(_))
        ));
        Ok(())
    }

    #[test]
    fn test_next_deadline() -> Result<()> {
        let mut bc = controller();
        assert_eq!(bc.next_deadline(), None);
        bc.submit(CommandRequest::new(target(1)), Timestamp::ZERO)?;
        assert_eq!(bc.next_deadline(), Some(Timestamp::from_millis(33)));
        Ok(())
    }

    #[test]
    fn test_idle_controller_ignores_poll() -> Result<()> {
        let mut bc = BusControllerBuilder::new().build()?;
        let mut sink = RecordingSink::default();
        let mut source: VecDeque<Edge> = VecDeque::from(vec![Edge::falling(Timestamp::from_millis(1))]);
        bc.poll(&mut source, &mut sink, Timestamp::from_millis(100))?;
        assert_eq!(source.len(), 1);
        Ok(())
    }
}
