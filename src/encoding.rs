//! Command encoding into bit patterns and pulse-timed waveforms

use crate::config::TimingConfig;
use crate::core::{Bitvector, Channel, Direction, Edge, Timestamp, UnitId};
use crate::error::{EncodeError, EncodeResult};
use crate::frame::{FrameWord, UnitSettings};
use crate::wire;
use log::debug;
use std::time::Duration;

/// One constant-level segment of a waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pulse {
    /// Line level (`true` = high)
    pub level: bool,
    /// How long the level is held
    pub duration: Duration,
}

/// Ordered pulse/gap durations realizing one frame on the wire
///
/// The line is assumed idle (high) before the first pulse and is released
/// high after the last one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Waveform {
    pulses: Vec<Pulse>,
}

impl Waveform {
    /// Merge equal adjacent bits into pulses of whole quanta
    pub fn from_bitvector(bits: &Bitvector, pulse_width: Duration) -> Self {
        let mut pulses: Vec<Pulse> = Vec::new();
        for bit in bits.iter() {
            match pulses.last_mut() {
                Some(last) if last.level == bit => last.duration += pulse_width,
                _ => pulses.push(Pulse {
                    level: bit,
                    duration: pulse_width,
                }),
            }
        }
        Waveform { pulses }
    }

    /// Pulses in transmission order
    pub fn pulses(&self) -> &[Pulse] {
        &self.pulses
    }

    /// Total time the waveform occupies the bus
    pub fn duration(&self) -> Duration {
        self.pulses.iter().map(|p| p.duration).sum()
    }

    /// Edges produced when the waveform starts at `start` on an idle line
    pub fn edges(&self, start: Timestamp) -> Vec<Edge> {
        let mut edges = Vec::with_capacity(self.pulses.len() + 1);
        let mut level = true;
        let mut at = start;
        for pulse in &self.pulses {
            if pulse.level != level {
                edges.push(Edge::new(at, Direction::towards(pulse.level)));
                level = pulse.level;
            }
            at = at + pulse.duration;
        }
        if !level {
            edges.push(Edge::rising(at));
        }
        edges
    }
}

/// Encoder for commanded unit settings
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    timing: TimingConfig,
}

impl CommandEncoder {
    /// Create an encoder for the given timing
    pub fn new(timing: TimingConfig) -> Self {
        CommandEncoder { timing }
    }

    /// Timing the encoder generates for
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Encode settings as a 34-bit frame on `channel`
    ///
    /// Fails with [`EncodeError::Unrepresentable`] when a field does not fit
    /// its bits, when the pattern would hold the line high long enough to
    /// look like an idle gap to a receiver at the edge of the drift
    /// tolerance, or when the frame exceeds the duration budget.
    pub fn encode(&self, target: &UnitSettings, channel: Channel) -> EncodeResult<Bitvector> {
        if target.unit.value() > UnitId::MAX {
            return Err(EncodeError::unrepresentable(format!(
                "{} exceeds 4-bit address",
                target.unit
            )));
        }
        if target.fan_level > 0b111 {
            return Err(EncodeError::unrepresentable(format!(
                "fan level {} exceeds 3 bits",
                target.fan_level
            )));
        }

        let mut word = FrameWord::from_value(0);
        word.set_channel_marker(channel.marker());
        word.set_unit(target.unit.value());
        word.set_fan_level(target.fan_level);
        word.set_mode_code(target.mode.code());
        word.set_aux(target.aux);
        word.seal();

        let bits = Bitvector::from_word(word.value())
            .map_err(|e| EncodeError::unrepresentable(e.to_string()))?;

        let high_run = bits.longest_run(true);
        if high_run > self.timing.max_high_run() {
            return Err(EncodeError::unrepresentable(format!(
                "{} high bits in a row would read as an idle gap",
                high_run
            )));
        }

        let duration = self.timing.pulse_width * wire::FRAME_BITS as u32;
        if duration > self.timing.max_frame_duration {
            return Err(EncodeError::unrepresentable(format!(
                "frame needs {:?}, budget is {:?}",
                duration, self.timing.max_frame_duration
            )));
        }

        debug!("Encoded {} on {} as [{}]", target, channel, bits);
        Ok(bits)
    }

    /// Realize bits as a pulse-timed waveform
    pub fn waveform(&self, bits: &Bitvector) -> Waveform {
        Waveform::from_bitvector(bits, self.timing.pulse_width)
    }

    /// Encode settings straight to a waveform
    pub fn encode_waveform(&self, target: &UnitSettings, channel: Channel) -> EncodeResult<Waveform> {
        let bits = self.encode(target, channel)?;
        Ok(self.waveform(&bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Mode;
    use crate::decoder::FrameDecoder;
    use crate::recovery::BitRecovery;

    fn encoder() -> CommandEncoder {
        CommandEncoder::new(TimingConfig::default())
    }

    #[test]
    fn test_encode_known_pattern() {
        let target = UnitSettings::new(UnitId::new(1), 2, Mode::HeatRecovery).with_aux(0x0C30);
        let bits = encoder().encode(&target, Channel::In).unwrap();
        assert_eq!(bits.to_string(), "0010001010000000110000110000010010");
    }

    #[test]
    fn test_waveform_merges_runs() {
        let bits: Bitvector = "0011101".parse().unwrap();
        let q = Duration::from_micros(1_650);
        let waveform = Waveform::from_bitvector(&bits, q);
        let levels: Vec<(bool, Duration)> = waveform.pulses().iter().map(|p| (p.level, p.duration)).collect();
        assert_eq!(
            levels,
            vec![(false, q * 2), (true, q * 3), (false, q), (true, q)]
        );
        assert_eq!(waveform.duration(), q * 7);
    }

    #[test]
    fn test_waveform_edges() {
        let bits: Bitvector = "0110".parse().unwrap();
        let waveform = Waveform::from_bitvector(&bits, Duration::from_micros(1_000));
        let edges = waveform.edges(Timestamp::from_micros(10_000));
        assert_eq!(
            edges,
            vec![
                Edge::falling(Timestamp::from_micros(10_000)),
                Edge::rising(Timestamp::from_micros(11_000)),
                Edge::falling(Timestamp::from_micros(13_000)),
                Edge::rising(Timestamp::from_micros(14_000)),
            ]
        );
    }

    #[test]
    fn test_waveform_round_trips_through_decoder() {
        let encoder = encoder();
        let target = UnitSettings::new(UnitId::new(9), 6, Mode::Supply).with_aux(0xBEEF);
        let waveform = encoder.encode_waveform(&target, Channel::Out).unwrap();
        assert!(waveform.duration() <= encoder.timing().max_frame_duration);

        let mut engine = BitRecovery::new(encoder.timing().clone());
        engine.prime_idle(Timestamp::ZERO);
        let recovered: Vec<_> = waveform
            .edges(Timestamp::from_millis(40))
            .into_iter()
            .filter_map(|e| engine.push_edge(e))
            .collect();
        assert_eq!(recovered.len(), 1);
        let recovered = recovered[0].unwrap();

        let mut decoder = FrameDecoder::new(Duration::from_secs(70));
        let frame = decoder.decode(&recovered.bits, recovered.started_at);
        let valid = frame.valid().unwrap();
        assert_eq!(valid.settings, target);
        assert_eq!(valid.channel, Channel::Out);
    }

    #[test]
    fn test_unrepresentable_fields() {
        let encoder = encoder();
        let fan = UnitSettings::new(UnitId::new(1), 8, Mode::Extract);
        assert!(matches!(
            encoder.encode(&fan, Channel::In),
            Err(EncodeError::Unrepresentable(_))
        ));

        let unit = UnitSettings::new(UnitId::new(16), 1, Mode::Extract);
        assert!(encoder.encode(&unit, Channel::In).is_err());
    }

    #[test]
    fn test_unrepresentable_idle_lookalike() {
        let target = UnitSettings::new(UnitId::IMPLICIT, 4, Mode::Extract).with_aux(0xFFFF);
        let err = encoder().encode(&target, Channel::In).unwrap_err();
        assert!(err.to_string().contains("idle gap"));
    }

    #[test]
    fn test_idle_lookalike_keeps_drift_margin() {
        let encoder = encoder();
        for target in [
            UnitSettings::new(UnitId::IMPLICIT, 1, Mode::Extract).with_aux(0xFFFF),
            UnitSettings::new(UnitId::IMPLICIT, 0, Mode::HeatRecovery).with_aux(0x1FFF),
        ] {
            let err = encoder.encode(&target, Channel::In).unwrap_err();
            assert!(err.to_string().contains("idle gap"), "{}", target);
        }
    }

    #[test]
    fn test_longest_high_run_survives_drifted_sender() -> EncodeResult<()> {
        let encoder = encoder();
        let target = UnitSettings::new(UnitId::IMPLICIT, 0, Mode::Extract).with_aux(0xFFFF);
        let bits = encoder.encode(&target, Channel::In)?;
        assert_eq!(bits.longest_run(true), encoder.timing().max_high_run());

        // sender clock at either edge of the 15% tolerance
        for quantum in [1_403, 1_897] {
            let waveform = Waveform::from_bitvector(&bits, Duration::from_micros(quantum));
            let mut engine = BitRecovery::new(encoder.timing().clone());
            engine.prime_idle(Timestamp::ZERO);
            let recovered: Vec<_> = waveform
                .edges(Timestamp::from_millis(40))
                .into_iter()
                .filter_map(|e| engine.push_edge(e))
                .collect();
            assert_eq!(recovered.len(), 1, "quantum {}", quantum);
            let recovered = recovered[0].unwrap();

            let mut decoder = FrameDecoder::new(Duration::from_secs(70));
            let frame = decoder.decode(&recovered.bits, recovered.started_at);
            assert_eq!(frame.valid().map(|f| f.settings), Some(target));
        }
        Ok(())
    }

    #[test]
    fn test_unrepresentable_over_budget() {
        let mut timing = TimingConfig::default();
        timing.pulse_width = Duration::from_micros(2_000);
        let encoder = CommandEncoder::new(timing);
        let target = UnitSettings::new(UnitId::new(1), 1, Mode::HeatRecovery);
        let err = encoder.encode(&target, Channel::In).unwrap_err();
        assert!(err.to_string().contains("budget"));
    }
}
