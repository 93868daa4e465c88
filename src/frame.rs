//! Frame layout and decoded frame types
//!
//! A complete frame is 34 bits, transmitted in this order:
//!
//! - bit 0: start bit (always 0)
//! - bits 1-2: channel marker (`01` = IN, `10` = OUT)
//! - bits 3-6: unit address (0 = implicit single unit)
//! - bits 7-9: fan level
//! - bits 10-11: mode code
//! - bits 12-27: auxiliary bits not attributed to a known field
//! - bits 28-31: checksum nibble
//! - bit 32: odd parity over bits 1-32
//! - bit 33: stop bit (always 0)

use crate::core::{Bitvector, Channel, Mode, Timestamp, UnitId};
use crate::error::RejectReason;
use bitfield::bitfield;

bitfield! {
    /// A 34-bit frame word; bit 33 is the first bit on the wire
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct FrameWord(u64);
    impl Debug;
    u8;
    pub start, set_start: 33;
    pub channel_marker, set_channel_marker: 32, 31;
    pub unit, set_unit: 30, 27;
    pub fan_level, set_fan_level: 26, 24;
    pub mode_code, set_mode_code: 23, 22;
    pub u16, aux, set_aux: 21, 6;
    pub checksum, set_checksum: 5, 2;
    pub parity, set_parity: 1;
    pub stop, set_stop: 0;
}

impl FrameWord {
    /// Wrap a raw 34-bit word
    pub fn from_value(value: u64) -> Self {
        FrameWord(value)
    }

    /// Bits covered by the checksum (wire bits 1-27)
    pub fn body(&self) -> u32 {
        ((self.0 >> 6) & 0x7FF_FFFF) as u32
    }

    /// Checksum nibble for the current body
    pub fn compute_checksum(&self) -> u8 {
        let sum: u32 = (0..7).map(|i| (self.body() >> (i * 4)) & 0xF).sum();
        0xF - (sum & 0xF) as u8
    }

    /// Parity bit giving an odd number of ones over wire bits 1-32
    pub fn compute_parity(&self) -> bool {
        let ones = ((self.0 >> 2) & 0x7FFF_FFFF).count_ones();
        ones % 2 == 0
    }

    /// Fill in checksum and parity for the current body
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.set_checksum(checksum);
        let parity = self.compute_parity();
        self.set_parity(parity);
    }

    /// Check checksum and parity against the body
    pub fn is_sealed(&self) -> bool {
        self.checksum() == self.compute_checksum() && self.parity() == self.compute_parity()
    }

    /// Raw word value
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// The encodable part of a unit's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitSettings {
    /// Unit the settings belong to
    pub unit: UnitId,
    /// Fan level (0-7 on the wire)
    pub fan_level: u8,
    /// Airflow mode
    pub mode: Mode,
    /// Bits with no known meaning, carried verbatim
    pub aux: u16,
}

impl UnitSettings {
    /// Create settings with all auxiliary bits clear
    pub fn new(unit: UnitId, fan_level: u8, mode: Mode) -> Self {
        UnitSettings {
            unit,
            fan_level,
            mode,
            aux: 0,
        }
    }

    /// Replace the auxiliary bits
    pub fn with_aux(mut self, aux: u16) -> Self {
        self.aux = aux;
        self
    }
}

impl std::fmt::Display for UnitSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: fan {} {} (aux {:#06x})",
            self.unit, self.fan_level, self.mode, self.aux
        )
    }
}

/// A frame that passed structural checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValidFrame {
    /// Channel active when the frame was decoded
    pub channel: Channel,
    /// Decoded unit settings
    pub settings: UnitSettings,
    /// Start of the frame on the wire
    pub timestamp: Timestamp,
    /// Bits the frame was decoded from
    pub raw: Bitvector,
}

/// A frame that failed structural checks, kept for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RejectedFrame {
    /// Reason code
    pub reason: RejectReason,
    /// Channel assumed at decode time
    pub channel: Channel,
    /// Start of the frame on the wire
    pub timestamp: Timestamp,
    /// Bits as recovered
    pub raw: Bitvector,
}

/// Outcome of decoding one bitvector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Frame {
    /// Passed all checks
    Valid(ValidFrame),
    /// Failed a check; the reason is recorded
    Rejected(RejectedFrame),
}

impl Frame {
    /// Whether the frame passed validation
    pub fn is_valid(&self) -> bool {
        matches!(self, Frame::Valid(_))
    }

    /// The valid frame, if any
    pub fn valid(&self) -> Option<&ValidFrame> {
        match self {
            Frame::Valid(frame) => Some(frame),
            Frame::Rejected(_) => None,
        }
    }

    /// Reject reason, if rejected
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Frame::Valid(_) => None,
            Frame::Rejected(frame) => Some(frame.reason),
        }
    }

    /// Channel the frame is tagged with
    pub fn channel(&self) -> Channel {
        match self {
            Frame::Valid(frame) => frame.channel,
            Frame::Rejected(frame) => frame.channel,
        }
    }

    /// Start of the frame on the wire
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Frame::Valid(frame) => frame.timestamp,
            Frame::Rejected(frame) => frame.timestamp,
        }
    }

    /// Bits the frame was built from
    pub fn raw(&self) -> &Bitvector {
        match self {
            Frame::Valid(frame) => &frame.raw,
            Frame::Rejected(frame) => &frame.raw,
        }
    }
}

/// Parse a bitvector into channel marker and settings
///
/// Checks run in order: length, start/stop bits, checksum and parity,
/// then channel and mode patterns.
pub fn parse_bits(bits: &Bitvector) -> std::result::Result<(Channel, UnitSettings), RejectReason> {
    if !bits.is_full() {
        return Err(RejectReason::InsufficientBits);
    }

    let word = FrameWord::from_value(bits.word());
    if word.start() || word.stop() {
        return Err(RejectReason::UnknownPattern);
    }
    if !word.is_sealed() {
        return Err(RejectReason::ChecksumMismatch);
    }

    let channel = Channel::from_marker(word.channel_marker()).ok_or(RejectReason::UnknownPattern)?;
    let mode = Mode::from_code(word.mode_code()).ok_or(RejectReason::UnknownPattern)?;

    Ok((
        channel,
        UnitSettings {
            unit: UnitId::new(word.unit()),
            fan_level: word.fan_level(),
            mode,
            aux: word.aux(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn sealed_word(channel: Channel, settings: &UnitSettings) -> FrameWord {
        let mut word = FrameWord(0);
        word.set_channel_marker(channel.marker());
        word.set_unit(settings.unit.value());
        word.set_fan_level(settings.fan_level);
        word.set_mode_code(settings.mode.code());
        word.set_aux(settings.aux);
        word.seal();
        word
    }

    #[test]
    fn test_field_positions() -> Result<()> {
        let mut word = FrameWord(0);
        word.set_channel_marker(Channel::In.marker());
        let bits = Bitvector::from_word(word.value())?;
        assert_eq!(&bits.to_string()[..3], "001");

        let mut word = FrameWord(0);
        word.set_unit(0b1001);
        let bits = Bitvector::from_word(word.value())?;
        assert_eq!(&bits.to_string()[3..7], "1001");

        let mut word = FrameWord(0);
        word.set_aux(0x8001);
        let bits = Bitvector::from_word(word.value())?;
        assert_eq!(&bits.to_string()[12..28], "1000000000000001");
        Ok(())
    }

    #[test]
    fn test_seal_and_verify() {
        let settings = UnitSettings::new(UnitId::new(3), 5, Mode::Extract).with_aux(0x1234);
        let word = sealed_word(Channel::Out, &settings);
        assert!(word.is_sealed());
        assert!(!word.stop());
        assert!(!word.start());

        let mut tampered = word;
        tampered.set_fan_level(4);
        assert!(!tampered.is_sealed());
    }

    #[test]
    fn test_parity_is_odd() {
        let word = sealed_word(Channel::In, &UnitSettings::new(UnitId::IMPLICIT, 0, Mode::HeatRecovery));
        let ones = ((word.value() >> 1) & 0xFFFF_FFFF).count_ones();
        assert_eq!(ones % 2, 1);
    }

    #[test]
    fn test_parse_valid() -> Result<()> {
        let settings = UnitSettings::new(UnitId::new(1), 2, Mode::Supply).with_aux(0x0C30);
        let bits = Bitvector::from_word(sealed_word(Channel::In, &settings).value())?;
        assert_eq!(parse_bits(&bits), Ok((Channel::In, settings)));
        Ok(())
    }

    #[test]
    fn test_parse_rejections() -> Result<()> {
        assert_eq!(parse_bits(&Bitvector::new()), Err(RejectReason::InsufficientBits));

        let settings = UnitSettings::new(UnitId::new(1), 2, Mode::Supply);
        let word = sealed_word(Channel::In, &settings);

        let truncated: Bitvector = Bitvector::from_word(word.value())?.to_string()[..30].parse()?;
        assert_eq!(parse_bits(&truncated), Err(RejectReason::InsufficientBits));

        let flipped = Bitvector::from_word(word.value() ^ (1 << 20))?;
        assert_eq!(parse_bits(&flipped), Err(RejectReason::ChecksumMismatch));

        let mut stopless = word;
        stopless.set_stop(true);
        assert_eq!(
            parse_bits(&Bitvector::from_word(stopless.value())?),
            Err(RejectReason::UnknownPattern)
        );

        let mut no_channel = word;
        no_channel.set_channel_marker(0b11);
        no_channel.seal();
        assert_eq!(
            parse_bits(&Bitvector::from_word(no_channel.value())?),
            Err(RejectReason::UnknownPattern)
        );

        let mut bad_mode = word;
        bad_mode.set_mode_code(0b11);
        bad_mode.seal();
        assert_eq!(
            parse_bits(&Bitvector::from_word(bad_mode.value())?),
            Err(RejectReason::UnknownPattern)
        );
        Ok(())
    }
}
