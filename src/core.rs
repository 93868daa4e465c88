//! Core types shared by the decode and encode paths

use crate::error::{BusError, Result};
use std::ops::Add;
use std::time::Duration;

/// Monotonic timestamp with microsecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp(u64);

impl Timestamp {
    /// The origin of the time base
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create a timestamp from microseconds
    pub const fn from_micros(us: u64) -> Self {
        Timestamp(us)
    }

    /// Create a timestamp from milliseconds
    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms * 1_000)
    }

    /// Get the raw microsecond value
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let us = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(us))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}s", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// Direction of a signal transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Low-to-high
    Rising,
    /// High-to-low
    Falling,
}

impl Direction {
    /// Line level after the transition (`true` = high)
    pub fn level_after(&self) -> bool {
        matches!(self, Direction::Rising)
    }

    /// Transition that leads to `level`
    pub fn towards(level: bool) -> Self {
        if level {
            Direction::Rising
        } else {
            Direction::Falling
        }
    }
}

/// A timestamped transition on the bus signal line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Edge {
    /// When the transition happened
    pub at: Timestamp,
    /// Which way the line moved
    pub direction: Direction,
}

impl Edge {
    /// Create a new edge
    pub fn new(at: Timestamp, direction: Direction) -> Self {
        Edge { at, direction }
    }

    /// Rising edge at `at`
    pub fn rising(at: Timestamp) -> Self {
        Edge::new(at, Direction::Rising)
    }

    /// Falling edge at `at`
    pub fn falling(at: Timestamp) -> Self {
        Edge::new(at, Direction::Falling)
    }

    /// The same edge moved later in time
    pub fn shifted(&self, by: Duration) -> Self {
        Edge::new(self.at + by, self.direction)
    }
}

/// Bus channel; the bus alternates between the two roughly every 70 s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Channel {
    /// Intake phase
    In,
    /// Exhaust phase
    Out,
}

impl Channel {
    /// Two-bit marker carried in the frame
    pub fn marker(&self) -> u8 {
        match self {
            Channel::In => 0b01,
            Channel::Out => 0b10,
        }
    }

    /// Channel for a two-bit marker, `None` for unknown patterns
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker & 0b11 {
            0b01 => Some(Channel::In),
            0b10 => Some(Channel::Out),
            _ => None,
        }
    }

    /// The other channel
    pub fn other(&self) -> Self {
        match self {
            Channel::In => Channel::Out,
            Channel::Out => Channel::In,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::In => write!(f, "IN"),
            Channel::Out => write!(f, "OUT"),
        }
    }
}

/// Unit address on the bus (4 bits on the wire, 0 = implicit single unit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitId(u8);

impl UnitId {
    /// Largest address the frame can carry
    pub const MAX: u8 = 15;
    /// Unit assumed when the bus carries no addressing
    pub const IMPLICIT: UnitId = UnitId(0);

    /// Create a unit id; range is checked when the id is encoded
    pub const fn new(addr: u8) -> Self {
        UnitId(addr)
    }

    /// Get the raw address value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Whether this is the implicit single unit
    pub fn is_implicit(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_implicit() {
            write!(f, "unit (implicit)")
        } else {
            write!(f, "unit-{}", self.0)
        }
    }
}

/// Airflow mode of a ventilation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mode {
    /// Alternating supply/extract through the ceramic regenerator
    HeatRecovery,
    /// Continuous extract
    Extract,
    /// Continuous supply
    Supply,
}

impl Mode {
    /// Two-bit mode code carried in the frame
    pub fn code(&self) -> u8 {
        match self {
            Mode::HeatRecovery => 0b00,
            Mode::Extract => 0b01,
            Mode::Supply => 0b10,
        }
    }

    /// Mode for a two-bit code, `None` for the unassigned code
    pub fn from_code(code: u8) -> Option<Self> {
        match code & 0b11 {
            0b00 => Some(Mode::HeatRecovery),
            0b01 => Some(Mode::Extract),
            0b10 => Some(Mode::Supply),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::HeatRecovery => write!(f, "heat recovery"),
            Mode::Extract => write!(f, "extract"),
            Mode::Supply => write!(f, "supply"),
        }
    }
}

/// Up to 34 bits recovered from one frame, in wire order
///
/// Bits are stored left-aligned in a `u64`: the first bit on the wire
/// lands in bit 33, so a complete vector equals the frame word and a
/// truncated one is a prefix of it. Serialized as its `0`/`1` text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct Bitvector {
    bits: u64,
    len: u8,
}

impl Bitvector {
    /// Capacity of a frame in bits
    pub const MAX_BITS: usize = 34;

    /// Create an empty bitvector
    pub fn new() -> Self {
        Bitvector::default()
    }

    /// Create a full bitvector from a 34-bit frame word
    pub fn from_word(word: u64) -> Result<Self> {
        if word >> Self::MAX_BITS != 0 {
            return Err(BusError::invalid_bitvector(format!(
                "Word {:#x} exceeds {} bits",
                word,
                Self::MAX_BITS
            )));
        }
        Ok(Bitvector {
            bits: word,
            len: Self::MAX_BITS as u8,
        })
    }

    /// Append one bit
    pub fn push(&mut self, bit: bool) -> Result<()> {
        if self.is_full() {
            return Err(BusError::invalid_bitvector(format!(
                "Bitvector already holds {} bits",
                Self::MAX_BITS
            )));
        }
        if bit {
            self.bits |= 1 << (Self::MAX_BITS - 1 - self.len as usize);
        }
        self.len += 1;
        Ok(())
    }

    /// Append `count` copies of `bit`
    pub fn push_run(&mut self, bit: bool, count: usize) -> Result<()> {
        if self.len().checked_add(count).map_or(true, |n| n > Self::MAX_BITS) {
            return Err(BusError::invalid_bitvector(format!(
                "Run of {} bits overflows {} recovered bits",
                count,
                self.len()
            )));
        }
        for _ in 0..count {
            self.push(bit)?;
        }
        Ok(())
    }

    /// Bit at wire position `index`
    pub fn get(&self, index: usize) -> Option<bool> {
        if index >= self.len() {
            return None;
        }
        Some((self.bits >> (Self::MAX_BITS - 1 - index)) & 1 != 0)
    }

    /// Number of valid bits
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether no bits were recovered
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether all 34 bits are present
    pub fn is_full(&self) -> bool {
        self.len() == Self::MAX_BITS
    }

    /// Frame word; missing trailing bits read as zero
    pub fn word(&self) -> u64 {
        self.bits
    }

    /// Iterate the valid bits in wire order
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Longest run of consecutive bits equal to `level`
    pub fn longest_run(&self, level: bool) -> usize {
        let mut best = 0;
        let mut current = 0;
        for bit in self.iter() {
            if bit == level {
                current += 1;
                best = best.max(current);
            } else {
                current = 0;
            }
        }
        best
    }
}

impl std::fmt::Display for Bitvector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for bit in self.iter() {
            write!(f, "{}", if bit { '1' } else { '0' })?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Bitvector {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bits = Bitvector::new();
        for c in s.trim().chars() {
            match c {
                '0' => bits.push(false)?,
                '1' => bits.push(true)?,
                _ => {
                    return Err(BusError::invalid_bitvector(format!(
                        "Unexpected character {:?}",
                        c
                    )))
                }
            }
        }
        Ok(bits)
    }
}

impl TryFrom<String> for Bitvector {
    type Error = BusError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Bitvector> for String {
    fn from(bits: Bitvector) -> String {
        bits.to_string()
    }
}
