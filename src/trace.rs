//! Golden traces captured with a logic analyser
//!
//! A trace is a CSV export with one `seconds,level` row per sample and an
//! optional header row starting with `Time`. Consecutive samples at the same
//! level collapse into a single run, so both full sample dumps and
//! transition-only exports load the same way.

use crate::config::TimingConfig;
use crate::core::{Bitvector, Direction, Edge, Timestamp};
use crate::error::{BusError, EdgeTimingError, Result};
use crate::recovery::{BitRecovery, RecoveredBits};
use crate::wire;
use log::{debug, warn};
use std::time::Duration;

/// Shortest repeated pattern accepted as a real frame
pub const MIN_FRAME_BITS: usize = 30;

/// Repeats needed before a captured frame is trusted
pub const DEFAULT_MIN_REPEATS: usize = 5;

/// One constant-level stretch of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// Line level (`true` = high)
    pub level: bool,
    /// How long the level was held
    pub duration: Duration,
}

/// Edge-level view of a captured trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    initial_level: bool,
    start: Timestamp,
    edges: Vec<Edge>,
    end: Timestamp,
}

/// Frame that repeated identically across a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatedFrame {
    /// The repeated bit pattern
    pub bits: Bitvector,
    /// How many times it was seen
    pub repeats: usize,
    /// Frames abandoned on timing faults
    pub faults: usize,
}

impl std::fmt::Display for RepeatedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bits)
    }
}

impl Trace {
    /// Build a trace from a known starting level and ordered edges
    pub fn from_edges(initial_level: bool, start: Timestamp, edges: Vec<Edge>, end: Timestamp) -> Result<Self> {
        let mut level = initial_level;
        let mut last = start;
        for edge in &edges {
            if edge.at < last {
                return Err(BusError::invalid_trace(format!("edge at {} precedes {}", edge.at, last)));
            }
            if edge.direction.level_after() == level {
                return Err(BusError::invalid_trace(format!(
                    "{:?} edge at {} does not change the level",
                    edge.direction, edge.at
                )));
            }
            level = edge.direction.level_after();
            last = edge.at;
        }
        if end < last {
            return Err(BusError::invalid_trace(format!("trace ends at {} before last edge {}", end, last)));
        }
        Ok(Trace {
            initial_level,
            start,
            edges,
            end,
        })
    }

    /// Parse a logic-analyser CSV export
    pub fn from_csv(text: &str) -> Result<Self> {
        let mut samples = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("Time") {
                continue;
            }
            samples.push(parse_sample(line).map_err(|e| {
                BusError::invalid_trace(format!("line {}: {}", number + 1, e))
            })?);
        }

        let (start, initial_level) = match samples.first() {
            Some(first) => *first,
            None => return Err(BusError::invalid_trace("no samples")),
        };
        let mut end = start;
        let mut level = initial_level;
        let mut edges = Vec::new();
        for &(at, sample) in &samples[1..] {
            if at < end {
                return Err(BusError::invalid_trace(format!("sample at {} goes back in time", at)));
            }
            end = at;
            if sample != level {
                edges.push(Edge::new(at, Direction::towards(sample)));
                level = sample;
            }
        }
        debug!(
            "Loaded trace {}..{}: {} samples, {} edges",
            start,
            end,
            samples.len(),
            edges.len()
        );
        Trace::from_edges(initial_level, start, edges, end)
    }

    /// Level before the first edge
    pub fn initial_level(&self) -> bool {
        self.initial_level
    }

    /// First sample time
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Last sample time
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Edges in capture order
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Same trace moved later by `by`
    pub fn shifted(&self, by: Duration) -> Self {
        Trace {
            initial_level: self.initial_level,
            start: self.start + by,
            edges: self.edges.iter().map(|e| e.shifted(by)).collect(),
            end: self.end + by,
        }
    }

    /// Constant-level runs, the last one ending at the final sample
    pub fn runs(&self) -> Vec<Run> {
        let mut runs = Vec::with_capacity(self.edges.len() + 1);
        let mut level = self.initial_level;
        let mut since = self.start;
        for edge in &self.edges {
            runs.push(Run {
                level,
                duration: edge.at.saturating_since(since),
            });
            level = edge.direction.level_after();
            since = edge.at;
        }
        runs.push(Run {
            level,
            duration: self.end.saturating_since(since),
        });
        runs
    }

    /// Bit quantum estimated as the shortest low run
    pub fn estimate_quantum(&self) -> Option<Duration> {
        let runs = self.runs();
        let shortest_low = runs
            .iter()
            .filter(|r| !r.level && !r.duration.is_zero())
            .map(|r| r.duration)
            .min();
        shortest_low.or_else(|| runs.iter().map(|r| r.duration).filter(|d| !d.is_zero()).min())
    }

    /// Run the trace through bit recovery
    pub fn recover(&self, timing: &TimingConfig) -> Vec<std::result::Result<RecoveredBits, EdgeTimingError>> {
        self.recover_with(BitRecovery::new(timing.clone()))
    }

    fn recover_with(&self, mut engine: BitRecovery) -> Vec<std::result::Result<RecoveredBits, EdgeTimingError>> {
        if self.initial_level {
            engine.prime_idle(self.start);
        }
        let mut out: Vec<_> = self.edges.iter().filter_map(|e| engine.push_edge(*e)).collect();
        out.extend(engine.poll(self.end));
        out
    }

    /// Find the frame the capture repeats
    ///
    /// The pulse width is taken from the trace itself when it lies within
    /// the drift tolerance of `timing`. Fails when no frame is found, when
    /// frames disagree, when the frame is implausibly short, when it
    /// repeats fewer than `min_repeats` times, or when `timing` is invalid.
    pub fn extract_frame(&self, timing: &TimingConfig, min_repeats: usize) -> Result<RepeatedFrame> {
        timing.validate()?;
        let mut engine = BitRecovery::new(timing.clone());
        if let Some(quantum) = self.estimate_quantum() {
            if let Err(e) = engine.recalibrate(quantum) {
                debug!("Keeping nominal pulse width: {}", e);
            }
        }

        let mut frames: Vec<Bitvector> = Vec::new();
        let mut faults = 0;
        for step in self.recover_with(engine) {
            match step {
                Ok(recovered) => frames.push(recovered.bits),
                Err(e) => {
                    warn!("Trace frame abandoned: {}", e);
                    faults += 1;
                }
            }
        }

        let first = match frames.first() {
            Some(first) => *first,
            None => return Err(BusError::invalid_trace("no frames found")),
        };
        let differing = frames.iter().filter(|f| **f != first).count();
        if differing > 0 {
            return Err(BusError::invalid_trace(format!(
                "{} of {} frames differ, unreliable capture",
                differing,
                frames.len()
            )));
        }
        if first.len() < MIN_FRAME_BITS || first.len() > wire::FRAME_BITS {
            return Err(BusError::invalid_trace(format!(
                "frame of {} bits, unreliable capture",
                first.len()
            )));
        }
        if frames.len() < min_repeats {
            return Err(BusError::invalid_trace(format!(
                "frame seen {} times, need {}",
                frames.len(),
                min_repeats
            )));
        }
        Ok(RepeatedFrame {
            bits: first,
            repeats: frames.len(),
            faults,
        })
    }
}

fn parse_sample(line: &str) -> std::result::Result<(Timestamp, bool), String> {
    let mut fields = line.split(',').map(str::trim);
    let seconds: f64 = fields
        .next()
        .ok_or("missing time")?
        .parse()
        .map_err(|e| format!("bad time: {}", e))?;
    let level: i64 = fields
        .next()
        .ok_or("missing level")?
        .parse()
        .map_err(|e| format!("bad level: {}", e))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("time {} out of range", seconds));
    }
    let micros = (seconds * 1_000_000.0).round() as u64;
    Ok((Timestamp::from_micros(micros), level != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "Time [s],Channel 0\n\
                       0.000000,1\n\
                       0.001000,1\n\
                       0.040000,0\n\
                       0.041650,1\n\
                       0.045000,1\n";

    #[test]
    fn test_parse_collapses_levels() -> Result<()> {
        let trace = Trace::from_csv(CSV)?;
        assert!(trace.initial_level());
        assert_eq!(
            trace.edges(),
            &[
                Edge::falling(Timestamp::from_millis(40)),
                Edge::rising(Timestamp::from_micros(41_650)),
            ]
        );
        assert_eq!(trace.end(), Timestamp::from_millis(45));
        Ok(())
    }

    #[test]
    fn test_runs_and_quantum() -> Result<()> {
        let trace = Trace::from_csv(CSV)?;
        let runs = trace.runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[1], Run {
            level: false,
            duration: Duration::from_micros(1_650),
        });
        assert_eq!(trace.estimate_quantum(), Some(Duration::from_micros(1_650)));
        Ok(())
    }

    #[test]
    fn test_bad_rows() {
        assert!(Trace::from_csv("").is_err());
        assert!(Trace::from_csv("Time [s],Channel 0\n").is_err());
        let err = Trace::from_csv("0.0,1\nabc,0\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(Trace::from_csv("0.5,1\n0.4,0\n").is_err());
        assert!(Trace::from_csv("0.5\n").is_err());
    }

    #[test]
    fn test_from_edges_checks_levels() {
        let edges = vec![Edge::rising(Timestamp::from_micros(10))];
        assert!(Trace::from_edges(true, Timestamp::ZERO, edges, Timestamp::from_micros(20)).is_err());
    }

    #[test]
    fn test_shifted() -> Result<()> {
        let trace = Trace::from_csv(CSV)?.shifted(Duration::from_secs(70));
        assert_eq!(trace.start(), Timestamp::from_millis(70_000));
        assert_eq!(trace.edges()[0].at, Timestamp::from_millis(70_040));
        Ok(())
    }

    #[test]
    fn test_single_pulse_is_not_a_frame() -> Result<()> {
        let trace = Trace::from_csv(CSV)?;
        let err = trace.extract_frame(&TimingConfig::default(), 1).unwrap_err();
        assert!(err.to_string().contains("no frames"));
        Ok(())
    }

    #[test]
    fn test_zero_pulse_width_is_rejected() -> Result<()> {
        let trace = Trace::from_csv(CSV)?;
        let mut timing = TimingConfig::default();
        timing.pulse_width = Duration::ZERO;
        assert!(matches!(trace.extract_frame(&timing, 1), Err(BusError::InvalidConfig(_))));
        assert!(trace.recover(&timing).iter().all(|r| r.is_err()));
        Ok(())
    }
}
