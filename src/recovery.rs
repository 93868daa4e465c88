//! Bit recovery from timestamped edges
//!
//! The line idles high. A frame starts with the first falling edge after
//! an idle run of at least `idle_quanta` pulse widths; each level run
//! between two edges contributes `round(run / quantum)` bits of that
//! level, where the quantum is measured over the bits already received in
//! the frame (the nominal pulse width for the first run). A frame is complete once 34 bits are in and the line returns
//! high, or is cut short when the line stays high for a full idle gap.
//!
//! Any run outside the drift tolerance abandons the frame in progress;
//! the engine then waits for the next idle gap before starting again.

use crate::config::TimingConfig;
use crate::core::{Bitvector, Edge, Timestamp};
use crate::error::{BusError, EdgeTimingError, Result, TimingFault};
use log::{debug, trace, warn};
use std::time::Duration;

/// Bits recovered from one frame window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecoveredBits {
    /// Recovered bits; fewer than 34 if the frame was cut short
    pub bits: Bitvector,
    /// Falling edge that opened the frame
    pub started_at: Timestamp,
    /// Last edge that belonged to the frame
    pub ended_at: Timestamp,
}

/// Output of one engine step
pub type Recovery = Option<std::result::Result<RecoveredBits, EdgeTimingError>>;

#[derive(Debug, Clone)]
enum RxState {
    /// Waiting for an idle gap; `idle_since` is set while the line is high
    Hunting { idle_since: Option<Timestamp> },
    /// Inside a frame
    Receiving {
        started_at: Timestamp,
        last_edge: Timestamp,
        level: bool,
        bits: Bitvector,
    },
}

/// Counters kept by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecoveryStats {
    /// Complete 34-bit frames
    pub complete: u32,
    /// Frames cut short by an idle gap
    pub truncated: u32,
    /// Frames abandoned on a timing fault
    pub abandoned: u32,
}

/// Converts an ordered edge stream into bitvectors
#[derive(Debug, Clone)]
pub struct BitRecovery {
    timing: TimingConfig,
    state: RxState,
    last_edge: Option<Timestamp>,
    last_frame_start: Option<Timestamp>,
    last_period: Option<Duration>,
    stats: RecoveryStats,
}

impl BitRecovery {
    /// Create an engine; the line level is unknown until the first edge
    pub fn new(timing: TimingConfig) -> Self {
        BitRecovery {
            timing,
            state: RxState::Hunting { idle_since: None },
            last_edge: None,
            last_frame_start: None,
            last_period: None,
            stats: RecoveryStats::default(),
        }
    }

    /// Declare the line known to be idle (high) since `at`
    pub fn prime_idle(&mut self, at: Timestamp) {
        if let RxState::Hunting { idle_since } = &mut self.state {
            *idle_since = Some(at);
        }
    }

    /// Replace the pulse width with one measured from live traffic
    ///
    /// The measurement must be non-zero and lie within the drift tolerance
    /// of the current pulse width.
    pub fn recalibrate(&mut self, measured: Duration) -> Result<()> {
        let nominal = self.timing.pulse_width.as_secs_f64();
        let deviation = (measured.as_secs_f64() - nominal).abs() / nominal;
        if measured.is_zero() || deviation > self.timing.tolerance {
            return Err(BusError::invalid_config(format!(
                "measured pulse width {:?} deviates {:.0}% from {:?}",
                measured,
                deviation * 100.0,
                self.timing.pulse_width
            )));
        }
        debug!("Pulse width recalibrated to {:?}", measured);
        self.timing.pulse_width = measured;
        Ok(())
    }

    /// Timing references in use
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Whether a frame is being received
    pub fn in_frame(&self) -> bool {
        matches!(self.state, RxState::Receiving { .. })
    }

    /// Since when the line has been idle, if known and not in a frame
    pub fn idle_since(&self) -> Option<Timestamp> {
        match self.state {
            RxState::Hunting { idle_since } => idle_since,
            RxState::Receiving { .. } => None,
        }
    }

    /// Timestamp of the most recent edge
    pub fn last_edge(&self) -> Option<Timestamp> {
        self.last_edge
    }

    /// Interval between the two most recent frame starts
    pub fn last_period(&self) -> Option<Duration> {
        self.last_period
    }

    /// Engine counters
    pub fn stats(&self) -> RecoveryStats {
        self.stats
    }

    /// Feed the next edge
    pub fn push_edge(&mut self, edge: Edge) -> Recovery {
        if let Some(last) = self.last_edge {
            if edge.at < last {
                let level = edge.direction.level_after();
                let bits = self.bits_in_progress();
                return Some(Err(self.abandon(TimingFault::NonMonotonic, edge.at, 0, bits, level)));
            }
        }
        self.last_edge = Some(edge.at);
        let level_after = edge.direction.level_after();

        match std::mem::replace(&mut self.state, RxState::Hunting { idle_since: None }) {
            RxState::Hunting { idle_since } => {
                if level_after {
                    self.state = RxState::Hunting {
                        idle_since: Some(edge.at),
                    };
                    return None;
                }
                match idle_since {
                    Some(since) if edge.at.saturating_since(since) >= self.timing.idle_threshold() => {
                        self.open_frame(edge.at);
                    }
                    _ => trace!("Falling edge at {} without idle gap", edge.at),
                }
                None
            }
            RxState::Receiving {
                started_at,
                last_edge,
                level,
                mut bits,
            } => {
                let run = edge.at.saturating_since(last_edge);
                let run_us = run.as_micros() as u64;

                if level_after == level {
                    return Some(Err(self.abandon(
                        TimingFault::LevelMismatch,
                        edge.at,
                        run_us,
                        bits.len(),
                        level_after,
                    )));
                }

                if level && run >= self.timing.idle_threshold() {
                    let recovered = self.close_frame(bits, started_at, last_edge);
                    self.open_frame(edge.at);
                    return Some(Ok(recovered));
                }

                if edge.at.saturating_since(started_at) > self.timing.frame_deadline() {
                    return Some(Err(self.abandon(
                        TimingFault::Overrun,
                        edge.at,
                        run_us,
                        bits.len(),
                        level_after,
                    )));
                }

                let quantum = self.frame_quantum(started_at, last_edge, &bits);
                let count = match self.classify(run, quantum) {
                    Ok(count) => count,
                    Err(fault) => {
                        return Some(Err(self.abandon(fault, edge.at, run_us, bits.len(), level_after)));
                    }
                };
                if bits.push_run(level, count).is_err() {
                    return Some(Err(self.abandon(
                        TimingFault::Overrun,
                        edge.at,
                        run_us,
                        bits.len(),
                        level_after,
                    )));
                }

                if bits.is_full() {
                    if !level_after {
                        return Some(Err(self.abandon(
                            TimingFault::Overrun,
                            edge.at,
                            run_us,
                            bits.len(),
                            level_after,
                        )));
                    }
                    let recovered = self.close_frame(bits, started_at, edge.at);
                    self.state = RxState::Hunting {
                        idle_since: Some(edge.at),
                    };
                    return Some(Ok(recovered));
                }

                self.state = RxState::Receiving {
                    started_at,
                    last_edge: edge.at,
                    level: level_after,
                    bits,
                };
                None
            }
        }
    }

    /// Account for time passing without edges
    ///
    /// Closes a frame whose line has been high for a full idle gap and
    /// abandons one whose line has been held low past the frame deadline.
    pub fn poll(&mut self, now: Timestamp) -> Recovery {
        let (started_at, last_edge, level, bits) = match &self.state {
            RxState::Receiving {
                started_at,
                last_edge,
                level,
                bits,
            } => (*started_at, *last_edge, *level, *bits),
            RxState::Hunting { .. } => return None,
        };

        let quiet = now.saturating_since(last_edge);
        if level && quiet >= self.timing.idle_threshold() {
            let recovered = self.close_frame(bits, started_at, last_edge);
            self.state = RxState::Hunting {
                idle_since: Some(last_edge),
            };
            return Some(Ok(recovered));
        }
        if !level && quiet > self.timing.frame_deadline() {
            let run_us = quiet.as_micros() as u64;
            return Some(Err(self.abandon(TimingFault::StuckLow, now, run_us, bits.len(), false)));
        }
        None
    }

    /// Quantum the sender is using, measured over the bits received so far
    fn frame_quantum(&self, started_at: Timestamp, last_edge: Timestamp, bits: &Bitvector) -> Duration {
        match bits.len() {
            0 => self.timing.pulse_width,
            n => last_edge.saturating_since(started_at) / n as u32,
        }
    }

    /// Number of quanta in a run, or why the run is unusable
    fn classify(&self, run: Duration, quantum: Duration) -> std::result::Result<usize, TimingFault> {
        let nominal = self.timing.pulse_width.as_secs_f64();
        let quantum = quantum.as_secs_f64();
        if (quantum - nominal).abs() > self.timing.tolerance * nominal {
            return Err(TimingFault::OutOfTolerance);
        }
        let run = run.as_secs_f64();
        let count = (run / quantum).round();
        if !count.is_finite() {
            return Err(TimingFault::Overrun);
        }
        if count < 1.0 {
            return Err(TimingFault::Glitch);
        }
        let allowed = self.timing.tolerance * count * quantum;
        if (run - count * quantum).abs() > allowed {
            return Err(TimingFault::OutOfTolerance);
        }
        Ok(count as usize)
    }

    fn open_frame(&mut self, at: Timestamp) {
        if let Some(previous) = self.last_frame_start {
            let period = at.saturating_since(previous);
            let nominal = self.timing.frame_period.as_secs_f64();
            if (period.as_secs_f64() - nominal).abs() > nominal * self.timing.tolerance {
                debug!("Frame period {:?} off nominal {:?}", period, self.timing.frame_period);
            }
            self.last_period = Some(period);
        }
        self.last_frame_start = Some(at);
        trace!("Frame opened at {}", at);
        self.state = RxState::Receiving {
            started_at: at,
            last_edge: at,
            level: false,
            bits: Bitvector::new(),
        };
    }

    fn close_frame(&mut self, bits: Bitvector, started_at: Timestamp, ended_at: Timestamp) -> RecoveredBits {
        if bits.is_full() {
            self.stats.complete += 1;
        } else {
            self.stats.truncated += 1;
            debug!("Frame at {} cut short after {} bits", started_at, bits.len());
        }
        RecoveredBits {
            bits,
            started_at,
            ended_at,
        }
    }

    fn bits_in_progress(&self) -> usize {
        match &self.state {
            RxState::Receiving { bits, .. } => bits.len(),
            RxState::Hunting { .. } => 0,
        }
    }

    fn abandon(
        &mut self,
        fault: TimingFault,
        at: Timestamp,
        run_us: u64,
        bits_recovered: usize,
        line_high: bool,
    ) -> EdgeTimingError {
        let error = EdgeTimingError {
            fault,
            at,
            run_us,
            bits_recovered,
        };
        warn!("Frame abandoned: {}", error);
        self.stats.abandoned += 1;
        self.last_edge = Some(self.last_edge.map_or(at, |last| last.max(at)));
        self.state = RxState::Hunting {
            idle_since: if line_high { Some(at) } else { None },
        };
        error
    }
}
