//! Edge input and pulse output seams
//!
//! Edge capture usually runs in an interrupt or timer context. It hands
//! edges to the decode path through a single-producer/single-consumer
//! queue, which keeps them in order; a full queue is reported to the
//! producer rather than silently dropping an edge.

use crate::core::{Edge, Timestamp};
use crate::encoding::Waveform;
use crate::error::{BusError, Result};
use heapless::spsc::{Consumer, Producer, Queue};
use std::collections::VecDeque;

/// Fixed-capacity edge queue; holds `N - 1` edges
pub type EdgeQueue<const N: usize> = Queue<Edge, N>;

/// Source of chronologically ordered edges
pub trait EdgeSource {
    /// Next captured edge, or `None` if nothing is pending
    fn next_edge(&mut self) -> Option<Edge>;
}

/// Output driver that realizes waveforms on the bus
pub trait PulseSink {
    /// Start driving `waveform` at `start`
    ///
    /// Once started the waveform must run to completion.
    fn transmit(&mut self, waveform: &Waveform, start: Timestamp) -> Result<()>;
}

impl<'a, const N: usize> EdgeSource for Consumer<'a, Edge, N> {
    fn next_edge(&mut self) -> Option<Edge> {
        self.dequeue()
    }
}

impl EdgeSource for VecDeque<Edge> {
    fn next_edge(&mut self) -> Option<Edge> {
        self.pop_front()
    }
}

/// Capture-side half of an [`EdgeQueue`]
pub struct EdgeProducer<'a, const N: usize> {
    inner: Producer<'a, Edge, N>,
    last: Option<Timestamp>,
}

impl<'a, const N: usize> EdgeProducer<'a, N> {
    /// Wrap the producer half of a split queue
    pub fn new(inner: Producer<'a, Edge, N>) -> Self {
        EdgeProducer { inner, last: None }
    }

    /// Hand over one edge
    ///
    /// Rejects edges that go back in time and edges that do not fit.
    pub fn push(&mut self, edge: Edge) -> Result<()> {
        if let Some(last) = self.last {
            if edge.at < last {
                return Err(BusError::invalid_trace(format!(
                    "edge at {} precedes previous edge at {}",
                    edge.at, last
                )));
            }
        }
        self.inner
            .enqueue(edge)
            .map_err(|e| BusError::queue_full(format!("edge queue full, edge at {} not queued", e.at)))?;
        self.last = Some(edge.at);
        Ok(())
    }

    /// Free slots left in the queue
    pub fn free(&self) -> usize {
        self.inner.capacity() - self.inner.len()
    }
}

/// Split a queue into capture and decode halves
pub fn split<const N: usize>(queue: &mut EdgeQueue<N>) -> (EdgeProducer<'_, N>, Consumer<'_, Edge, N>) {
    let (producer, consumer) = queue.split();
    (EdgeProducer::new(producer), consumer)
}

/// Sink that records every transmitted waveform
#[derive(Debug, Default)]
pub struct RecordingSink {
    /// Waveforms with their start times
    pub sent: Vec<(Timestamp, Waveform)>,
}

impl RecordingSink {
    /// Edges of everything sent so far, as an echo on the shared line
    pub fn echo(&self) -> Vec<Edge> {
        self.sent.iter().flat_map(|(start, w)| w.edges(*start)).collect()
    }
}

impl PulseSink for RecordingSink {
    fn transmit(&mut self, waveform: &Waveform, start: Timestamp) -> Result<()> {
        self.sent.push((start, waveform.clone()));
        Ok(())
    }
}
