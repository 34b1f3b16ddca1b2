//! Output port: the scheduler side of a channel.
//!
//! An [`OutputPort`] owns the consumer end of one channel's ring buffer. The
//! host scheduler calls [`OutputPort::pull`] from its own thread; it never
//! blocks, returns zero items when nothing is buffered and reports
//! [`Produced::Done`] once the stream is closed and drained.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use num_complex::Complex;
use serde::Serialize;

use crate::ring_buffer::{Consumer, RingState};
use crate::session::{Session, SessionState};

/// Sample types a port can deliver.
pub trait OutputSample: Copy + Default {
    fn from_iq(sample: Complex<i16>) -> Self;
}

/// Scaled to [-1.0, 1.0).
impl OutputSample for Complex<f32> {
    fn from_iq(sample: Complex<i16>) -> Self {
        Complex::new(
            f32::from(sample.re) / 32768.0,
            f32::from(sample.im) / 32768.0,
        )
    }
}

/// Native 16 bit samples, unscaled.
impl OutputSample for Complex<i16> {
    fn from_iq(sample: Complex<i16>) -> Self {
        sample
    }
}

/// Result of a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Produced {
    /// Items written to the output, possibly zero.
    Items(usize),
    /// The stream is closed and every buffered sample was delivered.
    Done,
}

/// Health snapshot of one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub channel: usize,
    pub state: SessionState,
    pub is_streaming: bool,
    /// Samples lost because the ring buffer was full
    pub dropped_count: u64,
    /// Sequence number of the most recent block accepted
    pub last_sequence: Option<u64>,
    pub blocks: u64,
    /// Gaps in the service's sample numbering
    pub discontinuities: u64,
    pub missing_samples: u64,
    /// Blocks delivered outside the streaming state, discarded
    pub late_blocks: u64,
    pub overloads: u64,
    /// Milliseconds since session start at the last accepted block
    pub last_block_ms: Option<u64>,
    /// Samples waiting in the ring buffer
    pub buffered: usize,
    pub capacity: usize,
    /// Closed because the device was removed or failed
    pub faulted: bool,
}

impl Health {
    pub(crate) fn snapshot(session: &Session, ring: RingState) -> Self {
        let h = &session.health;
        let next_sequence = h.next_sequence.load(Ordering::Relaxed);
        let blocks = h.blocks.load(Ordering::Relaxed);
        let state = session.state();
        Health {
            channel: session.channel(),
            state,
            is_streaming: state == SessionState::Streaming,
            dropped_count: ring.dropped_count,
            last_sequence: next_sequence.checked_sub(1),
            blocks,
            discontinuities: h.discontinuities.load(Ordering::Relaxed),
            missing_samples: h.missing_samples.load(Ordering::Relaxed),
            late_blocks: h.late_blocks.load(Ordering::Relaxed),
            overloads: h.overloads.load(Ordering::Relaxed),
            last_block_ms: (blocks > 0).then(|| h.last_block_at.load(Ordering::Relaxed)),
            buffered: ring.len(),
            capacity: ring.capacity,
            faulted: session.is_faulted(),
        }
    }
}

/// Consumer end of one channel.
pub struct OutputPort {
    session: Arc<Session>,
    consumer: Consumer<Complex<i16>>,
}

impl OutputPort {
    pub(crate) fn new(session: Arc<Session>, consumer: Consumer<Complex<i16>>) -> Self {
        Self { session, consumer }
    }

    pub fn channel(&self) -> usize {
        self.session.channel()
    }

    /// Samples ready to be pulled.
    pub fn available(&self) -> usize {
        self.consumer.len()
    }

    /// Deliver up to `max_items` samples into `output`.
    ///
    /// Never blocks. An empty buffer gives `Items(0)` while the stream is
    /// live and `Done` once it is closed.
    pub fn pull<S: OutputSample>(&mut self, output: &mut [S], max_items: usize) -> Produced {
        let limit = max_items.min(output.len());
        let n = self
            .consumer
            .read_map(&mut output[..limit], S::from_iq);
        if n == 0 && self.is_done() {
            Produced::Done
        } else {
            Produced::Items(n)
        }
    }

    /// True once the session is closed and every sample was delivered.
    pub fn is_done(&mut self) -> bool {
        if !self.consumer.is_empty() {
            return false;
        }
        match self.session.state() {
            // Nothing can arrive once the callback is quiesced.
            SessionState::Draining => self.session.finish_drain() && self.consumer.is_empty(),
            SessionState::Closed => self.consumer.is_empty(),
            _ => false,
        }
    }

    pub fn health(&self) -> Health {
        Health::snapshot(&self.session, self.consumer.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::ring_buffer;
    use std::time::Instant;

    fn port(capacity: usize) -> (crate::ring_buffer::Producer<Complex<i16>>, OutputPort) {
        let session = Session::new(0);
        session.configure();
        session.begin_streaming();
        let (tx, rx) = ring_buffer(capacity);
        (tx, OutputPort::new(session, rx))
    }

    #[test]
    fn test_empty_pull_returns_zero() {
        let (_tx, mut port) = port(16);
        let mut out = [Complex::<f32>::default(); 8];
        assert_eq!(port.pull(&mut out, 8), Produced::Items(0));
    }

    #[test]
    fn test_pull_scales_to_float() {
        let (mut tx, mut port) = port(16);
        tx.write(&[Complex::new(16384, -32768), Complex::new(0, 8192)]);
        let mut out = [Complex::<f32>::default(); 8];
        assert_eq!(port.pull(&mut out, 8), Produced::Items(2));
        assert_eq!(out[0], Complex::new(0.5, -1.0));
        assert_eq!(out[1], Complex::new(0.0, 0.25));
    }

    #[test]
    fn test_pull_respects_max_items() {
        let (mut tx, mut port) = port(16);
        tx.write(&[Complex::new(1, 1); 10]);
        let mut out = [Complex::<i16>::default(); 8];
        assert_eq!(port.pull(&mut out, 3), Produced::Items(3));
        assert_eq!(port.pull(&mut out, 100), Produced::Items(7));
    }

    #[test]
    fn test_done_after_drain() {
        let (mut tx, mut port) = port(16);
        tx.write(&[Complex::new(1, 2); 4]);
        port.session.drain();
        let mut out = [Complex::<i16>::default(); 2];
        assert_eq!(port.pull(&mut out, 2), Produced::Items(2));
        assert_eq!(port.pull(&mut out, 2), Produced::Items(2));
        // Not quiesced yet: the callback might still be writing.
        assert_eq!(port.pull(&mut out, 2), Produced::Items(0));
        assert!(port.session.wait_idle(Instant::now()));
        assert_eq!(port.pull(&mut out, 2), Produced::Done);
        assert_eq!(port.health().state, SessionState::Closed);
    }

    #[test]
    fn test_health_reports_drops() {
        let (mut tx, port) = port(8);
        tx.write(&[Complex::new(0, 0); 10]);
        let health = port.health();
        assert_eq!(health.dropped_count, 3);
        assert_eq!(health.buffered, 7);
        assert_eq!(health.last_sequence, None);
        assert!(health.is_streaming);
    }
}
