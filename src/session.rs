//! Stream session state machine.
//!
//! A session spans one streaming epoch of one channel:
//! `Created -> Configuring -> Streaming -> Draining -> Closed`. The state is
//! an `AtomicU8` shared by the control thread, the vendor callback thread and
//! the scheduler thread.
//!
//! The callback thread brackets each block with [`Session::enter`]; `stop()`
//! moves the session to `Draining` and then waits on [`Session::wait_idle`]
//! for in-flight callbacks to leave. Both sides use `SeqCst` so that once the
//! wait returns, no callback can still be writing.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Stream session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    /// Device opened, parameters may be set, callback not registered.
    Configuring = 1,
    /// Callback registered, blocks are written to the ring buffer.
    Streaming = 2,
    /// Stop requested; blocks are discarded, the consumer drains what is left.
    Draining = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Configuring,
            2 => Self::Streaming,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Configuring => write!(f, "configuring"),
            Self::Streaming => write!(f, "streaming"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Stream health counters, written by the callback thread.
#[derive(Debug, Default)]
pub(crate) struct HealthCounters {
    pub blocks: AtomicU64,
    /// Sequence number of the last accepted block, plus one (0 = none yet).
    pub next_sequence: AtomicU64,
    pub discontinuities: AtomicU64,
    pub missing_samples: AtomicU64,
    pub late_blocks: AtomicU64,
    pub overloads: AtomicU64,
    pub last_block_at: AtomicU64,
}

/// Shared state of one stream session.
#[derive(Debug)]
pub struct Session {
    channel: usize,
    state: AtomicU8,
    in_flight: AtomicUsize,
    quiesced: AtomicBool,
    faulted: AtomicBool,
    started_at: Instant,
    pub(crate) health: HealthCounters,
}

/// Proof that a callback is inside a `Streaming` session.
pub(crate) struct InFlight<'a> {
    session: &'a Session,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.session.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Session {
    pub fn new(channel: usize) -> Arc<Self> {
        Arc::new(Self {
            channel,
            state: AtomicU8::new(SessionState::Created as u8),
            in_flight: AtomicUsize::new(0),
            quiesced: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            started_at: Instant::now(),
            health: HealthCounters::default(),
        })
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Created -> Configuring (device opened).
    pub fn configure(&self) -> bool {
        self.transition(SessionState::Created, SessionState::Configuring)
    }

    /// Configuring -> Streaming, before the callback is registered.
    pub fn begin_streaming(&self) -> bool {
        self.transition(SessionState::Configuring, SessionState::Streaming)
    }

    /// Streaming -> Configuring, when the hardware failed to start.
    pub fn abort_start(&self) -> bool {
        self.transition(SessionState::Streaming, SessionState::Configuring)
    }

    /// Streaming -> Draining. Callbacks arriving from now on are discarded.
    pub fn drain(&self) -> bool {
        self.transition(SessionState::Streaming, SessionState::Draining)
    }

    /// Draining -> Closed, once the callback is quiesced and the buffer is empty.
    pub fn finish_drain(&self) -> bool {
        self.quiesced.load(Ordering::SeqCst)
            && self.transition(SessionState::Draining, SessionState::Closed)
    }

    /// Any state -> Closed.
    pub fn close(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
    }

    /// Closed because of a device error rather than a stop.
    pub fn fail(&self) {
        self.faulted.store(true, Ordering::SeqCst);
        self.close();
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Register a callback invocation. Returns `None`, after counting the
    /// block as late, when the session is not `Streaming`.
    pub(crate) fn enter(&self) -> Option<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight { session: self };
        if self.state.load(Ordering::SeqCst) == SessionState::Streaming as u8 {
            Some(guard)
        } else {
            drop(guard);
            self.health.late_blocks.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Wait until no callback is inside the session.
    ///
    /// Must be called after leaving `Streaming`. Returns false on timeout.
    pub(crate) fn wait_idle(&self, deadline: Instant) -> bool {
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                self.quiesced.store(true, Ordering::SeqCst);
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::SeqCst)
    }

    /// Milliseconds since the session was created, the callback clock.
    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
