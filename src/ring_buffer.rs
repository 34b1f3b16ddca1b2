//! Lock-free single-producer/single-consumer ring buffer
//!
//! The vendor callback thread writes blocks of samples through a [`Producer`]
//! while the scheduler thread drains them through a [`Consumer`]. Neither side
//! ever blocks: the producer writes what fits and counts the rest as dropped,
//! the consumer takes what is available, possibly nothing.
//!
//! Both indices are kept modulo the capacity. The buffer is empty when they
//! are equal and full when the write index is one slot behind the read index,
//! so one slot is always left unused and `capacity - 1` samples fit.
//!
//! # Example
//!
//! ```
//! use sdrplay3::ring_buffer::ring_buffer;
//!
//! let (mut tx, mut rx) = ring_buffer::<u32>(8);
//! assert_eq!(tx.write(&[0, 1, 2, 3, 4]), 5);
//! assert_eq!(rx.read(3), vec![0, 1, 2]);
//! assert_eq!(tx.write(&[5, 6, 7, 8, 9, 10]), 5);
//! assert_eq!(tx.dropped_count(), 1);
//! ```

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Default number of slots, enough for several work cycles at 10 MS/s.
pub const DEFAULT_CAPACITY: usize = 65536;

/// Snapshot of the ring indices and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingState {
    pub capacity: usize,
    pub write_index: usize,
    pub read_index: usize,
    pub dropped_count: u64,
}

impl RingState {
    /// Samples buffered when the snapshot was taken.
    pub fn len(&self) -> usize {
        (self.write_index + self.capacity - self.read_index) % self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Shared<T> {
    slots: Box<[UnsafeCell<T>]>,
    write: CachePadded<AtomicUsize>,
    read: CachePadded<AtomicUsize>,
    dropped: AtomicU64,
    written: AtomicU64,
}

// Slots in [read, write) belong to the consumer, the others to the producer.
// Ownership moves with the Release stores of the indices.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> *mut T {
        debug_assert!(index < self.slots.len());
        // SAFETY: index is in bounds.
        UnsafeCell::raw_get(unsafe { self.slots.as_ptr().add(index) })
    }

    fn len(&self) -> usize {
        let cap = self.capacity();
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (write + cap - read) % cap
    }

    fn state(&self) -> RingState {
        RingState {
            capacity: self.capacity(),
            write_index: self.write.load(Ordering::Acquire),
            read_index: self.read.load(Ordering::Acquire),
            dropped_count: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Create a ring buffer with `capacity` slots, of which `capacity - 1` hold samples.
///
/// # Panics
///
/// Panics if `capacity` is smaller than 2.
pub fn ring_buffer<T: Copy + Default + Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity >= 2, "ring buffer needs at least 2 slots");
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(T::default()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared {
        slots,
        write: CachePadded::new(AtomicUsize::new(0)),
        read: CachePadded::new(AtomicUsize::new(0)),
        dropped: AtomicU64::new(0),
        written: AtomicU64::new(0),
    });
    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

/// Write side, owned by the callback thread.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy> Producer<T> {
    /// Free slots, as seen by the producer.
    pub fn free(&self) -> usize {
        self.shared.capacity() - 1 - self.shared.len()
    }

    /// Write as many samples as fit, in order, and count the remainder as dropped.
    ///
    /// Returns the number of samples written.
    pub fn write(&mut self, samples: &[T]) -> usize {
        let shared = &*self.shared;
        let cap = shared.capacity();
        let write = shared.write.load(Ordering::Relaxed);
        let read = shared.read.load(Ordering::Acquire);
        let free = (read + cap - write - 1) % cap;

        let n = samples.len().min(free);
        let first = n.min(cap - write);
        // SAFETY: the n slots starting at `write` are free, so the consumer
        // does not touch them until the index store below.
        unsafe {
            ptr::copy_nonoverlapping(samples.as_ptr(), shared.slot(write), first);
            if n > first {
                ptr::copy_nonoverlapping(samples.as_ptr().add(first), shared.slot(0), n - first);
            }
        }
        shared.write.store((write + n) % cap, Ordering::Release);

        if n < samples.len() {
            shared
                .dropped
                .fetch_add((samples.len() - n) as u64, Ordering::Relaxed);
        }
        shared.written.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Count samples lost before they reached the buffer.
    pub fn add_dropped(&self, count: u64) {
        self.shared.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Total samples ever written.
    pub fn written_count(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RingState {
        self.shared.state()
    }
}

/// Read side, owned by the scheduler thread.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy> Consumer<T> {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Samples available to read.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take up to `max_count` samples. Never blocks; may return nothing.
    pub fn read(&mut self, max_count: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max_count.min(self.len()));
        self.read_map_with(max_count, |s| out.push(s));
        out
    }

    /// Copy up to `dst.len()` samples into `dst`, returning how many were copied.
    pub fn read_into(&mut self, dst: &mut [T]) -> usize {
        let shared = &*self.shared;
        let cap = shared.capacity();
        let read = shared.read.load(Ordering::Relaxed);
        let write = shared.write.load(Ordering::Acquire);
        let available = (write + cap - read) % cap;

        let n = dst.len().min(available);
        let first = n.min(cap - read);
        // SAFETY: the n slots starting at `read` were published by the
        // producer and are not written again until the index store below.
        unsafe {
            ptr::copy_nonoverlapping(shared.slot(read), dst.as_mut_ptr(), first);
            if n > first {
                ptr::copy_nonoverlapping(shared.slot(0), dst.as_mut_ptr().add(first), n - first);
            }
        }
        shared.read.store((read + n) % cap, Ordering::Release);
        n
    }

    /// Convert up to `dst.len()` samples into `dst` with `f`.
    pub fn read_map<U>(&mut self, dst: &mut [U], mut f: impl FnMut(T) -> U) -> usize {
        let max_count = dst.len();
        let mut slots = dst.iter_mut();
        self.read_map_with(max_count, |s| {
            if let Some(slot) = slots.next() {
                *slot = f(s);
            }
        })
    }

    fn read_map_with(&mut self, max_count: usize, mut sink: impl FnMut(T)) -> usize {
        let shared = &*self.shared;
        let cap = shared.capacity();
        let read = shared.read.load(Ordering::Relaxed);
        let write = shared.write.load(Ordering::Acquire);
        let available = (write + cap - read) % cap;

        let n = max_count.min(available);
        for k in 0..n {
            // SAFETY: see `read_into`.
            sink(unsafe { ptr::read(shared.slot((read + k) % cap)) });
        }
        shared.read.store((read + n) % cap, Ordering::Release);
        n
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RingState {
        self.shared.state()
    }

    /// A read-only view of this ring for other threads.
    pub fn monitor(&self) -> RingMonitor<T> {
        RingMonitor {
            shared: self.shared.clone(),
        }
    }
}

/// Read-only view of a ring, usable from any thread.
pub struct RingMonitor<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RingMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> RingMonitor<T> {
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn written_count(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RingState {
        self.shared.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_empty_read_returns_nothing() {
        let (_tx, mut rx) = ring_buffer::<u32>(16);
        assert!(rx.read(8).is_empty());
        let mut dst = [0u32; 4];
        assert_eq!(rx.read_into(&mut dst), 0);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_write_then_read_in_order() {
        let (mut tx, mut rx) = ring_buffer::<u32>(32);
        let data: Vec<u32> = (0..31).collect();
        assert_eq!(tx.write(&data[..10]), 10);
        assert_eq!(tx.write(&data[10..]), 21);
        assert_eq!(tx.dropped_count(), 0);
        assert_eq!(rx.read(100), data);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_usable_capacity_keeps_one_sentinel_slot() {
        let (mut tx, rx) = ring_buffer::<u8>(8);
        assert_eq!(tx.free(), 7);
        assert_eq!(tx.write(&[1; 10]), 7);
        assert_eq!(tx.dropped_count(), 3);
        assert_eq!(rx.len(), 7);
        let state = rx.state();
        assert_eq!(state.write_index, 7);
        assert_eq!(state.read_index, 0);
    }

    #[test]
    fn test_overflow_scenario_seven_slots() {
        // 6 usable slots: write 5, read 3, write 6 -> 4 written, 2 dropped.
        let (mut tx, mut rx) = ring_buffer::<u32>(7);
        assert_eq!(tx.write(&[0, 1, 2, 3, 4]), 5);
        assert_eq!(rx.read(3), vec![0, 1, 2]);
        assert_eq!(tx.write(&[5, 6, 7, 8, 9, 10]), 4);
        assert_eq!(tx.dropped_count(), 2);
        assert_eq!(rx.read(4), vec![3, 4, 5, 6]);
        assert_eq!(rx.read(4), vec![7, 8]);
    }

    #[test]
    fn test_overflow_scenario_eight_slots() {
        let (mut tx, mut rx) = ring_buffer::<u32>(8);
        assert_eq!(tx.write(&[0, 1, 2, 3, 4]), 5);
        assert_eq!(rx.read(3), vec![0, 1, 2]);
        assert_eq!(tx.write(&[5, 6, 7, 8, 9, 10]), 5);
        assert_eq!(tx.dropped_count(), 1);
        assert_eq!(rx.read(4), vec![3, 4, 5, 6]);
        assert_eq!(rx.read(10), vec![7, 8, 9]);
    }

    #[test]
    fn test_valid_samples_after_overflow() {
        let (mut tx, mut rx) = ring_buffer::<u32>(4);
        assert_eq!(tx.write(&[1, 2, 3, 4, 5]), 3);
        assert_eq!(rx.read(2), vec![1, 2]);
        assert_eq!(tx.write(&[6, 7]), 2);
        assert_eq!(rx.read(10), vec![3, 6, 7]);
        assert_eq!(rx.dropped_count(), 2);
    }

    #[test]
    fn test_wraparound_read_into() {
        let (mut tx, mut rx) = ring_buffer::<u16>(5);
        for round in 0..20u16 {
            let block = [round * 3, round * 3 + 1, round * 3 + 2];
            assert_eq!(tx.write(&block), 3);
            let mut dst = [0u16; 3];
            assert_eq!(rx.read_into(&mut dst), 3);
            assert_eq!(dst, block);
        }
        assert_eq!(tx.written_count(), 60);
    }

    #[test]
    fn test_read_map_converts() {
        let (mut tx, mut rx) = ring_buffer::<i16>(8);
        tx.write(&[16384, -16384, 0]);
        let mut dst = [0f32; 2];
        assert_eq!(rx.read_map(&mut dst, |s| s as f32 / 32768.0), 2);
        assert_eq!(dst, [0.5, -0.5]);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_monitor_sees_both_sides() {
        let (mut tx, mut rx) = ring_buffer::<u8>(8);
        let monitor = rx.monitor();
        tx.write(&[0; 9]);
        assert_eq!(monitor.state().len(), 7);
        assert_eq!(monitor.dropped_count(), 2);
        rx.read(5);
        assert_eq!(monitor.state().len(), 2);
        assert_eq!(monitor.written_count(), 7);
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        const TOTAL: u64 = 200_000;
        let (mut tx, mut rx) = ring_buffer::<u64>(1024);
        let producer = thread::spawn(move || {
            let mut next = 0u64;
            while next < TOTAL {
                let end = (next + 64).min(TOTAL);
                let block: Vec<u64> = (next..end).collect();
                let n = tx.write(&block[..tx.free().min(block.len())]);
                next += n as u64;
                if n == 0 {
                    thread::yield_now();
                }
            }
            tx.dropped_count()
        });

        let mut expected = 0u64;
        let mut dst = vec![0u64; 100];
        while expected < TOTAL {
            let n = rx.read_into(&mut dst);
            for value in &dst[..n] {
                assert_eq!(*value, expected);
                expected += 1;
            }
        }
        assert_eq!(producer.join().unwrap(), 0);
    }
}
