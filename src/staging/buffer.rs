//! Lock-free SPSC staging ring between one producer and the compressor
//!
//! Each logging thread owns exactly one `StagingBuffer`. The producer
//! reserves contiguous space, writes an entry, and publishes it by
//! advancing `producer_pos` with a release store; the compression thread
//! observes it with an acquire load, drains it, and releases the space by
//! advancing `consumer_pos`. Neither side ever takes a lock.
//!
//! Position discipline:
//!
//! - `producer_pos` and `end_of_recorded_space` are written only by the
//!   producer; `consumer_pos` only by the consumer.
//! - Equality of `producer_pos` and `consumer_pos` always means EMPTY.
//!   Every free-space check is a strict inequality so a full buffer can
//!   never collapse into the empty state.
//! - When the free run at the tail is too short, the producer records the
//!   high-water mark in `end_of_recorded_space` (release) and only then
//!   rolls `producer_pos` back to zero (release). The consumer reads them
//!   in the opposite order with matching acquires.
//! - The producer never wraps while the consumer sits at offset zero:
//!   landing on it would create position equality with live bytes still
//!   in the buffer.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;

use crossbeam_utils::CachePadded;

use crate::error::{Error, Result};

/// Single-producer single-consumer byte ring for one logging thread
pub struct StagingBuffer {
    /// Raw entry storage; producer and consumer touch disjoint regions
    storage: UnsafeCell<Box<[u8]>>,
    /// Buffer capacity (power of two)
    capacity: usize,
    /// Next byte the producer will write, padded against false sharing
    producer_pos: CachePadded<AtomicUsize>,
    /// Next byte the consumer will read, padded against false sharing
    consumer_pos: CachePadded<AtomicUsize>,
    /// Highest byte used before the producer's last wrap
    end_of_recorded_space: AtomicUsize,
    /// Producer-private cache of contiguous free bytes at `producer_pos`;
    /// lets the fast path skip reloading `consumer_pos`
    min_free_space: Cell<usize>,
    /// Identity of the owning producer thread
    producer_thread: ThreadId,
    /// Set by the producer's teardown hook; the consumer is the unique
    /// destroyer
    should_delete: AtomicBool,
}

// Storage access is partitioned: the producer writes only regions it has
// reserved and not yet committed, the consumer reads only committed
// regions. `min_free_space` is producer-private.
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

/// A contiguous writable region handed to the producer by `reserve`
///
/// Bytes become visible to the consumer only on [`Reservation::commit`].
pub struct Reservation<'a> {
    buffer: &'a StagingBuffer,
    offset: usize,
    len: usize,
}

impl Reservation<'_> {
    /// Number of reserved bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the reservation is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writable view of the reserved bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe {
            let base = (*self.buffer.storage.get()).as_mut_ptr();
            std::slice::from_raw_parts_mut(base.add(self.offset), self.len)
        }
    }

    /// Publish the first `nbytes` of the reservation to the consumer
    ///
    /// A zero-byte commit is a no-op and does not advance the producer
    /// position.
    ///
    /// # Panics
    ///
    /// Panics if `nbytes` exceeds the reserved length.
    pub fn commit(self, nbytes: usize) {
        assert!(nbytes <= self.len, "commit larger than reservation");
        if nbytes == 0 {
            return;
        }

        let buffer = self.buffer;
        buffer
            .min_free_space
            .set(buffer.min_free_space.get() - nbytes);

        // Release publishes the entry bytes written through as_mut_slice.
        buffer
            .producer_pos
            .store(self.offset + nbytes, Ordering::Release);
    }
}

impl StagingBuffer {
    /// Create a staging buffer owned by the calling thread
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");

        Self {
            storage: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            producer_pos: CachePadded::new(AtomicUsize::new(0)),
            consumer_pos: CachePadded::new(AtomicUsize::new(0)),
            end_of_recorded_space: AtomicUsize::new(0),
            min_free_space: Cell::new(capacity),
            producer_thread: std::thread::current().id(),
            should_delete: AtomicBool::new(false),
        }
    }

    /// Buffer capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Identity of the owning producer thread
    pub fn producer_thread(&self) -> ThreadId {
        self.producer_thread
    }

    /// Reserve `nbytes` of contiguous space, spinning until the consumer
    /// frees enough room (producer only)
    pub fn reserve(&self, nbytes: usize) -> Result<Reservation<'_>> {
        if nbytes >= self.capacity {
            return Err(Error::ReservationTooLarge {
                requested: nbytes,
                capacity: self.capacity,
            });
        }

        // Blocking mode always produces an offset.
        let offset = self.reserve_internal(nbytes, true).unwrap();
        Ok(Reservation {
            buffer: self,
            offset,
            len: nbytes,
        })
    }

    /// Non-blocking reservation used by tests; returns `Ok(None)` instead
    /// of spinning when the ring is full (producer only)
    pub fn try_reserve(&self, nbytes: usize) -> Result<Option<Reservation<'_>>> {
        if nbytes >= self.capacity {
            return Err(Error::ReservationTooLarge {
                requested: nbytes,
                capacity: self.capacity,
            });
        }

        Ok(self.reserve_internal(nbytes, false).map(|offset| Reservation {
            buffer: self,
            offset,
            len: nbytes,
        }))
    }

    /// Slow-path space search shared by both reservation modes
    ///
    /// All comparisons against the remaining space are strict: free space
    /// equal to the request is rejected, because consuming it would make
    /// `producer_pos == consumer_pos` while the buffer still holds data,
    /// and equality is reserved for the empty state.
    fn reserve_internal(&self, nbytes: usize, blocking: bool) -> Option<usize> {
        while self.min_free_space.get() <= nbytes {
            // Snapshot the consumer position once per attempt; it may move
            // forward concurrently but never backward past us.
            let cached_consumer = self.consumer_pos.load(Ordering::Acquire);
            let producer = self.producer_pos.load(Ordering::Relaxed);

            if cached_consumer <= producer {
                // The free run extends from producer_pos to the end.
                let tail_run = self.capacity - producer;
                if tail_run > nbytes {
                    self.min_free_space.set(tail_run);
                    return Some(producer);
                }

                if cached_consumer != 0 {
                    // Wrap: publish the high-water mark before the rolled
                    // over producer position so the consumer always sees a
                    // valid end bound once it observes the wrap.
                    self.end_of_recorded_space
                        .store(producer, Ordering::Release);
                    self.producer_pos.store(0, Ordering::Release);
                    self.min_free_space.set(cached_consumer);
                } else {
                    // Consumer parked at zero; wrapping now would land on
                    // it. Stay put until it moves.
                    self.min_free_space.set(0);
                }
            } else {
                self.min_free_space.set(cached_consumer - producer);
            }

            if self.min_free_space.get() <= nbytes {
                if !blocking {
                    return None;
                }
                std::hint::spin_loop();
            }
        }

        Some(self.producer_pos.load(Ordering::Relaxed))
    }

    /// Largest contiguous committed region starting at the consumer
    /// position (consumer only); the returned slice may be empty
    pub fn peek(&self) -> &[u8] {
        let producer = self.producer_pos.load(Ordering::Acquire);
        let consumer = self.consumer_pos.load(Ordering::Relaxed);

        if producer < consumer {
            // The producer wrapped; drain the recorded tail first.
            let end = self.end_of_recorded_space.load(Ordering::Acquire);
            if end > consumer {
                return unsafe { self.readable(consumer, end) };
            }

            // Tail fully drained; roll the consumer over to the start.
            self.consumer_pos.store(0, Ordering::Release);
            return unsafe { self.readable(0, producer) };
        }

        unsafe { self.readable(consumer, producer) }
    }

    /// Release `nbytes` previously returned by `peek` back to the
    /// producer (consumer only)
    pub fn consume(&self, nbytes: usize) {
        if nbytes == 0 {
            return;
        }
        let consumer = self.consumer_pos.load(Ordering::Relaxed);
        self.consumer_pos.store(consumer + nbytes, Ordering::Release);
    }

    /// Mark the buffer for retirement (producer only, at thread exit)
    pub fn request_delete(&self) {
        self.should_delete.store(true, Ordering::Release);
    }

    /// True when the producer has requested deletion and every committed
    /// byte has been consumed (consumer only)
    ///
    /// Position equality implies no residual wrapped data because the
    /// producer never wraps onto a consumer parked at zero.
    pub fn can_delete(&self) -> bool {
        if !self.should_delete.load(Ordering::Acquire) {
            return false;
        }
        let producer = self.producer_pos.load(Ordering::Acquire);
        let consumer = self.consumer_pos.load(Ordering::Relaxed);
        producer == consumer
    }

    unsafe fn readable(&self, start: usize, end: usize) -> &[u8] {
        let base = (*self.storage.get()).as_ptr();
        std::slice::from_raw_parts(base.add(start), end - start)
    }
}
