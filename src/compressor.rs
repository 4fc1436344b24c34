//! Background compression thread
//!
//! A single thread drains every registered staging buffer in round-robin
//! order, delta-encodes entry metadata, runs the per-format compression
//! functions, and drives the output engine. Producers never signal it on
//! commit; it polls with a short bounded wait and is only notified for
//! sync barriers and shutdown.
//!
//! One loop iteration scans the registry starting at the cursor left by
//! the previous iteration. While a buffer has committed bytes the
//! registry mutex is released and whole entries are encoded until the
//! buffer runs dry or the output buffer cannot hold another worst-case
//! entry. A scan ends after a full pass finds no work, when the output
//! buffer fills, or on shutdown. Whatever was encoded is then padded if
//! required, submitted, and the output buffers swap roles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::TickSource;
use crate::codec::{self, CodecTable};
use crate::output::OutputEngine;
use crate::registry::BufferRegistry;
use crate::staging::{EntryHeader, StagingBuffer};

/// Counters maintained by the compression thread
///
/// Mutated only by the compression thread (and the completion path of the
/// writer thread); snapshots taken elsewhere are best-effort.
pub(crate) struct Stats {
    pub(crate) events_processed: AtomicU64,
    pub(crate) total_bytes_read: AtomicU64,
    pub(crate) total_bytes_written: AtomicU64,
    pub(crate) pad_bytes_written: AtomicU64,
    pub(crate) num_writes_completed: AtomicU64,
    pub(crate) write_errors: AtomicU64,
    pub(crate) cycles_compressing: AtomicU64,
    pub(crate) cycles_scanning_and_compressing: AtomicU64,
    pub(crate) cycles_aio_and_fsync: AtomicU64,
    pub(crate) cycles_awake: AtomicU64,
    pub(crate) cycle_at_thread_start: AtomicU64,
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self {
            events_processed: AtomicU64::new(0),
            total_bytes_read: AtomicU64::new(0),
            total_bytes_written: AtomicU64::new(0),
            pad_bytes_written: AtomicU64::new(0),
            num_writes_completed: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            cycles_compressing: AtomicU64::new(0),
            cycles_scanning_and_compressing: AtomicU64::new(0),
            cycles_aio_and_fsync: AtomicU64::new(0),
            cycles_awake: AtomicU64::new(0),
            cycle_at_thread_start: AtomicU64::new(0),
        }
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            total_bytes_read: self.total_bytes_read.load(Ordering::Relaxed),
            total_bytes_written: self.total_bytes_written.load(Ordering::Relaxed),
            pad_bytes_written: self.pad_bytes_written.load(Ordering::Relaxed),
            num_writes_completed: self.num_writes_completed.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            cycles_compressing: self.cycles_compressing.load(Ordering::Relaxed),
            cycles_scanning_and_compressing: self
                .cycles_scanning_and_compressing
                .load(Ordering::Relaxed),
            cycles_aio_and_fsync: self.cycles_aio_and_fsync.load(Ordering::Relaxed),
            cycles_awake: self.cycles_awake.load(Ordering::Relaxed),
            cycle_at_thread_start: self.cycle_at_thread_start.load(Ordering::Relaxed),
        }
    }
}

/// Best-effort snapshot of the runtime's counters
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    /// Entries encoded into the output stream
    pub events_processed: u64,
    /// Uncompressed bytes drained from staging buffers
    pub total_bytes_read: u64,
    /// Compressed payload bytes handed to the output file, padding
    /// excluded
    pub total_bytes_written: u64,
    /// Zero bytes appended for direct-I/O block alignment
    pub pad_bytes_written: u64,
    /// Write calls completed against the output file
    pub num_writes_completed: u64,
    /// Write or flush failures reported to stderr
    pub write_errors: u64,
    /// Ticks spent running compression functions
    pub cycles_compressing: u64,
    /// Ticks spent scanning buffers, compression included
    pub cycles_scanning_and_compressing: u64,
    /// Ticks spent submitting writes and waiting on flushes
    pub cycles_aio_and_fsync: u64,
    /// Ticks the compression thread spent awake
    pub cycles_awake: u64,
    /// Tick at which the compression thread started, zero when stopped
    pub cycle_at_thread_start: u64,
}

/// Shared flags and signals between the runtime and the compressor
pub(crate) struct Control {
    /// Stops the compression thread at the top of its next iteration
    pub(crate) should_exit: AtomicBool,
    pub(crate) sync: Mutex<SyncState>,
    /// Signaled on sync requests and shutdown; the compressor otherwise
    /// polls with a bounded wait
    pub(crate) work_added: Condvar,
    /// Signaled when a sync barrier has been satisfied
    pub(crate) hint_queue_emptied: Condvar,
}

pub(crate) struct SyncState {
    pub(crate) requested: bool,
    /// Incremented once per completed sync barrier; waiters compare
    /// against it to survive spurious wakeups
    pub(crate) epoch: u64,
}

impl Control {
    pub(crate) fn new() -> Self {
        Self {
            should_exit: AtomicBool::new(false),
            sync: Mutex::new(SyncState {
                requested: false,
                epoch: 0,
            }),
            work_added: Condvar::new(),
            hint_queue_emptied: Condvar::new(),
        }
    }
}

/// State owned by one run of the compression thread
pub(crate) struct Compressor {
    registry: Arc<BufferRegistry>,
    control: Arc<Control>,
    stats: Arc<Stats>,
    ticks: Arc<dyn TickSource>,
    codecs: Arc<CodecTable>,
    engine: OutputEngine,
    poll_wait: Duration,
    /// Index of the staging buffer the previous scan stopped at
    cursor: usize,
    /// Trailing values for delta encoding; reset per log file
    last_fmt_id: u32,
    last_timestamp: u64,
}

/// Outcome of draining one staging buffer
#[derive(PartialEq, Eq)]
enum Drain {
    /// The buffer's readable region was fully encoded
    Drained,
    /// The output buffer cannot hold another worst-case entry
    OutputFull,
}

impl Compressor {
    pub(crate) fn new(
        registry: Arc<BufferRegistry>,
        control: Arc<Control>,
        stats: Arc<Stats>,
        ticks: Arc<dyn TickSource>,
        codecs: Arc<CodecTable>,
        engine: OutputEngine,
        poll_wait: Duration,
    ) -> Self {
        Self {
            registry,
            control,
            stats,
            ticks,
            codecs,
            engine,
            poll_wait,
            cursor: 0,
            last_fmt_id: 0,
            last_timestamp: 0,
        }
    }

    /// Thread main: scan, compress, and write until told to exit
    pub(crate) fn run(mut self) {
        let mut awake_start = self.ticks.now();
        self.stats
            .cycle_at_thread_start
            .store(awake_start, Ordering::Relaxed);

        // True between clearing a sync request and bumping the epoch; the
        // extra pass it forces catches entries racing the request.
        let mut sync_pending = false;

        while !self.control.should_exit.load(Ordering::Acquire) {
            let scan_start = self.ticks.now();
            let compressing = self.engine.compressing_buffer();
            // The compression thread is the sole owner of the compressing
            // buffer role until submit swaps it.
            let out = unsafe { compressing.as_mut_slice() };
            let mut out_pos = 0usize;

            self.scan(out, &mut out_pos);

            self.stats.cycles_scanning_and_compressing.fetch_add(
                self.ticks.now().wrapping_sub(scan_start),
                Ordering::Relaxed,
            );

            if out_pos == 0 {
                let mut sync = self.control.sync.lock();

                if sync.requested {
                    sync.requested = false;
                    sync_pending = true;
                    // One more full pass to cover entries committed right
                    // before the request.
                    continue;
                }

                if sync_pending {
                    drop(sync);
                    let io_start = self.ticks.now();
                    self.engine.drain();
                    self.engine.sync_file();
                    self.stats.cycles_aio_and_fsync.fetch_add(
                        self.ticks.now().wrapping_sub(io_start),
                        Ordering::Relaxed,
                    );

                    sync = self.control.sync.lock();
                    if sync.requested {
                        // A new request raced in while flushing; it needs
                        // its own pass before the barrier is observable.
                        sync.requested = false;
                        continue;
                    }
                    sync.epoch += 1;
                    sync_pending = false;
                }

                self.control.hint_queue_emptied.notify_all();

                if self.control.should_exit.load(Ordering::Acquire) {
                    break;
                }

                let now = self.ticks.now();
                self.stats
                    .cycles_awake
                    .fetch_add(now.wrapping_sub(awake_start), Ordering::Relaxed);

                // Producers do not notify on commit, so the wait must be
                // bounded.
                let _ = self.control.work_added.wait_for(&mut sync, self.poll_wait);
                awake_start = self.ticks.now();
                continue;
            }

            let io_start = self.ticks.now();
            self.engine.submit(out_pos);
            self.stats.cycles_aio_and_fsync.fetch_add(
                self.ticks.now().wrapping_sub(io_start),
                Ordering::Relaxed,
            );
        }

        // The engine's drop awaits any outstanding write and joins the
        // writer thread.
        let now = self.ticks.now();
        self.stats
            .cycles_awake
            .fetch_add(now.wrapping_sub(awake_start), Ordering::Relaxed);
        self.stats.cycle_at_thread_start.store(0, Ordering::Relaxed);

        // Unblock any sync waiter that raced shutdown; nothing more will
        // ever be drained.
        let mut sync = self.control.sync.lock();
        sync.requested = false;
        sync.epoch += 1;
        self.control.hint_queue_emptied.notify_all();
    }

    /// One round-robin pass over the registry
    fn scan(&mut self, out: &mut [u8], out_pos: &mut usize) {
        let registry = self.registry.clone();
        let mut buffers = registry.lock();
        if self.cursor >= buffers.len() {
            self.cursor = 0;
        }
        let mut i = self.cursor;
        let mut work_found = false;
        let mut output_full = false;

        while !self.control.should_exit.load(Ordering::Acquire)
            && !output_full
            && !buffers.is_empty()
        {
            if i >= buffers.len() {
                i = 0;
            }
            let sb = buffers[i].clone();

            if !sb.peek().is_empty() {
                work_found = true;
                drop(buffers);

                let drain_start = self.ticks.now();
                let outcome = self.drain_buffer(&sb, out, out_pos);
                self.stats.cycles_compressing.fetch_add(
                    self.ticks.now().wrapping_sub(drain_start),
                    Ordering::Relaxed,
                );

                if outcome == Drain::OutputFull {
                    // Resume at this buffer once the output buffer swaps.
                    self.cursor = i;
                    output_full = true;
                }

                buffers = registry.lock();
            } else if sb.can_delete() {
                buffers.remove(i);
                if i == buffers.len() {
                    if self.cursor == i {
                        self.cursor = 0;
                    }
                    i = 0;
                }
                continue;
            }

            if buffers.is_empty() {
                break;
            }
            i = (i + 1) % buffers.len();

            // Completed a pass; stop once a full pass found no work.
            if i == self.cursor {
                if !work_found {
                    break;
                }
                work_found = false;
            }
        }
    }

    /// Encode whole entries from `sb` into the output buffer until the
    /// buffer runs dry or the room check fails
    fn drain_buffer(&mut self, sb: &StagingBuffer, out: &mut [u8], out_pos: &mut usize) -> Drain {
        let region = sb.peek();
        let total = region.len();
        let mut offset = 0;

        while offset < total {
            let remaining = &region[offset..];
            debug_assert!(remaining.len() >= EntryHeader::SIZE);

            let header = EntryHeader::read_from(remaining);
            let entry_size = header.entry_size as usize;
            debug_assert!(entry_size <= remaining.len());

            // Entries whose worst case exactly equals the remaining room
            // are deferred as well; the next buffer starts empty.
            if header.worst_case_compressed_size() >= out.len() - *out_pos {
                self.stats
                    .total_bytes_read
                    .fetch_add(offset as u64, Ordering::Relaxed);
                return Drain::OutputFull;
            }

            let n = codec::compress_metadata(
                &header,
                &mut out[*out_pos..],
                self.last_timestamp,
                self.last_fmt_id,
            );
            *out_pos += n;
            self.last_fmt_id = header.fmt_id;
            self.last_timestamp = header.timestamp;

            let args = &remaining[EntryHeader::SIZE..entry_size];
            let compress = self.codecs.get(header.fmt_id);
            *out_pos += compress(args, &mut out[*out_pos..]);

            self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
            sb.consume(entry_size);
            offset += entry_size;
        }

        self.stats
            .total_bytes_read
            .fetch_add(total as u64, Ordering::Relaxed);
        Drain::Drained
    }
}
