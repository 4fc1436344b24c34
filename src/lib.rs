//! Packlog - a low-latency binary logging runtime
//!
//! Packlog collects log events from many producer threads and ships them,
//! compressed, to a single output file. The design keeps the producer
//! fast path free of locks, allocations, and errors:
//!
//! 1. Each logging thread owns a lock-free SPSC staging buffer it
//!    reserves and commits pre-serialized entries into.
//! 2. A background compression thread discovers the buffers through a
//!    registry, drains them round-robin, delta-encodes entry metadata,
//!    and runs per-format compression functions.
//! 3. The compressed stream ships to disk through a double-buffered
//!    asynchronous output engine, optionally padded for direct I/O.
//!
//! # Usage
//!
//! The runtime is process-wide. Initialize it once, log from any thread,
//! and shut it down (or let a standalone [`Runtime`] drop) to flush:
//!
//! ```no_run
//! packlog::init(packlog::Config::default()).unwrap();
//!
//! packlog::log(1, 16, b"pre-serialized argument bytes");
//! packlog::sync();
//! packlog::shutdown();
//! ```
//!
//! `sync` is a non-quiescent checkpoint: everything committed before the
//! call is durable when it returns; concurrent events may or may not be
//! included.

pub mod clock;
pub mod codec;
mod compressor;
mod config;
mod error;
mod output;
mod registry;
pub mod staging;

pub use compressor::StatsSnapshot;
pub use config::{Config, DEFAULT_LOG_PATH};
pub use error::{Error, Result};
pub use output::DIRECT_IO_BLOCK;

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::clock::to_seconds;
use crate::compressor::{Compressor, Control, Stats};
use crate::output::{AlignedBuffer, OutputEngine};
use crate::registry::BufferRegistry;
use crate::staging::{EntryHeader, StagingBuffer};

/// Global runtime installed by [`init`]
static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Distinguishes runtime instances so a thread-local producer handle can
/// detect it belongs to a retired runtime
static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static PRODUCER: RefCell<Option<ProducerSlot>> = const { RefCell::new(None) };
}

/// Thread-local handle to this thread's staging buffer
///
/// Dropping it (at thread exit, or when the thread binds to a newer
/// runtime) marks the buffer for retirement; the compression thread
/// performs the actual removal once the buffer is empty.
struct ProducerSlot {
    runtime_id: u64,
    buffer: Arc<StagingBuffer>,
}

impl Drop for ProducerSlot {
    fn drop(&mut self) {
        self.buffer.request_delete();
    }
}

/// The logging runtime: staging buffer registry, compression thread, and
/// output engine rolled into one process-wide service
///
/// Most programs use the module-level functions backed by the global
/// instance; tests construct standalone runtimes with [`Runtime::start`].
/// Dropping a runtime performs a full [`Runtime::shutdown`].
pub struct Runtime {
    id: u64,
    config: Config,
    registry: Arc<BufferRegistry>,
    control: Arc<Control>,
    stats: Arc<Stats>,
    out_file: Mutex<Arc<File>>,
    out_buffers: [Arc<AlignedBuffer>; 2],
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Open the output file, allocate the aligned output buffers, and
    /// start the compression thread
    pub fn start(config: Config) -> Result<Runtime> {
        config.validate();

        let file = Arc::new(open_output(&config.path, config.direct_io)?);
        let out_buffers = [
            AlignedBuffer::new(config.output_buffer_size)?,
            AlignedBuffer::new(config.output_buffer_size)?,
        ];

        let runtime = Runtime {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            config,
            registry: Arc::new(BufferRegistry::new()),
            control: Arc::new(Control::new()),
            stats: Arc::new(Stats::new()),
            out_file: Mutex::new(file),
            out_buffers,
            thread: Mutex::new(None),
        };

        runtime.start_compressor();
        Ok(runtime)
    }

    /// Append one pre-serialized event to the calling thread's staging
    /// buffer, allocating and registering the buffer on first use
    ///
    /// `args` must already be serialized; `arg_meta_bytes` is the upper
    /// bound on growth when the entry is re-encoded for the output
    /// stream (at least [`codec::MAX_VARINT_LEN`] for the pass-through
    /// codec).
    pub fn log(&self, fmt_id: u32, arg_meta_bytes: u32, args: &[u8]) {
        PRODUCER.with(|slot| {
            let mut slot = slot.borrow_mut();
            let bound = matches!(&*slot, Some(s) if s.runtime_id == self.id);
            if !bound {
                *slot = Some(ProducerSlot {
                    runtime_id: self.id,
                    buffer: self.new_staging_buffer(),
                });
            }
            let buffer = &slot.as_ref().unwrap().buffer;
            self.append(buffer, fmt_id, arg_meta_bytes, args);
        });
    }

    /// Eagerly allocate and register the calling thread's staging buffer
    pub fn preallocate(&self) {
        PRODUCER.with(|slot| {
            let mut slot = slot.borrow_mut();
            let bound = matches!(&*slot, Some(s) if s.runtime_id == self.id);
            if !bound {
                *slot = Some(ProducerSlot {
                    runtime_id: self.id,
                    buffer: self.new_staging_buffer(),
                });
            }
        });
    }

    /// Block until every event committed before this call is compressed,
    /// written, and flushed to disk
    ///
    /// Events committed concurrently may or may not be included. Must not
    /// be called from the compression thread.
    pub fn sync(&self) {
        if self.thread.lock().is_none() {
            // No compression thread; everything was flushed when it
            // stopped.
            return;
        }
        self.sync_inner();
    }

    /// Swap the output file, surfacing open failures without disturbing
    /// the running system
    ///
    /// Pending events are synced to the old file first. Not thread-safe
    /// with concurrent producers.
    pub fn set_log_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        // Refuse existing files we cannot write before touching anything.
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.permissions().readonly() {
                return Err(Error::Open(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("cannot write to {}", path.display()),
                )));
            }
        }
        let new_file = open_output(path, self.config.direct_io)?;

        self.stop_compressor();
        *self.out_file.lock() = Arc::new(new_file);
        self.start_compressor();
        Ok(())
    }

    /// Sync, stop the compression thread, and await outstanding writes
    ///
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        self.stop_compressor();
    }

    /// Best-effort snapshot of the runtime counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Flush the output file and print the counters to stdout
    pub fn print_stats(&self) {
        let ticks = &self.config.ticks;
        let file = self.out_file.lock().clone();

        let start = ticks.now();
        let _ = file.sync_data();
        let stop = ticks.now();
        self.stats
            .cycles_aio_and_fsync
            .fetch_add(stop.wrapping_sub(start), Ordering::Relaxed);

        let snap = self.stats.snapshot();
        let tps = ticks.ticks_per_second();

        let output_time = to_seconds(snap.cycles_aio_and_fsync, tps);
        let compress_time = to_seconds(snap.cycles_compressing, tps);
        let work_time = output_time + compress_time;
        let mb_written = snap.total_bytes_written as f64 / 1.0e6;

        println!(
            "Wrote {} events ({:.2} MB) in {:.3} seconds ({:.3} seconds spent compressing)",
            snap.events_processed, mb_written, work_time, compress_time
        );
        println!(
            "There were {} file writes and the final sync took {:.6} sec",
            snap.num_writes_completed,
            to_seconds(stop.wrapping_sub(start), tps)
        );

        if snap.cycle_at_thread_start != 0 {
            let awake = to_seconds(snap.cycles_awake, tps);
            let alive = to_seconds(ticks.now().wrapping_sub(snap.cycle_at_thread_start), tps);
            if alive > 0.0 {
                println!(
                    "Compression thread active for {:.3} out of {:.3} seconds ({:.2} %)",
                    awake,
                    alive,
                    100.0 * awake / alive
                );
            }
        }

        if work_time > 0.0 && snap.events_processed > 0 {
            println!(
                "On average: {:.2} MB/s, {:.1} bytes/event, {:.2} ns/event",
                mb_written / work_time,
                snap.total_bytes_written as f64 / snap.events_processed as f64,
                work_time * 1.0e9 / snap.events_processed as f64
            );
        }

        if snap.total_bytes_written > 0 {
            println!(
                "Compression ratio {:.2}-{:.2}x ({} bytes in, {} bytes out, {} pad bytes)",
                snap.total_bytes_read as f64
                    / (snap.total_bytes_written + snap.pad_bytes_written) as f64,
                snap.total_bytes_read as f64 / snap.total_bytes_written as f64,
                snap.total_bytes_read,
                snap.total_bytes_written,
                snap.pad_bytes_written
            );
        }
    }

    fn new_staging_buffer(&self) -> Arc<StagingBuffer> {
        let buffer = Arc::new(StagingBuffer::new(self.config.staging_buffer_size));
        self.registry.register(buffer.clone());
        buffer
    }

    fn append(&self, buffer: &StagingBuffer, fmt_id: u32, arg_meta_bytes: u32, args: &[u8]) {
        let total = EntryHeader::SIZE + args.len();
        let header = EntryHeader {
            entry_size: total as u32,
            arg_meta_bytes,
            fmt_id,
            timestamp: self.config.ticks.now(),
        };

        let mut reservation = match buffer.reserve(total) {
            Ok(r) => r,
            Err(e) => panic!("packlog: {}", e),
        };
        let dst = reservation.as_mut_slice();
        header.write_to(dst);
        dst[EntryHeader::SIZE..].copy_from_slice(args);
        reservation.commit(total);
    }

    fn start_compressor(&self) {
        self.control.should_exit.store(false, Ordering::Release);

        let engine = OutputEngine::new(
            self.out_buffers.clone(),
            self.out_file.lock().clone(),
            self.config.async_io,
            self.config.direct_io,
            self.stats.clone(),
        );
        let compressor = Compressor::new(
            self.registry.clone(),
            self.control.clone(),
            self.stats.clone(),
            self.config.ticks.clone(),
            self.config.codecs.clone(),
            engine,
            self.config.poll_wait,
        );

        let handle = std::thread::Builder::new()
            .name("packlog-compressor".to_string())
            .spawn(move || compressor.run())
            .expect("failed to spawn compression thread");
        *self.thread.lock() = Some(handle);
    }

    fn stop_compressor(&self) {
        let handle = self.thread.lock().take();
        let Some(handle) = handle else { return };

        // Flush staged events while the thread still runs.
        self.sync_inner();

        self.control.should_exit.store(true, Ordering::Release);
        {
            let _guard = self.control.sync.lock();
            self.control.work_added.notify_all();
        }
        let _ = handle.join();
    }

    fn sync_inner(&self) {
        let mut sync = self.control.sync.lock();
        let target = sync.epoch + 1;
        sync.requested = true;
        self.control.work_added.notify_all();
        while sync.epoch < target {
            self.control.hint_queue_emptied.wait(&mut sync);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_output(path: &Path, direct_io: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);

    #[cfg(unix)]
    if direct_io {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DIRECT);
    }
    #[cfg(not(unix))]
    let _ = direct_io;

    options.open(path).map_err(Error::Open)
}

/// Install the process-wide runtime
///
/// # Panics
///
/// Panics if a runtime was already installed.
pub fn init(config: Config) -> Result<()> {
    let runtime = Runtime::start(config)?;
    if RUNTIME.set(runtime).is_err() {
        panic!("packlog runtime already initialized");
    }
    Ok(())
}

fn runtime() -> &'static Runtime {
    RUNTIME
        .get()
        .expect("packlog runtime not initialized; call packlog::init first")
}

/// Append one pre-serialized event from the calling thread
///
/// See [`Runtime::log`].
pub fn log(fmt_id: u32, arg_meta_bytes: u32, args: &[u8]) {
    runtime().log(fmt_id, arg_meta_bytes, args);
}

/// Eagerly allocate the calling thread's staging buffer
pub fn preallocate() {
    runtime().preallocate();
}

/// Barrier: block until everything committed before the call is durable
pub fn sync() {
    runtime().sync();
}

/// Swap the output file for the global runtime
pub fn set_log_file<P: AsRef<Path>>(path: P) -> Result<()> {
    runtime().set_log_file(path)
}

/// Snapshot the global runtime's counters
pub fn stats() -> StatsSnapshot {
    runtime().stats()
}

/// Print the global runtime's counters to stdout
pub fn print_stats() {
    runtime().print_stats();
}

/// Flush and stop the global runtime; a no-op when none was installed
pub fn shutdown() {
    if let Some(runtime) = RUNTIME.get() {
        runtime.shutdown();
    }
}
