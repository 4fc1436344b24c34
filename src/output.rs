//! Double-buffered output engine for the compressed stream
//!
//! The engine owns two equally sized, page-aligned output buffers backed
//! by anonymous memory maps. The compression thread fills one
//! (`compressing`) while the other is in flight to disk. In asynchronous
//! mode a dedicated writer thread performs the blocking `write` calls:
//! `submit` awaits the previous write, hands the full buffer over, and
//! swaps roles without copying. In synchronous mode `submit` writes in
//! place and the second buffer is never used.
//!
//! When the output file was opened for direct I/O every write length must
//! be a multiple of the 512-byte block size; `submit` zero-pads the tail
//! of the buffer up to the next block boundary and accounts the pad bytes
//! separately from payload bytes.
//!
//! Write failures are reported to stderr and counted; the engine keeps
//! going. Only a failed open is fatal, and that happens before an engine
//! is ever constructed.

use std::cell::UnsafeCell;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex};

use crate::compressor::Stats;
use crate::error::{Error, Result};

/// Direct-I/O block size; write lengths must be multiples of this when
/// the output file bypasses the page cache
pub const DIRECT_IO_BLOCK: usize = 512;

/// Page-aligned output buffer backed by an anonymous memory map
///
/// Page alignment satisfies direct-I/O's buffer address requirement
/// without a custom allocator.
pub(crate) struct AlignedBuffer {
    map: UnsafeCell<MmapMut>,
    len: usize,
}

// Role discipline replaces locking: at any instant the compression thread
// owns one buffer and the writer thread the other, and roles only swap
// after the outstanding write completed.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub(crate) fn new(len: usize) -> Result<Arc<Self>> {
        let map = MmapMut::map_anon(len).map_err(Error::Allocation)?;
        Ok(Arc::new(Self {
            map: UnsafeCell::new(map),
            len,
        }))
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// The caller must be the current owner of this buffer's role and the
    /// only thread accessing it.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        let map = &*self.map.get();
        std::slice::from_raw_parts(map.as_ptr(), self.len)
    }

    /// # Safety
    ///
    /// Same ownership requirement as [`AlignedBuffer::as_slice`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        let map = &mut *self.map.get();
        std::slice::from_raw_parts_mut(map.as_mut_ptr(), self.len)
    }
}

/// One write handed to the writer thread
struct WriteRequest {
    buffer: Arc<AlignedBuffer>,
    len: usize,
}

/// Completion slot the writer thread signals through
struct Completion {
    pending: Mutex<bool>,
    done: Condvar,
}

struct Writer {
    sender: SyncSender<WriteRequest>,
    completion: Arc<Completion>,
    handle: Option<JoinHandle<()>>,
}

/// Double-buffered writer for the compressed output stream
pub(crate) struct OutputEngine {
    buffers: [Arc<AlignedBuffer>; 2],
    /// Index of the buffer currently being filled
    compressing: usize,
    file: Arc<File>,
    pad_writes: bool,
    stats: Arc<Stats>,
    /// Present in asynchronous mode only
    writer: Option<Writer>,
}

impl OutputEngine {
    /// Build an engine over preallocated buffers and an open output file
    ///
    /// `async_io` selects the double-buffered writer thread;
    /// `pad_writes` enables direct-I/O block padding.
    pub(crate) fn new(
        buffers: [Arc<AlignedBuffer>; 2],
        file: Arc<File>,
        async_io: bool,
        pad_writes: bool,
        stats: Arc<Stats>,
    ) -> Self {
        let writer = if async_io {
            let completion = Arc::new(Completion {
                pending: Mutex::new(false),
                done: Condvar::new(),
            });
            let (sender, receiver) = std::sync::mpsc::sync_channel::<WriteRequest>(1);

            let thread_file = file.clone();
            let thread_completion = completion.clone();
            let thread_stats = stats.clone();
            let handle = std::thread::Builder::new()
                .name("packlog-writer".to_string())
                .spawn(move || {
                    writer_main(receiver, thread_file, thread_completion, thread_stats)
                })
                .expect("failed to spawn writer thread");

            Some(Writer {
                sender,
                completion,
                handle: Some(handle),
            })
        } else {
            None
        };

        Self {
            buffers,
            compressing: 0,
            file,
            pad_writes,
            stats,
            writer,
        }
    }

    /// Buffer the compression thread should fill next
    pub(crate) fn compressing_buffer(&self) -> Arc<AlignedBuffer> {
        self.buffers[self.compressing].clone()
    }

    /// Capacity of each output buffer
    pub(crate) fn buffer_len(&self) -> usize {
        self.buffers[0].len()
    }

    /// Schedule a write of the first `payload_len` bytes of the
    /// compressing buffer
    ///
    /// In asynchronous mode this awaits the previous write, hands the
    /// buffer to the writer thread, and swaps roles; in synchronous mode
    /// it writes in place.
    pub(crate) fn submit(&mut self, payload_len: usize) {
        debug_assert!(payload_len > 0 && payload_len <= self.buffer_len());

        let write_len = if self.pad_writes {
            self.pad_to_block(payload_len)
        } else {
            payload_len
        };

        self.stats
            .total_bytes_written
            .fetch_add(payload_len as u64, Ordering::Relaxed);

        match &self.writer {
            Some(writer) => {
                self.drain();

                *writer.completion.pending.lock() = true;
                let request = WriteRequest {
                    buffer: self.buffers[self.compressing].clone(),
                    len: write_len,
                };
                if writer.sender.send(request).is_err() {
                    // Writer thread is gone; nothing left to signal.
                    *writer.completion.pending.lock() = false;
                }

                self.compressing ^= 1;
            }
            None => {
                let buffer = self.buffers[self.compressing].clone();
                let data = unsafe { &buffer.as_slice()[..write_len] };
                if let Err(e) = (&*self.file).write_all(data) {
                    eprintln!("packlog: {}", Error::Write(e));
                    self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                }
                self.stats
                    .num_writes_completed
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Block until no write is outstanding
    pub(crate) fn drain(&self) {
        if let Some(writer) = &self.writer {
            let mut pending = writer.completion.pending.lock();
            while *pending {
                writer.completion.done.wait(&mut pending);
            }
        }
    }

    /// Flush file contents to stable storage
    pub(crate) fn sync_file(&self) {
        if let Err(e) = self.file.sync_data() {
            eprintln!("packlog: {}", Error::Write(e));
            self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Zero-fill the tail of the compressing buffer up to the next block
    /// boundary, returning the padded write length
    fn pad_to_block(&mut self, payload_len: usize) -> usize {
        let over = payload_len % DIRECT_IO_BLOCK;
        if over == 0 {
            return payload_len;
        }

        let pad = DIRECT_IO_BLOCK - over;
        let buffer = self.buffers[self.compressing].clone();
        let slice = unsafe { buffer.as_mut_slice() };
        slice[payload_len..payload_len + pad].fill(0);

        self.stats
            .pad_bytes_written
            .fetch_add(pad as u64, Ordering::Relaxed);
        payload_len + pad
    }
}

impl Drop for OutputEngine {
    fn drop(&mut self) {
        self.drain();
        if let Some(mut writer) = self.writer.take() {
            // Closing the channel ends the writer loop.
            drop(writer.sender);
            if let Some(handle) = writer.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn writer_main(
    receiver: Receiver<WriteRequest>,
    file: Arc<File>,
    completion: Arc<Completion>,
    stats: Arc<Stats>,
) {
    while let Ok(request) = receiver.recv() {
        let data = unsafe { &request.buffer.as_slice()[..request.len] };
        if let Err(e) = (&*file).write_all(data) {
            eprintln!("packlog: {}", Error::Write(e));
            stats.write_errors.fetch_add(1, Ordering::Relaxed);
        }
        stats.num_writes_completed.fetch_add(1, Ordering::Relaxed);

        let mut pending = completion.pending.lock();
        *pending = false;
        completion.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn test_engine(path: &std::path::Path, async_io: bool, pad: bool) -> OutputEngine {
        let file = Arc::new(File::create(path).unwrap());
        let buffers = [
            AlignedBuffer::new(4096).unwrap(),
            AlignedBuffer::new(4096).unwrap(),
        ];
        OutputEngine::new(buffers, file, async_io, pad, Arc::new(Stats::new()))
    }

    fn fill_compressing(engine: &OutputEngine, data: &[u8]) {
        let buffer = engine.compressing_buffer();
        let slice = unsafe { buffer.as_mut_slice() };
        slice[..data.len()].copy_from_slice(data);
    }

    #[test]
    fn synchronous_submit_writes_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");

        let mut engine = test_engine(&path, false, false);
        fill_compressing(&engine, b"payload bytes");
        engine.submit(13);
        engine.sync_file();
        drop(engine);

        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"payload bytes");
    }

    #[test]
    fn asynchronous_submit_swaps_buffers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");

        let mut engine = test_engine(&path, true, false);

        fill_compressing(&engine, b"first");
        let first = engine.compressing_buffer();
        engine.submit(5);
        let second = engine.compressing_buffer();
        assert!(!Arc::ptr_eq(&first, &second));

        fill_compressing(&engine, b"second");
        engine.submit(6);
        engine.drain();
        drop(engine);

        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"firstsecond");
    }

    #[test]
    fn padding_rounds_up_to_block_with_zero_fill() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");

        let mut engine = test_engine(&path, false, true);
        let stats = engine.stats.clone();

        fill_compressing(&engine, &vec![0xABu8; 1234]);
        engine.submit(1234);
        drop(engine);

        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents.len(), 1536);
        assert_eq!(&contents[..1234], &vec![0xABu8; 1234][..]);
        assert!(contents[1234..].iter().all(|&b| b == 0));

        assert_eq!(stats.pad_bytes_written.load(Ordering::Relaxed), 302);
        assert_eq!(stats.total_bytes_written.load(Ordering::Relaxed), 1234);
    }

    #[test]
    fn aligned_payload_needs_no_padding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");

        let mut engine = test_engine(&path, false, true);
        let stats = engine.stats.clone();

        fill_compressing(&engine, &vec![1u8; 1024]);
        engine.submit(1024);
        drop(engine);

        assert_eq!(stats.pad_bytes_written.load(Ordering::Relaxed), 0);
    }
}
