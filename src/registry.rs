//! Registry of live staging buffers
//!
//! The registry is the only rendezvous point between producer threads and
//! the compression thread. A producer touches it exactly once, to
//! register its freshly allocated staging buffer; steady-state logging is
//! lock-free. The compression thread walks the registered buffers in
//! round-robin order from a cursor it owns, releasing the mutex while it
//! drains any one buffer, and retires buffers whose producers have exited
//! once they are empty.
//!
//! Insertion order is preserved so the compressor's cursor stays
//! meaningful across scans.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::staging::StagingBuffer;

/// Ordered set of live staging buffers shared with the compressor
pub(crate) struct BufferRegistry {
    buffers: Mutex<Vec<Arc<StagingBuffer>>>,
}

impl BufferRegistry {
    pub(crate) fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Append a newly allocated staging buffer; called once per producer
    /// thread on first use
    pub(crate) fn register(&self, buffer: Arc<StagingBuffer>) {
        self.buffers.lock().push(buffer);
    }

    /// Lock the buffer sequence for a compressor scan
    ///
    /// The guard must be dropped while a single buffer is being drained;
    /// registration may append in the meantime, but removal happens only
    /// under this lock, from the compression thread.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<Arc<StagingBuffer>>> {
        self.buffers.lock()
    }

    /// Number of live buffers
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buffers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_preserves_order() {
        let registry = BufferRegistry::new();
        let a = Arc::new(StagingBuffer::new(256));
        let b = Arc::new(StagingBuffer::new(256));

        registry.register(a.clone());
        registry.register(b.clone());

        let buffers = registry.lock();
        assert_eq!(buffers.len(), 2);
        assert!(Arc::ptr_eq(&buffers[0], &a));
        assert!(Arc::ptr_eq(&buffers[1], &b));
    }

    #[test]
    fn retirement_removes_under_lock() {
        let registry = BufferRegistry::new();
        let buffer = Arc::new(StagingBuffer::new(256));
        registry.register(buffer.clone());

        buffer.request_delete();
        assert!(buffer.can_delete());

        let mut buffers = registry.lock();
        buffers.retain(|sb| !sb.can_delete());
        drop(buffers);

        assert_eq!(registry.len(), 0);
    }
}
