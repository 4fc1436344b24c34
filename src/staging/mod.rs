//! Per-thread staging of uncompressed log entries
//!
//! This module implements the producer side of the data path:
//!
//! - [`EntryHeader`], the fixed header every uncompressed entry carries
//! - [`StagingBuffer`], a lock-free single-producer single-consumer ring
//!   that decouples a logging thread from the compression thread
//!
//! A producer reserves contiguous space, writes one entry (header plus
//! already-serialized argument bytes), and commits it with a single
//! release store. The compression thread is the only consumer; it peeks
//! at committed bytes, encodes them into the output stream, and releases
//! the space back to the producer.

mod buffer;

pub use buffer::{Reservation, StagingBuffer};

/// Header of one uncompressed log entry in a staging buffer
///
/// The header is followed by `entry_size - EntryHeader::SIZE` bytes of
/// opaque, already-serialized argument data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Total length of the entry in bytes, header included
    pub entry_size: u32,
    /// Upper bound on how much the entry may grow when its metadata is
    /// re-encoded for the output stream
    pub arg_meta_bytes: u32,
    /// Index into the compression function table
    pub fmt_id: u32,
    /// Monotonic tick stamp taken when the entry was logged
    pub timestamp: u64,
}

impl EntryHeader {
    /// Encoded size of the header in bytes
    pub const SIZE: usize = 20;

    /// Write the header into the first [`Self::SIZE`] bytes of `buf`
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.entry_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.arg_meta_bytes.to_le_bytes());
        buf[8..12].copy_from_slice(&self.fmt_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.timestamp.to_le_bytes());
    }

    /// Read a header from the first [`Self::SIZE`] bytes of `buf`
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`Self::SIZE`].
    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            entry_size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            arg_meta_bytes: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            fmt_id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
        }
    }

    /// Worst-case number of output bytes this entry can occupy once
    /// compressed, used to bound output buffer room checks
    #[inline]
    pub fn worst_case_compressed_size(&self) -> usize {
        self.entry_size as usize + self.arg_meta_bytes as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = EntryHeader {
            entry_size: 64,
            arg_meta_bytes: 16,
            fmt_id: 3,
            timestamp: 123_456_789,
        };

        let mut buf = [0u8; EntryHeader::SIZE];
        header.write_to(&mut buf);
        assert_eq!(EntryHeader::read_from(&buf), header);
    }

    #[test]
    fn header_size_matches_layout() {
        // Three u32 fields plus one u64 field.
        assert_eq!(EntryHeader::SIZE, 4 + 4 + 4 + 8);
    }
}
