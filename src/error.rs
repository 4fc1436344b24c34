//! Error types for the logging runtime
//!
//! The producer fast path is error-free by design: the only failures the
//! runtime can encounter are I/O failures around the output file, an
//! allocation failure for the aligned output buffers, and a reservation
//! request larger than a staging buffer could ever satisfy. Recoverable
//! write failures are reported to stderr by the compression thread and
//! counted; only `set_log_file` surfaces errors to the caller.

use std::fmt;
use std::io;

/// Errors surfaced by the logging runtime
#[derive(Debug)]
pub enum Error {
    /// The output file could not be opened or created
    Open(io::Error),
    /// A write to the output file failed
    Write(io::Error),
    /// A producer asked for more bytes than a staging buffer can ever hold
    ReservationTooLarge {
        /// Number of bytes the producer requested
        requested: usize,
        /// Capacity of the staging buffer
        capacity: usize,
    },
    /// The aligned output buffers could not be allocated
    Allocation(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Open(e) => write!(f, "cannot open output file: {}", e),
            Error::Write(e) => write!(f, "write to output file failed: {}", e),
            Error::ReservationTooLarge {
                requested,
                capacity,
            } => write!(
                f,
                "reservation of {} bytes can never fit in a {} byte staging buffer",
                requested, capacity
            ),
            Error::Allocation(e) => write!(f, "cannot allocate output buffers: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Open(e) | Error::Write(e) | Error::Allocation(e) => Some(e),
            Error::ReservationTooLarge { .. } => None,
        }
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;
