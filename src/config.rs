//! Runtime configuration
//!
//! All knobs the logging runtime exposes live here. The defaults mirror a
//! reasonable production setup: a 1 MiB staging buffer per producer
//! thread, 1 MiB double-buffered output, asynchronous writes, and a
//! 100 microsecond idle poll for the compression thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::clock::{CpuTicks, TickSource};
use crate::codec::CodecTable;
use crate::output::DIRECT_IO_BLOCK;

/// Default location of the compressed log file
pub const DEFAULT_LOG_PATH: &str = "/tmp/compressedLog";

/// Calibrated once per process and shared by every default config
static DEFAULT_TICKS: Lazy<Arc<CpuTicks>> = Lazy::new(|| Arc::new(CpuTicks::new()));

/// Configuration for [`Runtime::start`](crate::Runtime::start)
#[derive(Clone)]
pub struct Config {
    /// Path of the compressed output file, created or truncated at start
    pub path: PathBuf,
    /// Capacity of each per-thread staging buffer; must be a power of two
    pub staging_buffer_size: usize,
    /// Capacity of each of the two output buffers; must be a power of two
    /// and a multiple of the 512-byte direct-I/O block. It must also
    /// exceed the worst-case encoded size of any single entry.
    pub output_buffer_size: usize,
    /// Write through a background writer thread with buffer swapping
    /// instead of blocking the compressor on every write
    pub async_io: bool,
    /// Open the output file with `O_DIRECT` and pad every write to a
    /// 512-byte multiple
    pub direct_io: bool,
    /// Bounded wait of the compression thread when no work is found
    pub poll_wait: Duration,
    /// Per-format-id compression functions, normally generated by the
    /// upstream preprocessor
    pub codecs: Arc<CodecTable>,
    /// Monotonic tick source used to stamp entries
    pub ticks: Arc<dyn TickSource>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LOG_PATH),
            staging_buffer_size: 1024 * 1024,
            output_buffer_size: 1024 * 1024,
            async_io: true,
            direct_io: false,
            poll_wait: Duration::from_micros(100),
            codecs: Arc::new(CodecTable::pass_through()),
            ticks: DEFAULT_TICKS.clone(),
        }
    }
}

impl Config {
    /// Check the size constraints
    ///
    /// # Panics
    ///
    /// Panics on a size that is not a power of two or an output buffer
    /// that cannot hold a whole direct-I/O block.
    pub(crate) fn validate(&self) {
        assert!(
            self.staging_buffer_size.is_power_of_two(),
            "staging_buffer_size must be a power of two"
        );
        assert!(
            self.output_buffer_size.is_power_of_two(),
            "output_buffer_size must be a power of two"
        );
        assert!(
            self.output_buffer_size >= DIRECT_IO_BLOCK,
            "output_buffer_size must hold at least one direct-I/O block"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate();
        assert_eq!(config.path, PathBuf::from(DEFAULT_LOG_PATH));
        assert!(config.async_io);
        assert!(!config.direct_io);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn odd_staging_size_is_rejected() {
        let config = Config {
            staging_buffer_size: 1000,
            ..Config::default()
        };
        config.validate();
    }
}
