//! Basic usage of the packlog runtime
//!
//! This demo:
//! 1. Initializes the process-wide runtime with a custom output path
//! 2. Logs pre-serialized events from multiple threads concurrently
//! 3. Issues a sync barrier and prints the runtime counters
//! 4. Shuts the runtime down, flushing everything to disk
//!
//! The log file it produces is a concatenation of compressed frames;
//! decoding it back is the job of a separate replay tool.

use std::thread;

// Format ids would normally come from a build-time preprocessor.
const FMT_STARTUP: u32 = 1;
const FMT_WORKER_TICK: u32 = 2;

// Upper bound on frame growth for the pass-through codec.
const ARG_META: u32 = 16;

fn main() {
    let log_path = std::env::temp_dir().join("packlog_demo.bin");
    println!("Writing compressed log to {:?}", log_path);

    let config = packlog::Config {
        path: log_path.clone(),
        ..packlog::Config::default()
    };
    packlog::init(config).expect("failed to start the logging runtime");

    packlog::log(FMT_STARTUP, ARG_META, b"demo starting");

    // Several worker threads logging concurrently; each gets its own
    // staging buffer on first use.
    let workers: Vec<_> = (0..4u8)
        .map(|worker| {
            thread::spawn(move || {
                packlog::preallocate();
                for tick in 0..50_000u32 {
                    let mut args = [0u8; 5];
                    args[0] = worker;
                    args[1..].copy_from_slice(&tick.to_le_bytes());
                    packlog::log(FMT_WORKER_TICK, ARG_META, &args);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    // Everything committed so far is on disk once sync returns.
    packlog::sync();
    packlog::print_stats();

    packlog::shutdown();

    let size = std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
    println!("Done; log file is {} bytes", size);
}
