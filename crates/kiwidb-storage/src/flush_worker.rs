//! Background worker that flushes shards on an interval.
//!
//! Each flush records fresh table properties, so the durable applied-index
//! watermark keeps up with the apply path even when memtables stay small.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::shard::Shard;

/// Granularity at which the worker notices a stop request.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Periodic flusher for a set of shards.
pub struct FlushWorker {
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushWorker {
    /// Start flushing `shards` every `interval`.
    pub fn start(shards: Arc<Vec<Arc<Shard>>>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::spawn(move || {
            Self::worker_loop(&shards, interval, &shutdown_clone);
        });

        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the worker and wait for it to finish.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Check if the worker is still running.
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn worker_loop(shards: &[Arc<Shard>], interval: Duration, shutdown: &AtomicBool) {
        let mut last_flush = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            thread::sleep(POLL_INTERVAL.min(interval));
            if last_flush.elapsed() < interval {
                continue;
            }
            for shard in shards {
                if let Err(e) = shard.flush() {
                    tracing::warn!(shard = shard.index(), error = %e, "background flush failed");
                }
            }
            last_flush = Instant::now();
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::log_entry::{LogEntry, LogOp};
    use crate::types::{ColumnFamily, DataType};

    #[test]
    fn test_background_flush_publishes_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path()).without_background_flush();
        let shard = Arc::new(Shard::open(&config, 0, Arc::default()).unwrap());
        let entry = LogEntry::new(
            DataType::String,
            0,
            vec![LogOp::put(ColumnFamily::Strings, b"k".to_vec(), b"v".to_vec())],
        );
        shard.apply_entry(42, &entry).unwrap();

        let worker = FlushWorker::start(Arc::new(vec![shard.clone()]), Duration::from_millis(20));
        let deadline = Instant::now() + Duration::from_secs(5);
        while shard.engine().properties_of_all_tables().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "no flush happened");
            thread::sleep(Duration::from_millis(10));
        }
        worker.stop();
        assert!(!worker.is_running());

        drop(shard);
        let reopened = Shard::open(&config, 0, Arc::default()).unwrap();
        assert_eq!(reopened.watermarks().get(ColumnFamily::Strings), 42);
    }
}
