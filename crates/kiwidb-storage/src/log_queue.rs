//! Ordered application of committed log entries.
//!
//! Producers hand committed entries to [`LogApplyQueue::produce`]; a single
//! dedicated thread drains them strictly FIFO through the commit callback.
//! One consumer keeps the engine's sequence order identical to the log's
//! commit order.

use std::sync::mpsc::{channel, Sender};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::types::SequenceNumber;

/// A committed entry waiting to be applied.
#[derive(Debug)]
pub struct WriteTask {
    /// Local, monotonically increasing position in the queue.
    pub queue_sequence: u64,
    /// Replicated-log index of the entry.
    pub log_index: u64,
    /// Encoded entry.
    pub entry: Vec<u8>,
}

/// Writes one task to storage and returns the last sequence number written.
pub type CommitCallback = Box<dyn FnMut(&WriteTask) -> Result<SequenceNumber> + Send + 'static>;

type Job = (WriteTask, oneshot::Sender<Result<SequenceNumber>>);

/// Completion of one produced task.
pub struct ApplyTicket {
    queue_sequence: u64,
    rx: oneshot::Receiver<Result<SequenceNumber>>,
}

impl ApplyTicket {
    /// Queue position of the task.
    pub fn queue_sequence(&self) -> u64 {
        self.queue_sequence
    }

    /// Wait for the commit callback's result.
    pub async fn wait(self) -> Result<SequenceNumber> {
        self.rx.await.map_err(|_| Error::Closed)?
    }

    /// Blocking variant of [`ApplyTicket::wait`]; must not run on an async worker.
    pub fn wait_blocking(self) -> Result<SequenceNumber> {
        self.rx.blocking_recv().map_err(|_| Error::Closed)?
    }
}

struct Producer {
    next_sequence: u64,
    sender: Option<Sender<Job>>,
}

/// Multi-producer, single-consumer apply queue.
pub struct LogApplyQueue {
    producer: Mutex<Producer>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogApplyQueue {
    /// Start the consumer thread.
    pub fn start(mut commit: CommitCallback) -> Result<Self> {
        let (tx, rx) = channel::<Job>();

        let handle = thread::Builder::new()
            .name("kiwidb-log-apply".to_string())
            .spawn(move || {
                for (task, done) in rx {
                    let result = commit(&task);
                    if let Err(e) = &result {
                        tracing::error!(
                            queue_sequence = task.queue_sequence,
                            log_index = task.log_index,
                            error = %e,
                            "failed to apply log entry"
                        );
                    }
                    // The producer may have stopped waiting.
                    let _ = done.send(result);
                }
                tracing::debug!("log apply queue drained");
            })?;

        Ok(Self {
            producer: Mutex::new(Producer {
                next_sequence: 1,
                sender: Some(tx),
            }),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a committed entry.
    ///
    /// The queue sequence is assigned and the task enqueued under one lock,
    /// so queue order equals call order across producers.
    pub fn produce(&self, log_index: u64, entry: Vec<u8>) -> Result<ApplyTicket> {
        let (done, rx) = oneshot::channel();
        let mut producer = self.producer.lock();
        let queue_sequence = producer.next_sequence;
        let sender = producer.sender.as_ref().ok_or(Error::Closed)?;

        let task = WriteTask {
            queue_sequence,
            log_index,
            entry,
        };
        sender.send((task, done)).map_err(|_| Error::Closed)?;
        producer.next_sequence += 1;

        Ok(ApplyTicket { queue_sequence, rx })
    }

    /// Stop accepting tasks, drain what is queued and join the consumer.
    pub fn stop(&self) {
        self.producer.lock().sender.take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Whether the consumer thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for LogApplyQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
