//! The parallel pipeline engine behind the extended query protocol.
//!
//! Every operation between two Syncs becomes an entry in a FIFO queue:
//! either literal response bytes produced inline by the command loop, or a
//! spawned Execute task bounded by a concurrency semaphore. The command
//! loop drains the queue in submission order, so the wire sees a single
//! logical output stream no matter how many tasks ran concurrently.
//!
//! With pipelining disabled the queue is drained after every submission,
//! which degenerates into the strictly serial protocol flow.

// Standard library imports
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

// External crate imports
use bytes::BytesMut;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

// Internal crate imports
use crate::statements::ExecOutcome;

/// Host-facing configuration of the engine.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Run independent Execute operations of one batch concurrently.
    pub enabled: bool,
    /// Upper bound on concurrently running tasks per connection.
    pub max_concurrency: usize,
    /// Upper bound on queued, not yet flushed operations. Submissions
    /// beyond the bound drain the oldest entry first.
    pub max_queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            enabled: false,
            max_concurrency: 8,
            max_queue_depth: 64,
        }
    }
}

/// One queued response, keyed implicitly by queue position.
pub(crate) enum Pending {
    /// Finished response bytes from an inline operation.
    Bytes(BytesMut),
    /// A running task. Streamed output arrives through `chunk_rx` while the
    /// task runs; the join result carries any residual bytes plus the
    /// outcome.
    Task {
        handle: JoinHandle<(BytesMut, ExecOutcome)>,
        chunk_rx: mpsc::Receiver<BytesMut>,
    },
}

pub(crate) struct Pipeline {
    config: PipelineConfig,
    queue: VecDeque<Pending>,
    permits: Arc<Semaphore>,
}

impl Pipeline {
    pub(crate) fn new(config: PipelineConfig) -> Pipeline {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Pipeline {
            config,
            queue: VecDeque::new(),
            permits,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.queue.len() >= self.config.max_queue_depth.max(1)
    }

    /// Queue literal response bytes at the current position.
    pub(crate) fn push_bytes(&mut self, bytes: BytesMut) {
        self.queue.push_back(Pending::Bytes(bytes));
    }

    /// Spawn a task at the current queue position. The task starts running
    /// once the concurrency semaphore admits it.
    pub(crate) fn spawn_task<F>(&mut self, task: F, chunk_rx: mpsc::Receiver<BytesMut>)
    where
        F: Future<Output = (BytesMut, ExecOutcome)> + Send + 'static,
    {
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("pipeline semaphore is never closed");
            task.await
        });
        self.queue.push_back(Pending::Task { handle, chunk_rx });
    }

    pub(crate) fn pop_front(&mut self) -> Option<Pending> {
        self.queue.pop_front()
    }

    /// Cancel every queued entry. Called once a task in the batch failed;
    /// successors emit no output.
    pub(crate) fn cancel_remaining(&mut self) {
        for pending in self.queue.drain(..) {
            if let Pending::Task { handle, .. } = pending {
                handle.abort();
            }
        }
    }
}
