//! Queued aggregation: one consumer thread fed over a bounded channel
//!
//! Query threads hand observations to a sidecar thread that owns all map
//! mutation. The channel is bounded, and a full channel makes the producer
//! wait. Observations are never dropped: a burst of identical queries is the
//! exact condition N+1 detection has to see.
//!
//! ```text
//! query thread ──observe──▶ [bounded channel] ──▶ sidecar ──▶ Aggregator
//!                                  ▲
//! end() ─────────flush barrier─────┘  (acked once everything before it is applied)
//! ```

use crate::aggregator::{Aggregator, QueryObservation};
use crate::error::{FinderError, Result};
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum Command {
    Observe(Arc<Aggregator>, QueryObservation),
    /// Ack once every command queued before it has been applied
    Flush(Sender<()>),
}

/// Bounded hand-off queue with a dedicated consumer thread
pub struct ObservationQueue {
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    capacity: usize,
    total_pushed: AtomicU64,
    /// Pushes that found the channel full and had to wait
    total_blocked: AtomicU64,
}

impl ObservationQueue {
    /// Spawn the consumer thread
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(FinderError::InvalidConfig(
                "queue capacity must be > 0".to_string(),
            ));
        }

        let (sender, receiver) = channel::bounded(capacity);
        let worker = thread::Builder::new()
            .name("nplusone-aggregator".to_string())
            .spawn(move || Self::consume(receiver))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            capacity,
            total_pushed: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
        })
    }

    /// Hand an observation to the consumer, waiting while the channel is full
    ///
    /// If the consumer is gone the observation is handed back so the caller
    /// can apply it directly.
    pub fn push(
        &self,
        target: &Arc<Aggregator>,
        observation: QueryObservation,
    ) -> std::result::Result<(), QueryObservation> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(observation);
        };

        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        if sender.is_full() {
            self.total_blocked.fetch_add(1, Ordering::Relaxed);
        }

        sender
            .send(Command::Observe(Arc::clone(target), observation))
            .map_err(|err| match err.into_inner() {
                Command::Observe(_, observation) => observation,
                Command::Flush(_) => unreachable!("push only sends observations"),
            })
    }

    /// Block until everything pushed before this call has been applied
    pub fn flush(&self) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(FinderError::QueueDisconnected)?;
        let (ack_tx, ack_rx) = channel::bounded(1);
        sender
            .send(Command::Flush(ack_tx))
            .map_err(|_| FinderError::QueueDisconnected)?;
        ack_rx.recv().map_err(|_| FinderError::QueueDisconnected)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_blocked: self.total_blocked.load(Ordering::Relaxed),
            current_size: self.sender.as_ref().map_or(0, Sender::len),
            capacity: self.capacity,
        }
    }

    fn consume(receiver: Receiver<Command>) {
        // Ends when every sender is dropped
        for command in receiver {
            match command {
                Command::Observe(target, observation) => target.observe(observation),
                Command::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        tracing::debug!("Aggregation sidecar stopped");
    }
}

impl Drop for ObservationQueue {
    fn drop(&mut self) {
        // Closing the channel lets the consumer drain and exit
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ObservationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub total_pushed: u64,
    pub total_blocked: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    /// Fraction of pushes that hit a full channel (0.0 to 1.0)
    pub fn blocked_rate(&self) -> f64 {
        if self.total_pushed == 0 {
            0.0
        } else {
            self.total_blocked as f64 / self.total_pushed as f64
        }
    }

    /// Channel utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.current_size as f64 / self.capacity as f64
    }
}
