//! Shared result channel between stream workers and the streaming aggregator.
//!
//! Every worker of a request holds a clone of [`ResultSender`]; the single
//! [`ResultReceiver`] belongs to the aggregator. The channel is unbounded so a
//! push never waits on capacity. Entries arrive in a total order across
//! workers; per-worker order is preserved and the worker index inside each
//! record lets the caller rebuild individual choices.

use crate::{error::Error, types::StepRecord};
use tokio::sync::mpsc;

/// One value pushed by a worker.
#[derive(Debug)]
pub enum ChannelEntry {
    /// A step-record stamped with its worker index.
    Record(StepRecord),
    /// The worker's engine failed. The worker pushes nothing after this.
    Failed(Error),
    /// The worker's sequence ended without a terminal record.
    Exhausted { index: usize },
}

/// Write side of the result channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ResultSender {
    tx: mpsc::UnboundedSender<ChannelEntry>,
}

impl ResultSender {
    /// Pushes an entry. Returns `false` if the aggregator is gone.
    pub fn push(&self, entry: ChannelEntry) -> bool {
        self.tx.send(entry).is_ok()
    }
}

/// Read side of the result channel.
#[derive(Debug)]
pub struct ResultReceiver {
    rx: mpsc::UnboundedReceiver<ChannelEntry>,
}

impl ResultReceiver {
    /// Waits for the next entry.
    ///
    /// Returns `None` once every sender has been dropped and the queue is
    /// drained.
    pub async fn pop(&mut self) -> Option<ChannelEntry> {
        self.rx.recv().await
    }

    /// Takes an already-queued entry without waiting.
    pub fn try_pop(&mut self) -> Option<ChannelEntry> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Creates the result channel for one request.
pub fn result_channel() -> (ResultSender, ResultReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResultSender { tx }, ResultReceiver { rx })
}
