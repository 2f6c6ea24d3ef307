//! Cancellation and producer/consumer handoff between a background worker
//! and whoever displays its results.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;

/// Shared stop request, polled by workers between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm for the next run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffMode {
    /// The producer waits until the consumer has finished with each item.
    Synchronous,
    /// Up to `n` items in flight; the producer blocks only when full.
    Buffered(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

impl std::fmt::Display for Disconnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consumer went away")
    }
}

impl std::error::Error for Disconnected {}

pub fn handoff<T>(mode: HandoffMode) -> (Producer<T>, Consumer<T>) {
    match mode {
        HandoffMode::Synchronous => {
            let (tx, rx) = mpsc::sync_channel(1);
            let (ack_tx, ack_rx) = mpsc::sync_channel(1);
            (
                Producer { tx, ack: Some(ack_rx) },
                Consumer { rx, ack: Some(ack_tx) },
            )
        }
        HandoffMode::Buffered(depth) => {
            let (tx, rx) = mpsc::sync_channel(depth.max(1));
            (Producer { tx, ack: None }, Consumer { rx, ack: None })
        }
    }
}

pub struct Producer<T> {
    tx: SyncSender<T>,
    ack: Option<Receiver<()>>,
}

impl<T> Producer<T> {
    /// Hand one item over. In synchronous mode this returns once the
    /// consumer has dropped the matching [`Ticket`].
    pub fn deliver(&self, item: T) -> Result<(), Disconnected> {
        self.tx.send(item).map_err(|_| Disconnected)?;
        if let Some(ack) = &self.ack {
            ack.recv().map_err(|_| Disconnected)?;
        }
        Ok(())
    }
}

pub struct Consumer<T> {
    rx: Receiver<T>,
    ack: Option<SyncSender<()>>,
}

impl<T> Consumer<T> {
    /// Block for the next item. `None` once the producer is gone and the
    /// queue is drained.
    pub fn recv(&self) -> Option<Ticket<T>> {
        self.rx.recv().ok().map(|item| self.ticket(item))
    }

    fn try_recv(&self) -> Option<Ticket<T>> {
        match self.rx.try_recv() {
            Ok(item) => Some(self.ticket(item)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Most recent queued item, older ones are dropped (and acknowledged).
    pub fn latest(&self) -> Option<Ticket<T>> {
        let mut last = None;
        while let Some(ticket) = self.try_recv() {
            last = Some(ticket);
        }
        last
    }

    fn ticket(&self, item: T) -> Ticket<T> {
        Ticket {
            item,
            ack: self.ack.clone(),
        }
    }
}

/// One received item. Dropping it tells a synchronous producer to go on.
pub struct Ticket<T> {
    item: T,
    ack: Option<SyncSender<()>>,
}

impl<T> Deref for Ticket<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        if let Some(ack) = &self.ack {
            let _ = ack.try_send(());
        }
    }
}
