//! Two-class priority channel
//!
//! A bounded multi-producer/single-consumer channel where every item is
//! sent under a [`Class`]: [`Class::Priority`] items are always drained
//! before [`Class::Background`] items, and items of the same class are
//! FIFO.
//!
//! To use, create a channel with [`channel`]. [`Sender`]s are clonable;
//! the single [`Receiver`] drains with [`Receiver::recv`], which yields
//! `None` only after [`Sender::finish`] was called (or every sender was
//! dropped) AND both queues ran dry.
//!
//! Senders block (async) while the channel is at capacity.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Scheduling class of a sent item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Class {
    /// Drained before any background item. Used for unstash batches that
    /// must overtake ongoing backfill.
    Priority,
    /// Normal work: backfill windows, live events.
    Background,
}

pub enum SendError<T> {
    /// `finish()` was called; no further items are accepted.
    Finished(T),
    /// The receiver is gone.
    Closed(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Finished(v) | SendError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Finished(_) => f.write_str("SendError::Finished"),
            SendError::Closed(_) => f.write_str("SendError::Closed"),
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Debug>::fmt(self, f)
    }
}

impl<T> std::error::Error for SendError<T> {}

struct Inner<T> {
    priority: VecDeque<T>,
    background: VecDeque<T>,
    finished: bool,
    receiver_closed: bool,
    senders: usize,
}

impl<T> Inner<T> {
    fn len(&self) -> usize {
        self.priority.len() + self.background.len()
    }

    fn pop(&mut self) -> Option<T> {
        self.priority
            .pop_front()
            .or_else(|| self.background.pop_front())
    }
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    /// Bumped on every push and on finish; the receiver waits on it.
    items_tx: watch::Sender<u64>,
    /// Bumped on every pop and on receiver drop; full senders wait on it.
    space_tx: watch::Sender<u64>,
    capacity: usize,
}

impl<T> Shared<T> {
    fn bump(tx: &watch::Sender<u64>) {
        tx.send_modify(|seq| *seq = seq.wrapping_add(1));
    }
}

pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(0 < capacity, "zero-capacity channel can never accept");
    let (items_tx, items_rx) = watch::channel(0);
    let (space_tx, space_rx) = watch::channel(0);
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            priority: VecDeque::new(),
            background: VecDeque::new(),
            finished: false,
            receiver_closed: false,
            senders: 1,
        }),
        items_tx,
        space_tx,
        capacity,
    });
    (
        Sender {
            shared: shared.clone(),
            space_rx,
        },
        Receiver { shared, items_rx },
    )
}

pub struct Sender<T> {
    shared: Arc<Shared<T>>,
    space_rx: watch::Receiver<u64>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.inner.lock().expect("Locking failed").senders += 1;
        Self {
            shared: self.shared.clone(),
            space_rx: self.space_rx.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut lock = self.shared.inner.lock().expect("Locking failed");
        lock.senders -= 1;
        if lock.senders == 0 {
            // Last sender gone behaves like an implicit finish
            lock.finished = true;
            drop(lock);
            Shared::<T>::bump(&self.shared.items_tx);
        }
    }
}

impl<T> Sender<T> {
    /// Queue an item under `class`, waiting while the channel is full.
    pub async fn send(&mut self, class: Class, item: T) -> Result<(), SendError<T>> {
        loop {
            {
                let mut lock = self.shared.inner.lock().expect("Locking failed");
                if lock.finished {
                    return Err(SendError::Finished(item));
                }
                if lock.receiver_closed {
                    return Err(SendError::Closed(item));
                }
                if lock.len() < self.shared.capacity {
                    match class {
                        Class::Priority => lock.priority.push_back(item),
                        Class::Background => lock.background.push_back(item),
                    }
                    drop(lock);
                    Shared::<T>::bump(&self.shared.items_tx);
                    return Ok(());
                }
            }

            // Wait for a pop, then re-check under the lock; another
            // producer may race us for the freed slot.
            if self.space_rx.changed().await.is_err() {
                return Err(SendError::Closed(item));
            }
        }
    }

    /// Mark end-of-stream. Idempotent; subsequent sends fail with
    /// [`SendError::Finished`]. The receiver still drains queued items.
    pub fn finish(&self) {
        let mut lock = self.shared.inner.lock().expect("Locking failed");
        if !lock.finished {
            lock.finished = true;
            drop(lock);
            Shared::<T>::bump(&self.shared.items_tx);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.inner.lock().expect("Locking failed").finished
    }
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
    items_rx: watch::Receiver<u64>,
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.inner.lock().expect("Locking failed").receiver_closed = true;
        Shared::<T>::bump(&self.shared.space_tx);
    }
}

impl<T> Receiver<T> {
    /// Next item in class-then-FIFO order; `None` after finish + drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut lock = self.shared.inner.lock().expect("Locking failed");
                if let Some(item) = lock.pop() {
                    drop(lock);
                    Shared::<T>::bump(&self.shared.space_tx);
                    return Some(item);
                }
                if lock.finished {
                    return None;
                }
            }

            if self.items_rx.changed().await.is_err() {
                // The shared watch sender lives as long as `self.shared`
                return None;
            }
        }
    }

    /// Drain without waiting; empty vec when nothing is queued.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut lock = self.shared.inner.lock().expect("Locking failed");
        let mut drained = Vec::with_capacity(lock.len());
        while let Some(item) = lock.pop() {
            drained.push(item);
        }
        if !drained.is_empty() {
            drop(lock);
            Shared::<T>::bump(&self.shared.space_tx);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().expect("Locking failed").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests;
