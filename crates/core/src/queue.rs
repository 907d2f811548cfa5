//! A multi-producer/single-consumer FIFO queue with explicit close.
//!
//! This is the plumbing between the socket read loop (producer) and the
//! model adapter's turn consumer (the single taker), the same shape as the
//! `mpsc::UnboundedSender`/`Receiver` pairs `scp::jsonrpc::actors` hands out
//! to its outgoing-message and new-task actors. We wrap the pair in one
//! type so `close` can be expressed as "drop the sender", which is exactly
//! what makes pending `take`s resolve to the end sentinel without a second
//! signalling channel.

use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::Mutex;

/// FIFO queue. `push` after `close` silently drops the value; `take` after
/// `close` drains whatever was buffered before returning `None` (the "end"
/// sentinel), matching the invariant that no post-close push is ever
/// delivered, but values buffered at close time still are.
pub struct EventQueue<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }

    /// Push a value. Dropped silently if the queue is already closed.
    pub async fn push(&self, value: T) {
        let guard = self.tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            // An UnboundedSender only errors if the receiver has been
            // dropped, which can't happen while `self` is alive.
            let _ = tx.unbounded_send(value);
        }
    }

    /// Take the oldest buffered value, suspending until one arrives or the
    /// queue closes. Returns `None` once closed and drained.
    pub async fn take(&self) -> Option<T> {
        self.rx.lock().await.next().await
    }

    /// Close the queue. Idempotent: closing twice is a no-op the second
    /// time.
    pub async fn close(&self) {
        self.tx.lock().await.take();
    }

    pub async fn is_closed(&self) -> bool {
        self.tx.lock().await.is_none()
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
