//! In-Memory Connection Sink
//!
//! Backs [`Connection::fake`](super::Connection::fake): writes land in a
//! shared buffer instead of a socket, and the first write fires a one-shot
//! notification. The AOF loader replays history through a fake connection,
//! and tests use one to observe exactly what the engine wrote.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Shared buffer observing every byte written to a fake connection.
#[derive(Clone, Debug, Default)]
pub struct FakeSink {
    buf: Arc<Mutex<Vec<u8>>>,
    notify: Arc<Notify>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn push(&self, bytes: &[u8]) {
        self.buf.lock().unwrap().extend_from_slice(bytes);
        // Stores a permit, so a waiter arriving late still sees the write.
        self.notify.notify_one();
    }

    /// Everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }

    /// Discards buffered bytes.
    pub fn clear(&self) {
        self.buf.lock().unwrap().clear();
    }

    /// Resolves when a write lands after this call.
    pub fn notified(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.notify.notified()
    }
}
