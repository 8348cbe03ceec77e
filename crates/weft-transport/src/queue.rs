use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded outbound queue shared between a driver's API surface and
/// its writer task. On overflow the oldest entry is dropped and
/// returned so the caller can surface a `SendFailed` event.
/// Reused by every driver, including the relay client in `weft-relay`.
pub struct SendQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> SendQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push an item. Returns the dropped oldest item if the queue was full.
    pub fn push(&self, item: T) -> Option<T> {
        let dropped = {
            let mut q = self.inner.lock().expect("send queue poisoned");
            let dropped = if q.len() >= self.capacity {
                q.pop_front()
            } else {
                None
            };
            q.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Wait for the next item.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.inner.lock().expect("send queue poisoned").pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("send queue poisoned").len()
    }
}
