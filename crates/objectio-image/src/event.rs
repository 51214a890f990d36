//! Native asynchronous notification
//!
//! An application that prefers polling over per-request callbacks registers
//! the image's [`EventSocket`] and submits with `native_async` set. Each such
//! completion is queued on the socket when it resolves and the socket is
//! signalled; the application then drains the queue with
//! [`EventSocket::poll_io_events`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::debug;

use crate::completion::AioCompletion;

#[derive(Default)]
struct EventSocketInner {
    /// Whether a consumer is attached
    registered: AtomicBool,
    /// Resolved completions waiting to be polled
    completed: Mutex<VecDeque<AioCompletion>>,
    /// Signals raised since creation
    signals: AtomicU64,
    notify: Notify,
}

/// Event channel of an image
#[derive(Clone, Default)]
pub struct EventSocket {
    inner: Arc<EventSocketInner>,
}

impl EventSocket {
    /// Create an unregistered socket
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting completion events
    pub fn register(&self) {
        self.inner.registered.store(true, Ordering::Release);
        debug!("Event socket registered");
    }

    /// Stop accepting completion events; already queued events stay pollable
    pub fn unregister(&self) {
        self.inner.registered.store(false, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    /// Queue a resolved completion and signal the socket
    pub(crate) fn notify(&self, completion: AioCompletion) {
        self.inner.completed.lock().push_back(completion);
        self.inner.signals.fetch_add(1, Ordering::AcqRel);
        self.inner.notify.notify_one();
    }

    /// Drain up to `max` resolved completions in resolution order
    pub fn poll_io_events(&self, max: usize) -> Vec<AioCompletion> {
        let mut completed = self.inner.completed.lock();
        let n = max.min(completed.len());
        completed.drain(..n).collect()
    }

    /// Number of completions waiting to be polled
    pub fn pending_events(&self) -> usize {
        self.inner.completed.lock().len()
    }

    /// Total signals raised since creation
    pub fn signal_count(&self) -> u64 {
        self.inner.signals.load(Ordering::Acquire)
    }

    /// Wait until the socket has been signalled.
    ///
    /// A signal raised while nobody is waiting is retained, so a single
    /// pending signal is never lost between polls.
    pub async fn readable(&self) {
        self.inner.notify.notified().await;
    }
}

impl std::fmt::Debug for EventSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSocket")
            .field("registered", &self.is_valid())
            .field("pending", &self.pending_events())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionSink;
    use crate::image::{Image, ImageCtx, ImageOptions};
    use crate::testing::RecordingDispatcher;
    use crate::types::AioType;

    #[test]
    fn test_register() {
        let socket = EventSocket::new();
        assert!(!socket.is_valid());
        socket.register();
        assert!(socket.is_valid());
        socket.unregister();
        assert!(!socket.is_valid());
    }

    #[test]
    fn test_poll_drains_in_order() {
        let socket = EventSocket::new();
        let first = AioCompletion::create(CompletionSink::None);
        let second = AioCompletion::create(CompletionSink::None);
        socket.notify(first.clone());
        socket.notify(second.clone());

        assert_eq!(socket.signal_count(), 2);
        let events = socket.poll_io_events(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id(), first.id());
        let events = socket.poll_io_events(8);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id(), second.id());
        assert_eq!(socket.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_readable_keeps_permit() {
        let socket = EventSocket::new();
        socket.notify(AioCompletion::create(CompletionSink::None));
        tokio::time::timeout(std::time::Duration::from_secs(1), socket.readable())
            .await
            .unwrap();
    }

    #[test]
    fn test_queued_completion_releases_socket() {
        let image = Image::open(
            "img",
            4096,
            ImageOptions::default(),
            RecordingDispatcher::new(),
        )
        .unwrap();
        let socket = image.event_socket().clone();
        socket.register();

        let completion = AioCompletion::create(CompletionSink::None);
        completion.init_time(image.as_ref(), AioType::Flush);
        completion.set_event_notify(true);
        let before = Arc::strong_count(&socket.inner);

        assert!(completion.complete(0));
        assert_eq!(socket.pending_events(), 1);
        assert_eq!(Arc::strong_count(&socket.inner), before - 1);
    }
}
