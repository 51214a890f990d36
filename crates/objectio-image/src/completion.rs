//! Asynchronous I/O completions
//!
//! An [`AioCompletion`] is the one-shot outcome of a single image operation.
//! It is created by the submitter, handed to the dispatch pipeline together
//! with the request, and resolved exactly once, either by the pipeline or by
//! the entry layer when a request is rejected before submission.
//!
//! ```text
//!   Pending ──resolve(r)──► Callback ──sink + event socket──► Complete
//!      │
//!      └── set_request_count(n) / complete_request(r) × n ──┘
//! ```
//!
//! Resolution may happen on any thread. The result code is published under
//! the completion's mutex before waiters are woken, and an atomic guard makes
//! any second resolution attempt a logged no-op.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::event::EventSocket;
use crate::image::ImageCtx;
use crate::perf::IoStats;
use crate::types::AioType;

static NEXT_COMPLETION_ID: AtomicU64 = AtomicU64::new(1);

/// Blocking result cell used by the synchronous API.
///
/// The pipeline side calls [`SaferCond::complete`]; the submitting thread
/// parks in [`SaferCond::wait`] until the result is available.
#[derive(Clone, Default)]
pub struct SaferCond {
    inner: Arc<(Mutex<Option<i64>>, Condvar)>,
}

impl SaferCond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the result and wake the waiter
    pub fn complete(&self, r: i64) {
        let (lock, cond) = &*self.inner;
        *lock.lock() = Some(r);
        cond.notify_all();
    }

    /// Block until a result has been published and return it
    pub fn wait(&self) -> i64 {
        let (lock, cond) = &*self.inner;
        let mut result = lock.lock();
        loop {
            if let Some(r) = *result {
                return r;
            }
            cond.wait(&mut result);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.0.lock().is_some()
    }
}

/// Where the result of a completion is delivered
pub enum CompletionSink {
    /// No direct delivery; only waiters and the event socket observe it
    None,
    /// Wake a thread blocked on a [`SaferCond`]
    Blocking(SaferCond),
    /// Invoke a caller-supplied callback on the resolving thread
    Callback(Box<dyn FnOnce(i64) + Send + 'static>),
    /// Send the result to an async task
    Oneshot(oneshot::Sender<i64>),
}

impl CompletionSink {
    /// Wrap a closure as a callback sink
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(i64) + Send + 'static,
    {
        CompletionSink::Callback(Box::new(f))
    }

    fn deliver(self, r: i64) {
        match self {
            CompletionSink::None => {}
            CompletionSink::Blocking(cond) => cond.complete(r),
            CompletionSink::Callback(cb) => cb(r),
            CompletionSink::Oneshot(tx) => {
                // receiver may have been dropped by a caller that lost interest
                let _ = tx.send(r);
            }
        }
    }
}

impl From<SaferCond> for CompletionSink {
    fn from(cond: SaferCond) -> Self {
        CompletionSink::Blocking(cond)
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            CompletionSink::None => "None",
            CompletionSink::Blocking(_) => "Blocking",
            CompletionSink::Callback(_) => "Callback",
            CompletionSink::Oneshot(_) => "Oneshot",
        };
        f.write_str(kind)
    }
}

/// Lifecycle state of a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// Waiting for the pipeline
    Pending,
    /// Result fixed, notifications in progress
    Callback,
    /// Result fixed and all notifications delivered
    Complete,
}

struct State {
    state: CompletionState,
    /// Aggregate result code
    rval: i64,
    /// Sub-requests still outstanding
    pending_count: u32,
    aio_type: AioType,
    /// Set by `init_time`
    start_time: Option<Instant>,
    /// Queue on the event socket when resolved
    event_notify: bool,
    /// Taken on resolution
    sink: Option<CompletionSink>,
    /// Image accounting, taken on resolution
    stats: Option<Arc<IoStats>>,
    /// Image event socket, taken on resolution
    event_socket: Option<EventSocket>,
}

struct Inner {
    id: u64,
    /// Guards against a second resolution
    resolved: AtomicBool,
    state: Mutex<State>,
    /// Signalled when the state reaches `Complete`
    cond: Condvar,
}

/// Reference-counted handle to a single asynchronous operation outcome
#[derive(Clone)]
pub struct AioCompletion {
    inner: Arc<Inner>,
}

impl AioCompletion {
    /// Create a pending completion bound to a result sink
    pub fn create(sink: impl Into<CompletionSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_COMPLETION_ID.fetch_add(1, Ordering::Relaxed),
                resolved: AtomicBool::new(false),
                state: Mutex::new(State {
                    state: CompletionState::Pending,
                    rval: 0,
                    pending_count: 0,
                    aio_type: AioType::None,
                    start_time: None,
                    event_notify: false,
                    sink: Some(sink.into()),
                    stats: None,
                    event_socket: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create a completion whose result is delivered over a oneshot channel
    pub fn create_oneshot() -> (Self, oneshot::Receiver<i64>) {
        let (tx, rx) = oneshot::channel();
        (Self::create(CompletionSink::Oneshot(tx)), rx)
    }

    /// Process-unique identifier, used in logs
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Bind the completion to an image and start its latency clock.
    ///
    /// Only the first call has an effect.
    pub fn init_time<I: ImageCtx + ?Sized>(&self, image: &I, aio_type: AioType) {
        let mut state = self.inner.state.lock();
        if state.start_time.is_some() {
            return;
        }
        state.aio_type = aio_type;
        state.start_time = Some(Instant::now());
        state.stats = Some(Arc::clone(image.stats()));
        state.event_socket = Some(image.event_socket().clone());
    }

    pub fn aio_type(&self) -> AioType {
        self.inner.state.lock().aio_type
    }

    /// Time of [`AioCompletion::init_time`], if it has been called
    pub fn start_time(&self) -> Option<Instant> {
        self.inner.state.lock().start_time
    }

    /// Queue this completion on the image's event socket when it resolves
    pub fn set_event_notify(&self, event_notify: bool) {
        self.inner.state.lock().event_notify = event_notify;
    }

    pub fn event_notify(&self) -> bool {
        self.inner.state.lock().event_notify
    }

    /// Declare how many sub-requests the pipeline will complete.
    ///
    /// A count of zero resolves the completion immediately.
    pub fn set_request_count(&self, count: u32) {
        let rval = {
            let mut state = self.inner.state.lock();
            if state.state != CompletionState::Pending {
                warn!(
                    "completion {}: request count set after resolution",
                    self.inner.id
                );
                return;
            }
            state.pending_count = count;
            if count > 0 {
                return;
            }
            state.rval
        };
        self.resolve(rval);
    }

    /// Complete one sub-request.
    ///
    /// Byte counts of successful sub-requests are summed; the first failure
    /// (other than `-EEXIST`) becomes the result.
    pub fn complete_request(&self, r: i64) {
        let rval = {
            let mut state = self.inner.state.lock();
            if state.state != CompletionState::Pending || state.pending_count == 0 {
                warn!(
                    "completion {}: unexpected sub-request result {}",
                    self.inner.id, r
                );
                return;
            }

            if state.rval >= 0 {
                if r < 0 && r != -i64::from(libc::EEXIST) {
                    state.rval = r;
                } else if r > 0 {
                    state.rval += r;
                }
            }

            state.pending_count -= 1;
            if state.pending_count > 0 {
                return;
            }
            state.rval
        };
        self.resolve(rval);
    }

    /// Resolve with the final result. Returns false if already resolved.
    pub fn complete(&self, r: i64) -> bool {
        self.resolve(r)
    }

    /// Resolve immediately with a negative error code.
    ///
    /// Returns false if the completion had already been resolved.
    pub fn fail(&self, r: i64) -> bool {
        error!("completion {}: failing with {}", self.inner.id, r);
        self.resolve(r)
    }

    pub fn state(&self) -> CompletionState {
        self.inner.state.lock().state
    }

    pub fn is_complete(&self) -> bool {
        self.state() == CompletionState::Complete
    }

    /// The result code, once resolved
    pub fn get_return_value(&self) -> Option<i64> {
        let state = self.inner.state.lock();
        match state.state {
            CompletionState::Pending => None,
            CompletionState::Callback | CompletionState::Complete => Some(state.rval),
        }
    }

    /// Block until the completion reaches [`CompletionState::Complete`]
    pub fn wait_for_complete(&self) -> i64 {
        let mut state = self.inner.state.lock();
        while state.state != CompletionState::Complete {
            self.inner.cond.wait(&mut state);
        }
        state.rval
    }

    fn resolve(&self, r: i64) -> bool {
        if self
            .inner
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                "completion {}: already resolved, dropping result {}",
                self.inner.id, r
            );
            return false;
        }

        let (sink, aio_type, start_time, stats, event_socket) = {
            let mut state = self.inner.state.lock();
            state.rval = r;
            state.pending_count = 0;
            state.state = CompletionState::Callback;
            // the socket queue holds this completion once it is notified
            let event_socket = state.event_socket.take().filter(|_| state.event_notify);
            (
                state.sink.take(),
                state.aio_type,
                state.start_time,
                state.stats.take(),
                event_socket,
            )
        };

        if let (Some(stats), Some(start)) = (stats, start_time) {
            stats.record(aio_type, r, start.elapsed());
        }
        debug!("completion {}: {} resolved with {}", self.inner.id, aio_type, r);

        if let Some(sink) = sink {
            sink.deliver(r);
        }

        if let Some(socket) = event_socket
            && socket.is_valid()
        {
            socket.notify(self.clone());
        }

        self.inner.state.lock().state = CompletionState::Complete;
        self.inner.cond.notify_all();
        true
    }
}

impl fmt::Debug for AioCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AioCompletion")
            .field("id", &self.inner.id)
            .field("aio_type", &state.aio_type)
            .field("state", &state.state)
            .field("rval", &state.rval)
            .field("event_notify", &state.event_notify)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_resolve_from_other_thread_wakes_waiter() {
        let cond = SaferCond::new();
        let completion = AioCompletion::create(cond.clone());

        let resolver = completion.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.complete(4096);
        });

        assert_eq!(cond.wait(), 4096);
        handle.join().unwrap();
        assert_eq!(completion.wait_for_complete(), 4096);
        assert!(completion.is_complete());
    }

    #[test]
    fn test_resolved_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let completion = AioCompletion::create(CompletionSink::callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(completion.fail(-i64::from(libc::ENODEV)));
        assert!(!completion.complete(0));
        assert!(!completion.fail(-i64::from(libc::EIO)));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            completion.get_return_value(),
            Some(-i64::from(libc::ENODEV))
        );
    }

    #[test]
    fn test_concurrent_resolvers_single_winner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let completion = AioCompletion::create(CompletionSink::callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let c = completion.clone();
                thread::spawn(move || c.complete(i))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_result_hidden_until_resolved() {
        let completion = AioCompletion::create(CompletionSink::None);
        assert_eq!(completion.get_return_value(), None);
        assert_eq!(completion.state(), CompletionState::Pending);
        completion.complete(7);
        assert_eq!(completion.get_return_value(), Some(7));
    }

    #[test]
    fn test_request_count_aggregation() {
        let cond = SaferCond::new();
        let completion = AioCompletion::create(cond.clone());
        completion.set_request_count(3);

        completion.complete_request(512);
        completion.complete_request(-i64::from(libc::EEXIST));
        assert!(!cond.is_complete());
        completion.complete_request(1024);

        assert_eq!(cond.wait(), 1536);
    }

    #[test]
    fn test_request_count_first_error_wins() {
        let cond = SaferCond::new();
        let completion = AioCompletion::create(cond.clone());
        completion.set_request_count(3);

        completion.complete_request(512);
        completion.complete_request(-i64::from(libc::EIO));
        completion.complete_request(-i64::from(libc::EROFS));

        assert_eq!(cond.wait(), -i64::from(libc::EIO));
    }

    #[test]
    fn test_zero_request_count_resolves() {
        let cond = SaferCond::new();
        let completion = AioCompletion::create(cond.clone());
        completion.set_request_count(0);
        assert_eq!(cond.wait(), 0);
        assert!(completion.is_complete());
    }

    #[tokio::test]
    async fn test_oneshot_sink() {
        let (completion, rx) = AioCompletion::create_oneshot();
        let resolver = completion.clone();
        tokio::task::spawn_blocking(move || resolver.complete(-5));
        assert_eq!(rx.await.unwrap(), -5);
    }

    #[test]
    fn test_dropped_oneshot_receiver() {
        let (completion, rx) = AioCompletion::create_oneshot();
        drop(rx);
        assert!(completion.complete(0));
        assert!(completion.is_complete());
    }
}
