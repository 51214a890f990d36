//! Test doubles for the dispatch pipeline

use parking_lot::Mutex;
use std::sync::Arc;

use crate::dispatch::{ImageDispatchSpec, ImageDispatcher};

/// Dispatcher that keeps every spec it receives.
///
/// With an auto-complete result set, each spec's completion is resolved
/// inline with that result before the spec is recorded.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<ImageDispatchSpec>>,
    auto_complete: Option<i64>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn completing_with(r: i64) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            auto_complete: Some(r),
        })
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn take(&self) -> Vec<ImageDispatchSpec> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl ImageDispatcher for RecordingDispatcher {
    fn send(&self, spec: ImageDispatchSpec) {
        if let Some(r) = self.auto_complete {
            spec.aio_comp.complete(r);
        }
        self.sent.lock().push(spec);
    }
}
