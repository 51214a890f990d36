//! Image context
//!
//! The entry layer only reads from the image: its size under the shared side
//! of the size lock, the validity of its backing data store, its event
//! socket and tracing options. [`ImageCtx`] is that read-only view;
//! [`Image`] is the in-process implementation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use uuid::Uuid;

use crate::DEFAULT_OBJECT_SIZE;
use crate::dispatch::ImageDispatcher;
use crate::error::{BlockError, BlockResult};
use crate::event::EventSocket;
use crate::perf::IoStats;

/// Per-image options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    /// Open a trace span for every request
    pub trace_all: bool,
    /// Endpoint name recorded on request spans
    pub trace_endpoint: String,
    /// Backing object size in bytes
    pub object_size: u64,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            trace_all: false,
            trace_endpoint: "objectio-image".to_string(),
            object_size: DEFAULT_OBJECT_SIZE,
        }
    }
}

impl ImageOptions {
    /// Parse options from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> BlockResult<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| BlockError::InvalidArgument(format!("image options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> BlockResult<()> {
        if self.object_size == 0 || !self.object_size.is_power_of_two() {
            return Err(BlockError::InvalidArgument(format!(
                "object size must be a non-zero power of two, got {}",
                self.object_size
            )));
        }
        Ok(())
    }
}

/// Read-only view of an image used by the I/O entry layer
pub trait ImageCtx: Send + Sync {
    /// Human-readable image name
    fn name(&self) -> &str;

    /// Lock guarding the logical image size in bytes
    fn size_lock(&self) -> &RwLock<u64>;

    /// Whether the backing data store can currently serve I/O
    fn data_store_is_valid(&self) -> bool;

    /// Channel for native asynchronous notification
    fn event_socket(&self) -> &EventSocket;

    fn options(&self) -> &ImageOptions;

    /// Latency and throughput accounting
    fn stats(&self) -> &Arc<IoStats>;

    /// Entry point of the dispatch pipeline
    fn dispatcher(&self) -> &Arc<dyn ImageDispatcher>;

    /// Current logical size, read under the shared side of the size lock
    fn image_size(&self) -> u64 {
        *self.size_lock().read()
    }
}

/// An open image
pub struct Image {
    /// Unique image ID
    id: String,
    /// Image name
    name: String,
    /// Logical size in bytes
    size: RwLock<u64>,
    /// Backing data store availability
    data_store_valid: AtomicBool,
    event_socket: EventSocket,
    options: ImageOptions,
    stats: Arc<IoStats>,
    /// Dispatch pipeline entry
    dispatcher: Arc<dyn ImageDispatcher>,
}

impl Image {
    /// Open an image of `size` bytes served by `dispatcher`
    pub fn open(
        name: impl Into<String>,
        size: u64,
        options: ImageOptions,
        dispatcher: Arc<dyn ImageDispatcher>,
    ) -> BlockResult<Arc<Self>> {
        options.validate()?;
        let image = Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            size: RwLock::new(size),
            data_store_valid: AtomicBool::new(true),
            event_socket: EventSocket::new(),
            options,
            stats: Arc::new(IoStats::new()),
            dispatcher,
        };
        info!(
            "Opened image {} ({}) size={} object_size={}",
            image.name, image.id, size, image.options.object_size
        );
        Ok(Arc::new(image))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Change the logical size under the exclusive side of the size lock
    pub fn resize(&self, new_size: u64) {
        let mut size = self.size.write();
        info!("Resizing image {} from {} to {} bytes", self.name, *size, new_size);
        *size = new_size;
    }

    /// Mark the backing data store usable or unusable
    pub fn set_data_store_valid(&self, valid: bool) {
        self.data_store_valid.store(valid, Ordering::Release);
    }
}

impl ImageCtx for Image {
    fn name(&self) -> &str {
        &self.name
    }

    fn size_lock(&self) -> &RwLock<u64> {
        &self.size
    }

    fn data_store_is_valid(&self) -> bool {
        self.data_store_valid.load(Ordering::Acquire)
    }

    fn event_socket(&self) -> &EventSocket {
        &self.event_socket
    }

    fn options(&self) -> &ImageOptions {
        &self.options
    }

    fn stats(&self) -> &Arc<IoStats> {
        &self.stats
    }

    fn dispatcher(&self) -> &Arc<dyn ImageDispatcher> {
        &self.dispatcher
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.image_size())
            .field("data_store_valid", &self.data_store_is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDispatcher;

    #[test]
    fn test_options_from_json() {
        let options = ImageOptions::from_json(r#"{"trace_all": true}"#).unwrap();
        assert!(options.trace_all);
        assert_eq!(options.object_size, DEFAULT_OBJECT_SIZE);
        assert_eq!(options.trace_endpoint, "objectio-image");
    }

    #[test]
    fn test_options_reject_bad_object_size() {
        let result = ImageOptions::from_json(r#"{"object_size": 3000}"#);
        assert!(matches!(result, Err(BlockError::InvalidArgument(_))));
        let result = ImageOptions::from_json("not json");
        assert!(matches!(result, Err(BlockError::InvalidArgument(_))));
    }

    #[test]
    fn test_resize_and_validity() {
        let image = Image::open(
            "img",
            1000,
            ImageOptions::default(),
            RecordingDispatcher::new(),
        )
        .unwrap();
        assert_eq!(image.image_size(), 1000);
        image.resize(4096);
        assert_eq!(image.image_size(), 4096);

        assert!(image.data_store_is_valid());
        image.set_data_store_valid(false);
        assert!(!image.data_store_is_valid());
        assert!(!image.event_socket().is_valid());
    }
}
