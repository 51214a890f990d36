//! In-memory dispatch pipeline
//!
//! Executes image requests on a tokio runtime against a sparse store of
//! fixed-size objects, resolving completions from runtime worker threads.
//! Used to run images without a cluster and to exercise the entry layer
//! end to end.
//!
//! ```text
//! Image (object_size = 4 MiB)
//! ├── object 0: bytes 0 - 4 MiB         (allocated on first write)
//! ├── object 1: bytes 4 MiB - 8 MiB     (absent: reads as zeros)
//! │   ...
//! ```

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::clip::clip_io;
use crate::dispatch::{ImageDispatchSpec, ImageDispatcher, ImageRequest};
use crate::image::{ImageCtx, ImageOptions};
use crate::types::{ImageExtent, MismatchOffset};

fn einval() -> i64 {
    -i64::from(libc::EINVAL)
}

/// One contiguous piece of an image extent inside a single object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObjectExtent {
    object_no: u64,
    offset: usize,
    length: usize,
}

/// Sparse object store backing the in-memory pipeline
struct MemoryStore {
    /// Object size in bytes
    object_size: u64,
    /// Allocated objects by object number
    objects: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl MemoryStore {
    fn new(object_size: u64) -> Self {
        Self {
            object_size,
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    fn object_extents(&self, off: u64, len: u64) -> Vec<ObjectExtent> {
        let mut pieces = Vec::new();
        let end = off + len;
        let mut pos = off;
        while pos < end {
            let object_no = pos / self.object_size;
            let object_end = (object_no + 1) * self.object_size;
            let piece_end = end.min(object_end);
            pieces.push(ObjectExtent {
                object_no,
                offset: (pos - object_no * self.object_size) as usize,
                length: (piece_end - pos) as usize,
            });
            pos = piece_end;
        }
        pieces
    }

    fn read_locked(&self, objects: &BTreeMap<u64, Vec<u8>>, off: u64, len: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(len as usize);
        for piece in self.object_extents(off, len) {
            match objects.get(&piece.object_no) {
                Some(object) => {
                    out.extend_from_slice(&object[piece.offset..piece.offset + piece.length]);
                }
                None => out.resize(out.len() + piece.length, 0),
            }
        }
        out
    }

    fn write_locked(&self, objects: &mut BTreeMap<u64, Vec<u8>>, off: u64, data: &[u8]) {
        let object_size = self.object_size as usize;
        let mut consumed = 0usize;
        for piece in self.object_extents(off, data.len() as u64) {
            let object = objects
                .entry(piece.object_no)
                .or_insert_with(|| vec![0u8; object_size]);
            object[piece.offset..piece.offset + piece.length]
                .copy_from_slice(&data[consumed..consumed + piece.length]);
            consumed += piece.length;
        }
    }

    fn zero_locked(&self, objects: &mut BTreeMap<u64, Vec<u8>>, off: u64, len: u64) {
        for piece in self.object_extents(off, len) {
            if piece.offset == 0 && piece.length as u64 == self.object_size {
                objects.remove(&piece.object_no);
            } else if let Some(object) = objects.get_mut(&piece.object_no) {
                object[piece.offset..piece.offset + piece.length].fill(0);
            }
        }
    }

    fn read(&self, off: u64, len: u64) -> Vec<u8> {
        self.read_locked(&self.objects.read(), off, len)
    }

    fn write(&self, off: u64, data: &[u8]) {
        self.write_locked(&mut self.objects.write(), off, data);
    }

    fn execute(&self, image: &dyn ImageCtx, request: ImageRequest) -> i64 {
        match request {
            ImageRequest::Read {
                extents,
                read_result,
            } => {
                let mut total = 0u64;
                for extent in extents {
                    let len = match clip_io(image, extent.offset, extent.length) {
                        Ok(len) => len,
                        Err(e) => return e.errno(),
                    };
                    read_result.append(&self.read(extent.offset, len));
                    total += len;
                }
                i64::try_from(total).unwrap_or(i64::MAX)
            }
            ImageRequest::Write { extents, data } => self.execute_write(image, &extents, &data),
            ImageRequest::Discard {
                extents,
                discard_granularity_bytes,
            } => {
                for extent in extents {
                    let len = match clip_io(image, extent.offset, extent.length) {
                        Ok(len) => len,
                        Err(e) => return e.errno(),
                    };
                    let (start, end) =
                        align_discard(extent.offset, len, u64::from(discard_granularity_bytes));
                    if start < end {
                        self.zero_locked(&mut self.objects.write(), start, end - start);
                    }
                }
                0
            }
            ImageRequest::WriteSame { extents, data } => {
                self.execute_write_same(image, &extents, &data)
            }
            ImageRequest::CompareAndWrite {
                extents,
                cmp_data,
                data,
                mismatch_offset,
            } => self.execute_compare_and_write(image, &extents, &cmp_data, &data, &mismatch_offset),
            ImageRequest::Flush { flush_source } => {
                trace!("flush from {:?}", flush_source);
                0
            }
        }
    }

    fn execute_write(&self, image: &dyn ImageCtx, extents: &[ImageExtent], data: &Bytes) -> i64 {
        let total: u64 = extents.iter().map(|e| e.length).sum();
        if total != data.len() as u64 {
            return einval();
        }

        let mut consumed = 0usize;
        for extent in extents {
            let len = match clip_io(image, extent.offset, extent.length) {
                Ok(len) => len as usize,
                Err(e) => return e.errno(),
            };
            self.write(extent.offset, &data[consumed..consumed + len]);
            consumed += extent.length as usize;
        }
        0
    }

    fn execute_write_same(
        &self,
        image: &dyn ImageCtx,
        extents: &[ImageExtent],
        pattern: &Bytes,
    ) -> i64 {
        if pattern.is_empty() {
            return einval();
        }

        // a clipped extent ends with a partial repetition
        for extent in extents {
            let len = match clip_io(image, extent.offset, extent.length) {
                Ok(len) => len as usize,
                Err(e) => return e.errno(),
            };
            let data: Vec<u8> = pattern.iter().copied().cycle().take(len).collect();
            self.write(extent.offset, &data);
        }
        0
    }

    fn execute_compare_and_write(
        &self,
        image: &dyn ImageCtx,
        extents: &[ImageExtent],
        cmp_data: &Bytes,
        data: &Bytes,
        mismatch_offset: &MismatchOffset,
    ) -> i64 {
        let [extent] = extents else {
            return einval();
        };
        if cmp_data.len() as u64 != extent.length || data.len() as u64 != extent.length {
            return einval();
        }

        let len = match clip_io(image, extent.offset, extent.length) {
            Ok(len) => len as usize,
            Err(e) => return e.errno(),
        };

        // compare and write under one exclusive lock
        let mut objects = self.objects.write();
        let current = self.read_locked(&objects, extent.offset, len as u64);
        if let Some(pos) = current
            .iter()
            .zip(cmp_data.iter())
            .position(|(have, want)| have != want)
        {
            let offset = extent.offset + pos as u64;
            mismatch_offset.set(offset);
            debug!("compare-and-write mismatch at offset {}", offset);
            return -i64::from(libc::EILSEQ);
        }
        self.write_locked(&mut objects, extent.offset, &data[..len]);
        0
    }
}

/// Shrink `[off, off + len)` to whole discard-granularity units
fn align_discard(off: u64, len: u64, granularity: u64) -> (u64, u64) {
    let end = off + len;
    if granularity <= 1 {
        return (off, end);
    }
    let start = off.div_ceil(granularity) * granularity;
    let end = (end / granularity) * granularity;
    (start, end.max(start))
}

/// Dispatch pipeline that serves an image from memory
pub struct MemoryDispatcher {
    /// Runtime executing requests
    runtime: Handle,
    store: Arc<MemoryStore>,
    /// Result for the next request instead of executing it
    injected: Mutex<Option<i64>>,
    /// Specs received
    submitted: AtomicU64,
}

impl MemoryDispatcher {
    /// Create a dispatcher running requests on `runtime`
    pub fn new(runtime: Handle, options: &ImageOptions) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            store: Arc::new(MemoryStore::new(options.object_size)),
            injected: Mutex::new(None),
            submitted: AtomicU64::new(0),
        })
    }

    /// Fail the next submitted request with `r` instead of executing it
    pub fn inject_error(&self, r: i64) {
        *self.injected.lock() = Some(r);
    }

    /// Number of specs received
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Number of objects currently holding data
    pub fn allocated_objects(&self) -> usize {
        self.store.objects.read().len()
    }
}

impl ImageDispatcher for MemoryDispatcher {
    fn send(&self, spec: ImageDispatchSpec) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let injected = self.injected.lock().take();
        let store = Arc::clone(&self.store);

        self.runtime.spawn(async move {
            let ImageDispatchSpec {
                image,
                aio_comp,
                request,
                trace: span,
                ..
            } = spec;

            span.in_scope(|| {
                aio_comp.set_request_count(1);
                let r = match injected {
                    Some(r) => {
                        warn!("completion {}: injected error {}", aio_comp.id(), r);
                        r
                    }
                    None => store.execute(image.as_ref(), request),
                };
                aio_comp.complete_request(r);
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(4096)
    }

    #[test]
    fn test_object_extents_span_objects() {
        let store = store();
        let pieces = store.object_extents(4000, 5000);
        assert_eq!(
            pieces,
            vec![
                ObjectExtent {
                    object_no: 0,
                    offset: 4000,
                    length: 96
                },
                ObjectExtent {
                    object_no: 1,
                    offset: 0,
                    length: 4096
                },
                ObjectExtent {
                    object_no: 2,
                    offset: 0,
                    length: 808
                },
            ]
        );
        assert!(store.object_extents(100, 0).is_empty());
    }

    #[test]
    fn test_sparse_read_returns_zeros() {
        let store = store();
        store.write(5000, b"hello");
        let data = store.read(4998, 9);
        assert_eq!(&data, b"\0\0hello\0\0");
        assert_eq!(store.read(100_000, 4), vec![0u8; 4]);
        assert_eq!(store.objects.read().len(), 1);
    }

    #[test]
    fn test_zero_drops_whole_objects() {
        let store = store();
        store.write(0, &vec![0xAA; 3 * 4096]);
        store.zero_locked(&mut store.objects.write(), 100, 2 * 4096);
        let objects = store.objects.read();
        assert_eq!(objects.len(), 2);
        assert!(!objects.contains_key(&1));
        drop(objects);
        assert_eq!(store.read(99, 2), vec![0xAA, 0]);
        assert_eq!(store.read(100 + 2 * 4096 - 1, 2), vec![0, 0xAA]);
    }

    #[test]
    fn test_align_discard() {
        assert_eq!(align_discard(100, 1000, 0), (100, 1100));
        assert_eq!(align_discard(100, 8192, 4096), (4096, 8192));
        assert_eq!(align_discard(100, 200, 4096), (4096, 4096));
        assert_eq!(align_discard(0, 8192, 4096), (0, 8192));
    }
}
