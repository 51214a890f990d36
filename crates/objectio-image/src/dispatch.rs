//! Dispatch specs handed to the image dispatch pipeline
//!
//! Every entry point builds exactly one [`ImageDispatchSpec`], tagged with the
//! pipeline layer it enters at, and sends it. Sending is fire-and-forget: the
//! pipeline owns the spec from then on and must resolve its completion exactly
//! once, including when it fails internally.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{Span, debug};

use crate::completion::AioCompletion;
use crate::image::ImageCtx;
use crate::types::{
    AioType, FlushSource, ImageDispatchLayer, ImageExtent, ImageExtents, MismatchOffset, OpFlags,
    ReadResult,
};

/// Operation-specific payload of a dispatch spec
#[derive(Debug)]
pub enum ImageRequest {
    Read {
        extents: ImageExtents,
        read_result: ReadResult,
    },
    Write {
        extents: ImageExtents,
        data: Bytes,
    },
    Discard {
        extents: ImageExtents,
        discard_granularity_bytes: u32,
    },
    WriteSame {
        extents: ImageExtents,
        data: Bytes,
    },
    CompareAndWrite {
        extents: ImageExtents,
        cmp_data: Bytes,
        data: Bytes,
        mismatch_offset: MismatchOffset,
    },
    Flush {
        flush_source: FlushSource,
    },
}

impl ImageRequest {
    pub fn aio_type(&self) -> AioType {
        match self {
            ImageRequest::Read { .. } => AioType::Read,
            ImageRequest::Write { .. } => AioType::Write,
            ImageRequest::Discard { .. } => AioType::Discard,
            ImageRequest::WriteSame { .. } => AioType::WriteSame,
            ImageRequest::CompareAndWrite { .. } => AioType::CompareAndWrite,
            ImageRequest::Flush { .. } => AioType::Flush,
        }
    }

    /// Image extents touched by the request; empty for flushes
    pub fn extents(&self) -> &[ImageExtent] {
        match self {
            ImageRequest::Read { extents, .. }
            | ImageRequest::Write { extents, .. }
            | ImageRequest::Discard { extents, .. }
            | ImageRequest::WriteSame { extents, .. }
            | ImageRequest::CompareAndWrite { extents, .. } => extents,
            ImageRequest::Flush { .. } => &[],
        }
    }
}

/// Downstream execution engine for image requests
pub trait ImageDispatcher: Send + Sync {
    /// Take ownership of a spec. Must not block on the I/O itself.
    fn send(&self, spec: ImageDispatchSpec);
}

/// A request submitted to the dispatch pipeline
pub struct ImageDispatchSpec {
    pub image: Arc<dyn ImageCtx>,
    pub dispatch_layer: ImageDispatchLayer,
    pub aio_comp: AioCompletion,
    pub request: ImageRequest,
    pub op_flags: OpFlags,
    pub trace: Span,
}

impl ImageDispatchSpec {
    fn new(
        image: Arc<dyn ImageCtx>,
        dispatch_layer: ImageDispatchLayer,
        aio_comp: AioCompletion,
        request: ImageRequest,
        op_flags: OpFlags,
        trace: Span,
    ) -> Self {
        Self {
            image,
            dispatch_layer,
            aio_comp,
            request,
            op_flags,
            trace,
        }
    }

    pub fn create_read(
        image: Arc<dyn ImageCtx>,
        dispatch_layer: ImageDispatchLayer,
        aio_comp: AioCompletion,
        extents: ImageExtents,
        read_result: ReadResult,
        op_flags: OpFlags,
        trace: Span,
    ) -> Self {
        Self::new(
            image,
            dispatch_layer,
            aio_comp,
            ImageRequest::Read {
                extents,
                read_result,
            },
            op_flags,
            trace,
        )
    }

    pub fn create_write(
        image: Arc<dyn ImageCtx>,
        dispatch_layer: ImageDispatchLayer,
        aio_comp: AioCompletion,
        extents: ImageExtents,
        data: Bytes,
        op_flags: OpFlags,
        trace: Span,
    ) -> Self {
        Self::new(
            image,
            dispatch_layer,
            aio_comp,
            ImageRequest::Write { extents, data },
            op_flags,
            trace,
        )
    }

    pub fn create_discard(
        image: Arc<dyn ImageCtx>,
        dispatch_layer: ImageDispatchLayer,
        aio_comp: AioCompletion,
        off: u64,
        len: u64,
        discard_granularity_bytes: u32,
        trace: Span,
    ) -> Self {
        Self::new(
            image,
            dispatch_layer,
            aio_comp,
            ImageRequest::Discard {
                extents: vec![ImageExtent::new(off, len)],
                discard_granularity_bytes,
            },
            OpFlags::NONE,
            trace,
        )
    }

    pub fn create_write_same(
        image: Arc<dyn ImageCtx>,
        dispatch_layer: ImageDispatchLayer,
        aio_comp: AioCompletion,
        off: u64,
        len: u64,
        data: Bytes,
        op_flags: OpFlags,
        trace: Span,
    ) -> Self {
        Self::new(
            image,
            dispatch_layer,
            aio_comp,
            ImageRequest::WriteSame {
                extents: vec![ImageExtent::new(off, len)],
                data,
            },
            op_flags,
            trace,
        )
    }

    pub fn create_compare_and_write(
        image: Arc<dyn ImageCtx>,
        dispatch_layer: ImageDispatchLayer,
        aio_comp: AioCompletion,
        extents: ImageExtents,
        cmp_data: Bytes,
        data: Bytes,
        mismatch_offset: MismatchOffset,
        op_flags: OpFlags,
        trace: Span,
    ) -> Self {
        Self::new(
            image,
            dispatch_layer,
            aio_comp,
            ImageRequest::CompareAndWrite {
                extents,
                cmp_data,
                data,
                mismatch_offset,
            },
            op_flags,
            trace,
        )
    }

    pub fn create_flush(
        image: Arc<dyn ImageCtx>,
        dispatch_layer: ImageDispatchLayer,
        aio_comp: AioCompletion,
        flush_source: FlushSource,
        trace: Span,
    ) -> Self {
        Self::new(
            image,
            dispatch_layer,
            aio_comp,
            ImageRequest::Flush { flush_source },
            OpFlags::NONE,
            trace,
        )
    }

    /// Hand the spec to the image's dispatch pipeline
    pub fn send(self) {
        let dispatcher = Arc::clone(self.image.dispatcher());
        debug!(
            "completion {}: sending {} at layer {:?}",
            self.aio_comp.id(),
            self.request.aio_type(),
            self.dispatch_layer
        );
        dispatcher.send(self);
    }
}

impl std::fmt::Debug for ImageDispatchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDispatchSpec")
            .field("image", &self.image.name())
            .field("dispatch_layer", &self.dispatch_layer)
            .field("aio_comp", &self.aio_comp.id())
            .field("request", &self.request)
            .field("op_flags", &self.op_flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionSink;
    use crate::image::{Image, ImageOptions};
    use crate::testing::RecordingDispatcher;

    #[test]
    fn test_send_reaches_dispatcher() {
        let dispatcher = RecordingDispatcher::new();
        let image = Image::open("img", 4096, ImageOptions::default(), dispatcher.clone()).unwrap();

        let spec = ImageDispatchSpec::create_write(
            image,
            ImageDispatchLayer::ApiStart,
            AioCompletion::create(CompletionSink::None),
            vec![ImageExtent::new(0, 3)],
            Bytes::from_static(b"abc"),
            OpFlags::FADVISE_SEQUENTIAL,
            Span::none(),
        );
        assert_eq!(spec.request.aio_type(), AioType::Write);
        spec.send();

        let sent = dispatcher.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dispatch_layer, ImageDispatchLayer::ApiStart);
        assert_eq!(sent[0].op_flags, OpFlags::FADVISE_SEQUENTIAL);
        assert_eq!(sent[0].request.extents(), &[ImageExtent::new(0, 3)]);
    }

    #[test]
    fn test_flush_has_no_extents() {
        let dispatcher = RecordingDispatcher::new();
        let image = Image::open("img", 4096, ImageOptions::default(), dispatcher).unwrap();
        let spec = ImageDispatchSpec::create_flush(
            image,
            ImageDispatchLayer::ApiStart,
            AioCompletion::create(CompletionSink::None),
            FlushSource::User,
            Span::none(),
        );
        assert!(spec.request.extents().is_empty());
        assert_eq!(spec.request.aio_type(), AioType::Flush);
    }
}
