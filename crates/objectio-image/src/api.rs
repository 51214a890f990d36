//! Image I/O entry points
//!
//! Two calling conventions are offered for every operation:
//!
//! - `aio_*`: the caller supplies an [`AioCompletion`] and the call returns
//!   as soon as the request has been handed to the dispatch pipeline. The
//!   outcome is delivered through the completion's sink and, when
//!   `native_async` is set and the image's event socket is registered,
//!   through the event socket.
//! - synchronous: the call creates a completion bound to a [`SaferCond`],
//!   submits through the matching `aio_*` entry point and blocks until the
//!   pipeline resolves it.
//!
//! Write-class synchronous calls clip the request against the current image
//! size before anything is submitted and report the clipped length on
//! success. Reads are clipped by the pipeline.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{Span, error, info_span, trace};

use crate::clip::clip_io;
use crate::completion::{AioCompletion, SaferCond};
use crate::dispatch::ImageDispatchSpec;
use crate::error::{BlockError, BlockResult};
use crate::image::ImageCtx;
use crate::types::{
    AioType, FlushSource, ImageDispatchLayer, ImageExtent, MismatchOffset, OpFlags, ReadResult,
};

/// Layer every request from this entry layer is tagged with
const DISPATCH_LAYER: ImageDispatchLayer = ImageDispatchLayer::ApiStart;

/// Resolve the completion with `-ENODEV` if the image cannot serve I/O
fn is_valid_io<I: ImageCtx + ?Sized>(image: &I, aio_comp: &AioCompletion) -> bool {
    if !image.data_store_is_valid() {
        error!("image {}: missing data pool", image.name());
        aio_comp.fail(-i64::from(libc::ENODEV));
        return false;
    }
    true
}

/// Open a request span when the image traces every request
fn start_trace<I: ImageCtx + ?Sized>(image: &I, op: &'static str) -> Span {
    if !image.options().trace_all {
        return Span::none();
    }
    let span = info_span!(
        "io",
        op,
        endpoint = %image.options().trace_endpoint,
        image = %image.name()
    );
    span.in_scope(|| trace!("init"));
    span
}

/// Flag the completion for the event socket if the caller asked for native
/// async notification and the image has a registered socket
fn prepare_completion<I: ImageCtx + ?Sized>(
    image: &I,
    aio_comp: &AioCompletion,
    aio_type: AioType,
    native_async: bool,
) {
    aio_comp.init_time(image, aio_type);
    if native_async && image.event_socket().is_valid() {
        aio_comp.set_event_notify(true);
    }
}

fn to_dyn<I: ImageCtx + 'static>(image: &Arc<I>) -> Arc<dyn ImageCtx> {
    Arc::clone(image) as Arc<dyn ImageCtx>
}

fn to_byte_count(r: i64) -> BlockResult<u64> {
    u64::try_from(r).map_err(|_| BlockError::from_errno(r))
}

fn clip_or_reject<I: ImageCtx + ?Sized>(image: &I, off: u64, len: u64) -> BlockResult<u64> {
    clip_io(image, off, len).inspect_err(|e| {
        error!("image {}: invalid IO request: {}", image.name(), e);
    })
}

// ── Asynchronous entry points ─────────────────────────────────────────────────

/// Read `len` bytes at `off` into `read_result`.
///
/// Resolves with the number of bytes read.
pub fn aio_read<I: ImageCtx + 'static>(
    image: &Arc<I>,
    aio_comp: AioCompletion,
    off: u64,
    len: u64,
    read_result: ReadResult,
    op_flags: OpFlags,
    native_async: bool,
) {
    let span = start_trace(image.as_ref(), "read");
    prepare_completion(image.as_ref(), &aio_comp, AioType::Read, native_async);
    trace!(
        "image={} completion={} off={} len={} flags={}",
        image.name(),
        aio_comp.id(),
        off,
        len,
        op_flags
    );

    if !is_valid_io(image.as_ref(), &aio_comp) {
        return;
    }

    ImageDispatchSpec::create_read(
        to_dyn(image),
        DISPATCH_LAYER,
        aio_comp,
        vec![ImageExtent::new(off, len)],
        read_result,
        op_flags,
        span,
    )
    .send();
}

/// Write `data` at `off`
pub fn aio_write<I: ImageCtx + 'static>(
    image: &Arc<I>,
    aio_comp: AioCompletion,
    off: u64,
    data: Bytes,
    op_flags: OpFlags,
    native_async: bool,
) {
    let span = start_trace(image.as_ref(), "write");
    prepare_completion(image.as_ref(), &aio_comp, AioType::Write, native_async);
    trace!(
        "image={} completion={} off={} len={} flags={}",
        image.name(),
        aio_comp.id(),
        off,
        data.len(),
        op_flags
    );

    if !is_valid_io(image.as_ref(), &aio_comp) {
        return;
    }

    let len = data.len() as u64;
    ImageDispatchSpec::create_write(
        to_dyn(image),
        DISPATCH_LAYER,
        aio_comp,
        vec![ImageExtent::new(off, len)],
        data,
        op_flags,
        span,
    )
    .send();
}

/// Discard `len` bytes at `off`.
///
/// A non-zero `discard_granularity_bytes` lets the pipeline skip partial
/// granularity units at either end.
pub fn aio_discard<I: ImageCtx + 'static>(
    image: &Arc<I>,
    aio_comp: AioCompletion,
    off: u64,
    len: u64,
    discard_granularity_bytes: u32,
    native_async: bool,
) {
    let span = start_trace(image.as_ref(), "discard");
    prepare_completion(image.as_ref(), &aio_comp, AioType::Discard, native_async);
    trace!(
        "image={} completion={} off={} len={}",
        image.name(),
        aio_comp.id(),
        off,
        len
    );

    if !is_valid_io(image.as_ref(), &aio_comp) {
        return;
    }

    ImageDispatchSpec::create_discard(
        to_dyn(image),
        DISPATCH_LAYER,
        aio_comp,
        off,
        len,
        discard_granularity_bytes,
        span,
    )
    .send();
}

/// Fill `len` bytes at `off` with repetitions of `data`
pub fn aio_write_same<I: ImageCtx + 'static>(
    image: &Arc<I>,
    aio_comp: AioCompletion,
    off: u64,
    len: u64,
    data: Bytes,
    op_flags: OpFlags,
    native_async: bool,
) {
    let span = start_trace(image.as_ref(), "writesame");
    prepare_completion(image.as_ref(), &aio_comp, AioType::WriteSame, native_async);
    trace!(
        "image={} completion={} off={} len={} data_len={} flags={}",
        image.name(),
        aio_comp.id(),
        off,
        len,
        data.len(),
        op_flags
    );

    if !is_valid_io(image.as_ref(), &aio_comp) {
        return;
    }

    ImageDispatchSpec::create_write_same(
        to_dyn(image),
        DISPATCH_LAYER,
        aio_comp,
        off,
        len,
        data,
        op_flags,
        span,
    )
    .send();
}

/// Write `data` at `off` only if the range currently holds `cmp_data`.
///
/// On a mismatch the completion resolves with `-EILSEQ` and the offset of
/// the first differing byte is stored in `mismatch_offset`.
#[allow(clippy::too_many_arguments)]
pub fn aio_compare_and_write<I: ImageCtx + 'static>(
    image: &Arc<I>,
    aio_comp: AioCompletion,
    off: u64,
    cmp_data: Bytes,
    data: Bytes,
    mismatch_offset: MismatchOffset,
    op_flags: OpFlags,
    native_async: bool,
) {
    let span = start_trace(image.as_ref(), "compare_and_write");
    prepare_completion(
        image.as_ref(),
        &aio_comp,
        AioType::CompareAndWrite,
        native_async,
    );
    trace!(
        "image={} completion={} off={} len={}",
        image.name(),
        aio_comp.id(),
        off,
        data.len()
    );

    if !is_valid_io(image.as_ref(), &aio_comp) {
        return;
    }

    let len = data.len() as u64;
    ImageDispatchSpec::create_compare_and_write(
        to_dyn(image),
        DISPATCH_LAYER,
        aio_comp,
        vec![ImageExtent::new(off, len)],
        cmp_data,
        data,
        mismatch_offset,
        op_flags,
        span,
    )
    .send();
}

/// Flush all writes acknowledged before this call
pub fn aio_flush<I: ImageCtx + 'static>(image: &Arc<I>, aio_comp: AioCompletion, native_async: bool) {
    let span = start_trace(image.as_ref(), "flush");
    prepare_completion(image.as_ref(), &aio_comp, AioType::Flush, native_async);
    trace!("image={} completion={}", image.name(), aio_comp.id());

    if !is_valid_io(image.as_ref(), &aio_comp) {
        return;
    }

    ImageDispatchSpec::create_flush(
        to_dyn(image),
        DISPATCH_LAYER,
        aio_comp,
        FlushSource::User,
        span,
    )
    .send();
}

// ── Synchronous wrappers ──────────────────────────────────────────────────────

/// Read `len` bytes at `off`, returning the number of bytes read
pub fn read<I: ImageCtx + 'static>(
    image: &Arc<I>,
    off: u64,
    len: u64,
    read_result: ReadResult,
    op_flags: OpFlags,
) -> BlockResult<u64> {
    trace!("image={} off={} len={}", image.name(), off, len);

    let cond = SaferCond::new();
    let aio_comp = AioCompletion::create(cond.clone());
    aio_read(image, aio_comp, off, len, read_result, op_flags, false);
    to_byte_count(cond.wait())
}

/// Write `data` at `off`, returning the number of bytes written after
/// clipping to the image size
pub fn write<I: ImageCtx + 'static>(
    image: &Arc<I>,
    off: u64,
    data: Bytes,
    op_flags: OpFlags,
) -> BlockResult<u64> {
    trace!("image={} off={} len={}", image.name(), off, data.len());

    let len = clip_or_reject(image.as_ref(), off, data.len() as u64)?;
    let data = data.slice(..len as usize);

    let cond = SaferCond::new();
    let aio_comp = AioCompletion::create(cond.clone());
    aio_write(image, aio_comp, off, data, op_flags, false);

    to_byte_count(cond.wait())?;
    Ok(len)
}

/// Discard `len` bytes at `off`, returning the clipped length
pub fn discard<I: ImageCtx + 'static>(
    image: &Arc<I>,
    off: u64,
    len: u64,
    discard_granularity_bytes: u32,
) -> BlockResult<u64> {
    trace!("image={} off={} len={}", image.name(), off, len);

    let len = clip_or_reject(image.as_ref(), off, len)?;

    let cond = SaferCond::new();
    let aio_comp = AioCompletion::create(cond.clone());
    aio_discard(image, aio_comp, off, len, discard_granularity_bytes, false);

    to_byte_count(cond.wait())?;
    Ok(len)
}

/// Fill `len` bytes at `off` with `data`, returning the clipped length
pub fn write_same<I: ImageCtx + 'static>(
    image: &Arc<I>,
    off: u64,
    len: u64,
    data: Bytes,
    op_flags: OpFlags,
) -> BlockResult<u64> {
    trace!(
        "image={} off={} len={} data_len={}",
        image.name(),
        off,
        len,
        data.len()
    );

    if data.is_empty() || len % data.len() as u64 != 0 {
        error!(
            "image {}: write-same length {} is not a multiple of pattern length {}",
            image.name(),
            len,
            data.len()
        );
        return Err(BlockError::InvalidArgument(format!(
            "write-same length {len} is not a multiple of pattern length {}",
            data.len()
        )));
    }

    let len = clip_or_reject(image.as_ref(), off, len)?;

    let cond = SaferCond::new();
    let aio_comp = AioCompletion::create(cond.clone());
    aio_write_same(image, aio_comp, off, len, data, op_flags, false);

    to_byte_count(cond.wait())?;
    Ok(len)
}

/// Compare-and-write, returning the clipped length.
///
/// A mismatch is reported as [`BlockError::CompareMismatch`] carrying the
/// offset of the first differing byte.
pub fn compare_and_write<I: ImageCtx + 'static>(
    image: &Arc<I>,
    off: u64,
    cmp_data: Bytes,
    data: Bytes,
    op_flags: OpFlags,
) -> BlockResult<u64> {
    trace!("image={} off={} len={}", image.name(), off, data.len());

    let len = clip_or_reject(image.as_ref(), off, data.len() as u64)?;
    let clipped = len as usize;
    // mismatched buffer lengths are left for the pipeline to reject
    let (cmp_data, data) = if clipped < data.len() && cmp_data.len() == data.len() {
        (cmp_data.slice(..clipped), data.slice(..clipped))
    } else {
        (cmp_data, data)
    };

    let mismatch_offset = MismatchOffset::new();
    let cond = SaferCond::new();
    let aio_comp = AioCompletion::create(cond.clone());
    aio_compare_and_write(
        image,
        aio_comp,
        off,
        cmp_data,
        data,
        mismatch_offset.clone(),
        op_flags,
        false,
    );

    let r = cond.wait();
    if r == -i64::from(libc::EILSEQ)
        && let Some(offset) = mismatch_offset.get()
    {
        return Err(BlockError::CompareMismatch { offset });
    }
    to_byte_count(r)?;
    Ok(len)
}

/// Flush the image
pub fn flush<I: ImageCtx + 'static>(image: &Arc<I>) -> BlockResult<()> {
    trace!("image={}", image.name());

    let cond = SaferCond::new();
    let aio_comp = AioCompletion::create(cond.clone());
    aio_flush(image, aio_comp, false);

    to_byte_count(cond.wait())?;
    Ok(())
}
