//! Ordered device work queues.

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::api::CUstream;
use crate::context::{Context, ContextHandle};
use crate::error::{CuError, Result};
use crate::status::{check, error_name, CUDA_ERROR_NOT_READY, CUDA_SUCCESS};

bitflags! {
    /// Stream creation flags (CU_STREAM_*).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u32 {
        const DEFAULT = 0x0;
        /// Work does not synchronize with the legacy default stream.
        const NON_BLOCKING = 0x1;
    }
}

impl Default for StreamFlags {
    fn default() -> Self {
        StreamFlags::DEFAULT
    }
}

/// Result of a non-blocking stream poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// All enqueued work has completed.
    Idle,
    /// Work is still pending.
    Running,
}

/// An owned stream in a context.
pub struct Stream<'ctx> {
    ctx: &'ctx Context,
    raw: CUstream,
    flags: StreamFlags,
    released: bool,
}

impl std::fmt::Debug for Stream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("raw", &self.raw)
            .field("flags", &self.flags)
            .finish()
    }
}

// SAFETY: stream handles are plain driver tokens; the borrow of the context
// keeps the owning context alive.
unsafe impl Send for Stream<'_> {}

impl<'ctx> Stream<'ctx> {
    pub fn new(ctx: &'ctx Context, flags: StreamFlags) -> Result<Self> {
        ctx.bind()?;
        let raw = ctx.driver().stream_create(flags.bits())?;
        debug!("StreamCreate(flags={:#x}) -> {:?}", flags.bits(), raw);
        Ok(Self {
            ctx,
            raw,
            flags,
            released: false,
        })
    }

    pub(crate) fn raw(&self) -> CUstream {
        self.raw
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    /// Poll for completion without blocking.
    pub fn query(&self) -> Result<StreamStatus> {
        self.ctx.bind()?;
        match self.ctx.driver().stream_query(self.raw) {
            CUDA_SUCCESS => Ok(StreamStatus::Idle),
            CUDA_ERROR_NOT_READY => Ok(StreamStatus::Running),
            code => Err(CuError::Driver { code }),
        }
    }

    /// Block until all work enqueued so far has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.ctx.bind()?;
        check(self.ctx.driver().stream_synchronize(self.raw))
    }

    /// Handle of the context the stream belongs to, as the driver reports it.
    pub fn context_handle(&self) -> Result<ContextHandle> {
        let raw = self.ctx.driver().stream_get_ctx(self.raw)?;
        Ok(ContextHandle::from_raw(raw))
    }

    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    pub fn destroy(mut self) -> Result<()> {
        self.released = true;
        self.ctx.bind()?;
        let res = self.ctx.driver().stream_destroy(self.raw);
        debug!("StreamDestroy({:?}) -> {}", self.raw, res);
        check(res)
    }
}

impl Drop for Stream<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.ctx.bind() {
            warn!("StreamDestroy on drop could not bind its context: {}", e);
        }
        let res = self.ctx.driver().stream_destroy(self.raw);
        if res != CUDA_SUCCESS {
            warn!("StreamDestroy on drop failed: {} ({})", error_name(res), res);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFlags;
    use crate::device::Cuda;
    use crate::emulator::EmulatedDriver;
    use crate::memory::DeviceBuffer;
    use std::sync::Arc;

    fn context() -> (Arc<EmulatedDriver>, Context) {
        let emu = Arc::new(EmulatedDriver::new());
        let cuda = Cuda::with_driver(emu.clone()).unwrap();
        let ctx = Context::create(&cuda.device(0).unwrap(), ContextFlags::default()).unwrap();
        (emu, ctx)
    }

    #[test]
    fn empty_stream_is_idle() {
        let (_emu, ctx) = context();
        let stream = Stream::new(&ctx, StreamFlags::NON_BLOCKING).unwrap();
        assert_eq!(stream.query().unwrap(), StreamStatus::Idle);
        assert_eq!(stream.context_handle().unwrap(), ctx.handle());
        stream.destroy().unwrap();
    }

    #[test]
    fn pending_work_reports_running_until_synchronized() {
        let (_emu, ctx) = context();
        let stream = Stream::new(&ctx, StreamFlags::NON_BLOCKING).unwrap();
        let src = DeviceBuffer::from_slice(&ctx, &[1u32, 2, 3, 4]).unwrap();
        let mut dst = DeviceBuffer::<u32>::alloc(&ctx, 4).unwrap();
        let mut mid = DeviceBuffer::<u32>::alloc(&ctx, 4).unwrap();
        mid.copy_from_device_async(&src, &stream).unwrap();
        dst.copy_from_device_async(&mid, &stream).unwrap();

        assert_eq!(stream.query().unwrap(), StreamStatus::Running);
        stream.synchronize().unwrap();
        assert_eq!(stream.query().unwrap(), StreamStatus::Idle);
        assert_eq!(dst.to_vec().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn drop_destroys() {
        let (emu, ctx) = context();
        {
            let _s = Stream::new(&ctx, StreamFlags::default()).unwrap();
            assert_eq!(emu.live_streams(), 1);
        }
        assert_eq!(emu.live_streams(), 0);
    }

    #[test]
    fn stream_belongs_to_the_context_it_borrows() {
        let emu = Arc::new(EmulatedDriver::with_devices(2, 1 << 16));
        let cuda = Cuda::with_driver(emu.clone()).unwrap();
        let first = Context::create(&cuda.device(0).unwrap(), ContextFlags::default()).unwrap();
        let _second = Context::create(&cuda.device(1).unwrap(), ContextFlags::default()).unwrap();
        let stream = Stream::new(&first, StreamFlags::default()).unwrap();
        assert_eq!(stream.context_handle().unwrap(), first.handle());
    }
}
