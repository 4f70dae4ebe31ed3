//! Execution contexts.

use std::sync::Arc;

use bitflags::bitflags;
use cuhost_core::config::ContextConfig;
use tracing::{debug, warn};

use crate::api::{CUcontext, CUdevice, DriverApi};
use crate::device::{Cuda, Device};
use crate::error::Result;
use crate::status::{check, error_name};

bitflags! {
    /// Context creation flags (CU_CTX_*).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u32 {
        const SCHED_AUTO = 0x00;
        const SCHED_SPIN = 0x01;
        const SCHED_YIELD = 0x02;
        const SCHED_BLOCKING_SYNC = 0x04;
        const MAP_HOST = 0x08;
        const LMEM_RESIZE_TO_MAX = 0x10;
    }
}

impl ContextFlags {
    pub fn from_config(config: &ContextConfig) -> Self {
        Self::from_bits_truncate(config.flags_bits())
    }
}

impl Default for ContextFlags {
    fn default() -> Self {
        ContextFlags::SCHED_AUTO
    }
}

/// Raw context handle, comparable but not usable on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub(crate) usize);

impl ContextHandle {
    pub(crate) fn from_raw(ctx: CUcontext) -> Self {
        Self(ctx as usize)
    }

    pub fn as_raw(self) -> CUcontext {
        self.0 as CUcontext
    }
}

/// An owned driver context.
///
/// Buffers, modules and streams borrow their context, so it cannot be
/// destroyed while any of them is alive.
#[derive(Debug)]
pub struct Context {
    cuda: Cuda,
    device: Device,
    raw: CUcontext,
    released: bool,
}

// SAFETY: a context handle may be moved between threads; the driver tracks
// currency per thread and every operation goes through `bind`.
unsafe impl Send for Context {}

impl Context {
    /// Create a context on `device` and make it current.
    pub fn create(device: &Device, flags: ContextFlags) -> Result<Self> {
        let cuda = device.cuda().clone();
        let raw = cuda.driver().ctx_create(flags.bits(), device.raw())?;
        debug!(
            device = device.ordinal(),
            "CtxCreate(flags={:#x}) -> {:?}",
            flags.bits(),
            raw
        );
        Ok(Self {
            cuda,
            device: device.clone(),
            raw,
            released: false,
        })
    }

    pub fn cuda(&self) -> &Cuda {
        &self.cuda
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn driver(&self) -> &Arc<dyn DriverApi> {
        self.cuda.driver()
    }

    pub fn handle(&self) -> ContextHandle {
        ContextHandle::from_raw(self.raw)
    }

    pub(crate) fn raw(&self) -> CUcontext {
        self.raw
    }

    /// Bind this context to the calling thread.
    pub fn set_current(&self) -> Result<()> {
        check(self.driver().ctx_set_current(self.raw))
    }

    /// Make this context current if another one is bound. Context-scoped
    /// operations go through here so they act on the context they borrow.
    pub(crate) fn bind(&self) -> Result<()> {
        if self.driver().ctx_get_current()? != self.raw {
            self.set_current()?;
        }
        Ok(())
    }

    /// Block until all work in this context has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.bind()?;
        check(self.driver().ctx_synchronize())
    }

    /// Device of the context current on this thread.
    pub fn current_device(&self) -> Result<CUdevice> {
        Ok(self.driver().ctx_get_device()?)
    }

    pub fn api_version(&self) -> Result<u32> {
        Ok(self.driver().ctx_get_api_version(self.raw)?)
    }

    /// `(free, total)` device memory in bytes.
    pub fn memory_info(&self) -> Result<(usize, usize)> {
        self.bind()?;
        Ok(self.driver().mem_get_info()?)
    }

    /// Destroy the context, reporting the driver's status.
    pub fn destroy(mut self) -> Result<()> {
        self.released = true;
        let res = self.driver().ctx_destroy(self.raw);
        debug!(device = self.device.ordinal(), "CtxDestroy({:?}) -> {}", self.raw, res);
        check(res)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let res = self.driver().ctx_destroy(self.raw);
        if res != 0 {
            warn!("CtxDestroy on drop failed: {} ({})", error_name(res), res);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{EmulatedDriver, CONTEXT_API_VERSION};
    use crate::status::CUDA_ERROR_INVALID_CONTEXT;
    use cuhost_core::config::SchedulePolicy;

    fn setup() -> (Arc<EmulatedDriver>, Device) {
        let emu = Arc::new(EmulatedDriver::with_devices(2, 1 << 20));
        let cuda = Cuda::with_driver(emu.clone()).unwrap();
        let dev = cuda.device(1).unwrap();
        (emu, dev)
    }

    #[test]
    fn create_makes_context_current() {
        let (emu, dev) = setup();
        let ctx = Context::create(&dev, ContextFlags::default()).unwrap();
        assert_eq!(ctx.current_device().unwrap(), 1);
        assert_eq!(ctx.api_version().unwrap(), CONTEXT_API_VERSION);
        assert_eq!(ctx.memory_info().unwrap(), (1 << 20, 1 << 20));
        assert_eq!(emu.live_contexts(), 1);
        ctx.destroy().unwrap();
        assert_eq!(emu.live_contexts(), 0);
    }

    #[test]
    fn drop_releases_exactly_once() {
        let (emu, dev) = setup();
        {
            let _ctx = Context::create(&dev, ContextFlags::SCHED_YIELD).unwrap();
            assert_eq!(emu.live_contexts(), 1);
        }
        assert_eq!(emu.live_contexts(), 0);
    }

    #[test]
    fn operations_after_release_report_invalid_context() {
        let (_emu, dev) = setup();
        let a = Context::create(&dev, ContextFlags::default()).unwrap();
        let b = Context::create(&dev, ContextFlags::default()).unwrap();
        b.destroy().unwrap();
        // the destroyed context was current; nothing is bound now
        match a.current_device() {
            Err(e) => assert!(e.is_driver(CUDA_ERROR_INVALID_CONTEXT)),
            Ok(dev) => panic!("expected invalid context, got device {}", dev),
        }
        // context-scoped calls rebind their own context
        assert!(a.memory_info().is_ok());
        assert_eq!(a.current_device().unwrap(), 1);
    }

    #[test]
    fn memory_info_reports_its_own_device() {
        let emu = Arc::new(EmulatedDriver::with_devices(2, 1 << 20));
        let cuda = Cuda::with_driver(emu.clone()).unwrap();
        let first = Context::create(&cuda.device(0).unwrap(), ContextFlags::default()).unwrap();
        let second = Context::create(&cuda.device(1).unwrap(), ContextFlags::default()).unwrap();
        assert_eq!(second.current_device().unwrap(), 1);
        first.memory_info().unwrap();
        assert_eq!(first.current_device().unwrap(), 0);
        second.synchronize().unwrap();
        assert_eq!(second.current_device().unwrap(), 1);
    }

    #[test]
    fn flags_from_config() {
        let config = ContextConfig {
            device: 0,
            schedule: SchedulePolicy::Spin,
            map_host: true,
        };
        assert_eq!(
            ContextFlags::from_config(&config),
            ContextFlags::SCHED_SPIN | ContextFlags::MAP_HOST
        );
    }
}
