//! Device memory allocation and host/device transfers.

use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::api::CUdeviceptr;
use crate::context::Context;
use crate::error::{CuError, Result};
use crate::status::{check, error_name, CUDA_ERROR_OUT_OF_MEMORY};
use crate::stream::Stream;

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width scalars that may be copied to and from device memory.
pub trait DeviceScalar: bytemuck::Pod + sealed::Sealed + Send + Sync {}

macro_rules! device_scalars {
    ($($t:ty),+) => {
        $(
            impl sealed::Sealed for $t {}
            impl DeviceScalar for $t {}
        )+
    };
}

device_scalars!(i32, i64, u32, u64, f32, f64, u8);

bitflags! {
    /// Attachment for managed allocations (CU_MEM_ATTACH_*).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttachFlags: u32 {
        const GLOBAL = 0x1;
        const HOST = 0x2;
    }
}

/// Raw device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(pub CUdeviceptr);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn as_raw(self) -> CUdeviceptr {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one, or `None` if it would wrap.
    pub fn offset(self, bytes: u64) -> Option<DevicePtr> {
        self.0.checked_add(bytes).map(DevicePtr)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An owned allocation of `len` elements of `T` in a context's memory.
///
/// Freed exactly once: by [`DeviceBuffer::free`] or on drop.
pub struct DeviceBuffer<'ctx, T: DeviceScalar> {
    ctx: &'ctx Context,
    ptr: CUdeviceptr,
    len: usize,
    released: bool,
    _marker: PhantomData<T>,
}

// SAFETY: the allocation is addressed by value; the borrow of the context
// keeps the owning context alive.
unsafe impl<T: DeviceScalar> Send for DeviceBuffer<'_, T> {}

impl<T: DeviceScalar> fmt::Debug for DeviceBuffer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &DevicePtr(self.ptr))
            .field("len", &self.len)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Byte size of `len` elements; a count too large to address is reported as
/// out of memory.
fn bytes_for<T>(len: usize) -> Result<usize> {
    len.checked_mul(std::mem::size_of::<T>())
        .ok_or(CuError::Driver { code: CUDA_ERROR_OUT_OF_MEMORY })
}

impl<'ctx, T: DeviceScalar> DeviceBuffer<'ctx, T> {
    /// Allocate room for `len` elements. Contents are unspecified.
    pub fn alloc(ctx: &'ctx Context, len: usize) -> Result<Self> {
        let bytes = bytes_for::<T>(len)?;
        let ptr = if bytes == 0 {
            0
        } else {
            ctx.bind()?;
            ctx.driver().mem_alloc(bytes)?
        };
        debug!("MemAlloc({} bytes) -> {:#x}", bytes, ptr);
        Ok(Self::from_raw_parts(ctx, ptr, len))
    }

    /// Allocate `len` elements of managed memory, addressable from host and device.
    pub fn alloc_managed(ctx: &'ctx Context, len: usize, flags: AttachFlags) -> Result<Self> {
        let bytes = bytes_for::<T>(len)?;
        let ptr = if bytes == 0 {
            0
        } else {
            ctx.bind()?;
            ctx.driver().mem_alloc_managed(bytes, flags.bits())?
        };
        debug!("MemAllocManaged({} bytes, {:?}) -> {:#x}", bytes, flags, ptr);
        Ok(Self::from_raw_parts(ctx, ptr, len))
    }

    /// Allocate and fill from `data`.
    pub fn from_slice(ctx: &'ctx Context, data: &[T]) -> Result<Self> {
        let mut buf = Self::alloc(ctx, data.len())?;
        buf.copy_from_host(data)?;
        Ok(buf)
    }

    fn from_raw_parts(ctx: &'ctx Context, ptr: CUdeviceptr, len: usize) -> Self {
        Self {
            ctx,
            ptr,
            len,
            released: false,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        // checked when the buffer was allocated
        self.len * std::mem::size_of::<T>()
    }

    pub fn device_ptr(&self) -> DevicePtr {
        DevicePtr(self.ptr)
    }

    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    fn check_len(&self, host: usize) -> Result<()> {
        let device = self.byte_len();
        if host != device {
            return Err(CuError::SizeMismatch { host, device });
        }
        Ok(())
    }

    // ── Blocking transfers ────────────────────────────────────────

    /// Copy `src` into the buffer. Blocks until the copy has completed.
    pub fn copy_from_host(&mut self, src: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(src);
        self.write_bytes(bytes)
    }

    /// Copy the buffer into `dst`. Blocks until the copy has completed.
    pub fn copy_to_host(&self, dst: &mut [T]) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        self.read_bytes(bytes)
    }

    /// Read the whole buffer into a new `Vec`.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        self.copy_to_host(&mut out)?;
        Ok(out)
    }

    pub fn copy_from_device(&mut self, src: &DeviceBuffer<'_, T>) -> Result<()> {
        self.check_len(src.byte_len())?;
        if self.len == 0 {
            return Ok(());
        }
        self.ctx.bind()?;
        check(self.ctx.driver().memcpy_dtod(self.ptr, src.ptr, self.byte_len()))
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_len(bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        self.ctx.bind()?;
        // SAFETY: `bytes` is a live slice of exactly `byte_len` bytes.
        let res = unsafe {
            self.ctx
                .driver()
                .memcpy_htod(self.ptr, bytes.as_ptr() as *const c_void, bytes.len())
        };
        check(res)
    }

    fn read_bytes(&self, bytes: &mut [u8]) -> Result<()> {
        self.check_len(bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        self.ctx.bind()?;
        // SAFETY: as above, for writes.
        let res = unsafe {
            self.ctx
                .driver()
                .memcpy_dtoh(bytes.as_mut_ptr() as *mut c_void, self.ptr, bytes.len())
        };
        check(res)
    }

    // ── Stream-ordered transfers ──────────────────────────────────

    /// Enqueue a copy of `src` into the buffer on `stream`.
    ///
    /// # Safety
    /// `src` must not be dropped or modified until `stream` has been
    /// synchronized (or queried as complete).
    pub unsafe fn copy_from_host_async(&mut self, src: &[T], stream: &Stream<'_>) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(src);
        self.check_len(bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        self.ctx.bind()?;
        let res = unsafe {
            self.ctx.driver().memcpy_htod_async(
                self.ptr,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                stream.raw(),
            )
        };
        check(res)
    }

    /// Enqueue a copy of the buffer into `dst` on `stream`.
    ///
    /// # Safety
    /// `dst` must stay alive and must not be read or written until `stream`
    /// has been synchronized (or queried as complete).
    pub unsafe fn copy_to_host_async(&self, dst: &mut [T], stream: &Stream<'_>) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        self.check_len(bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        self.ctx.bind()?;
        let res = unsafe {
            self.ctx.driver().memcpy_dtoh_async(
                bytes.as_mut_ptr() as *mut c_void,
                self.ptr,
                bytes.len(),
                stream.raw(),
            )
        };
        check(res)
    }

    pub fn copy_from_device_async(
        &mut self,
        src: &DeviceBuffer<'_, T>,
        stream: &Stream<'_>,
    ) -> Result<()> {
        self.check_len(src.byte_len())?;
        if self.len == 0 {
            return Ok(());
        }
        self.ctx.bind()?;
        check(
            self.ctx
                .driver()
                .memcpy_dtod_async(self.ptr, src.ptr, self.byte_len(), stream.raw()),
        )
    }

    // ── Peer transfers ────────────────────────────────────────────

    /// Copy from a buffer owned by another context (possibly another device).
    pub fn copy_peer(&mut self, src: &DeviceBuffer<'_, T>) -> Result<()> {
        self.check_len(src.byte_len())?;
        if self.len == 0 {
            return Ok(());
        }
        self.ctx.bind()?;
        check(self.ctx.driver().memcpy_peer(
            self.ptr,
            self.ctx.raw(),
            src.ptr,
            src.ctx.raw(),
            self.byte_len(),
        ))
    }

    pub fn copy_peer_async(&mut self, src: &DeviceBuffer<'_, T>, stream: &Stream<'_>) -> Result<()> {
        self.check_len(src.byte_len())?;
        if self.len == 0 {
            return Ok(());
        }
        self.ctx.bind()?;
        check(self.ctx.driver().memcpy_peer_async(
            self.ptr,
            self.ctx.raw(),
            src.ptr,
            src.ctx.raw(),
            self.byte_len(),
            stream.raw(),
        ))
    }

    // ── Runtime-typed transfers ───────────────────────────────────

    /// Copy from a host value whose type is only known at runtime.
    ///
    /// Accepts a `Vec` of any [`DeviceScalar`]; the byte length must match.
    /// Any other type is rejected with [`CuError::UnsupportedHostType`].
    pub fn copy_from_any(&mut self, src: &dyn Any) -> Result<()> {
        let bytes = host_bytes(src)?;
        self.write_bytes(bytes)
    }

    /// Copy into a host value whose type is only known at runtime.
    pub fn copy_to_any(&self, dst: &mut dyn Any) -> Result<()> {
        let bytes = host_bytes_mut(dst)?;
        self.read_bytes(bytes)
    }

    /// Release the allocation, reporting the driver's status.
    pub fn free(mut self) -> Result<()> {
        self.released = true;
        if self.ptr == 0 {
            return Ok(());
        }
        self.ctx.bind()?;
        let res = self.ctx.driver().mem_free(self.ptr);
        debug!("MemFree({:#x}) -> {}", self.ptr, res);
        check(res)
    }
}

impl<T: DeviceScalar> Drop for DeviceBuffer<'_, T> {
    fn drop(&mut self) {
        if self.released || self.ptr == 0 {
            return;
        }
        self.released = true;
        if let Err(e) = self.ctx.bind() {
            warn!("MemFree({:#x}) on drop could not bind its context: {}", self.ptr, e);
        }
        let res = self.ctx.driver().mem_free(self.ptr);
        if res != 0 {
            warn!("MemFree({:#x}) on drop failed: {} ({})", self.ptr, error_name(res), res);
        }
    }
}

macro_rules! host_dispatch {
    ($host:ident, $($t:ty),+) => {
        $(
            if let Some(v) = $host.downcast_ref::<Vec<$t>>() {
                return Ok(bytemuck::cast_slice(v.as_slice()));
            }
        )+
    };
}

macro_rules! host_dispatch_mut {
    ($host:ident, $($t:ty),+) => {
        $(
            if $host.is::<Vec<$t>>() {
                return match $host.downcast_mut::<Vec<$t>>() {
                    Some(v) => Ok(bytemuck::cast_slice_mut(v.as_mut_slice())),
                    None => Err(CuError::UnsupportedHostType),
                };
            }
        )+
    };
}

/// Byte view of a host `Vec` of any supported scalar.
pub fn host_bytes(host: &dyn Any) -> Result<&[u8]> {
    host_dispatch!(host, i32, i64, u32, u64, f32, f64, u8);
    Err(CuError::UnsupportedHostType)
}

/// Mutable byte view of a host `Vec` of any supported scalar.
pub fn host_bytes_mut(host: &mut dyn Any) -> Result<&mut [u8]> {
    host_dispatch_mut!(host, i32, i64, u32, u64, f32, f64, u8);
    Err(CuError::UnsupportedHostType)
}
