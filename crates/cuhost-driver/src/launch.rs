//! Kernel launch marshaling.
//!
//! Each argument is reduced to one 64-bit word. At launch the words are copied
//! into a per-call value buffer, and a parallel array of pointers into that
//! buffer is what the driver receives as `kernelParams`. Both buffers live
//! only for the duration of the call.

use std::ffi::c_void;
use std::fmt;

use tracing::{debug, error};

use crate::api::{CU_LAUNCH_PARAM_BUFFER_POINTER, CU_LAUNCH_PARAM_BUFFER_SIZE, CU_LAUNCH_PARAM_END};
use crate::error::{CuError, Result};
use crate::memory::{DeviceBuffer, DevicePtr, DeviceScalar};
use crate::module::Function;
use crate::status::{error_name, CUDA_SUCCESS};
use crate::stream::Stream;

/// Grid or block extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn as_array(self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn has_zero(self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }

    pub fn volume(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<(u32, u32)> for Dim3 {
    fn from((x, y): (u32, u32)) -> Self {
        Self::new(x, y, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

/// Launch geometry and dynamic shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    pub fn new(grid: impl Into<Dim3>, block: impl Into<Dim3>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
            shared_mem_bytes: 0,
        }
    }

    /// One-dimensional launch covering `n` threads with `block_size` per block.
    pub fn linear(n: u32, block_size: u32) -> Self {
        let grid = if block_size == 0 { 0 } else { n.div_ceil(block_size) };
        Self::new(grid, block_size)
    }

    pub fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.grid.has_zero() || self.block.has_zero() {
            return Err(CuError::InvalidGeometry {
                grid: self.grid,
                block: self.block,
            });
        }
        Ok(())
    }
}

/// A value that can be passed as one kernel parameter.
pub trait KernelArg {
    /// The parameter's bit pattern, zero-extended to 64 bits.
    fn to_word(&self) -> u64;
}

impl<A: KernelArg + ?Sized> KernelArg for &A {
    fn to_word(&self) -> u64 {
        (**self).to_word()
    }
}

/// A [`KernelArg`] that fills a whole 8-byte parameter: pointers and 64-bit
/// scalars. Only these may go through [`ExtraArgs`], where the driver reads
/// each parameter at its natural offset.
pub trait WideKernelArg: KernelArg {}

impl<A: WideKernelArg + ?Sized> WideKernelArg for &A {}
impl WideKernelArg for DevicePtr {}
impl<T: DeviceScalar> WideKernelArg for DeviceBuffer<'_, T> {}
impl WideKernelArg for u64 {}
impl WideKernelArg for i64 {}
impl WideKernelArg for f64 {}

impl KernelArg for DevicePtr {
    fn to_word(&self) -> u64 {
        self.as_raw()
    }
}

impl<T: DeviceScalar> KernelArg for DeviceBuffer<'_, T> {
    fn to_word(&self) -> u64 {
        self.device_ptr().as_raw()
    }
}

impl KernelArg for u64 {
    fn to_word(&self) -> u64 {
        *self
    }
}

impl KernelArg for i64 {
    fn to_word(&self) -> u64 {
        *self as u64
    }
}

impl KernelArg for f64 {
    fn to_word(&self) -> u64 {
        self.to_bits()
    }
}

impl KernelArg for u32 {
    fn to_word(&self) -> u64 {
        *self as u64
    }
}

impl KernelArg for i32 {
    fn to_word(&self) -> u64 {
        *self as u32 as u64
    }
}

impl KernelArg for f32 {
    fn to_word(&self) -> u64 {
        self.to_bits() as u64
    }
}

/// Ordered kernel parameters, one word each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelParams {
    words: Vec<u64>,
}

impl KernelParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<A: KernelArg + ?Sized>(&mut self, arg: &A) -> &mut Self {
        self.words.push(arg.to_word());
        self
    }

    pub fn arg<A: KernelArg>(mut self, arg: A) -> Self {
        self.words.push(arg.to_word());
        self
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }
}

impl FromIterator<u64> for KernelParams {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self {
            words: iter.into_iter().collect(),
        }
    }
}

/// Build [`KernelParams`] from a list of [`KernelArg`] values.
#[macro_export]
macro_rules! kernel_params {
    ($($arg:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut params = $crate::launch::KernelParams::new();
        $( params.push(&$arg); )*
        params
    }};
}

/// Parameters passed through the `extra` channel as one packed buffer.
///
/// Every parameter occupies an 8-byte slot. 32-bit scalars are not accepted:
/// the driver expects them at 4-byte offsets, so use [`KernelParams`] for
/// kernels that take them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraArgs {
    words: Vec<u64>,
}

impl ExtraArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<A: WideKernelArg>(mut self, arg: A) -> Self {
        self.words.push(arg.to_word());
        self
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }

    /// The buffer handed to the driver as `CU_LAUNCH_PARAM_BUFFER_POINTER`.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }
}

impl FromIterator<u64> for ExtraArgs {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self {
            words: iter.into_iter().collect(),
        }
    }
}

/// Launch `function` with the given geometry.
///
/// `stream = None` targets the default stream. At most one of
/// `kernel_params` and `extra` may be given. When the function declares a
/// parameter count, the supplied count must match it.
///
/// # Errors
/// [`CuError::InvalidGeometry`], [`CuError::ConflictingLaunchArgs`] and
/// [`CuError::ParamCountMismatch`] are raised before the driver is called.
/// Any driver failure is returned as [`CuError::Driver`].
pub fn launch(
    function: &Function<'_>,
    config: &LaunchConfig,
    stream: Option<&Stream<'_>>,
    kernel_params: Option<&KernelParams>,
    extra: Option<&ExtraArgs>,
) -> Result<()> {
    config.validate()?;

    let supplied = match (kernel_params, extra) {
        (Some(_), Some(_)) => return Err(CuError::ConflictingLaunchArgs),
        (Some(p), None) => p.len(),
        (None, Some(e)) => e.len(),
        (None, None) => 0,
    };
    if let Some(expected) = function.param_count() {
        if expected != supplied {
            return Err(CuError::ParamCountMismatch {
                expected,
                actual: supplied,
            });
        }
    }

    // Per-call scratch: values, pointers into the values, and the extra
    // option list. Nothing here outlives the driver call.
    let mut values: Vec<u64> = kernel_params.map(|p| p.words.clone()).unwrap_or_default();
    let mut pointers: Vec<*mut c_void> = values
        .iter_mut()
        .map(|w| w as *mut u64 as *mut c_void)
        .collect();
    let mut extra_buf: Vec<u64> = extra.map(|e| e.words.clone()).unwrap_or_default();
    let mut extra_size: usize = extra_buf.len() * std::mem::size_of::<u64>();
    let mut extra_opts: [*mut c_void; 5] = [
        CU_LAUNCH_PARAM_BUFFER_POINTER,
        extra_buf.as_mut_ptr() as *mut c_void,
        CU_LAUNCH_PARAM_BUFFER_SIZE,
        &mut extra_size as *mut usize as *mut c_void,
        CU_LAUNCH_PARAM_END,
    ];

    let params_ptr = if kernel_params.is_some() && !pointers.is_empty() {
        pointers.as_mut_ptr()
    } else {
        std::ptr::null_mut()
    };
    let extra_ptr = if extra.is_some() {
        extra_opts.as_mut_ptr()
    } else {
        std::ptr::null_mut()
    };
    let raw_stream = stream.map_or(std::ptr::null_mut(), |s| s.raw());
    function.context().bind()?;

    debug!(
        kernel = function.name(),
        "LaunchKernel(grid=[{}], block=[{}], shared={}, params={}, extra={})",
        config.grid,
        config.block,
        config.shared_mem_bytes,
        pointers.len(),
        extra.map_or(0, |e| e.len())
    );

    // SAFETY: at most one of params_ptr/extra_ptr is non-null, and every
    // pointer reachable from them refers to a local that outlives the call.
    let res = unsafe {
        function.context().driver().launch_kernel(
            function.raw(),
            config.grid.as_array(),
            config.block.as_array(),
            config.shared_mem_bytes,
            raw_stream,
            params_ptr,
            extra_ptr,
        )
    };

    if res == CUDA_SUCCESS {
        Ok(())
    } else {
        error!(
            kernel = function.name(),
            "LaunchKernel failed: {} ({})",
            error_name(res),
            res
        );
        Err(CuError::Driver { code: res })
    }
}
