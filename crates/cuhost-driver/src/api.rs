//! The native driver boundary.
//!
//! Everything above this trait speaks in owned wrappers; everything below it
//! speaks in raw handles and status codes. [`crate::sys::CudaDriver`] forwards
//! to the real library, [`crate::emulator::EmulatedDriver`] runs in host memory.

use std::ffi::{c_void, CStr};

use crate::status::{self, CUresult};

/// CUDA device type.
pub type CUdevice = i32;

/// Opaque CUDA types (represented as pointers).
pub type CUcontext = *mut c_void;
pub type CUmodule = *mut c_void;
pub type CUfunction = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUdeviceptr = u64;

/// `extra` launch option markers.
pub const CU_LAUNCH_PARAM_END: *mut c_void = std::ptr::null_mut();
pub const CU_LAUNCH_PARAM_BUFFER_POINTER: *mut c_void = 1 as *mut c_void;
pub const CU_LAUNCH_PARAM_BUFFER_SIZE: *mut c_void = 2 as *mut c_void;

pub trait DriverApi: Send + Sync {
    // ── Initialization ────────────────────────────────────────────

    fn init(&self, flags: u32) -> CUresult;
    fn driver_get_version(&self) -> Result<i32, CUresult>;

    fn error_name(&self, code: CUresult) -> &'static str {
        status::error_name(code)
    }

    fn error_string(&self, code: CUresult) -> &'static str {
        status::error_string(code)
    }

    // ── Device Management ─────────────────────────────────────────

    fn device_get_count(&self) -> Result<i32, CUresult>;
    fn device_get(&self, ordinal: i32) -> Result<CUdevice, CUresult>;
    fn device_get_name(&self, device: CUdevice) -> Result<String, CUresult>;
    fn device_total_mem(&self, device: CUdevice) -> Result<usize, CUresult>;
    fn device_get_uuid(&self, device: CUdevice) -> Result<[u8; 16], CUresult>;
    fn device_get_attribute(&self, attrib: i32, device: CUdevice) -> Result<i32, CUresult>;

    // ── Context Management ────────────────────────────────────────

    fn ctx_create(&self, flags: u32, device: CUdevice) -> Result<CUcontext, CUresult>;
    fn ctx_destroy(&self, ctx: CUcontext) -> CUresult;
    fn ctx_set_current(&self, ctx: CUcontext) -> CUresult;
    fn ctx_get_current(&self) -> Result<CUcontext, CUresult>;
    fn ctx_synchronize(&self) -> CUresult;
    fn ctx_get_device(&self) -> Result<CUdevice, CUresult>;
    fn ctx_get_api_version(&self, ctx: CUcontext) -> Result<u32, CUresult>;

    // ── Memory Management ─────────────────────────────────────────

    fn mem_alloc(&self, bytesize: usize) -> Result<CUdeviceptr, CUresult>;
    fn mem_alloc_managed(&self, bytesize: usize, flags: u32) -> Result<CUdeviceptr, CUresult>;
    fn mem_free(&self, dptr: CUdeviceptr) -> CUresult;
    fn mem_get_info(&self) -> Result<(usize, usize), CUresult>;

    /// # Safety
    /// `src` must be valid for reads of `byte_count` bytes.
    unsafe fn memcpy_htod(&self, dst: CUdeviceptr, src: *const c_void, byte_count: usize)
        -> CUresult;

    /// # Safety
    /// `dst` must be valid for writes of `byte_count` bytes.
    unsafe fn memcpy_dtoh(&self, dst: *mut c_void, src: CUdeviceptr, byte_count: usize)
        -> CUresult;

    fn memcpy_dtod(&self, dst: CUdeviceptr, src: CUdeviceptr, byte_count: usize) -> CUresult;

    /// # Safety
    /// `src` must stay valid and unmodified until `stream` has drained.
    unsafe fn memcpy_htod_async(
        &self,
        dst: CUdeviceptr,
        src: *const c_void,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult;

    /// # Safety
    /// `dst` must stay valid and otherwise untouched until `stream` has drained.
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut c_void,
        src: CUdeviceptr,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult;

    fn memcpy_dtod_async(
        &self,
        dst: CUdeviceptr,
        src: CUdeviceptr,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult;

    fn memcpy_peer(
        &self,
        dst: CUdeviceptr,
        dst_ctx: CUcontext,
        src: CUdeviceptr,
        src_ctx: CUcontext,
        byte_count: usize,
    ) -> CUresult;

    fn memcpy_peer_async(
        &self,
        dst: CUdeviceptr,
        dst_ctx: CUcontext,
        src: CUdeviceptr,
        src_ctx: CUcontext,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult;

    // ── Module Management ─────────────────────────────────────────

    fn module_load(&self, fname: &CStr) -> Result<CUmodule, CUresult>;

    /// # Safety
    /// `image` must point to a complete cubin, fatbin or NUL-terminated PTX image.
    unsafe fn module_load_data(&self, image: *const c_void) -> Result<CUmodule, CUresult>;

    fn module_unload(&self, module: CUmodule) -> CUresult;
    fn module_get_function(&self, module: CUmodule, name: &CStr) -> Result<CUfunction, CUresult>;

    // ── Stream Management ─────────────────────────────────────────

    fn stream_create(&self, flags: u32) -> Result<CUstream, CUresult>;
    fn stream_destroy(&self, stream: CUstream) -> CUresult;
    fn stream_synchronize(&self, stream: CUstream) -> CUresult;
    fn stream_query(&self, stream: CUstream) -> CUresult;
    fn stream_get_ctx(&self, stream: CUstream) -> Result<CUcontext, CUresult>;

    // ── Execution ─────────────────────────────────────────────────

    /// # Safety
    /// Exactly one of `kernel_params` and `extra` may be non-null. Every
    /// pointer reachable from them must be valid for the duration of the call.
    #[allow(clippy::too_many_arguments)]
    unsafe fn launch_kernel(
        &self,
        func: CUfunction,
        grid_dim: [u32; 3],
        block_dim: [u32; 3],
        shared_mem_bytes: u32,
        stream: CUstream,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> CUresult;
}
