//! [`DriverApi`] backed by the system CUDA driver.
//!
//! Every entry point is resolved once at load time; the `_v2` variant wins
//! when the library exports both. Optional entry points that are missing
//! report `CUDA_ERROR_NOT_SUPPORTED`.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::sync::{Arc, OnceLock};

use libloading::{Library, Symbol};
use tracing::{debug, info};

use crate::api::{CUcontext, CUdevice, CUdeviceptr, CUfunction, CUmodule, CUstream, DriverApi};
use crate::status::{self, CUresult, CUDA_ERROR_NOT_SUPPORTED, CUDA_SUCCESS};

/// UUID structure (16 bytes).
#[repr(C)]
struct CUuuid {
    bytes: [u8; 16],
}

/// Function pointer type definitions for the CUDA driver API.
type FnCuInit = unsafe extern "C" fn(flags: c_uint) -> CUresult;
type FnCuDriverGetVersion = unsafe extern "C" fn(version: *mut c_int) -> CUresult;
type FnCuGetErrorName = unsafe extern "C" fn(error: CUresult, pstr: *mut *const c_char) -> CUresult;
type FnCuGetErrorString =
    unsafe extern "C" fn(error: CUresult, pstr: *mut *const c_char) -> CUresult;
type FnCuDeviceGetCount = unsafe extern "C" fn(count: *mut c_int) -> CUresult;
type FnCuDeviceGet = unsafe extern "C" fn(device: *mut CUdevice, ordinal: c_int) -> CUresult;
type FnCuDeviceGetName =
    unsafe extern "C" fn(name: *mut c_char, len: c_int, dev: CUdevice) -> CUresult;
type FnCuDeviceGetAttribute =
    unsafe extern "C" fn(pi: *mut c_int, attrib: c_int, dev: CUdevice) -> CUresult;
type FnCuDeviceTotalMem = unsafe extern "C" fn(bytes: *mut usize, dev: CUdevice) -> CUresult;
type FnCuDeviceGetUuid = unsafe extern "C" fn(uuid: *mut CUuuid, dev: CUdevice) -> CUresult;

// Context management
type FnCuCtxCreate =
    unsafe extern "C" fn(pctx: *mut CUcontext, flags: c_uint, dev: CUdevice) -> CUresult;
type FnCuCtxDestroy = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuCtxGetCurrent = unsafe extern "C" fn(pctx: *mut CUcontext) -> CUresult;
type FnCuCtxSynchronize = unsafe extern "C" fn() -> CUresult;
type FnCuCtxGetDevice = unsafe extern "C" fn(device: *mut CUdevice) -> CUresult;
type FnCuCtxGetApiVersion = unsafe extern "C" fn(ctx: CUcontext, version: *mut c_uint) -> CUresult;

// Module management
type FnCuModuleLoad = unsafe extern "C" fn(module: *mut CUmodule, fname: *const c_char) -> CUresult;
type FnCuModuleLoadData =
    unsafe extern "C" fn(module: *mut CUmodule, image: *const c_void) -> CUresult;
type FnCuModuleUnload = unsafe extern "C" fn(hmod: CUmodule) -> CUresult;
type FnCuModuleGetFunction = unsafe extern "C" fn(
    hfunc: *mut CUfunction,
    hmod: CUmodule,
    name: *const c_char,
) -> CUresult;

// Memory management
type FnCuMemAlloc = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type FnCuMemAllocManaged =
    unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize, flags: c_uint) -> CUresult;
type FnCuMemFree = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type FnCuMemGetInfo = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> CUresult;
type FnCuMemcpyHtoD =
    unsafe extern "C" fn(dst: CUdeviceptr, src: *const c_void, byte_count: usize) -> CUresult;
type FnCuMemcpyDtoH =
    unsafe extern "C" fn(dst: *mut c_void, src: CUdeviceptr, byte_count: usize) -> CUresult;
type FnCuMemcpyDtoD =
    unsafe extern "C" fn(dst: CUdeviceptr, src: CUdeviceptr, byte_count: usize) -> CUresult;
type FnCuMemcpyHtoDAsync = unsafe extern "C" fn(
    dst: CUdeviceptr,
    src: *const c_void,
    byte_count: usize,
    hstream: CUstream,
) -> CUresult;
type FnCuMemcpyDtoHAsync = unsafe extern "C" fn(
    dst: *mut c_void,
    src: CUdeviceptr,
    byte_count: usize,
    hstream: CUstream,
) -> CUresult;
type FnCuMemcpyDtoDAsync = unsafe extern "C" fn(
    dst: CUdeviceptr,
    src: CUdeviceptr,
    byte_count: usize,
    hstream: CUstream,
) -> CUresult;
type FnCuMemcpyPeer = unsafe extern "C" fn(
    dst: CUdeviceptr,
    dst_ctx: CUcontext,
    src: CUdeviceptr,
    src_ctx: CUcontext,
    byte_count: usize,
) -> CUresult;
type FnCuMemcpyPeerAsync = unsafe extern "C" fn(
    dst: CUdeviceptr,
    dst_ctx: CUcontext,
    src: CUdeviceptr,
    src_ctx: CUcontext,
    byte_count: usize,
    hstream: CUstream,
) -> CUresult;

// Execution
type FnCuLaunchKernel = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: c_uint,
    grid_dim_y: c_uint,
    grid_dim_z: c_uint,
    block_dim_x: c_uint,
    block_dim_y: c_uint,
    block_dim_z: c_uint,
    shared_mem_bytes: c_uint,
    hstream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

// Stream management
type FnCuStreamCreate = unsafe extern "C" fn(phstream: *mut CUstream, flags: c_uint) -> CUresult;
type FnCuStreamDestroy = unsafe extern "C" fn(hstream: CUstream) -> CUresult;
type FnCuStreamSynchronize = unsafe extern "C" fn(hstream: CUstream) -> CUresult;
type FnCuStreamQuery = unsafe extern "C" fn(hstream: CUstream) -> CUresult;
type FnCuStreamGetCtx = unsafe extern "C" fn(hstream: CUstream, pctx: *mut CUcontext) -> CUresult;

/// Loaded CUDA driver with resolved entry points.
pub struct CudaDriver {
    _lib: Library,
    init_result: OnceLock<CUresult>,
    cu_init: FnCuInit,
    cu_driver_get_version: FnCuDriverGetVersion,
    cu_get_error_name: Option<FnCuGetErrorName>,
    cu_get_error_string: Option<FnCuGetErrorString>,
    cu_device_get_count: FnCuDeviceGetCount,
    cu_device_get: FnCuDeviceGet,
    cu_device_get_name: FnCuDeviceGetName,
    cu_device_get_attribute: FnCuDeviceGetAttribute,
    cu_device_total_mem: FnCuDeviceTotalMem,
    cu_device_get_uuid: Option<FnCuDeviceGetUuid>,
    cu_ctx_create: FnCuCtxCreate,
    cu_ctx_destroy: FnCuCtxDestroy,
    cu_ctx_set_current: FnCuCtxSetCurrent,
    cu_ctx_get_current: FnCuCtxGetCurrent,
    cu_ctx_synchronize: FnCuCtxSynchronize,
    cu_ctx_get_device: Option<FnCuCtxGetDevice>,
    cu_ctx_get_api_version: Option<FnCuCtxGetApiVersion>,
    cu_module_load: Option<FnCuModuleLoad>,
    cu_module_load_data: FnCuModuleLoadData,
    cu_module_unload: FnCuModuleUnload,
    cu_module_get_function: FnCuModuleGetFunction,
    cu_mem_alloc: FnCuMemAlloc,
    cu_mem_alloc_managed: Option<FnCuMemAllocManaged>,
    cu_mem_free: FnCuMemFree,
    cu_mem_get_info: FnCuMemGetInfo,
    cu_memcpy_htod: FnCuMemcpyHtoD,
    cu_memcpy_dtoh: FnCuMemcpyDtoH,
    cu_memcpy_dtod: FnCuMemcpyDtoD,
    cu_memcpy_htod_async: FnCuMemcpyHtoDAsync,
    cu_memcpy_dtoh_async: FnCuMemcpyDtoHAsync,
    cu_memcpy_dtod_async: FnCuMemcpyDtoDAsync,
    cu_memcpy_peer: Option<FnCuMemcpyPeer>,
    cu_memcpy_peer_async: Option<FnCuMemcpyPeerAsync>,
    cu_launch_kernel: FnCuLaunchKernel,
    cu_stream_create: FnCuStreamCreate,
    cu_stream_destroy: FnCuStreamDestroy,
    cu_stream_synchronize: FnCuStreamSynchronize,
    cu_stream_query: FnCuStreamQuery,
    cu_stream_get_ctx: Option<FnCuStreamGetCtx>,
}

// SAFETY: the library handle and function pointers are immutable after load,
// and the driver API itself is thread-safe.
unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

impl CudaDriver {
    /// Load the CUDA driver from the platform's default locations.
    pub fn load() -> Result<Arc<Self>, String> {
        Self::load_from(None)
    }

    /// Load the CUDA driver, trying `path` before the platform defaults.
    pub fn load_from(path: Option<&str>) -> Result<Arc<Self>, String> {
        let lib = Self::load_library(path)?;

        unsafe {
            let driver = Self {
                init_result: OnceLock::new(),
                cu_init: Self::load_fn(&lib, "cuInit")?,
                cu_driver_get_version: Self::load_fn(&lib, "cuDriverGetVersion")?,
                cu_get_error_name: Self::load_fn_opt(&lib, "cuGetErrorName"),
                cu_get_error_string: Self::load_fn_opt(&lib, "cuGetErrorString"),
                cu_device_get_count: Self::load_fn(&lib, "cuDeviceGetCount")?,
                cu_device_get: Self::load_fn(&lib, "cuDeviceGet")?,
                cu_device_get_name: Self::load_fn(&lib, "cuDeviceGetName")?,
                cu_device_get_attribute: Self::load_fn(&lib, "cuDeviceGetAttribute")?,
                cu_device_total_mem: Self::load_fn(&lib, "cuDeviceTotalMem_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuDeviceTotalMem"))?,
                cu_device_get_uuid: Self::load_fn_opt::<FnCuDeviceGetUuid>(&lib, "cuDeviceGetUuid_v2")
                    .or(Self::load_fn_opt(&lib, "cuDeviceGetUuid")),
                // Context
                cu_ctx_create: Self::load_fn(&lib, "cuCtxCreate_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuCtxCreate"))?,
                cu_ctx_destroy: Self::load_fn(&lib, "cuCtxDestroy_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuCtxDestroy"))?,
                cu_ctx_set_current: Self::load_fn(&lib, "cuCtxSetCurrent")?,
                cu_ctx_get_current: Self::load_fn(&lib, "cuCtxGetCurrent")?,
                cu_ctx_synchronize: Self::load_fn(&lib, "cuCtxSynchronize")?,
                cu_ctx_get_device: Self::load_fn_opt(&lib, "cuCtxGetDevice"),
                cu_ctx_get_api_version: Self::load_fn_opt(&lib, "cuCtxGetApiVersion"),
                // Module
                cu_module_load: Self::load_fn_opt(&lib, "cuModuleLoad"),
                cu_module_load_data: Self::load_fn(&lib, "cuModuleLoadData")?,
                cu_module_unload: Self::load_fn(&lib, "cuModuleUnload")?,
                cu_module_get_function: Self::load_fn(&lib, "cuModuleGetFunction")?,
                // Memory
                cu_mem_alloc: Self::load_fn(&lib, "cuMemAlloc_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemAlloc"))?,
                cu_mem_alloc_managed: Self::load_fn_opt(&lib, "cuMemAllocManaged"),
                cu_mem_free: Self::load_fn(&lib, "cuMemFree_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemFree"))?,
                cu_mem_get_info: Self::load_fn(&lib, "cuMemGetInfo_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemGetInfo"))?,
                cu_memcpy_htod: Self::load_fn(&lib, "cuMemcpyHtoD_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyHtoD"))?,
                cu_memcpy_dtoh: Self::load_fn(&lib, "cuMemcpyDtoH_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyDtoH"))?,
                cu_memcpy_dtod: Self::load_fn(&lib, "cuMemcpyDtoD_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyDtoD"))?,
                cu_memcpy_htod_async: Self::load_fn(&lib, "cuMemcpyHtoDAsync_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyHtoDAsync"))?,
                cu_memcpy_dtoh_async: Self::load_fn(&lib, "cuMemcpyDtoHAsync_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyDtoHAsync"))?,
                cu_memcpy_dtod_async: Self::load_fn(&lib, "cuMemcpyDtoDAsync_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyDtoDAsync"))?,
                cu_memcpy_peer: Self::load_fn_opt(&lib, "cuMemcpyPeer"),
                cu_memcpy_peer_async: Self::load_fn_opt(&lib, "cuMemcpyPeerAsync"),
                // Execution
                cu_launch_kernel: Self::load_fn(&lib, "cuLaunchKernel")?,
                // Stream
                cu_stream_create: Self::load_fn(&lib, "cuStreamCreate")?,
                cu_stream_destroy: Self::load_fn(&lib, "cuStreamDestroy_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuStreamDestroy"))?,
                cu_stream_synchronize: Self::load_fn(&lib, "cuStreamSynchronize")?,
                cu_stream_query: Self::load_fn(&lib, "cuStreamQuery")?,
                cu_stream_get_ctx: Self::load_fn_opt(&lib, "cuStreamGetCtx"),
                _lib: lib,
            };

            info!("CUDA driver loaded successfully");
            Ok(Arc::new(driver))
        }
    }

    fn load_library(path: Option<&str>) -> Result<Library, String> {
        let defaults = cuhost_common::platform::driver_library_names();
        let candidates = path.into_iter().chain(defaults.iter().copied());

        let mut last_err = String::from("no candidate library names for this platform");
        for name in candidates {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!("loaded CUDA driver from: {}", name);
                    return Ok(lib);
                }
                Err(e) => {
                    last_err = format!("{}: {}", name, e);
                    debug!("failed to load {}: {}", name, e);
                }
            }
        }

        Err(format!("failed to load CUDA driver library: {}", last_err))
    }

    unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, String> {
        let sym: Symbol<F> = unsafe { lib.get(name.as_bytes()) }
            .map_err(|e| format!("failed to load {}: {}", name, e))?;
        Ok(*sym)
    }

    unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
        unsafe { lib.get(name.as_bytes()) }.ok().map(|s: Symbol<F>| *s)
    }

    fn static_str(ptr: *const c_char, fallback: &'static str) -> &'static str {
        if ptr.is_null() {
            return fallback;
        }
        // SAFETY: the driver returns pointers into its own static string tables.
        let s: &'static CStr = unsafe { CStr::from_ptr(ptr) };
        s.to_str().unwrap_or(fallback)
    }
}

impl DriverApi for CudaDriver {
    // ── Initialization ────────────────────────────────────────────

    fn init(&self, flags: u32) -> CUresult {
        *self
            .init_result
            .get_or_init(|| unsafe { (self.cu_init)(flags as c_uint) })
    }

    fn driver_get_version(&self) -> Result<i32, CUresult> {
        let mut version: c_int = 0;
        let res = unsafe { (self.cu_driver_get_version)(&mut version) };
        if res == CUDA_SUCCESS { Ok(version) } else { Err(res) }
    }

    fn error_name(&self, code: CUresult) -> &'static str {
        let fallback = status::error_name(code);
        match self.cu_get_error_name {
            Some(func) => {
                let mut ptr: *const c_char = std::ptr::null();
                if unsafe { func(code, &mut ptr) } == CUDA_SUCCESS {
                    Self::static_str(ptr, fallback)
                } else {
                    fallback
                }
            }
            None => fallback,
        }
    }

    fn error_string(&self, code: CUresult) -> &'static str {
        let fallback = status::error_string(code);
        match self.cu_get_error_string {
            Some(func) => {
                let mut ptr: *const c_char = std::ptr::null();
                if unsafe { func(code, &mut ptr) } == CUDA_SUCCESS {
                    Self::static_str(ptr, fallback)
                } else {
                    fallback
                }
            }
            None => fallback,
        }
    }

    // ── Device Management ─────────────────────────────────────────

    fn device_get_count(&self) -> Result<i32, CUresult> {
        let mut count: c_int = 0;
        let res = unsafe { (self.cu_device_get_count)(&mut count) };
        if res == CUDA_SUCCESS { Ok(count) } else { Err(res) }
    }

    fn device_get(&self, ordinal: i32) -> Result<CUdevice, CUresult> {
        let mut device: CUdevice = 0;
        let res = unsafe { (self.cu_device_get)(&mut device, ordinal) };
        if res == CUDA_SUCCESS { Ok(device) } else { Err(res) }
    }

    fn device_get_name(&self, device: CUdevice) -> Result<String, CUresult> {
        let mut buf = [0u8; 256];
        let res = unsafe {
            (self.cu_device_get_name)(buf.as_mut_ptr() as *mut c_char, buf.len() as c_int, device)
        };
        if res == CUDA_SUCCESS {
            let name = CStr::from_bytes_until_nul(&buf)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&buf).into_owned());
            Ok(name)
        } else {
            Err(res)
        }
    }

    fn device_total_mem(&self, device: CUdevice) -> Result<usize, CUresult> {
        let mut bytes: usize = 0;
        let res = unsafe { (self.cu_device_total_mem)(&mut bytes, device) };
        if res == CUDA_SUCCESS { Ok(bytes) } else { Err(res) }
    }

    fn device_get_uuid(&self, device: CUdevice) -> Result<[u8; 16], CUresult> {
        if let Some(func) = self.cu_device_get_uuid {
            let mut uuid = CUuuid { bytes: [0u8; 16] };
            let res = unsafe { func(&mut uuid, device) };
            if res == CUDA_SUCCESS { Ok(uuid.bytes) } else { Err(res) }
        } else {
            Err(CUDA_ERROR_NOT_SUPPORTED)
        }
    }

    fn device_get_attribute(&self, attrib: i32, device: CUdevice) -> Result<i32, CUresult> {
        let mut value: c_int = 0;
        let res = unsafe { (self.cu_device_get_attribute)(&mut value, attrib, device) };
        if res == CUDA_SUCCESS { Ok(value) } else { Err(res) }
    }

    // ── Context Management ────────────────────────────────────────

    fn ctx_create(&self, flags: u32, device: CUdevice) -> Result<CUcontext, CUresult> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        let res = unsafe { (self.cu_ctx_create)(&mut ctx, flags as c_uint, device) };
        if res == CUDA_SUCCESS { Ok(ctx) } else { Err(res) }
    }

    fn ctx_destroy(&self, ctx: CUcontext) -> CUresult {
        unsafe { (self.cu_ctx_destroy)(ctx) }
    }

    fn ctx_set_current(&self, ctx: CUcontext) -> CUresult {
        unsafe { (self.cu_ctx_set_current)(ctx) }
    }

    fn ctx_get_current(&self) -> Result<CUcontext, CUresult> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        let res = unsafe { (self.cu_ctx_get_current)(&mut ctx) };
        if res == CUDA_SUCCESS { Ok(ctx) } else { Err(res) }
    }

    fn ctx_synchronize(&self) -> CUresult {
        unsafe { (self.cu_ctx_synchronize)() }
    }

    fn ctx_get_device(&self) -> Result<CUdevice, CUresult> {
        if let Some(func) = self.cu_ctx_get_device {
            let mut dev: CUdevice = 0;
            let res = unsafe { func(&mut dev) };
            if res == CUDA_SUCCESS { Ok(dev) } else { Err(res) }
        } else {
            Err(CUDA_ERROR_NOT_SUPPORTED)
        }
    }

    fn ctx_get_api_version(&self, ctx: CUcontext) -> Result<u32, CUresult> {
        if let Some(func) = self.cu_ctx_get_api_version {
            let mut version: c_uint = 0;
            let res = unsafe { func(ctx, &mut version) };
            if res == CUDA_SUCCESS { Ok(version) } else { Err(res) }
        } else {
            Err(CUDA_ERROR_NOT_SUPPORTED)
        }
    }

    // ── Memory Management ─────────────────────────────────────────

    fn mem_alloc(&self, bytesize: usize) -> Result<CUdeviceptr, CUresult> {
        let mut dptr: CUdeviceptr = 0;
        let res = unsafe { (self.cu_mem_alloc)(&mut dptr, bytesize) };
        if res == CUDA_SUCCESS { Ok(dptr) } else { Err(res) }
    }

    fn mem_alloc_managed(&self, bytesize: usize, flags: u32) -> Result<CUdeviceptr, CUresult> {
        if let Some(func) = self.cu_mem_alloc_managed {
            let mut dptr: CUdeviceptr = 0;
            let res = unsafe { func(&mut dptr, bytesize, flags as c_uint) };
            if res == CUDA_SUCCESS { Ok(dptr) } else { Err(res) }
        } else {
            Err(CUDA_ERROR_NOT_SUPPORTED)
        }
    }

    fn mem_free(&self, dptr: CUdeviceptr) -> CUresult {
        unsafe { (self.cu_mem_free)(dptr) }
    }

    fn mem_get_info(&self) -> Result<(usize, usize), CUresult> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        let res = unsafe { (self.cu_mem_get_info)(&mut free, &mut total) };
        if res == CUDA_SUCCESS { Ok((free, total)) } else { Err(res) }
    }

    unsafe fn memcpy_htod(
        &self,
        dst: CUdeviceptr,
        src: *const c_void,
        byte_count: usize,
    ) -> CUresult {
        unsafe { (self.cu_memcpy_htod)(dst, src, byte_count) }
    }

    unsafe fn memcpy_dtoh(
        &self,
        dst: *mut c_void,
        src: CUdeviceptr,
        byte_count: usize,
    ) -> CUresult {
        unsafe { (self.cu_memcpy_dtoh)(dst, src, byte_count) }
    }

    fn memcpy_dtod(&self, dst: CUdeviceptr, src: CUdeviceptr, byte_count: usize) -> CUresult {
        unsafe { (self.cu_memcpy_dtod)(dst, src, byte_count) }
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: CUdeviceptr,
        src: *const c_void,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult {
        unsafe { (self.cu_memcpy_htod_async)(dst, src, byte_count, stream) }
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut c_void,
        src: CUdeviceptr,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult {
        unsafe { (self.cu_memcpy_dtoh_async)(dst, src, byte_count, stream) }
    }

    fn memcpy_dtod_async(
        &self,
        dst: CUdeviceptr,
        src: CUdeviceptr,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult {
        unsafe { (self.cu_memcpy_dtod_async)(dst, src, byte_count, stream) }
    }

    fn memcpy_peer(
        &self,
        dst: CUdeviceptr,
        dst_ctx: CUcontext,
        src: CUdeviceptr,
        src_ctx: CUcontext,
        byte_count: usize,
    ) -> CUresult {
        match self.cu_memcpy_peer {
            Some(func) => unsafe { func(dst, dst_ctx, src, src_ctx, byte_count) },
            None => CUDA_ERROR_NOT_SUPPORTED,
        }
    }

    fn memcpy_peer_async(
        &self,
        dst: CUdeviceptr,
        dst_ctx: CUcontext,
        src: CUdeviceptr,
        src_ctx: CUcontext,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult {
        match self.cu_memcpy_peer_async {
            Some(func) => unsafe { func(dst, dst_ctx, src, src_ctx, byte_count, stream) },
            None => CUDA_ERROR_NOT_SUPPORTED,
        }
    }

    // ── Module Management ─────────────────────────────────────────

    fn module_load(&self, fname: &CStr) -> Result<CUmodule, CUresult> {
        if let Some(func) = self.cu_module_load {
            let mut module: CUmodule = std::ptr::null_mut();
            let res = unsafe { func(&mut module, fname.as_ptr()) };
            if res == CUDA_SUCCESS { Ok(module) } else { Err(res) }
        } else {
            Err(CUDA_ERROR_NOT_SUPPORTED)
        }
    }

    unsafe fn module_load_data(&self, image: *const c_void) -> Result<CUmodule, CUresult> {
        let mut module: CUmodule = std::ptr::null_mut();
        let res = unsafe { (self.cu_module_load_data)(&mut module, image) };
        if res == CUDA_SUCCESS { Ok(module) } else { Err(res) }
    }

    fn module_unload(&self, module: CUmodule) -> CUresult {
        unsafe { (self.cu_module_unload)(module) }
    }

    fn module_get_function(&self, module: CUmodule, name: &CStr) -> Result<CUfunction, CUresult> {
        let mut func: CUfunction = std::ptr::null_mut();
        let res = unsafe { (self.cu_module_get_function)(&mut func, module, name.as_ptr()) };
        if res == CUDA_SUCCESS { Ok(func) } else { Err(res) }
    }

    // ── Stream Management ─────────────────────────────────────────

    fn stream_create(&self, flags: u32) -> Result<CUstream, CUresult> {
        let mut stream: CUstream = std::ptr::null_mut();
        let res = unsafe { (self.cu_stream_create)(&mut stream, flags as c_uint) };
        if res == CUDA_SUCCESS { Ok(stream) } else { Err(res) }
    }

    fn stream_destroy(&self, stream: CUstream) -> CUresult {
        unsafe { (self.cu_stream_destroy)(stream) }
    }

    fn stream_synchronize(&self, stream: CUstream) -> CUresult {
        unsafe { (self.cu_stream_synchronize)(stream) }
    }

    fn stream_query(&self, stream: CUstream) -> CUresult {
        unsafe { (self.cu_stream_query)(stream) }
    }

    fn stream_get_ctx(&self, stream: CUstream) -> Result<CUcontext, CUresult> {
        if let Some(func) = self.cu_stream_get_ctx {
            let mut ctx: CUcontext = std::ptr::null_mut();
            let res = unsafe { func(stream, &mut ctx) };
            if res == CUDA_SUCCESS { Ok(ctx) } else { Err(res) }
        } else {
            Err(CUDA_ERROR_NOT_SUPPORTED)
        }
    }

    // ── Execution ─────────────────────────────────────────────────

    unsafe fn launch_kernel(
        &self,
        func: CUfunction,
        grid_dim: [u32; 3],
        block_dim: [u32; 3],
        shared_mem_bytes: u32,
        stream: CUstream,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> CUresult {
        unsafe {
            (self.cu_launch_kernel)(
                func,
                grid_dim[0] as c_uint, grid_dim[1] as c_uint, grid_dim[2] as c_uint,
                block_dim[0] as c_uint, block_dim[1] as c_uint, block_dim[2] as c_uint,
                shared_mem_bytes as c_uint,
                stream,
                kernel_params,
                extra,
            )
        }
    }
}
