//! Host-memory implementation of [`DriverApi`].
//!
//! Devices, contexts, allocations, modules and streams are tracked in plain
//! maps. Kernels are host closures registered by entry-point name; a module
//! exposes whichever `.entry` names its image declares. Work queued on a
//! stream runs when the stream is synchronized (or one item per query), so
//! stream ordering and `CUDA_ERROR_NOT_READY` are observable.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ffi::{c_void, CStr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::api::{
    CUcontext, CUdevice, CUdeviceptr, CUfunction, CUmodule, CUstream, DriverApi,
    CU_LAUNCH_PARAM_BUFFER_POINTER, CU_LAUNCH_PARAM_BUFFER_SIZE, CU_LAUNCH_PARAM_END,
};
use crate::status::*;

pub const DEFAULT_TOTAL_MEMORY: usize = 1 << 30;
pub const DRIVER_VERSION: i32 = 12040;
pub const CONTEXT_API_VERSION: u32 = 3020;

const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 256;
const MAX_THREADS_PER_BLOCK: u64 = 1024;
const STREAM_NON_BLOCKING: u32 = 0x1;

/// Host closure standing in for a compiled kernel.
pub type KernelFn = dyn Fn(&mut KernelCall<'_>) -> Result<(), CUresult> + Send + Sync;

struct Kernel {
    arity: usize,
    body: Arc<KernelFn>,
}

/// One emulated device.
#[derive(Debug, Clone)]
pub struct EmulatedDevice {
    pub name: String,
    pub total_mem: usize,
    pub uuid: [u8; 16],
    pub attributes: HashMap<i32, i32>,
}

impl EmulatedDevice {
    pub fn new(ordinal: usize, total_mem: usize) -> Self {
        let mut uuid = [0u8; 16];
        uuid[..4].copy_from_slice(b"emu\0");
        uuid[8..16].copy_from_slice(&(ordinal as u64).to_be_bytes());

        let attributes = HashMap::from([
            (1, 1024),        // max threads per block
            (2, 1024),        // max block dim x
            (3, 1024),        // max block dim y
            (4, 64),          // max block dim z
            (5, i32::MAX),    // max grid dim x
            (6, 65535),       // max grid dim y
            (7, 65535),       // max grid dim z
            (8, 49152),       // shared memory per block
            (10, 32),         // warp size
            (12, 65536),      // registers per block
            (13, 1_500_000),  // clock rate (kHz)
            (16, 8),          // multiprocessor count
            (41, 1),          // unified addressing
            (75, 8),          // compute capability major
            (76, 6),          // compute capability minor
            (83, 1),          // managed memory
        ]);

        Self {
            name: format!("Emulated CUDA Device {}", ordinal),
            total_mem,
            uuid,
            attributes,
        }
    }
}

/// Record of the most recent successful launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub kernel: String,
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_mem_bytes: u32,
    pub args: Vec<u64>,
    pub via_extra: bool,
    pub stream: usize,
}

struct Allocation {
    bytes: Vec<u8>,
    ctx: usize,
    device: usize,
    managed: bool,
}

/// Emulated device memory.
#[derive(Default)]
pub struct DeviceMemory {
    allocations: BTreeMap<u64, Allocation>,
    next_addr: u64,
}

impl DeviceMemory {
    fn locate(&self, addr: u64, len: usize) -> Result<(u64, usize), CUresult> {
        let (&base, alloc) = self
            .allocations
            .range(..=addr)
            .next_back()
            .ok_or(CUDA_ERROR_INVALID_VALUE)?;
        let offset = (addr - base) as usize;
        if offset.checked_add(len).map_or(true, |end| end > alloc.bytes.len()) {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        Ok((base, offset))
    }

    fn slice(&self, addr: u64, len: usize) -> Result<&[u8], CUresult> {
        let (base, offset) = self.locate(addr, len)?;
        let alloc = &self.allocations[&base];
        Ok(&alloc.bytes[offset..offset + len])
    }

    fn slice_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8], CUresult> {
        let (base, offset) = self.locate(addr, len)?;
        let alloc = self
            .allocations
            .get_mut(&base)
            .ok_or(CUDA_ERROR_INVALID_VALUE)?;
        Ok(&mut alloc.bytes[offset..offset + len])
    }

    fn copy_within(&mut self, dst: u64, src: u64, len: usize) -> Result<(), CUresult> {
        if len == 0 {
            return Ok(());
        }
        let data = self.slice(src, len)?.to_vec();
        self.slice_mut(dst, len)?.copy_from_slice(&data);
        Ok(())
    }

    fn used_on(&self, device: usize) -> usize {
        self.allocations
            .values()
            .filter(|a| a.device == device)
            .map(|a| a.bytes.len())
            .sum()
    }

    /// Read `len` elements of `T` starting at `addr`.
    pub fn read<T: bytemuck::Pod>(&self, addr: u64, len: usize) -> Result<Vec<T>, CUresult> {
        let size = std::mem::size_of::<T>();
        let bytes = self.slice(addr, len * size)?;
        Ok(bytes.chunks_exact(size).map(bytemuck::pod_read_unaligned).collect())
    }

    /// Write `data` starting at `addr`.
    pub fn write<T: bytemuck::Pod>(&mut self, addr: u64, data: &[T]) -> Result<(), CUresult> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.slice_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

/// View handed to a kernel body for one launch.
pub struct KernelCall<'a> {
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_mem_bytes: u32,
    args: &'a [u64],
    memory: &'a mut DeviceMemory,
}

impl KernelCall<'_> {
    /// Parameter word `index` as it was packed at launch.
    pub fn arg(&self, index: usize) -> Result<u64, CUresult> {
        self.args.get(index).copied().ok_or(CUDA_ERROR_INVALID_VALUE)
    }

    pub fn args(&self) -> &[u64] {
        self.args
    }

    /// Total number of threads in the launch.
    pub fn threads(&self) -> u64 {
        self.grid.iter().chain(self.block.iter()).map(|&d| d as u64).product()
    }

    pub fn read<T: bytemuck::Pod>(&self, addr: u64, len: usize) -> Result<Vec<T>, CUresult> {
        self.memory.read(addr, len)
    }

    pub fn write<T: bytemuck::Pod>(&mut self, addr: u64, data: &[T]) -> Result<(), CUresult> {
        self.memory.write(addr, data)
    }
}

struct ContextState {
    device: usize,
}

struct ModuleState {
    ctx: usize,
    entries: Vec<String>,
    functions: HashMap<String, usize>,
}

struct FunctionState {
    module: usize,
    name: String,
}

enum StreamOp {
    HtoD { dst: CUdeviceptr, src: usize, len: usize },
    DtoH { dst: usize, src: CUdeviceptr, len: usize },
    DtoD { dst: CUdeviceptr, src: CUdeviceptr, len: usize },
    Launch(LaunchRecord),
}

struct StreamState {
    ctx: usize,
    flags: u32,
    queue: VecDeque<StreamOp>,
}

/// In-process stand-in for the CUDA driver.
pub struct EmulatedDriver {
    initialized: AtomicBool,
    devices: Vec<EmulatedDevice>,
    next_handle: AtomicUsize,
    current: Mutex<usize>,
    contexts: DashMap<usize, ContextState>,
    memory: Mutex<DeviceMemory>,
    kernels: DashMap<String, Kernel>,
    modules: DashMap<usize, ModuleState>,
    functions: DashMap<usize, FunctionState>,
    streams: DashMap<usize, StreamState>,
    launches: AtomicUsize,
    last_launch: Mutex<Option<LaunchRecord>>,
}

impl Default for EmulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn handle(id: usize) -> *mut c_void {
    id as *mut c_void
}

fn id_of(h: *mut c_void) -> usize {
    h as usize
}

#[cfg(unix)]
fn image_path(fname: &CStr) -> Result<std::path::PathBuf, CUresult> {
    use std::os::unix::ffi::OsStrExt;
    Ok(std::ffi::OsStr::from_bytes(fname.to_bytes()).into())
}

#[cfg(not(unix))]
fn image_path(fname: &CStr) -> Result<std::path::PathBuf, CUresult> {
    fname.to_str().map(Into::into).map_err(|_| CUDA_ERROR_INVALID_VALUE)
}

fn parse_entries(image: &str) -> Result<Vec<String>, CUresult> {
    let entries: Vec<String> = image
        .lines()
        .filter_map(|line| {
            let rest = line.split(".entry").nth(1)?;
            let name: String = rest
                .trim_start()
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
                .collect();
            (!name.is_empty()).then_some(name)
        })
        .collect();
    if entries.is_empty() && !image.contains(".version") {
        return Err(CUDA_ERROR_INVALID_IMAGE);
    }
    Ok(entries)
}

impl EmulatedDriver {
    /// One device with [`DEFAULT_TOTAL_MEMORY`].
    pub fn new() -> Self {
        Self::with_devices(1, DEFAULT_TOTAL_MEMORY)
    }

    pub fn with_devices(count: usize, total_mem: usize) -> Self {
        Self {
            initialized: AtomicBool::new(false),
            devices: (0..count).map(|i| EmulatedDevice::new(i, total_mem)).collect(),
            next_handle: AtomicUsize::new(0x1000),
            current: Mutex::new(0),
            contexts: DashMap::new(),
            memory: Mutex::new(DeviceMemory {
                allocations: BTreeMap::new(),
                next_addr: BASE_ADDRESS,
            }),
            kernels: DashMap::new(),
            modules: DashMap::new(),
            functions: DashMap::new(),
            streams: DashMap::new(),
            launches: AtomicUsize::new(0),
            last_launch: Mutex::new(None),
        }
    }

    /// Register a host kernel under `name` taking `arity` parameter words.
    pub fn register_kernel<F>(&self, name: &str, arity: usize, body: F)
    where
        F: Fn(&mut KernelCall<'_>) -> Result<(), CUresult> + Send + Sync + 'static,
    {
        self.kernels.insert(
            name.to_string(),
            Kernel {
                arity,
                body: Arc::new(body),
            },
        );
    }

    pub fn with_kernel<F>(self, name: &str, arity: usize, body: F) -> Self
    where
        F: Fn(&mut KernelCall<'_>) -> Result<(), CUresult> + Send + Sync + 'static,
    {
        self.register_kernel(name, arity, body);
        self
    }

    pub fn live_allocations(&self) -> usize {
        self.memory.lock().allocations.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn live_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn live_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn last_launch(&self) -> Option<LaunchRecord> {
        self.last_launch.lock().clone()
    }

    /// Operations still queued on `stream`.
    pub fn pending(&self, stream: CUstream) -> usize {
        self.streams
            .get(&id_of(stream))
            .map_or(0, |s| s.queue.len())
    }

    /// Whether `dptr` was allocated as managed memory.
    pub fn is_managed(&self, dptr: CUdeviceptr) -> bool {
        self.memory
            .lock()
            .allocations
            .get(&dptr)
            .is_some_and(|a| a.managed)
    }

    fn next_id(&self) -> usize {
        self.next_handle.fetch_add(0x10, Ordering::SeqCst)
    }

    fn ensure_init(&self) -> Result<(), CUresult> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CUDA_ERROR_NOT_INITIALIZED)
        }
    }

    /// Current context id and its device.
    fn current_ctx(&self) -> Result<(usize, usize), CUresult> {
        self.ensure_init()?;
        let ctx = *self.current.lock();
        let state = self.contexts.get(&ctx).ok_or(CUDA_ERROR_INVALID_CONTEXT)?;
        Ok((ctx, state.device))
    }

    fn status(res: Result<(), CUresult>) -> CUresult {
        match res {
            Ok(()) => CUDA_SUCCESS,
            Err(code) => code,
        }
    }

    /// Run queued work until `stream` is empty, stopping at the first error.
    fn drain(&self, stream: usize) -> Result<(), CUresult> {
        loop {
            let op = {
                let mut state = self.streams.get_mut(&stream).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
                match state.queue.pop_front() {
                    Some(op) => op,
                    None => return Ok(()),
                }
            };
            if let Err(code) = self.execute(op) {
                if let Some(mut state) = self.streams.get_mut(&stream) {
                    state.queue.clear();
                }
                return Err(code);
            }
        }
    }

    /// Legacy default-stream semantics: null-stream work waits for every
    /// blocking stream.
    fn drain_blocking_streams(&self) -> Result<(), CUresult> {
        let ids: Vec<usize> = self
            .streams
            .iter()
            .filter(|s| s.flags & STREAM_NON_BLOCKING == 0 && !s.queue.is_empty())
            .map(|s| *s.key())
            .collect();
        for id in ids {
            self.drain(id)?;
        }
        Ok(())
    }

    fn submit(&self, stream: CUstream, op: StreamOp) -> CUresult {
        if stream.is_null() {
            return Self::status(self.drain_blocking_streams().and_then(|_| self.execute(op)));
        }
        match self.streams.get_mut(&id_of(stream)) {
            Some(mut state) => {
                state.queue.push_back(op);
                CUDA_SUCCESS
            }
            None => CUDA_ERROR_INVALID_HANDLE,
        }
    }

    fn execute(&self, op: StreamOp) -> Result<(), CUresult> {
        match op {
            StreamOp::HtoD { dst, src, len } => {
                if len == 0 {
                    return Ok(());
                }
                // SAFETY: the enqueueing caller guaranteed `src` stays valid
                // for `len` bytes until the stream drains.
                let data = unsafe { std::slice::from_raw_parts(src as *const u8, len) };
                self.memory.lock().slice_mut(dst, len)?.copy_from_slice(data);
                Ok(())
            }
            StreamOp::DtoH { dst, src, len } => {
                if len == 0 {
                    return Ok(());
                }
                let memory = self.memory.lock();
                let data = memory.slice(src, len)?;
                // SAFETY: as above, for writes to `dst`.
                let out = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, len) };
                out.copy_from_slice(data);
                Ok(())
            }
            StreamOp::DtoD { dst, src, len } => self.memory.lock().copy_within(dst, src, len),
            StreamOp::Launch(record) => self.run_kernel(record),
        }
    }

    fn run_kernel(&self, record: LaunchRecord) -> Result<(), CUresult> {
        let body = match self.kernels.get(&record.kernel) {
            Some(kernel) => Arc::clone(&kernel.body),
            None => {
                warn!("emulator has no body for kernel {}", record.kernel);
                return Err(CUDA_ERROR_LAUNCH_FAILED);
            }
        };
        {
            let mut memory = self.memory.lock();
            let mut call = KernelCall {
                grid: record.grid,
                block: record.block,
                shared_mem_bytes: record.shared_mem_bytes,
                args: &record.args,
                memory: &mut *memory,
            };
            body(&mut call)?;
        }
        debug!("emulated kernel {} completed", record.kernel);
        *self.last_launch.lock() = Some(record);
        Ok(())
    }

    /// Read the parameter words for a launch from either channel.
    unsafe fn collect_args(
        arity: usize,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> Result<(Vec<u64>, bool), CUresult> {
        if !kernel_params.is_null() {
            let mut args = Vec::with_capacity(arity);
            for i in 0..arity {
                // SAFETY: the caller provides one valid pointer per parameter.
                let slot = unsafe { *kernel_params.add(i) };
                if slot.is_null() {
                    return Err(CUDA_ERROR_INVALID_VALUE);
                }
                args.push(unsafe { std::ptr::read_unaligned(slot as *const u64) });
            }
            return Ok((args, false));
        }
        if extra.is_null() {
            return if arity == 0 {
                Ok((Vec::new(), false))
            } else {
                Err(CUDA_ERROR_INVALID_VALUE)
            };
        }

        let mut buffer: *const u8 = std::ptr::null();
        let mut size: Option<usize> = None;
        let mut i = 0;
        loop {
            // SAFETY: `extra` is an END-terminated option list.
            let key = unsafe { *extra.add(i) };
            if key == CU_LAUNCH_PARAM_END {
                break;
            }
            let value = unsafe { *extra.add(i + 1) };
            if key == CU_LAUNCH_PARAM_BUFFER_POINTER {
                buffer = value as *const u8;
            } else if key == CU_LAUNCH_PARAM_BUFFER_SIZE {
                if value.is_null() {
                    return Err(CUDA_ERROR_INVALID_VALUE);
                }
                size = Some(unsafe { std::ptr::read_unaligned(value as *const usize) });
            } else {
                return Err(CUDA_ERROR_INVALID_VALUE);
            }
            i += 2;
        }

        let size = size.ok_or(CUDA_ERROR_INVALID_VALUE)?;
        if buffer.is_null() || size < arity * 8 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        // SAFETY: the buffer holds `size` readable bytes.
        let bytes = unsafe { std::slice::from_raw_parts(buffer, size) };
        let args = bytes
            .chunks_exact(8)
            .take(arity)
            .map(bytemuck::pod_read_unaligned::<u64>)
            .collect();
        Ok((args, true))
    }
}

impl DriverApi for EmulatedDriver {
    // ── Initialization ────────────────────────────────────────────

    fn init(&self, flags: u32) -> CUresult {
        if flags != 0 {
            return CUDA_ERROR_INVALID_VALUE;
        }
        self.initialized.store(true, Ordering::SeqCst);
        CUDA_SUCCESS
    }

    fn driver_get_version(&self) -> Result<i32, CUresult> {
        Ok(DRIVER_VERSION)
    }

    // ── Device Management ─────────────────────────────────────────

    fn device_get_count(&self) -> Result<i32, CUresult> {
        self.ensure_init()?;
        Ok(self.devices.len() as i32)
    }

    fn device_get(&self, ordinal: i32) -> Result<CUdevice, CUresult> {
        self.ensure_init()?;
        if ordinal < 0 || ordinal as usize >= self.devices.len() {
            return Err(CUDA_ERROR_INVALID_DEVICE);
        }
        Ok(ordinal)
    }

    fn device_get_name(&self, device: CUdevice) -> Result<String, CUresult> {
        self.ensure_init()?;
        self.devices
            .get(device as usize)
            .map(|d| d.name.clone())
            .ok_or(CUDA_ERROR_INVALID_DEVICE)
    }

    fn device_total_mem(&self, device: CUdevice) -> Result<usize, CUresult> {
        self.ensure_init()?;
        self.devices
            .get(device as usize)
            .map(|d| d.total_mem)
            .ok_or(CUDA_ERROR_INVALID_DEVICE)
    }

    fn device_get_uuid(&self, device: CUdevice) -> Result<[u8; 16], CUresult> {
        self.ensure_init()?;
        self.devices
            .get(device as usize)
            .map(|d| d.uuid)
            .ok_or(CUDA_ERROR_INVALID_DEVICE)
    }

    fn device_get_attribute(&self, attrib: i32, device: CUdevice) -> Result<i32, CUresult> {
        self.ensure_init()?;
        let dev = self.devices.get(device as usize).ok_or(CUDA_ERROR_INVALID_DEVICE)?;
        dev.attributes.get(&attrib).copied().ok_or(CUDA_ERROR_INVALID_VALUE)
    }

    // ── Context Management ────────────────────────────────────────

    fn ctx_create(&self, _flags: u32, device: CUdevice) -> Result<CUcontext, CUresult> {
        self.ensure_init()?;
        if device < 0 || device as usize >= self.devices.len() {
            return Err(CUDA_ERROR_INVALID_DEVICE);
        }
        let id = self.next_id();
        self.contexts.insert(id, ContextState { device: device as usize });
        *self.current.lock() = id;
        Ok(handle(id))
    }

    fn ctx_destroy(&self, ctx: CUcontext) -> CUresult {
        let id = id_of(ctx);
        if self.contexts.remove(&id).is_none() {
            return CUDA_ERROR_INVALID_CONTEXT;
        }
        self.memory.lock().allocations.retain(|_, a| a.ctx != id);
        self.streams.retain(|_, s| s.ctx != id);
        let dead: Vec<usize> = self
            .modules
            .iter()
            .filter(|m| m.ctx == id)
            .map(|m| *m.key())
            .collect();
        for module in dead {
            self.modules.remove(&module);
            self.functions.retain(|_, f| f.module != module);
        }
        let mut current = self.current.lock();
        if *current == id {
            *current = 0;
        }
        CUDA_SUCCESS
    }

    fn ctx_set_current(&self, ctx: CUcontext) -> CUresult {
        let id = id_of(ctx);
        if id != 0 && !self.contexts.contains_key(&id) {
            return CUDA_ERROR_INVALID_CONTEXT;
        }
        *self.current.lock() = id;
        CUDA_SUCCESS
    }

    fn ctx_get_current(&self) -> Result<CUcontext, CUresult> {
        self.ensure_init()?;
        Ok(handle(*self.current.lock()))
    }

    fn ctx_synchronize(&self) -> CUresult {
        let res = self.current_ctx().and_then(|(ctx, _)| {
            let ids: Vec<usize> = self
                .streams
                .iter()
                .filter(|s| s.ctx == ctx)
                .map(|s| *s.key())
                .collect();
            ids.into_iter().try_for_each(|id| self.drain(id))
        });
        Self::status(res)
    }

    fn ctx_get_device(&self) -> Result<CUdevice, CUresult> {
        let (_, device) = self.current_ctx()?;
        Ok(device as CUdevice)
    }

    fn ctx_get_api_version(&self, ctx: CUcontext) -> Result<u32, CUresult> {
        if self.contexts.contains_key(&id_of(ctx)) {
            Ok(CONTEXT_API_VERSION)
        } else {
            Err(CUDA_ERROR_INVALID_CONTEXT)
        }
    }

    // ── Memory Management ─────────────────────────────────────────

    fn mem_alloc(&self, bytesize: usize) -> Result<CUdeviceptr, CUresult> {
        let (ctx, device) = self.current_ctx()?;
        if bytesize == 0 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        let mut memory = self.memory.lock();
        let wanted = memory.used_on(device).checked_add(bytesize);
        if wanted.map_or(true, |n| n > self.devices[device].total_mem) {
            return Err(CUDA_ERROR_OUT_OF_MEMORY);
        }
        let addr = memory.next_addr;
        let span = (bytesize as u64).div_ceil(ALIGNMENT) * ALIGNMENT;
        memory.next_addr += span;
        memory.allocations.insert(
            addr,
            Allocation {
                bytes: vec![0u8; bytesize],
                ctx,
                device,
                managed: false,
            },
        );
        Ok(addr)
    }

    fn mem_alloc_managed(&self, bytesize: usize, flags: u32) -> Result<CUdeviceptr, CUresult> {
        // CU_MEM_ATTACH_GLOBAL | CU_MEM_ATTACH_HOST
        if flags != 0x1 && flags != 0x2 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        let addr = self.mem_alloc(bytesize)?;
        if let Some(a) = self.memory.lock().allocations.get_mut(&addr) {
            a.managed = true;
        }
        Ok(addr)
    }

    fn mem_free(&self, dptr: CUdeviceptr) -> CUresult {
        if let Err(code) = self.ensure_init() {
            return code;
        }
        match self.memory.lock().allocations.remove(&dptr) {
            Some(_) => CUDA_SUCCESS,
            None => CUDA_ERROR_INVALID_VALUE,
        }
    }

    fn mem_get_info(&self) -> Result<(usize, usize), CUresult> {
        let (_, device) = self.current_ctx()?;
        let total = self.devices[device].total_mem;
        let used = self.memory.lock().used_on(device);
        Ok((total - used, total))
    }

    unsafe fn memcpy_htod(
        &self,
        dst: CUdeviceptr,
        src: *const c_void,
        byte_count: usize,
    ) -> CUresult {
        if let Err(code) = self.current_ctx() {
            return code;
        }
        let op = StreamOp::HtoD { dst, src: src as usize, len: byte_count };
        self.submit(std::ptr::null_mut(), op)
    }

    unsafe fn memcpy_dtoh(
        &self,
        dst: *mut c_void,
        src: CUdeviceptr,
        byte_count: usize,
    ) -> CUresult {
        if let Err(code) = self.current_ctx() {
            return code;
        }
        let op = StreamOp::DtoH { dst: dst as usize, src, len: byte_count };
        self.submit(std::ptr::null_mut(), op)
    }

    fn memcpy_dtod(&self, dst: CUdeviceptr, src: CUdeviceptr, byte_count: usize) -> CUresult {
        if let Err(code) = self.current_ctx() {
            return code;
        }
        self.submit(std::ptr::null_mut(), StreamOp::DtoD { dst, src, len: byte_count })
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: CUdeviceptr,
        src: *const c_void,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult {
        if let Err(code) = self.current_ctx() {
            return code;
        }
        // Reject bad destinations at enqueue time, as the driver does.
        if byte_count > 0 {
            if let Err(code) = self.memory.lock().locate(dst, byte_count) {
                return code;
            }
        }
        self.submit(stream, StreamOp::HtoD { dst, src: src as usize, len: byte_count })
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut c_void,
        src: CUdeviceptr,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult {
        if let Err(code) = self.current_ctx() {
            return code;
        }
        if byte_count > 0 {
            if let Err(code) = self.memory.lock().locate(src, byte_count) {
                return code;
            }
        }
        self.submit(stream, StreamOp::DtoH { dst: dst as usize, src, len: byte_count })
    }

    fn memcpy_dtod_async(
        &self,
        dst: CUdeviceptr,
        src: CUdeviceptr,
        byte_count: usize,
        stream: CUstream,
    ) -> CUresult {
        if let Err(code) = self.current_ctx() {
            return code;
        }
        self.submit(stream, StreamOp::DtoD { dst, src, len: byte_count })
    }

    fn memcpy_peer(
        &self,
        dst: CUdeviceptr,
        dst_ctx: CUcontext,
        src: CUdeviceptr,
        src_ctx: CUcontext,
        byte_count: usize,
    ) -> CUresult {
        if !self.contexts.contains_key(&id_of(dst_ctx))
            || !self.contexts.contains_key(&id_of(src_ctx))
        {
            return CUDA_ERROR_INVALID_CONTEXT;
        }
        self.submit(std::ptr::null_mut(), StreamOp::DtoD { dst, src, len: byte_count })
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
        if !self.contexts.contains_key(&id_of(dst_ctx))
            || !self.contexts.contains_key(&id_of(src_ctx))
        {
            return CUDA_ERROR_INVALID_CONTEXT;
        }
        self.submit(stream, StreamOp::DtoD { dst, src, len: byte_count })
    }

    // ── Module Management ─────────────────────────────────────────

    fn module_load(&self, fname: &CStr) -> Result<CUmodule, CUresult> {
        let (ctx, _) = self.current_ctx()?;
        let path = image_path(fname)?;
        let image = std::fs::read_to_string(&path).map_err(|_| CUDA_ERROR_FILE_NOT_FOUND)?;
        let entries = parse_entries(&image)?;
        let id = self.next_id();
        debug!("emulator loaded {} with entries {:?}", path.display(), entries);
        self.modules.insert(
            id,
            ModuleState { ctx, entries, functions: HashMap::new() },
        );
        Ok(handle(id))
    }

    unsafe fn module_load_data(&self, image: *const c_void) -> Result<CUmodule, CUresult> {
        let (ctx, _) = self.current_ctx()?;
        if image.is_null() {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        // SAFETY: PTX images are NUL-terminated text.
        let text = unsafe { CStr::from_ptr(image as *const std::ffi::c_char) };
        let text = text.to_str().map_err(|_| CUDA_ERROR_INVALID_IMAGE)?;
        let entries = parse_entries(text)?;
        let id = self.next_id();
        self.modules.insert(
            id,
            ModuleState { ctx, entries, functions: HashMap::new() },
        );
        Ok(handle(id))
    }

    fn module_unload(&self, module: CUmodule) -> CUresult {
        let id = id_of(module);
        match self.modules.remove(&id) {
            Some(_) => {
                self.functions.retain(|_, f| f.module != id);
                CUDA_SUCCESS
            }
            None => CUDA_ERROR_INVALID_HANDLE,
        }
    }

    fn module_get_function(&self, module: CUmodule, name: &CStr) -> Result<CUfunction, CUresult> {
        let module_id = id_of(module);
        let name = name.to_str().map_err(|_| CUDA_ERROR_NOT_FOUND)?;
        let mut state = self.modules.get_mut(&module_id).ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        if !state.entries.iter().any(|e| e == name) {
            return Err(CUDA_ERROR_NOT_FOUND);
        }
        if let Some(&id) = state.functions.get(name) {
            return Ok(handle(id));
        }
        let id = self.next_id();
        state.functions.insert(name.to_string(), id);
        self.functions.insert(
            id,
            FunctionState { module: module_id, name: name.to_string() },
        );
        Ok(handle(id))
    }

    // ── Stream Management ─────────────────────────────────────────

    fn stream_create(&self, flags: u32) -> Result<CUstream, CUresult> {
        let (ctx, _) = self.current_ctx()?;
        if flags & !STREAM_NON_BLOCKING != 0 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        let id = self.next_id();
        self.streams.insert(id, StreamState { ctx, flags, queue: VecDeque::new() });
        Ok(handle(id))
    }

    fn stream_destroy(&self, stream: CUstream) -> CUresult {
        let id = id_of(stream);
        // Pending work still completes before the stream's resources go away.
        let drained = self.drain(id);
        match self.streams.remove(&id) {
            Some(_) => Self::status(drained),
            None => CUDA_ERROR_INVALID_HANDLE,
        }
    }

    fn stream_synchronize(&self, stream: CUstream) -> CUresult {
        if stream.is_null() {
            return Self::status(self.drain_blocking_streams());
        }
        Self::status(self.drain(id_of(stream)))
    }

    fn stream_query(&self, stream: CUstream) -> CUresult {
        if stream.is_null() {
            return CUDA_SUCCESS;
        }
        let id = id_of(stream);
        let op = match self.streams.get_mut(&id) {
            Some(mut state) => state.queue.pop_front(),
            None => return CUDA_ERROR_INVALID_HANDLE,
        };
        match op {
            // Each query lets the stream make progress by one operation.
            Some(op) => match self.execute(op) {
                Ok(()) => CUDA_ERROR_NOT_READY,
                Err(code) => code,
            },
            None => CUDA_SUCCESS,
        }
    }

    fn stream_get_ctx(&self, stream: CUstream) -> Result<CUcontext, CUresult> {
        self.streams
            .get(&id_of(stream))
            .map(|s| handle(s.ctx))
            .ok_or(CUDA_ERROR_INVALID_HANDLE)
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
        if let Err(code) = self.current_ctx() {
            return code;
        }
        let name = match self.functions.get(&id_of(func)) {
            Some(f) => f.name.clone(),
            None => return CUDA_ERROR_INVALID_HANDLE,
        };
        if grid_dim.contains(&0) || block_dim.contains(&0) {
            return CUDA_ERROR_INVALID_VALUE;
        }
        if block_dim.iter().map(|&d| d as u64).product::<u64>() > MAX_THREADS_PER_BLOCK {
            return CUDA_ERROR_INVALID_VALUE;
        }
        if !kernel_params.is_null() && !extra.is_null() {
            return CUDA_ERROR_INVALID_VALUE;
        }
        let arity = match self.kernels.get(&name) {
            Some(k) => k.arity,
            None => return CUDA_ERROR_LAUNCH_FAILED,
        };
        let (args, via_extra) = match unsafe { Self::collect_args(arity, kernel_params, extra) } {
            Ok(collected) => collected,
            Err(code) => return code,
        };

        self.launches.fetch_add(1, Ordering::SeqCst);
        let record = LaunchRecord {
            kernel: name,
            grid: grid_dim,
            block: block_dim,
            shared_mem_bytes,
            args,
            via_extra,
            stream: id_of(stream),
        };
        self.submit(stream, StreamOp::Launch(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> EmulatedDriver {
        let emu = EmulatedDriver::new();
        assert_eq!(emu.init(0), CUDA_SUCCESS);
        emu.ctx_create(0, 0).unwrap();
        emu
    }

    #[test]
    fn calls_before_init_fail() {
        let emu = EmulatedDriver::new();
        assert_eq!(emu.device_get_count(), Err(CUDA_ERROR_NOT_INITIALIZED));
        assert_eq!(emu.mem_alloc(16), Err(CUDA_ERROR_NOT_INITIALIZED));
    }

    #[test]
    fn allocation_without_context_is_invalid_context() {
        let emu = EmulatedDriver::new();
        emu.init(0);
        assert_eq!(emu.mem_alloc(16), Err(CUDA_ERROR_INVALID_CONTEXT));
    }

    #[test]
    fn out_of_memory_is_reported() {
        let emu = EmulatedDriver::with_devices(1, 1024);
        emu.init(0);
        emu.ctx_create(0, 0).unwrap();
        let a = emu.mem_alloc(1000).unwrap();
        assert_eq!(emu.mem_alloc(100), Err(CUDA_ERROR_OUT_OF_MEMORY));
        assert_eq!(emu.mem_free(a), CUDA_SUCCESS);
        assert!(emu.mem_alloc(100).is_ok());
    }

    #[test]
    fn double_free_is_rejected() {
        let emu = ready();
        let a = emu.mem_alloc(64).unwrap();
        assert_eq!(emu.mem_free(a), CUDA_SUCCESS);
        assert_eq!(emu.mem_free(a), CUDA_ERROR_INVALID_VALUE);
    }

    #[test]
    fn out_of_range_copy_is_rejected() {
        let emu = ready();
        let a = emu.mem_alloc(8).unwrap();
        let host = [0u8; 16];
        let res = unsafe { emu.memcpy_htod(a, host.as_ptr() as *const c_void, 16) };
        assert_eq!(res, CUDA_ERROR_INVALID_VALUE);
    }

    #[test]
    fn entries_are_parsed_from_ptx_text() {
        let ptx = ".version 7.0\n.visible .entry add(\n.param .u64 c\n)\n.entry scale (\n";
        assert_eq!(parse_entries(ptx).unwrap(), vec!["add", "scale"]);
        assert_eq!(parse_entries("garbage"), Err(CUDA_ERROR_INVALID_IMAGE));
    }

    #[test]
    fn query_makes_progress() {
        let emu = ready();
        let a = emu.mem_alloc(4).unwrap();
        let b = emu.mem_alloc(4).unwrap();
        let s = emu.stream_create(STREAM_NON_BLOCKING).unwrap();
        assert_eq!(emu.memcpy_dtod_async(b, a, 4, s), CUDA_SUCCESS);
        assert_eq!(emu.pending(s), 1);
        assert_eq!(emu.stream_query(s), CUDA_ERROR_NOT_READY);
        assert_eq!(emu.stream_query(s), CUDA_SUCCESS);
    }

    #[test]
    fn destroying_context_releases_children() {
        let emu = EmulatedDriver::new();
        emu.init(0);
        let ctx = emu.ctx_create(0, 0).unwrap();
        emu.mem_alloc(32).unwrap();
        emu.stream_create(0).unwrap();
        assert_eq!(emu.live_allocations(), 1);
        assert_eq!(emu.ctx_destroy(ctx), CUDA_SUCCESS);
        assert_eq!(emu.live_allocations(), 0);
        assert_eq!(emu.live_streams(), 0);
        assert_eq!(emu.ctx_destroy(ctx), CUDA_ERROR_INVALID_CONTEXT);
    }
}
