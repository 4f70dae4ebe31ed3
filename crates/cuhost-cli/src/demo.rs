use std::path::Path;
use std::sync::Arc;

use cuhost_core::config::CuhostConfig;
use cuhost_driver::emulator::KernelCall;
use cuhost_driver::{
    kernel_params, Context, ContextFlags, Cuda, DeviceBuffer, EmulatedDriver, LaunchConfig,
    Module, NvccCompiler, Result, Stream, StreamFlags,
};
use tracing::info;

/// Element count the `add` kernel is bounded by.
pub const N: usize = 3;

/// PTX for demos/add.cu.
pub const ADD_PTX: &str = include_str!("add.ptx");

const GRID: u32 = 16;
const BLOCK: u32 = 16;

/// Inputs and output of one add run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRun {
    pub a: Vec<i32>,
    pub b: Vec<i32>,
    pub c: Vec<i32>,
}

/// An emulated driver that knows the `add` kernel.
pub fn emulator() -> Arc<EmulatedDriver> {
    Arc::new(EmulatedDriver::new().with_kernel("add", 3, |call: &mut KernelCall<'_>| {
        let (c, a, b) = (call.arg(0)?, call.arg(1)?, call.arg(2)?);
        let n = (call.threads() as usize).min(N);
        let a: Vec<i32> = call.read(a, n)?;
        let b: Vec<i32> = call.read(b, n)?;
        let sum: Vec<i32> = a.iter().zip(&b).map(|(x, y)| x.wrapping_add(*y)).collect();
        call.write(c, &sum)
    }))
}

/// Compute `c = a + b` on the configured device.
///
/// With `source`, the kernel is compiled by the configured compiler first;
/// otherwise the bundled PTX is loaded.
pub fn run_add(
    cuda: &Cuda,
    config: &CuhostConfig,
    source: Option<&Path>,
    use_async: bool,
) -> Result<AddRun> {
    let device = cuda.device(config.context.device)?;
    let ctx = Context::create(&device, ContextFlags::from_config(&config.context))?;
    info!("using device {}: {}", device.ordinal(), device.name()?);

    let module = match source {
        Some(path) => {
            let nvcc = NvccCompiler::from_config(&config.compiler);
            Module::compile_and_load(&ctx, path, &nvcc)?
        }
        None => Module::load_data(&ctx, ADD_PTX.as_bytes())?,
    };
    let add = module.function("add")?.with_param_count(3);

    let a = vec![100i32; N];
    let b = vec![10i32; N];
    let launch = LaunchConfig::new(GRID, BLOCK);

    let c = if use_async {
        add_async(&ctx, &add, &launch, &a, &b)?
    } else {
        let d_a = DeviceBuffer::from_slice(&ctx, &a)?;
        let d_b = DeviceBuffer::from_slice(&ctx, &b)?;
        let d_c = DeviceBuffer::<i32>::alloc(&ctx, N)?;
        add.launch(&launch, None, &kernel_params![d_c, d_a, d_b])?;
        d_c.to_vec()?
    };

    module.unload()?;
    ctx.destroy()?;
    Ok(AddRun { a, b, c })
}

fn add_async(
    ctx: &Context,
    add: &cuhost_driver::Function<'_>,
    launch: &LaunchConfig,
    a: &[i32],
    b: &[i32],
) -> Result<Vec<i32>> {
    let stream = Stream::new(ctx, StreamFlags::NON_BLOCKING)?;
    let c = add_on_stream(ctx, &stream, add, launch, a, b)?;
    stream.destroy()?;
    Ok(c)
}

fn add_on_stream(
    ctx: &Context,
    stream: &Stream<'_>,
    add: &cuhost_driver::Function<'_>,
    launch: &LaunchConfig,
    a: &[i32],
    b: &[i32],
) -> Result<Vec<i32>> {
    let mut d_a = DeviceBuffer::<i32>::alloc(ctx, N)?;
    let mut d_b = DeviceBuffer::<i32>::alloc(ctx, N)?;
    let d_c = DeviceBuffer::<i32>::alloc(ctx, N)?;
    let mut c = vec![0i32; N];

    // SAFETY: `a`, `b` and `c` outlive the synchronize below, which also
    // runs when queueing fails part way.
    let buffers = (&mut d_a, &mut d_b, &d_c);
    let queued = unsafe { enqueue_add(stream, add, launch, buffers, a, b, &mut c) };
    if let Err(e) = queued {
        let _ = stream.synchronize();
        return Err(e);
    }
    stream.synchronize()?;
    Ok(c)
}

/// # Safety
/// The host slices must stay alive until `stream` has been synchronized.
unsafe fn enqueue_add(
    stream: &Stream<'_>,
    add: &cuhost_driver::Function<'_>,
    launch: &LaunchConfig,
    (d_a, d_b, d_c): (
        &mut DeviceBuffer<'_, i32>,
        &mut DeviceBuffer<'_, i32>,
        &DeviceBuffer<'_, i32>,
    ),
    a: &[i32],
    b: &[i32],
    c: &mut [i32],
) -> Result<()> {
    unsafe {
        d_a.copy_from_host_async(a, stream)?;
        d_b.copy_from_host_async(b, stream)?;
    }
    add.launch(launch, Some(stream), &kernel_params![*d_c, *d_a, *d_b])?;
    unsafe { d_c.copy_to_host_async(c, stream) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulated_add_sync_and_async() {
        let cuda = Cuda::with_driver(emulator()).unwrap();
        let config = CuhostConfig::default();
        for use_async in [false, true] {
            let run = run_add(&cuda, &config, None, use_async).unwrap();
            assert_eq!(run.c, vec![110, 110, 110]);
        }
    }

    #[test]
    fn failed_launch_drains_queued_copies() {
        // no host body for `add`, so the launch fails after the input copies
        let cuda = Cuda::with_driver(Arc::new(EmulatedDriver::new())).unwrap();
        let ctx = Context::create(&cuda.device(0).unwrap(), ContextFlags::default()).unwrap();
        let module = Module::load_data(&ctx, ADD_PTX.as_bytes()).unwrap();
        let add = module.function("add").unwrap();
        let stream = Stream::new(&ctx, StreamFlags::NON_BLOCKING).unwrap();
        let launch = LaunchConfig::new(GRID, BLOCK);

        let err = add_on_stream(&ctx, &stream, &add, &launch, &[1; N], &[2; N]).unwrap_err();
        assert!(err.is_driver(cuhost_driver::status::CUDA_ERROR_LAUNCH_FAILED));
        assert_eq!(stream.query().unwrap(), cuhost_driver::StreamStatus::Idle);
    }

    #[test]
    fn bundled_ptx_declares_add() {
        assert!(ADD_PTX.contains(".visible .entry add("));
    }
}
