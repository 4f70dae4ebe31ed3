//! Safe host-side bindings for the CUDA driver API.
//!
//! [`Cuda`] wraps a [`DriverApi`] implementation: the dynamically loaded
//! system driver ([`sys::CudaDriver`]) or the in-process [`EmulatedDriver`].
//! Everything else (contexts, buffers, modules, streams, launches) borrows
//! from it.

pub mod api;
pub mod compiler;
pub mod context;
pub mod device;
pub mod emulator;
pub mod error;
pub mod launch;
pub mod memory;
pub mod module;
pub mod registry;
pub mod status;
pub mod stream;
pub mod sys;

pub use api::DriverApi;
pub use compiler::{ImageCompiler, NvccCompiler};
pub use context::{Context, ContextFlags, ContextHandle};
pub use device::{Cuda, Device, DeviceAttribute};
pub use emulator::EmulatedDriver;
pub use error::{CuError, Result};
pub use launch::{launch, Dim3, ExtraArgs, KernelArg, KernelParams, LaunchConfig, WideKernelArg};
pub use memory::{AttachFlags, DeviceBuffer, DevicePtr, DeviceScalar};
pub use module::{Function, Module};
pub use registry::DeviceRegistry;
pub use status::CUresult;
pub use stream::{Stream, StreamFlags, StreamStatus};
