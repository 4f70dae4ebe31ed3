//! Loaded device code and its entry points.

use std::ffi::{c_void, CString};
use std::path::Path;

use tracing::{debug, warn};

use crate::api::{CUfunction, CUmodule};
use crate::compiler::ImageCompiler;
use crate::context::Context;
use crate::error::{CuError, Result};
use crate::launch::{launch, KernelParams, LaunchConfig};
use crate::status::{check, error_name, CUDA_SUCCESS};
use crate::stream::Stream;

/// A module loaded into a context. Unloaded exactly once.
pub struct Module<'ctx> {
    ctx: &'ctx Context,
    raw: CUmodule,
    released: bool,
}

impl std::fmt::Debug for Module<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("raw", &self.raw).finish()
    }
}

// SAFETY: module handles are plain driver tokens, valid on any thread while
// their context lives.
unsafe impl Send for Module<'_> {}

fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| CuError::InvalidName(s.to_string()))
}

/// The path's bytes as the driver will see them. Non-UTF-8 names pass through
/// unchanged on Unix.
#[cfg(unix)]
fn c_path(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CuError::InvalidName(path.display().to_string()))
}

#[cfg(not(unix))]
fn c_path(path: &Path) -> Result<CString> {
    match path.to_str() {
        Some(s) => c_string(s),
        None => Err(CuError::InvalidName(path.display().to_string())),
    }
}

impl<'ctx> Module<'ctx> {
    /// Load a module image (cubin, fatbin or PTX) from a file.
    pub fn load(ctx: &'ctx Context, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fname = c_path(path)?;
        ctx.bind()?;
        let raw = ctx.driver().module_load(&fname)?;
        debug!("ModuleLoad({}) -> {:?}", path.display(), raw);
        Ok(Self {
            ctx,
            raw,
            released: false,
        })
    }

    /// Load a module from an in-memory image. PTX text is NUL-terminated
    /// here if it is not already.
    pub fn load_data(ctx: &'ctx Context, image: &[u8]) -> Result<Self> {
        let mut owned;
        let bytes = if image.last() == Some(&0) {
            image
        } else {
            owned = Vec::with_capacity(image.len() + 1);
            owned.extend_from_slice(image);
            owned.push(0);
            &owned[..]
        };
        ctx.bind()?;
        // SAFETY: `bytes` is a complete image that lives across the call.
        let raw = unsafe { ctx.driver().module_load_data(bytes.as_ptr() as *const c_void)? };
        debug!("ModuleLoadData({} bytes) -> {:?}", image.len(), raw);
        Ok(Self {
            ctx,
            raw,
            released: false,
        })
    }

    /// Compile `source` with `compiler`, load the image, then delete it.
    ///
    /// The image is removed whether or not loading succeeded, unless the
    /// compiler asks to keep it.
    pub fn compile_and_load(
        ctx: &'ctx Context,
        source: impl AsRef<Path>,
        compiler: &dyn ImageCompiler,
    ) -> Result<Self> {
        let image = compiler.compile(source.as_ref())?;
        let loaded = Self::load(ctx, &image);
        if compiler.keep_image() {
            debug!("keeping compiled image {}", image.display());
            return loaded;
        }
        let removed = std::fs::remove_file(&image);
        let module = loaded?;
        removed?;
        Ok(module)
    }

    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    /// Resolve an entry point by exact name.
    pub fn function(&self, name: &str) -> Result<Function<'_>> {
        let cname = c_string(name)?;
        self.ctx.bind()?;
        let raw = self.ctx.driver().module_get_function(self.raw, &cname)?;
        Ok(Function {
            ctx: self.ctx,
            raw,
            name: name.to_string(),
            param_count: None,
        })
    }

    pub fn unload(mut self) -> Result<()> {
        self.released = true;
        self.ctx.bind()?;
        let res = self.ctx.driver().module_unload(self.raw);
        debug!("ModuleUnload({:?}) -> {}", self.raw, res);
        check(res)
    }
}

impl Drop for Module<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.ctx.bind() {
            warn!("ModuleUnload on drop could not bind its context: {}", e);
        }
        let res = self.ctx.driver().module_unload(self.raw);
        if res != CUDA_SUCCESS {
            warn!("ModuleUnload on drop failed: {} ({})", error_name(res), res);
        }
    }
}

/// A kernel entry point. Lives as long as the module it came from.
#[derive(Debug, Clone)]
pub struct Function<'m> {
    ctx: &'m Context,
    raw: CUfunction,
    name: String,
    param_count: Option<usize>,
}

impl<'m> Function<'m> {
    /// Declare the kernel's parameter count so launches are checked against it.
    pub fn with_param_count(mut self, count: usize) -> Self {
        self.param_count = Some(count);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_count(&self) -> Option<usize> {
        self.param_count
    }

    pub(crate) fn raw(&self) -> CUfunction {
        self.raw
    }

    pub(crate) fn context(&self) -> &'m Context {
        self.ctx
    }

    /// Launch with `kernelParams`; see [`launch`].
    pub fn launch(
        &self,
        config: &LaunchConfig,
        stream: Option<&Stream<'_>>,
        params: &KernelParams,
    ) -> Result<()> {
        launch(self, config, stream, Some(params), None)
    }
}
