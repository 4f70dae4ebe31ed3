//! External kernel compiler invocation.

use std::path::{Path, PathBuf};
use std::process::Command;

use cuhost_core::config::CompilerConfig;
use tracing::debug;

use crate::error::{CuError, Result};

/// Turns a kernel source file into a loadable image on disk.
pub trait ImageCompiler {
    /// Compile `source`, returning the path of the produced image.
    fn compile(&self, source: &Path) -> Result<PathBuf>;

    /// Whether the image should survive after it has been loaded.
    fn keep_image(&self) -> bool {
        false
    }
}

/// Runs `nvcc --ptx <source>` (or a configured equivalent).
///
/// The image is expected at `<work_dir>/<source stem>.<image_extension>`.
#[derive(Debug, Clone)]
pub struct NvccCompiler {
    program: String,
    args: Vec<String>,
    image_extension: String,
    work_dir: PathBuf,
    keep_image: bool,
}

impl Default for NvccCompiler {
    fn default() -> Self {
        Self::from_config(&CompilerConfig::default())
    }
}

impl NvccCompiler {
    pub fn from_config(config: &CompilerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            image_extension: config.image_extension.clone(),
            work_dir: config.work_dir.clone(),
            keep_image: config.keep_image,
        }
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn keep(mut self, keep: bool) -> Self {
        self.keep_image = keep;
        self
    }

    /// Where the image for `source` is expected to appear.
    pub fn image_path(&self, source: &Path) -> Result<PathBuf> {
        let stem = source.file_stem().ok_or_else(|| {
            CuError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file stem", source.display()),
            ))
        })?;
        let mut name = stem.to_os_string();
        name.push(".");
        name.push(&self.image_extension);
        Ok(self.work_dir.join(name))
    }
}

impl ImageCompiler for NvccCompiler {
    fn compile(&self, source: &Path) -> Result<PathBuf> {
        let image = self.image_path(source)?;
        let source = if source.is_absolute() {
            source.to_path_buf()
        } else {
            std::env::current_dir()?.join(source)
        };

        debug!(
            "running {} {} {} in {}",
            self.program,
            self.args.join(" "),
            source.display(),
            self.work_dir.display()
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&source)
            .current_dir(&self.work_dir)
            .output()
            .map_err(|e| CuError::Compile {
                program: self.program.clone(),
                status: "failed to start".to_string(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(CuError::Compile {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !image.is_file() {
            return Err(CuError::ArtifactMissing(image));
        }

        debug!("compiled {} -> {}", source.display(), image.display());
        Ok(image)
    }

    fn keep_image(&self) -> bool {
        self.keep_image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_path_uses_stem_and_extension() {
        let c = NvccCompiler::default().work_dir("/tmp/build");
        assert_eq!(
            c.image_path(Path::new("kernels/add.cu")).unwrap(),
            PathBuf::from("/tmp/build/add.ptx")
        );
    }

    #[test]
    fn missing_program_is_a_compile_error() {
        let dir = tempfile::tempdir().unwrap();
        let c = NvccCompiler::default()
            .program("cuhost-no-such-compiler")
            .work_dir(dir.path());
        match c.compile(Path::new("add.cu")) {
            Err(CuError::Compile { status, .. }) => assert_eq!(status, "failed to start"),
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn failing_program_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let c = NvccCompiler::default()
            .program("sh")
            .args(["-c", "echo 'add.cu(3): error: bad' >&2; exit 2"])
            .work_dir(dir.path());
        match c.compile(Path::new("add.cu")) {
            Err(CuError::Compile { stderr, .. }) => assert!(stderr.contains("error: bad")),
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn success_without_artifact_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let c = NvccCompiler::default()
            .program("true")
            .args(Vec::<String>::new())
            .work_dir(dir.path());
        match c.compile(Path::new("add.cu")) {
            Err(CuError::ArtifactMissing(path)) => assert_eq!(path, dir.path().join("add.ptx")),
            other => panic!("expected ArtifactMissing, got {:?}", other),
        }
    }
}
