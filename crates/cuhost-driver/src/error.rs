use std::path::PathBuf;

use crate::launch::Dim3;
use crate::status::{
    error_name, error_string, CUresult, CUDA_ERROR_FILE_NOT_FOUND, CUDA_ERROR_INVALID_VALUE,
    CUDA_ERROR_NOT_FOUND, CUDA_ERROR_NOT_INITIALIZED,
};

pub type Result<T> = std::result::Result<T, CuError>;

#[derive(Debug, thiserror::Error)]
pub enum CuError {
    /// Status reported by the driver, passed through unchanged.
    #[error("{}: {} ({code})", error_name(*.code), error_string(*.code))]
    Driver { code: CUresult },

    #[error("CUDA driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("unsupported host buffer type, expected a Vec of a fixed-width scalar")]
    UnsupportedHostType,

    #[error("size mismatch: host buffer is {host} bytes, device buffer is {device} bytes")]
    SizeMismatch { host: usize, device: usize },

    #[error("invalid launch geometry: grid {grid}, block {block}")]
    InvalidGeometry { grid: Dim3, block: Dim3 },

    #[error("kernel_params and extra are mutually exclusive")]
    ConflictingLaunchArgs,

    #[error("kernel expects {expected} parameters, got {actual}")]
    ParamCountMismatch { expected: usize, actual: usize },

    #[error("invalid name {0:?}: contains a NUL byte")]
    InvalidName(String),

    #[error("{program} exited with {status}: {stderr}")]
    Compile {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("compiled image not found at {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device slot {0} is not registered")]
    SlotNotFound(u32),

    #[error("device slot {0} is already registered")]
    SlotOccupied(u32),
}

impl CuError {
    /// Driver-style status code for this error.
    ///
    /// Driver errors return their own code. Contract violations map to
    /// `CUDA_ERROR_INVALID_VALUE`, compile-and-load failures to
    /// `CUDA_ERROR_FILE_NOT_FOUND`, registry misses to `CUDA_ERROR_NOT_FOUND`.
    pub fn code(&self) -> CUresult {
        match self {
            CuError::Driver { code } => *code,
            CuError::DriverUnavailable(_) => CUDA_ERROR_NOT_INITIALIZED,
            CuError::Compile { .. } | CuError::ArtifactMissing(_) | CuError::Io(_) => {
                CUDA_ERROR_FILE_NOT_FOUND
            }
            CuError::SlotNotFound(_) => CUDA_ERROR_NOT_FOUND,
            CuError::UnsupportedHostType
            | CuError::SizeMismatch { .. }
            | CuError::InvalidGeometry { .. }
            | CuError::ConflictingLaunchArgs
            | CuError::ParamCountMismatch { .. }
            | CuError::InvalidName(_)
            | CuError::SlotOccupied(_) => CUDA_ERROR_INVALID_VALUE,
        }
    }

    /// True when this is a driver status equal to `code`.
    pub fn is_driver(&self, code: CUresult) -> bool {
        matches!(self, CuError::Driver { code: c } if *c == code)
    }
}

impl From<CUresult> for CuError {
    fn from(code: CUresult) -> Self {
        CuError::Driver { code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::CUDA_ERROR_OUT_OF_MEMORY;

    #[test]
    fn driver_error_display_carries_name_and_code() {
        let err = CuError::from(CUDA_ERROR_OUT_OF_MEMORY);
        assert_eq!(err.to_string(), "CUDA_ERROR_OUT_OF_MEMORY: out of memory (2)");
        assert_eq!(err.code(), CUDA_ERROR_OUT_OF_MEMORY);
        assert!(err.is_driver(CUDA_ERROR_OUT_OF_MEMORY));
    }

    #[test]
    fn compile_family_shares_file_not_found() {
        let compile = CuError::Compile {
            program: "nvcc".into(),
            status: "exit status: 1".into(),
            stderr: "syntax error".into(),
        };
        let missing = CuError::ArtifactMissing(PathBuf::from("/tmp/add.ptx"));
        let io = CuError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro"));
        assert_eq!(compile.code(), CUDA_ERROR_FILE_NOT_FOUND);
        assert_eq!(missing.code(), CUDA_ERROR_FILE_NOT_FOUND);
        assert_eq!(io.code(), CUDA_ERROR_FILE_NOT_FOUND);
    }

    #[test]
    fn contract_errors_are_invalid_value() {
        assert_eq!(CuError::ConflictingLaunchArgs.code(), CUDA_ERROR_INVALID_VALUE);
        assert_eq!(CuError::UnsupportedHostType.code(), CUDA_ERROR_INVALID_VALUE);
        assert_eq!(CuError::SlotNotFound(3).code(), CUDA_ERROR_NOT_FOUND);
    }
}
