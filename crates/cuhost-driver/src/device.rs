//! Driver initialization and device queries.

use std::fmt;
use std::sync::Arc;

use cuhost_core::config::DriverConfig;
use tracing::debug;

use crate::api::{CUdevice, DriverApi};
use crate::error::{CuError, Result};
use crate::status::check;
use crate::sys::CudaDriver;

/// An initialized driver.
///
/// Constructing one runs `cuInit`, so holding a `Cuda` is proof that every
/// other call is legal.
#[derive(Clone)]
pub struct Cuda {
    driver: Arc<dyn DriverApi>,
}

impl fmt::Debug for Cuda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cuda").finish_non_exhaustive()
    }
}

impl Cuda {
    /// Load the system driver library and initialize it.
    pub fn load() -> Result<Self> {
        Self::load_with(&DriverConfig::default())
    }

    /// Load the driver named by `config` (or the platform default) and
    /// initialize it with the configured flags.
    pub fn load_with(config: &DriverConfig) -> Result<Self> {
        let driver = CudaDriver::load_from(config.library_path.as_deref())
            .map_err(CuError::DriverUnavailable)?;
        Self::with_driver_flags(driver, config.init_flags)
    }

    /// Initialize an already-loaded driver.
    pub fn with_driver(driver: Arc<dyn DriverApi>) -> Result<Self> {
        Self::with_driver_flags(driver, 0)
    }

    pub fn with_driver_flags(driver: Arc<dyn DriverApi>, flags: u32) -> Result<Self> {
        check(driver.init(flags))?;
        debug!("cuInit({}) succeeded", flags);
        Ok(Self { driver })
    }

    pub fn driver(&self) -> &Arc<dyn DriverApi> {
        &self.driver
    }

    pub fn driver_version(&self) -> Result<i32> {
        Ok(self.driver.driver_get_version()?)
    }

    pub fn device_count(&self) -> Result<usize> {
        Ok(self.driver.device_get_count()? as usize)
    }

    pub fn device(&self, ordinal: i32) -> Result<Device> {
        let raw = self.driver.device_get(ordinal)?;
        Ok(Device {
            cuda: self.clone(),
            ordinal,
            raw,
        })
    }

    pub fn devices(&self) -> Result<Vec<Device>> {
        (0..self.device_count()? as i32)
            .map(|ordinal| self.device(ordinal))
            .collect()
    }

    /// Symbolic name for a status, as reported by the loaded driver.
    pub fn error_name(&self, code: i32) -> &'static str {
        self.driver.error_name(code)
    }

    pub fn error_string(&self, code: i32) -> &'static str {
        self.driver.error_string(code)
    }
}

/// Device attributes (CU_DEVICE_ATTRIBUTE_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAttribute {
    MaxThreadsPerBlock,
    MaxBlockDimX,
    MaxBlockDimY,
    MaxBlockDimZ,
    MaxGridDimX,
    MaxGridDimY,
    MaxGridDimZ,
    MaxSharedMemoryPerBlock,
    WarpSize,
    MaxRegistersPerBlock,
    ClockRate,
    MultiprocessorCount,
    UnifiedAddressing,
    ComputeCapabilityMajor,
    ComputeCapabilityMinor,
    ManagedMemory,
    /// Any attribute not named above.
    Raw(i32),
}

impl DeviceAttribute {
    pub fn raw(self) -> i32 {
        match self {
            DeviceAttribute::MaxThreadsPerBlock => 1,
            DeviceAttribute::MaxBlockDimX => 2,
            DeviceAttribute::MaxBlockDimY => 3,
            DeviceAttribute::MaxBlockDimZ => 4,
            DeviceAttribute::MaxGridDimX => 5,
            DeviceAttribute::MaxGridDimY => 6,
            DeviceAttribute::MaxGridDimZ => 7,
            DeviceAttribute::MaxSharedMemoryPerBlock => 8,
            DeviceAttribute::WarpSize => 10,
            DeviceAttribute::MaxRegistersPerBlock => 12,
            DeviceAttribute::ClockRate => 13,
            DeviceAttribute::MultiprocessorCount => 16,
            DeviceAttribute::UnifiedAddressing => 41,
            DeviceAttribute::ComputeCapabilityMajor => 75,
            DeviceAttribute::ComputeCapabilityMinor => 76,
            DeviceAttribute::ManagedMemory => 83,
            DeviceAttribute::Raw(v) => v,
        }
    }
}

/// A device ordinal resolved by the driver.
#[derive(Clone)]
pub struct Device {
    cuda: Cuda,
    ordinal: i32,
    raw: CUdevice,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("ordinal", &self.ordinal)
            .field("raw", &self.raw)
            .finish()
    }
}

impl Device {
    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn raw(&self) -> CUdevice {
        self.raw
    }

    pub fn cuda(&self) -> &Cuda {
        &self.cuda
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.cuda.driver.device_get_name(self.raw)?)
    }

    /// Total device memory in bytes.
    pub fn total_memory(&self) -> Result<usize> {
        Ok(self.cuda.driver.device_total_mem(self.raw)?)
    }

    /// The device's 16-byte UUID.
    pub fn uuid(&self) -> Result<[u8; 16]> {
        Ok(self.cuda.driver.device_get_uuid(self.raw)?)
    }

    /// UUID in the driver's `GPU-xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form.
    pub fn uuid_string(&self) -> Result<String> {
        let bytes = self.uuid()?;
        let hex = hex::encode(bytes);
        Ok(format!(
            "GPU-{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        ))
    }

    pub fn attribute(&self, attr: DeviceAttribute) -> Result<i32> {
        Ok(self.cuda.driver.device_get_attribute(attr.raw(), self.raw)?)
    }

    pub fn compute_capability(&self) -> Result<(i32, i32)> {
        let major = self.attribute(DeviceAttribute::ComputeCapabilityMajor)?;
        let minor = self.attribute(DeviceAttribute::ComputeCapabilityMinor)?;
        Ok((major, minor))
    }
}
