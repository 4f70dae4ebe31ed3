use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "CUHOST_CONFIG";

/// Top-level configuration, loaded from cuhost.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CuhostConfig {
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub compiler: CompilerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Explicit driver library path (None = search the platform defaults)
    pub library_path: Option<String>,
    /// Flags passed to cuInit
    #[serde(default)]
    pub init_flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Device ordinal used when no explicit device is requested
    #[serde(default)]
    pub device: i32,
    /// Host thread scheduling policy while waiting on the device
    #[serde(default)]
    pub schedule: SchedulePolicy,
    /// Allow mapping page-locked host memory into the device address space
    #[serde(default)]
    pub map_host: bool,
}

/// Context scheduling policy (CU_CTX_SCHED_*).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePolicy {
    #[default]
    Auto,
    Spin,
    Yield,
    BlockingSync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// External compiler executable
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the source path
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Extension of the image the compiler writes next to the source stem
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    /// Directory the compiler runs in and writes its image to
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Leave the compiled image on disk after loading
    #[serde(default)]
    pub keep_image: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            device: 0,
            schedule: SchedulePolicy::default(),
            map_host: false,
        }
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            image_extension: default_image_extension(),
            work_dir: default_work_dir(),
            keep_image: false,
        }
    }
}

impl ContextConfig {
    /// Raw CU_CTX_* flag word for this configuration.
    pub fn flags_bits(&self) -> u32 {
        let sched = match self.schedule {
            SchedulePolicy::Auto => 0x00,
            SchedulePolicy::Spin => 0x01,
            SchedulePolicy::Yield => 0x02,
            SchedulePolicy::BlockingSync => 0x04,
        };
        if self.map_host {
            sched | 0x08
        } else {
            sched
        }
    }
}

impl CuhostConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: CuhostConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.compiler.program.trim().is_empty() {
            return Err(CoreError::Config("compiler.program is empty".to_string()));
        }
        if self.compiler.image_extension.is_empty()
            || self.compiler.image_extension.contains(['.', '/', '\\'])
        {
            return Err(CoreError::Config(format!(
                "compiler.image_extension {:?} is not a bare extension",
                self.compiler.image_extension
            )));
        }
        if self.context.device < 0 {
            return Err(CoreError::Config(format!(
                "context.device must be non-negative, got {}",
                self.context.device
            )));
        }
        Ok(())
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. `CUHOST_CONFIG` if set
/// 2. System-wide config: `%PROGRAMDATA%\cuhost\cuhost.toml` (Windows) or `/etc/cuhost/cuhost.toml`
/// 3. Local fallback: `./cuhost.toml`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    #[cfg(windows)]
    {
        let programdata =
            std::env::var("PROGRAMDATA").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = PathBuf::from(programdata).join("cuhost").join("cuhost.toml");
        if system_path.exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = Path::new("/etc/cuhost/cuhost.toml");
        if system_path.exists() {
            return system_path.to_path_buf();
        }
    }
    PathBuf::from("cuhost.toml")
}

fn default_program() -> String {
    "nvcc".to_string()
}

fn default_args() -> Vec<String> {
    vec!["--ptx".to_string()]
}

fn default_image_extension() -> String {
    "ptx".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: CuhostConfig = toml::from_str("").unwrap();
        assert_eq!(config.compiler.program, "nvcc");
        assert_eq!(config.compiler.args, vec!["--ptx".to_string()]);
        assert_eq!(config.compiler.image_extension, "ptx");
        assert!(!config.compiler.keep_image);
        assert_eq!(config.context.device, 0);
        assert_eq!(config.context.schedule, SchedulePolicy::Auto);
        assert!(config.driver.library_path.is_none());
    }

    #[test]
    fn schedule_and_map_host_fold_into_flags() {
        let config: CuhostConfig = toml::from_str(
            r#"
            [context]
            schedule = "blocking_sync"
            map_host = true
            "#,
        )
        .unwrap();
        assert_eq!(config.context.flags_bits(), 0x04 | 0x08);
    }

    #[test]
    fn dotted_extension_is_rejected() {
        let mut config = CuhostConfig::default();
        config.compiler.image_extension = ".ptx".to_string();
        match config.validate() {
            Err(CoreError::Config(msg)) => assert!(msg.contains("image_extension")),
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
