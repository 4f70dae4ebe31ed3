pub mod config;
pub mod error;

pub use config::CuhostConfig;
pub use error::CoreError;
