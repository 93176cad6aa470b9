pub mod config;
pub mod error;
pub mod money;
pub mod quality;
pub mod types;

pub use config::{AppConfig, FileConfig};
pub use error::ConfigError;
pub use money::Usd;
pub use quality::*;
pub use types::*;
