pub mod config;
pub mod errors;

pub use config::{AppConfig, ModelConfig, RunOptions};
pub use errors::{Result, TranslateError};
