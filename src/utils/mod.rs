pub mod configuration;

pub use configuration::{AptaForgeConfig, ConfigurationManager, PipelineError};
