//! Command line and configuration file handling

mod args;
mod settings;

pub use args::{Args, Command, PpmStep, DEFAULT_STEPS};
pub use settings::{ClockConfig, ConfigError, LOCAL_CONFIG_FILE};
