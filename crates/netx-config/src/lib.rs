//! Configuration loading, validation and CLI overrides.

mod cli;
mod defaults;
mod duration;
mod loader;
mod types;
mod validate;

pub use cli::{CliOverrides, apply_overrides};
pub use loader::{ConfigError, load_config, parse_config};
pub use types::*;
pub use validate::{validate_config, validate_node_shape};
