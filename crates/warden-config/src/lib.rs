//! Configuration system for Warden stateful session components.
//!
//! Provides TOML-based configuration with:
//! - Cache-wide defaults (`[cache]`): idle timeout, sweep interval, size bound,
//!   eviction action and default access timeout
//! - Per-component overrides (`[bean.<name>]`) layered over the defaults
//! - Per-method settings (`[bean.<name>.method.<method>]`): access timeout and
//!   session-terminating remove methods
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{ConfigSource, LoadedConfig, load_config, load_config_file};
pub use error::{ConfigError, Result};
pub use types::*;
