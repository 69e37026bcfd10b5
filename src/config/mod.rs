// src/config/mod.rs

//! Configuration loading and validation for ipcrun.
//!
//! - `model.rs`: the TOML-backed data model (transport timings, profiles).
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: `RawConfigFile` → `ConfigFile` with duration parsing.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_optional};
pub use model::{ConfigFile, DefaultsSection, ProfileConfig, RawConfigFile, TransportSection};
pub use validate::parse_duration;
