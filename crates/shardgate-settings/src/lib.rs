//! # shardgate-settings
//!
//! Configuration for the shardgate gateway, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **JSON file**: passed with `--config`, merged over defaults
//! 3. **Environment variables**: `SHARDGATE_*` overrides (highest priority)
//!
//! The merged result is validated before it is returned; out-of-range values
//! fail the load instead of being clamped.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, apply_env_overrides_from, load_settings, parse_bool};
pub use types::*;
