//! # plexus-settings
//!
//! Layered configuration: compiled defaults, then `~/.plexus/settings.json`,
//! then `PLEXUS_*` environment variables (highest priority).

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
