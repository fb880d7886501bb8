//! # nimbus-settings
//!
//! Client configuration loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`NimbusSettings::default()`]
//! 2. **User file**: `~/.nimbus/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `NIMBUS_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, nimbus_home, settings_path};
pub use types::*;
