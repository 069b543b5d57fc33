//! Connectivity settings: typed sections with production defaults, loaded from
//! an optional JSON file and overridden by `TWINBRIDGE_*` environment variables.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
