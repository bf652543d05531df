//! # lqbench-settings
//!
//! Configuration for lqbench, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`BenchSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `SUT_URL`, `NS`, `VUS_COUNT`, ... (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_with};
pub use types::{
    BenchSettings, DeadlinePolicy, MAX_BURST_SIZE, ScenarioSettings, TargetSettings,
    WorkloadSettings,
};
