// src/config/mod.rs - Configuration module
// Tree location: ./src/config/mod.rs

//! Global options and per-device parameter lists

/// Settings and list parsing
pub mod settings;

pub use settings::{parse_list, Settings, SettingsError};
