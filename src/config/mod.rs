//! Monitor Configuration Module
//!
//! Loaded from TOML once at startup and passed by value into the aggregates
//! that need it. There is no global config handle.
//!
//! ## Loading Order
//!
//! 1. `PULSEWATCH_CONFIG` environment variable (path to TOML file)
//! 2. `pulsewatch.toml` in the current working directory
//! 3. Built-in defaults
//!
//! CLI flags and environment variables are applied on top in `main`.

mod monitor_config;
pub mod defaults;
pub mod validation;

pub use monitor_config::*;
