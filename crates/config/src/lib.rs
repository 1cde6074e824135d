//! Configuration for the RecodeX transcoding daemon
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and validation of profile references.

pub mod config;

pub use config::*;
