//! Shared constants and run configuration.

pub mod config;
pub mod constants;

pub use config::{
    ClipConfig, CoaddConfig, ConfigError, IndexWindow, PixelWindow, RunConfig, SnrLimits,
    VelocityGridConfig,
};
