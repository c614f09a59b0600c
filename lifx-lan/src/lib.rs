//! LIFX LAN client runtime: per-device UDP sessions, broadcast discovery and configuration.

pub mod config;
pub mod device;
pub mod discovery;

pub use config::{Config, ConfigError};
pub use device::{
    Device, DeviceError, RequestOptions, RosterEvent, Transition, WaveformEffect, FIRE_INTERVAL,
};
pub use discovery::Discovery;
