//! Device protocol client for hdhrfs.
//!
//! The daemon never speaks the tuner control protocol itself. Everything the
//! capture engine needs from the hardware goes through the [`DeviceClient`]
//! and [`DeviceStream`] traits defined here, and the shipped implementation
//! [`HdhrConfig`] delegates to the vendor `hdhomerun_config` command-line
//! tool for tuning, program selection, streaming, discovery and scanning.

pub mod client;
pub mod error;
pub mod hdhr_config;
pub mod types;

pub use client::{DeviceClient, DeviceStream};
pub use error::DeviceError;
pub use hdhr_config::{DiscoveredDevice, HdhrConfig, SaveStream, ScanStream};
pub use types::TunerAddress;
