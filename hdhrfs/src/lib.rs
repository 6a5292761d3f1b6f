//! hdhrfs library - live broadcast channels as ordinary files.
//!
//! One physical tuner can only decode one program at a time. This crate
//! wraps that tuner in a directory of always-present channel files: reading
//! a channel file retunes the hardware if needed and serves the live
//! transport stream out of a memory-mapped ring buffer, so unmodified media
//! players can play broadcast channels by path.
//!
//! - [`ring`]: fixed-capacity byte ring backed by a doubled memory mapping
//! - [`capture`]: background worker streaming tuner output into the ring
//! - [`channels`]: configured virtual channels and path lookup
//! - [`server`]: owned server state and the channel-switch protocol
//! - [`fs`]: the per-call filesystem contract over the above
//! - [`mount`]: FUSE dispatch adapter for [`fs`]
//! - [`reaper`]: idle-timeout reclamation of the tuner
//! - [`config`]: channel-map config file loader

pub mod capture;
pub mod channels;
pub mod config;
pub mod fs;
pub mod logging;
pub mod mount;
pub mod reaper;
pub mod ring;
pub mod server;

#[cfg(test)]
pub(crate) mod mock;

pub use channels::{ChannelMap, VirtualChannel};
pub use config::{Config, ConfigError};
pub use fs::{ChannelFs, FsError};
pub use reaper::IdleReaper;
pub use ring::{AllocationError, RingBuffer};
pub use server::{ServeConfig, ServerContext, SwitchError};
