//! Channel-map config file loader.
//!
//! The file format is the one the `channelscan` utility writes: a `[global]`
//! section carrying the tuner identity and a `[channelmap]` section with one
//! `name = channel program [display name...]` entry per virtual channel.
//! The parser lowers the file to `(section, name, value)` triples and
//! validates each into the registry; every malformed entry is fatal at load
//! time so the daemon never mounts a half-usable channel set.

use std::io;
use std::path::Path;

use hdhrfs_device::{DeviceError, TunerAddress};
use log::warn;
use thiserror::Error;

use crate::channels::{ChannelMap, VirtualChannel};

/// Fatal configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },

    /// `key = value` before any `[section]` header.
    #[error("Line {line}: entry outside of any section")]
    OrphanEntry { line: usize },

    /// A line that is neither a section header nor `key = value`.
    #[error("Line {line}: malformed entry {entry:?}")]
    Malformed { line: usize, entry: String },

    /// A channelmap entry whose value is not `channel program [display...]`,
    /// including a missing or zero program number.
    #[error("Line {line}: invalid channel {name:?}: {detail}")]
    BadChannel {
        line: usize,
        name: String,
        detail: String,
    },

    #[error("Line {line}: duplicate channel {name:?}")]
    DuplicateChannel { line: usize, name: String },

    #[error("Line {line}: invalid tuner identity: {source}")]
    BadTuner { line: usize, source: DeviceError },

    /// No `tuners =` entry in `[global]`.
    #[error("Missing tuner identity ([global] tuners = device:index)")]
    MissingTuner,
}

/// Validated configuration: one tuner, an ordered channel map.
#[derive(Debug)]
pub struct Config {
    pub tuner: TunerAddress,
    pub channels: ChannelMap,
}

/// Load and validate a config file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse(&text)
}

/// Parse config text. Split out from [`load`] so tests can feed literals.
pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let mut tuner: Option<TunerAddress> = None;
    let mut channels: Vec<VirtualChannel> = Vec::new();
    let mut section: Option<String> = None;

    for (line, raw) in text.lines().enumerate() {
        let line = line + 1;
        let entry = raw.trim();
        if entry.is_empty() || entry.starts_with('#') || entry.starts_with(';') {
            continue;
        }

        if let Some(name) = entry.strip_prefix('[').and_then(|e| e.strip_suffix(']')) {
            section = Some(name.trim().to_ascii_lowercase());
            continue;
        }

        let (name, value) = entry.split_once('=').ok_or_else(|| ConfigError::Malformed {
            line,
            entry: entry.to_string(),
        })?;
        let (name, value) = (name.trim(), value.trim());
        let section = section
            .as_deref()
            .ok_or(ConfigError::OrphanEntry { line })?;

        match section {
            "global" => match name {
                "tuners" => {
                    tuner = Some(
                        value
                            .parse()
                            .map_err(|source| ConfigError::BadTuner { line, source })?,
                    );
                }
                other => warn!("Line {}: ignoring unknown global entry {:?}", line, other),
            },
            "channelmap" => {
                if channels.iter().any(|c| c.name == name) {
                    return Err(ConfigError::DuplicateChannel {
                        line,
                        name: name.to_string(),
                    });
                }
                channels.push(parse_channel(line, name, value)?);
            }
            other => warn!("Line {}: ignoring entry in unknown section {:?}", line, other),
        }
    }

    let tuner = tuner.ok_or(ConfigError::MissingTuner)?;
    Ok(Config {
        tuner,
        channels: ChannelMap::new(channels),
    })
}

/// Validate one `name = channel program [display name...]` triple.
fn parse_channel(line: usize, name: &str, value: &str) -> Result<VirtualChannel, ConfigError> {
    let bad = |detail: &str| ConfigError::BadChannel {
        line,
        name: name.to_string(),
        detail: detail.to_string(),
    };

    let mut words = value.split_whitespace();
    let channel = words.next().ok_or_else(|| bad("missing channel code"))?;
    let program = words
        .next()
        .ok_or_else(|| bad("missing program number"))?
        .parse::<u32>()
        .map_err(|_| bad("program number is not a positive integer"))?;
    if program == 0 {
        return Err(bad("program number must be non-zero"));
    }
    let display: Vec<&str> = words.collect();

    Ok(VirtualChannel {
        name: name.to_string(),
        channel: channel.to_string(),
        program,
        display_name: if display.is_empty() {
            None
        } else {
            Some(display.join(" "))
        },
    })
}
