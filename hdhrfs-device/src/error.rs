//! Error types for device communication.

use thiserror::Error;

/// Errors raised while commanding the tuner or pulling its stream.
///
/// None of these are fatal to the daemon: a failed tune or stream start
/// leaves the tuner untuned and the operation is retried on the next read.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Malformed tuner address string.
    #[error("Invalid tuner address: {0:?}")]
    BadAddress(String),

    /// The control tool could not be spawned at all.
    #[error("Device control tool unreachable: {0}")]
    Unreachable(#[source] std::io::Error),

    /// The control tool ran but reported failure.
    #[error("Device command `{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },

    /// The control tool did not answer within the bounded interval.
    #[error("Device command `{command}` timed out")]
    CommandTimeout { command: String },

    /// Tuning to a physical channel code was rejected.
    #[error("Failed to tune channel {channel}: {detail}")]
    TuneFailed { channel: String, detail: String },

    /// Selecting the program number within the multiplex was rejected.
    #[error("Failed to select program {program}: {detail}")]
    ProgramFailed { program: u32, detail: String },

    /// The stream session could not be started.
    #[error("Failed to start stream: {0}")]
    StreamStart(String),

    /// The stream session ended from the device side.
    #[error("Device stream closed")]
    StreamClosed,

    /// I/O error while talking to the stream session.
    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),
}
