//! Client-side traits for the tuner device.
//!
//! The capture engine is written against these traits so it can be driven by
//! the real control tool in production and by a scripted device in tests.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;

use crate::error::DeviceError;

/// Command half of the device: retune the hardware and open stream sessions.
///
/// A client is bound to one tuner on one device for its lifetime; selecting
/// the device and tuner index happens when the client is constructed.
pub trait DeviceClient: Send + Sync + 'static {
    /// Stream session type produced by [`DeviceClient::start_stream`].
    type Stream: DeviceStream;

    /// Tune to a physical channel code (e.g. `8vsb:43`).
    fn tune(&self, channel: &str) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Select the program number within the tuned multiplex.
    fn set_program(&self, program: u32) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Begin a stream session on the currently tuned channel.
    fn start_stream(&self) -> impl Future<Output = Result<Self::Stream, DeviceError>> + Send;

    /// Best-effort release of the tuner (untune), so an abandoned tuner does
    /// not keep its hardware lock.
    fn release(&self) -> impl Future<Output = ()> + Send;
}

/// One live stream session.
pub trait DeviceStream: Send + 'static {
    /// Pull the next chunk of transport-stream bytes.
    ///
    /// `Ok(None)` means the device produced nothing within `timeout`; that is
    /// a quiet interval, not an error, and the caller decides whether to keep
    /// polling. `Err(DeviceError::StreamClosed)` means the session ended on
    /// the device side.
    fn recv(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Bytes>, DeviceError>> + Send;

    /// Stop the session. Consumes the stream; when this returns, the device
    /// is no longer streaming.
    fn stop(self) -> impl Future<Output = ()> + Send;
}
