//! Owned server state and the channel-switch protocol.
//!
//! One [`ServerContext`] holds everything the filesystem handlers and the
//! background tasks share: the device client, the channel map, the ring
//! buffer, the single capture-session slot and the read-activity counter.
//! All of it is internally synchronized, so handlers just carry an
//! `Arc<ServerContext<_>>` instead of reaching for globals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use hdhrfs_device::{DeviceClient, DeviceError};
use log::info;
use thiserror::Error;

use crate::capture::CaptureSession;
use crate::channels::ChannelMap;
use crate::ring::RingBuffer;

/// Tunables for serving reads.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Retry attempts while a reader waits for the producer near the live
    /// edge. A coarse backpressure knob, not a contract.
    pub edge_wait_attempts: u32,
    /// Sleep between those attempts.
    pub edge_wait_interval: Duration,
    /// Reaping period: an unwatched capture is stopped after one full
    /// period without reads.
    pub idle_timeout: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            edge_wait_attempts: 5,
            edge_wait_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Errors from the switch protocol.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// Channel index out of range (never produced for configured paths).
    #[error("Unknown channel index {0}")]
    UnknownChannel(usize),

    /// Retune or stream start failed; no channel is active afterwards and
    /// the next read may retry.
    #[error("Capture failed to start: {0}")]
    Device(#[from] DeviceError),
}

/// Shared server state. The capture worker is the only writer of the ring;
/// read requests and the reaper go through the methods here.
pub struct ServerContext<D: DeviceClient> {
    device: Arc<D>,
    channels: ChannelMap,
    ring: Arc<Mutex<RingBuffer>>,
    /// The single capture-session slot. Holding this lock serializes every
    /// switch, which is what makes stop -> reset -> start total.
    session: tokio::sync::Mutex<Option<CaptureSession>>,
    read_activity: AtomicU64,
    config: ServeConfig,
}

impl<D: DeviceClient> ServerContext<D> {
    pub fn new(device: D, channels: ChannelMap, ring: RingBuffer, config: ServeConfig) -> Arc<Self> {
        Arc::new(Self {
            device: Arc::new(device),
            channels,
            ring: Arc::new(Mutex::new(ring)),
            session: tokio::sync::Mutex::new(None),
            read_activity: AtomicU64::new(0),
            config,
        })
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    pub fn serve_config(&self) -> &ServeConfig {
        &self.config
    }

    /// Bytes produced into the ring since the last switch.
    pub fn written(&self) -> u64 {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .written()
    }

    /// Count a read against the idle reaper.
    pub fn note_read(&self) {
        self.read_activity.fetch_add(1, Ordering::Relaxed);
    }

    /// Current read-activity counter value.
    pub fn read_activity(&self) -> u64 {
        self.read_activity.load(Ordering::Relaxed)
    }

    /// Index of the channel whose worker is currently producing.
    pub async fn active_index(&self) -> Option<usize> {
        let slot = self.session.lock().await;
        slot.as_ref().filter(|s| s.is_running()).map(|s| s.index())
    }

    /// Switch capture to channel `index`: stop any running session, reset
    /// the ring, start the new worker, and only then record it active. On
    /// failure no channel is active and the error surfaces to the caller.
    pub async fn switch_to(&self, index: usize) -> Result<(), SwitchError> {
        let channel = self
            .channels
            .get(index)
            .ok_or(SwitchError::UnknownChannel(index))?;

        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }
        {
            let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            ring.reset();
        }
        let session = CaptureSession::start(
            Arc::clone(&self.device),
            index,
            channel,
            Arc::clone(&self.ring),
        )
        .await?;
        *slot = Some(session);
        info!("Active channel is now {}", channel.file_name());
        Ok(())
    }

    /// Make sure channel `index` is the one being captured, switching if the
    /// target differs from the active channel or no worker is running.
    /// Returns whether a switch happened.
    pub async fn ensure_active(&self, index: usize) -> Result<bool, SwitchError> {
        {
            let slot = self.session.lock().await;
            if let Some(session) = slot.as_ref() {
                if session.index() == index && session.is_running() {
                    return Ok(false);
                }
            }
        }
        self.switch_to(index).await.map(|_| true)
    }

    /// Stop the active session, if any. Returns whether one was stopped.
    pub async fn stop_active(&self) -> bool {
        let mut slot = self.session.lock().await;
        match slot.take() {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    /// Copy up to `len` bytes of produced stream starting at logical offset
    /// `offset`. `None` means the reader is at or past the live edge. The
    /// ring lock is held only for the written-snapshot and the copy.
    pub fn copy_at(&self, offset: u64, len: usize) -> Option<Bytes> {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let written = ring.written();
        if offset >= written {
            return None;
        }
        let avail = (written - offset).min(len as u64) as usize;
        let avail = avail.min(ring.capacity());
        let start = (offset % ring.capacity() as u64) as usize;
        Some(Bytes::copy_from_slice(ring.slice(start, avail)))
    }

    /// Append bytes as if the capture worker produced them.
    #[cfg(test)]
    pub(crate) fn append_for_test(&self, data: &[u8]) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(data)
    }

    /// The device client, for test assertions on issued commands.
    #[cfg(test)]
    pub(crate) fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Stop capturing and release the tuner. Called on unmount.
    pub async fn shutdown(&self) {
        if self.stop_active().await {
            info!("Capture stopped on shutdown");
        }
        self.device.release().await;
    }
}
