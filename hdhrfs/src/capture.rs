//! Background capture worker.
//!
//! A [`CaptureSession`] is bound to exactly one virtual channel: it retunes
//! the device, opens a stream session, then a background task pulls chunks
//! and appends them into the shared ring buffer until it is told to stop.
//! At most one session exists system-wide; the owner enforces that by
//! stopping the previous session before starting the next.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hdhrfs_device::{DeviceClient, DeviceError, DeviceStream};
use log::{debug, error, info, warn};

use crate::channels::VirtualChannel;
use crate::ring::RingBuffer;

/// Bounded wait for one chunk from the device. A stop request is observed
/// within roughly one of these intervals.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between pulls, bounding the polling rate so readers always get a
/// turn on the ring lock.
const POLL_PAUSE: Duration = Duration::from_millis(10);

/// How long `stop()` waits for the worker task to exit before giving up.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

/// Atomic cell holding a [`CaptureState`]; every transition is logged so
/// debug runs show the full lifecycle.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(CaptureState::Idle as u8))
    }

    fn decode(value: u8) -> CaptureState {
        match value {
            1 => CaptureState::Starting,
            2 => CaptureState::Running,
            3 => CaptureState::Stopping,
            _ => CaptureState::Idle,
        }
    }

    fn get(&self) -> CaptureState {
        Self::decode(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, next: CaptureState) {
        let prev = Self::decode(self.0.swap(next as u8, Ordering::SeqCst));
        if prev != next {
            debug!("Capture state: {:?} -> {:?}", prev, next);
        }
    }
}

/// A running (or just-stopped) capture bound to one channel.
pub struct CaptureSession {
    index: usize,
    file_name: String,
    stop: Arc<AtomicBool>,
    state: Arc<StateCell>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl CaptureSession {
    /// Retune the device to `channel` and start the worker task.
    ///
    /// On tune or stream-start failure no session is created, the tuner is
    /// released (best effort) and the caller may retry on a later read.
    pub async fn start<D: DeviceClient>(
        device: Arc<D>,
        index: usize,
        channel: &VirtualChannel,
        ring: Arc<Mutex<RingBuffer>>,
    ) -> Result<Self, DeviceError> {
        let state = Arc::new(StateCell::new());
        state.set(CaptureState::Starting);
        info!(
            "Starting capture of {} (channel {}, program {})",
            channel.file_name(),
            channel.channel,
            channel.program
        );

        if let Err(e) = device.tune(&channel.channel).await {
            state.set(CaptureState::Idle);
            return Err(e);
        }
        if let Err(e) = device.set_program(channel.program).await {
            device.release().await;
            state.set(CaptureState::Idle);
            return Err(e);
        }
        let mut stream = match device.start_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                device.release().await;
                state.set(CaptureState::Idle);
                return Err(e);
            }
        };

        state.set(CaptureState::Running);
        let stop = Arc::new(AtomicBool::new(false));
        let file_name = channel.file_name();

        let worker_state = Arc::clone(&state);
        let worker_stop = Arc::clone(&stop);
        let worker_name = file_name.clone();
        let handle = tokio::spawn(async move {
            let mut total: u64 = 0;
            loop {
                if worker_stop.load(Ordering::SeqCst) {
                    break;
                }
                match stream.recv(RECV_TIMEOUT).await {
                    Ok(Some(chunk)) => {
                        let stored = {
                            let mut ring = ring.lock().unwrap_or_else(PoisonError::into_inner);
                            ring.append(&chunk)
                        };
                        total += stored as u64;
                    }
                    Ok(None) => {
                        debug!("No data from tuner for {} within {:?}", worker_name, RECV_TIMEOUT);
                    }
                    Err(DeviceError::StreamClosed) => {
                        warn!("Device stream for {} closed", worker_name);
                        break;
                    }
                    Err(e) => {
                        error!("Capture error on {}: {}", worker_name, e);
                        break;
                    }
                }
                tokio::time::sleep(POLL_PAUSE).await;
            }
            worker_state.set(CaptureState::Stopping);
            stream.stop().await;
            worker_state.set(CaptureState::Idle);
            info!("Capture worker for {} exited after {} bytes", worker_name, total);
        });

        Ok(Self {
            index,
            file_name,
            stop,
            state,
            handle: Some(handle),
        })
    }

    /// Index of the channel this session is bound to.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the worker is still producing. A session whose worker exited
    /// on a device error reports `false`, which makes the next read restart
    /// it through the switch protocol.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state.get(),
            CaptureState::Starting | CaptureState::Running
        )
    }

    pub fn state(&self) -> CaptureState {
        self.state.get()
    }

    /// Cooperative stop: set the flag, then block until the worker task has
    /// exited, guaranteeing the device stream is stopped and the tuner is
    /// free before the caller starts a new session.
    pub async fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(_) => debug!("Capture worker for {} joined", self.file_name),
                Err(_) => error!(
                    "Capture worker for {} did not stop within {:?}",
                    self.file_name, STOP_TIMEOUT
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ring_for_test, MockDevice};
    use crate::channels::VirtualChannel;

    fn channel() -> VirtualChannel {
        VirtualChannel {
            name: "10.1".to_string(),
            channel: "8vsb:10".to_string(),
            program: 3,
            display_name: None,
        }
    }

    #[tokio::test]
    async fn test_capture_appends_into_ring() {
        let device = Arc::new(MockDevice::new().script("8vsb:10", &[b"abcd", b"efgh"]));
        let ring = ring_for_test("capture-appends", 4096);

        let session = CaptureSession::start(Arc::clone(&device), 0, &channel(), Arc::clone(&ring))
            .await
            .unwrap();
        assert!(session.is_running());

        // Wait for the worker to drain both scripted chunks.
        for _ in 0..100 {
            if ring.lock().unwrap().written() >= 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        {
            let ring = ring.lock().unwrap();
            assert_eq!(ring.written(), 8);
            assert_eq!(ring.slice(0, 8), b"abcdefgh");
        }

        session.stop().await;
        assert_eq!(device.streams_stopped(), 1);
    }

    #[tokio::test]
    async fn test_tune_failure_leaves_idle() {
        let device = Arc::new(MockDevice::new().failing_tune());
        let ring = ring_for_test("capture-tune-fail", 4096);

        let err = CaptureSession::start(Arc::clone(&device), 0, &channel(), ring)
            .await
            .err()
            .expect("tune failure must surface");
        assert!(matches!(err, DeviceError::TuneFailed { .. }));
        assert_eq!(device.streams_started(), 0);
    }

    #[tokio::test]
    async fn test_stream_failure_releases_tuner() {
        let device = Arc::new(MockDevice::new().failing_stream());
        let ring = ring_for_test("capture-stream-fail", 4096);

        let result = CaptureSession::start(Arc::clone(&device), 0, &channel(), ring).await;
        assert!(result.is_err());
        assert_eq!(device.releases(), 1);
    }

    #[tokio::test]
    async fn test_stop_joins_worker() {
        let device = Arc::new(MockDevice::new().script("8vsb:10", &[b"data"]));
        let ring = ring_for_test("capture-stop", 4096);

        let session = CaptureSession::start(Arc::clone(&device), 0, &channel(), ring)
            .await
            .unwrap();
        session.stop().await;
        assert_eq!(device.streams_stopped(), 1);
    }
}
