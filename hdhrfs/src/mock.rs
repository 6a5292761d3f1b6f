//! Scripted device client for engine tests.
//!
//! `MockDevice` records every command and serves per-channel chunk scripts,
//! so tests can drive tune/stream/switch sequences without hardware.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use hdhrfs_device::{DeviceClient, DeviceError, DeviceStream};

use crate::ring::RingBuffer;

pub(crate) struct MockDevice {
    scripts: Mutex<HashMap<String, Vec<Bytes>>>,
    current_channel: Mutex<Option<String>>,
    fail_tune: bool,
    fail_stream: bool,
    tunes: Mutex<Vec<String>>,
    programs: Mutex<Vec<u32>>,
    streams_started: AtomicUsize,
    streams_stopped: Arc<AtomicUsize>,
    releases: AtomicUsize,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            current_channel: Mutex::new(None),
            fail_tune: false,
            fail_stream: false,
            tunes: Mutex::new(Vec::new()),
            programs: Mutex::new(Vec::new()),
            streams_started: AtomicUsize::new(0),
            streams_stopped: Arc::new(AtomicUsize::new(0)),
            releases: AtomicUsize::new(0),
        }
    }

    /// Chunks delivered by every stream started while tuned to `channel`.
    pub fn script(self, channel: &str, chunks: &[&[u8]]) -> Self {
        self.scripts.lock().unwrap().insert(
            channel.to_string(),
            chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect(),
        );
        self
    }

    pub fn failing_tune(mut self) -> Self {
        self.fail_tune = true;
        self
    }

    pub fn failing_stream(mut self) -> Self {
        self.fail_stream = true;
        self
    }

    pub fn tune_count(&self) -> usize {
        self.tunes.lock().unwrap().len()
    }

    pub fn streams_started(&self) -> usize {
        self.streams_started.load(Ordering::SeqCst)
    }

    pub fn streams_stopped(&self) -> usize {
        self.streams_stopped.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl DeviceClient for MockDevice {
    type Stream = MockStream;

    async fn tune(&self, channel: &str) -> Result<(), DeviceError> {
        self.tunes.lock().unwrap().push(channel.to_string());
        if self.fail_tune {
            return Err(DeviceError::TuneFailed {
                channel: channel.to_string(),
                detail: "scripted failure".to_string(),
            });
        }
        *self.current_channel.lock().unwrap() = Some(channel.to_string());
        Ok(())
    }

    async fn set_program(&self, program: u32) -> Result<(), DeviceError> {
        self.programs.lock().unwrap().push(program);
        Ok(())
    }

    async fn start_stream(&self) -> Result<MockStream, DeviceError> {
        if self.fail_stream {
            return Err(DeviceError::StreamStart("scripted failure".to_string()));
        }
        self.streams_started.fetch_add(1, Ordering::SeqCst);
        let channel = self.current_channel.lock().unwrap().clone();
        let chunks = channel
            .and_then(|c| self.scripts.lock().unwrap().get(&c).cloned())
            .unwrap_or_default();
        Ok(MockStream {
            chunks: chunks.into(),
            stopped: Arc::clone(&self.streams_stopped),
        })
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockStream {
    chunks: VecDeque<Bytes>,
    stopped: Arc<AtomicUsize>,
}

impl DeviceStream for MockStream {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>, DeviceError> {
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                // Script drained: behave like a quiet tuner.
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn stop(self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Ring buffer over a unique temp backing file.
pub(crate) fn ring_for_test(name: &str, requested: usize) -> Arc<Mutex<RingBuffer>> {
    let path: PathBuf =
        std::env::temp_dir().join(format!("hdhrfs-test-{}-{}", std::process::id(), name));
    Arc::new(Mutex::new(RingBuffer::create(&path, requested).unwrap()))
}
