//! The per-call filesystem contract.
//!
//! [`ChannelFs`] implements the seven calls the host dispatch framework
//! forwards (`getattr`, `readdir`, `open`, `release`, `read`, `init`,
//! `destroy`) without depending on any particular framework; [`crate::mount`]
//! wires them into the kernel. Reads are self-contained given
//! `(path, offset, length)` - no per-handle state exists.

use std::sync::Arc;

use bytes::Bytes;
use hdhrfs_device::DeviceClient;
use log::{debug, info};
use thiserror::Error;

use crate::server::{ServerContext, SwitchError};

/// Smallest size ever reported for a channel file. Keeps players happy
/// before the stream has produced anything.
pub const MIN_REPORTED_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Largest size ever reported; read offsets wrap modulo this bound, so a
/// player that keeps reading forever just circles the report window while
/// the ring keeps serving live bytes.
pub const MAX_REPORTED_SIZE: u64 = 2 * MIN_REPORTED_SIZE;

/// Per-call failures, mapped onto errno for the dispatch boundary.
///
/// Short reads and zero-length reads are *not* errors: they are the live
/// edge of a growing stream and come back as `Ok`.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("No such path: {0}")]
    UnknownPath(String),

    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(#[from] SwitchError),
}

impl FsError {
    /// The (positive) errno equivalent; the dispatch layer negates it.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::UnknownPath(_) => libc::ENOENT,
            FsError::CaptureUnavailable(_) => libc::EIO,
        }
    }
}

/// Attributes of a served path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    /// The root directory.
    Directory,
    /// A channel file with its currently reported size.
    Channel { size: u64 },
}

/// The virtual file server: a fixed channel-file set over the registry and
/// the ring buffer.
pub struct ChannelFs<D: DeviceClient> {
    ctx: Arc<ServerContext<D>>,
}

impl<D: DeviceClient> ChannelFs<D> {
    pub fn new(ctx: Arc<ServerContext<D>>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ServerContext<D>> {
        &self.ctx
    }

    fn index_of(&self, path: &str) -> Result<usize, FsError> {
        self.ctx
            .channels()
            .index_of_path(path)
            .ok_or_else(|| FsError::UnknownPath(path.to_string()))
    }

    /// Attributes for `/` or a channel file. Channel files report
    /// `clamp(written, MIN, MAX)`: a plausible, growing size even though
    /// true production is unbounded and wraps.
    pub fn getattr(&self, path: &str) -> Result<Attr, FsError> {
        if path == "/" {
            return Ok(Attr::Directory);
        }
        self.index_of(path)?;
        let size = self
            .ctx
            .written()
            .clamp(MIN_REPORTED_SIZE, MAX_REPORTED_SIZE);
        Ok(Attr::Channel { size })
    }

    /// Directory listing: `.` and `..`, then channel files in configuration
    /// order. Only the root is a directory.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        if path != "/" {
            return Err(FsError::UnknownPath(path.to_string()));
        }
        let mut names = vec![".".to_string(), "..".to_string()];
        names.extend(self.ctx.channels().iter().map(|c| c.file_name()));
        Ok(names)
    }

    /// Open succeeds for any known channel path; no handle state is kept.
    pub fn open(&self, path: &str) -> Result<(), FsError> {
        debug!("open: {}", path);
        self.index_of(path).map(|_| ())
    }

    pub fn release(&self, path: &str) -> Result<(), FsError> {
        debug!("release: {}", path);
        self.index_of(path).map(|_| ())
    }

    /// Read `length` bytes at `offset`, retuning first when the target is
    /// not the active channel or its worker is gone. A result shorter than
    /// `length` is the live edge; an empty result means the reader caught
    /// up with the producer entirely.
    pub async fn read(&self, path: &str, offset: u64, length: usize) -> Result<Bytes, FsError> {
        self.ctx.note_read();
        let index = self.index_of(path)?;

        if self.ctx.ensure_active(index).await? {
            debug!("read: switched capture to {}", path);
        }

        // Bounded circular addressing over the reported file window.
        let offset = offset % MAX_REPORTED_SIZE;

        // Near the live edge, give the producer a bounded chance to catch
        // up. The ring lock is released between attempts so the worker can
        // keep appending.
        let config = self.ctx.serve_config();
        let mut attempts = 0;
        while self.ctx.written() < offset + length as u64 {
            if attempts >= config.edge_wait_attempts {
                break;
            }
            attempts += 1;
            debug!(
                "read: waiting for live edge (offset {}, length {}, written {}, attempt {}/{})",
                offset,
                length,
                self.ctx.written(),
                attempts,
                config.edge_wait_attempts
            );
            tokio::time::sleep(config.edge_wait_interval).await;
        }

        match self.ctx.copy_at(offset, length) {
            Some(data) => {
                if data.len() < length {
                    debug!(
                        "read: short read at offset {} ({} of {} bytes)",
                        offset,
                        data.len(),
                        length
                    );
                }
                Ok(data)
            }
            None => {
                debug!("read: offset {} at or past live edge, returning 0 bytes", offset);
                Ok(Bytes::new())
            }
        }
    }

    /// Dispatch-framework startup hook.
    pub fn init(&self) {
        info!(
            "Serving {} channel files",
            self.ctx.channels().len()
        );
    }

    /// Dispatch-framework teardown hook: stop capturing, free the tuner.
    pub async fn destroy(&self) {
        self.ctx.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::channels::{ChannelMap, VirtualChannel};
    use crate::mock::MockDevice;
    use crate::ring::RingBuffer;
    use crate::server::ServeConfig;

    fn channel(name: &str, code: &str, program: u32) -> VirtualChannel {
        VirtualChannel {
            name: name.to_string(),
            channel: code.to_string(),
            program,
            display_name: None,
        }
    }

    fn fs_with(
        name: &str,
        device: MockDevice,
        config: ServeConfig,
    ) -> ChannelFs<MockDevice> {
        let path = std::env::temp_dir().join(format!(
            "hdhrfs-fs-{}-{}",
            std::process::id(),
            name
        ));
        let ring = RingBuffer::create(&path, 4096).unwrap();
        let map = ChannelMap::new(vec![
            channel("a", "8vsb:8", 3),
            channel("b", "8vsb:10", 4),
        ]);
        ChannelFs::new(ServerContext::new(device, map, ring, config))
    }

    fn fast_config() -> ServeConfig {
        ServeConfig {
            edge_wait_attempts: 2,
            edge_wait_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn wait_for_written(fs: &ChannelFs<MockDevice>, at_least: u64) {
        for _ in 0..200 {
            if fs.context().written() >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never produced {} bytes", at_least);
    }

    #[tokio::test]
    async fn test_unknown_path_is_enoent_everywhere() {
        let fs = fs_with("enoent", MockDevice::new(), fast_config());

        let err = fs.read("/unknown.ts", 0, 10).await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(fs.open("/unknown.ts").unwrap_err().errno(), libc::ENOENT);
        assert_eq!(fs.getattr("/unknown.ts").unwrap_err().errno(), libc::ENOENT);
        assert_eq!(fs.release("/unknown.ts").unwrap_err().errno(), libc::ENOENT);
    }

    #[tokio::test]
    async fn test_capture_failure_is_eio() {
        let fs = fs_with("eio", MockDevice::new().failing_tune(), fast_config());
        let err = fs.read("/a.ts", 0, 10).await.unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
    }

    #[tokio::test]
    async fn test_read_serves_captured_bytes() {
        let fs = fs_with(
            "serves",
            MockDevice::new().script("8vsb:8", &[b"stream bytes"]),
            fast_config(),
        );
        let data = fs.read("/a.ts", 0, 12).await.unwrap();
        assert_eq!(data.as_ref(), b"stream bytes");
    }

    #[tokio::test]
    async fn test_sequential_reads_do_not_retune() {
        let fs = fs_with(
            "sequential",
            MockDevice::new().script("8vsb:8", &[b"0123456789"]),
            fast_config(),
        );
        let first = fs.read("/a.ts", 0, 4).await.unwrap();
        let second = fs.read("/a.ts", 4, 4).await.unwrap();
        assert_eq!(first.as_ref(), b"0123");
        assert_eq!(second.as_ref(), b"4567");

        // One switch total: the second read reuses the running session.
        assert_eq!(fs.context().active_index().await, Some(0));
        assert_eq!(fs.context().device().tune_count(), 1);
    }

    #[tokio::test]
    async fn test_short_read_at_live_edge() {
        let fs = fs_with(
            "short",
            MockDevice::new().script("8vsb:8", &[b"abcdef"]),
            fast_config(),
        );
        wait_for_written_after_switch(&fs).await;
        // 6 bytes exist; asking for 100 past offset 2 yields the 4 available.
        let data = fs.read("/a.ts", 2, 100).await.unwrap();
        assert_eq!(data.as_ref(), b"cdef");
    }

    async fn wait_for_written_after_switch(fs: &ChannelFs<MockDevice>) {
        fs.context().ensure_active(0).await.unwrap();
        wait_for_written(fs, 6).await;
    }

    #[tokio::test]
    async fn test_read_past_live_edge_returns_empty() {
        let fs = fs_with(
            "past-edge",
            MockDevice::new().script("8vsb:8", &[b"abcdef"]),
            fast_config(),
        );
        let data = fs.read("/a.ts", 1_000_000, 64).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_read_waits_for_producer_near_live_edge() {
        let config = ServeConfig {
            edge_wait_attempts: 20,
            edge_wait_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let fs = fs_with(
            "edge-wait",
            MockDevice::new().script("8vsb:8", &[b"abcd", b"efgh"]),
            config,
        );
        // The worker trickles chunks in; the read polls until both landed.
        let data = fs.read("/a.ts", 0, 8).await.unwrap();
        assert_eq!(data.as_ref(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_wrapped_read_crosses_ring_boundary() {
        let fs = fs_with("wrapped", MockDevice::new(), fast_config());
        let ctx = fs.context();

        // Produce directly: 4096 x AA then 100 x BB (written = 4196).
        ctx.switch_to(0).await.unwrap();
        ctx.append_for_test(&[0xAA; 4096]);
        ctx.append_for_test(&[0xBB; 100]);
        assert_eq!(ctx.written(), 4196);

        let data = fs.read("/a.ts", 4046, 150).await.unwrap();
        assert_eq!(data.len(), 150);
        assert!(data[..50].iter().all(|&b| b == 0xAA));
        assert!(data[50..].iter().all(|&b| b == 0xBB));
    }

    #[tokio::test]
    async fn test_attr_reports_clamped_growing_size() {
        let fs = fs_with(
            "attr",
            MockDevice::new().script("8vsb:8", &[b"abc"]),
            fast_config(),
        );
        match fs.getattr("/a.ts").unwrap() {
            Attr::Channel { size } => assert_eq!(size, MIN_REPORTED_SIZE),
            other => panic!("expected channel attr, got {:?}", other),
        }
        assert_eq!(fs.getattr("/").unwrap(), Attr::Directory);
    }

    #[tokio::test]
    async fn test_readdir_lists_channels_in_config_order() {
        let fs = fs_with("readdir", MockDevice::new(), fast_config());
        let names = fs.readdir("/").unwrap();
        assert_eq!(names, vec![".", "..", "a.ts", "b.ts"]);
        assert!(fs.readdir("/a.ts").is_err());
    }
}
