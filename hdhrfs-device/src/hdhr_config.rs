//! `hdhomerun_config` backed device client.
//!
//! The vendor tool already speaks the discovery/control protocol, so this
//! client drives it as a subprocess: one short-lived invocation per command,
//! plus a long-lived `save /tunerN -` child whose stdout is the stream
//! session. Killing the save child ends the session on the device side.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use crate::client::{DeviceClient, DeviceStream};
use crate::error::DeviceError;
use crate::types::TunerAddress;

/// Bound on every one-shot control command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Read size for one stream chunk from the save child's stdout.
const RECV_CHUNK_SIZE: usize = 65536;

/// Device client that shells out to the `hdhomerun_config` tool.
pub struct HdhrConfig {
    tool: PathBuf,
    address: TunerAddress,
}

impl HdhrConfig {
    /// Create a client without probing the device. Useful when the tuner
    /// may not be reachable yet; every command revalidates anyway.
    pub fn new(tool: impl Into<PathBuf>, address: TunerAddress) -> Self {
        Self {
            tool: tool.into(),
            address,
        }
    }

    /// Connect to a tuner: probe its status once so a wrong address or a
    /// missing tool fails here instead of on the first read.
    pub async fn connect(
        tool: impl Into<PathBuf>,
        address: TunerAddress,
    ) -> Result<Self, DeviceError> {
        let client = Self::new(tool, address);
        let status = client
            .run(&["get", &format!("{}/status", client.address.tuner_path())])
            .await?;
        debug!("Connected to tuner {}: {}", client.address, status.trim());
        Ok(client)
    }

    /// The tuner this client is bound to.
    pub fn address(&self) -> &TunerAddress {
        &self.address
    }

    /// Disconnect from the tuner, releasing it if still held.
    pub async fn disconnect(self) {
        self.release().await;
    }

    /// Discover tuner devices on the local network.
    pub async fn discover(tool: &Path) -> Result<Vec<DiscoveredDevice>, DeviceError> {
        let output = run_tool(tool, &["discover"]).await?;
        Ok(output.lines().filter_map(parse_discover_line).collect())
    }

    /// Start a full channel scan on this tuner. The returned stream yields
    /// the tool's progress lines (`SCANNING:` / `LOCK:` / `PROGRAM ...`).
    pub async fn scan(&self) -> Result<ScanStream, DeviceError> {
        let mut child = Command::new(&self.tool)
            .arg(&self.address.device)
            .arg("scan")
            .arg(self.address.tuner_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(DeviceError::Unreachable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::StreamStart("scan stdout not captured".to_string()))?;
        Ok(ScanStream {
            _child: child,
            lines: BufReader::new(stdout).lines(),
        })
    }

    /// Run one control command (`<tool> <device> <args...>`) and return its
    /// stdout. The tool reports errors both through the exit code and through
    /// `ERROR` lines, so both are checked.
    async fn run(&self, args: &[&str]) -> Result<String, DeviceError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(self.address.device.as_str());
        full.extend_from_slice(args);
        run_tool(&self.tool, &full).await
    }

    async fn set(&self, item: &str, value: &str) -> Result<String, DeviceError> {
        let item = format!("{}{}", self.address.tuner_path(), item);
        self.run(&["set", &item, value]).await
    }
}

async fn run_tool(tool: &Path, args: &[&str]) -> Result<String, DeviceError> {
    let command = format!("{} {}", tool.display(), args.join(" "));
    debug!("Executing: {}", command);

    let result = tokio::time::timeout(
        COMMAND_TIMEOUT,
        Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| DeviceError::CommandTimeout {
        command: command.clone(),
    })?;

    let output = result.map_err(DeviceError::Unreachable)?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() || stdout.trim_start().starts_with("ERROR") {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stdout.trim().is_empty() {
            stderr.trim().to_string()
        } else {
            stdout.trim().to_string()
        };
        return Err(DeviceError::CommandFailed { command, detail });
    }
    Ok(stdout)
}

impl DeviceClient for HdhrConfig {
    type Stream = SaveStream;

    async fn tune(&self, channel: &str) -> Result<(), DeviceError> {
        self.set("/channel", channel)
            .await
            .map_err(|e| DeviceError::TuneFailed {
                channel: channel.to_string(),
                detail: e.to_string(),
            })?;
        Ok(())
    }

    async fn set_program(&self, program: u32) -> Result<(), DeviceError> {
        self.set("/program", &program.to_string())
            .await
            .map_err(|e| DeviceError::ProgramFailed {
                program,
                detail: e.to_string(),
            })?;
        Ok(())
    }

    async fn start_stream(&self) -> Result<SaveStream, DeviceError> {
        let mut child = Command::new(&self.tool)
            .arg(&self.address.device)
            .arg("save")
            .arg(self.address.tuner_path())
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeviceError::StreamStart(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::StreamStart("save stdout not captured".to_string()))?;
        debug!("Save session started for tuner {}", self.address);
        Ok(SaveStream {
            child,
            stdout,
            buf: vec![0u8; RECV_CHUNK_SIZE],
        })
    }

    async fn release(&self) {
        if let Err(e) = self.set("/channel", "none").await {
            warn!("Failed to release tuner {}: {}", self.address, e);
        }
    }
}

/// A live `save /tunerN -` session; chunks come from the child's stdout.
pub struct SaveStream {
    child: Child,
    stdout: ChildStdout,
    buf: Vec<u8>,
}

impl DeviceStream for SaveStream {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>, DeviceError> {
        match tokio::time::timeout(timeout, self.stdout.read(&mut self.buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(DeviceError::StreamClosed),
            Ok(Ok(n)) => Ok(Some(Bytes::copy_from_slice(&self.buf[..n]))),
            Ok(Err(e)) => Err(DeviceError::Io(e)),
        }
    }

    async fn stop(mut self) {
        // The child may already have exited; both calls are best-effort.
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        debug!("Save session stopped");
    }
}

/// Progress lines from a running channel scan.
pub struct ScanStream {
    _child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl ScanStream {
    /// Next progress line, or `None` when the scan finishes.
    pub async fn next_line(&mut self) -> Result<Option<String>, DeviceError> {
        Ok(self.lines.next_line().await?)
    }
}

/// A device reported by `discover`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Device id (hex string).
    pub id: String,
    /// IP address the device answered from.
    pub ip: String,
}

/// Parse one `discover` output line:
/// `hdhomerun device 10123456 found at 192.168.1.133`.
fn parse_discover_line(line: &str) -> Option<DiscoveredDevice> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["hdhomerun", "device", id, "found", "at", ip] => Some(DiscoveredDevice {
            id: id.to_string(),
            ip: ip.to_string(),
        }),
        _ => None,
    }
}
