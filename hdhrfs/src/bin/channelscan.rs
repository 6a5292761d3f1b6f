//! channelscan: one-shot channel scanner.
//!
//! Runs a full scan through the device control tool and prints a
//! ready-to-use hdhrfs config file to stdout: a `[global]` section with the
//! tuner identity, then one `[channelmap]` entry per guide-numbered program
//! found. Redirect into a file and point the daemon at it.

use std::fmt;
use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use hdhrfs_device::{HdhrConfig, TunerAddress};

/// channelscan - scan for channels and emit an hdhrfs config
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the hdhomerun_config control tool
    #[arg(long, default_value = "hdhomerun_config")]
    tool: PathBuf,

    /// Device id or IP address (first discovered device when omitted)
    device: Option<String>,

    /// Tuner index to scan with
    #[arg(default_value_t = 0)]
    tuner: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let device = match args.device {
        Some(device) => device,
        None => {
            let devices = HdhrConfig::discover(&args.tool).await?;
            let first = devices.first().ok_or("no devices found")?;
            info!("Using discovered device {} at {}", first.id, first.ip);
            first.ip.clone()
        }
    };

    let address = TunerAddress::new(device, args.tuner);
    let client = HdhrConfig::connect(&args.tool, address.clone()).await?;

    println!("[global]");
    println!("tuners = {}", address);
    println!();
    println!("[channelmap]");

    let mut scan = client.scan().await?;
    let mut parser = ScanParser::default();
    let mut found = 0usize;
    while let Some(line) = scan.next_line().await? {
        if let Some(entry) = parser.feed(&line) {
            println!("{}", entry);
            found += 1;
        }
    }

    if found == 0 {
        warn!("Scan finished without finding any guide-numbered programs");
    } else {
        info!("Scan finished: {} channels", found);
    }
    client.disconnect().await;
    Ok(())
}

/// One channelmap line: `10.1 = 8vsb:14 3 KAKE-DT`.
#[derive(Debug, PartialEq, Eq)]
struct ChannelEntry {
    guide: String,
    channel: String,
    program: u32,
    name: String,
}

impl fmt::Display for ChannelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{} = {} {}", self.guide, self.channel, self.program)
        } else {
            write!(
                f,
                "{} = {} {} {}",
                self.guide, self.channel, self.program, self.name
            )
        }
    }
}

/// Incremental parser for the tool's scan progress lines.
///
/// ```text
/// SCANNING: 473000000 (us-bcast:14)
/// LOCK: 8vsb (ss=100 snq=70 seq=100)
/// PROGRAM 3: 10.1 KAKE-DT
/// ```
///
/// Only programs with a guide number (`major.minor`) become entries; the
/// rest (data services, encrypted placeholders) are skipped.
#[derive(Debug, Default)]
struct ScanParser {
    channel_number: Option<u32>,
    modulation: Option<String>,
}

impl ScanParser {
    fn feed(&mut self, line: &str) -> Option<ChannelEntry> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("SCANNING:") {
            self.modulation = None;
            self.channel_number = rest
                .split(['(', ')'])
                .nth(1)
                .and_then(|map| map.rsplit_once(':'))
                .and_then(|(_, number)| number.parse().ok());
            return None;
        }
        if let Some(rest) = line.strip_prefix("LOCK:") {
            self.modulation = match rest.split_whitespace().next() {
                None | Some("none") => None,
                Some(modulation) => Some(modulation.to_string()),
            };
            return None;
        }
        if let Some(rest) = line.strip_prefix("PROGRAM ") {
            let (program, tail) = rest.split_once(':')?;
            let program: u32 = program.trim().parse().ok()?;
            let mut words = tail.split_whitespace();
            let guide = words.next()?;
            if program == 0 || !guide.contains('.') {
                return None;
            }
            let name = words.collect::<Vec<_>>().join(" ");
            return Some(ChannelEntry {
                guide: guide.to_string(),
                channel: format!("{}:{}", self.modulation.as_deref()?, self.channel_number?),
                program,
                name,
            });
        }
        None
    }
}
