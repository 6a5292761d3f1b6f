//! hdhrfs: serve a broadcast tuner as a directory of live channel files.
//!
//! Reading a channel file retunes the single tuner if needed and serves the
//! live transport stream out of a memory-mapped ring buffer, so unmodified
//! media players can play broadcast channels by path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use hdhrfs::{config, logging, mount, ChannelFs, IdleReaper, RingBuffer, ServeConfig, ServerContext};
use hdhrfs_device::HdhrConfig;

/// Default requested ring capacity: 64 MiB, a couple of minutes of a
/// typical broadcast program.
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// hdhrfs - mount a broadcast tuner as a directory of channel files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the ring-buffer backing file
    #[arg(short, long, default_value = "/var/tmp/hdhrfs-buffer.ts")]
    buffer_file: PathBuf,

    /// Requested ring capacity in bytes (rounded up to a page-aligned
    /// power of two)
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Path to the hdhomerun_config control tool
    #[arg(long, default_value = "hdhomerun_config")]
    tool: PathBuf,

    /// Stop an unwatched capture after this many seconds without reads
    #[arg(long, default_value_t = 600)]
    idle_timeout: u64,

    /// Directory for rotated log files (console only when unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long, default_value_t = 7)]
    log_retention_days: u64,

    /// Log every state transition and read decision
    #[arg(short, long)]
    debug: bool,

    /// Channel map config file (as written by channelscan)
    config: PathBuf,

    /// Mount point for the channel directory
    mountpoint: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    logging::init(args.debug, args.log_dir.as_deref(), args.log_retention_days)
        .expect("Failed to initialize logging");

    // Config and backing-storage failures are fatal; everything device-side
    // is retried on reads.
    let config = config::load(&args.config).inspect_err(|e| error!("{}", e))?;
    info!(
        "Loaded {} channels for tuner {}",
        config.channels.len(),
        config.tuner
    );

    let ring = RingBuffer::create(&args.buffer_file, args.buffer_size)
        .inspect_err(|e| error!("{}", e))?;

    // The mount loop owns the main thread; the capture worker and the
    // reaper live on this runtime, and handlers block on it.
    let runtime = tokio::runtime::Runtime::new()?;

    let device = match runtime.block_on(HdhrConfig::connect(&args.tool, config.tuner.clone())) {
        Ok(device) => device,
        Err(e) => {
            // Not fatal: the tuner may be rebooting; the first read retries.
            warn!("Tuner not reachable yet: {}", e);
            HdhrConfig::new(&args.tool, config.tuner.clone())
        }
    };

    let serve_config = ServeConfig {
        idle_timeout: Duration::from_secs(args.idle_timeout),
        ..Default::default()
    };
    let ctx = ServerContext::new(device, config.channels, ring, serve_config);

    let reaper = {
        let _enter = runtime.enter();
        IdleReaper::spawn(Arc::clone(&ctx), ctx.serve_config().idle_timeout)
    };

    info!("Mounting channel directory at {}", args.mountpoint.display());
    let served = mount::mount(
        ChannelFs::new(Arc::clone(&ctx)),
        &args.mountpoint,
        runtime.handle().clone(),
    );

    reaper.abort();
    runtime.block_on(ctx.shutdown());
    served?;
    info!("Unmounted, exiting");
    Ok(())
}
