//! Idle-timeout reclamation of the tuner.
//!
//! A client that stops reading without closing (a crashed player, a stale
//! NFS re-export) would otherwise hold the single tuner forever. The reaper
//! is a plain periodic task - no signal handlers, so stopping the worker
//! (which blocks on a join) is safe here - that compares the read-activity
//! counter against its value at the previous firing and stops the capture
//! session when nothing moved. The next read restarts capture
//! transparently.

use std::sync::Arc;
use std::time::Duration;

use hdhrfs_device::DeviceClient;
use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::server::ServerContext;

pub struct IdleReaper;

impl IdleReaper {
    /// Spawn the reaper with the given period. Must be called from within
    /// the runtime. The task re-arms unconditionally and runs until aborted.
    pub fn spawn<D: DeviceClient>(
        ctx: Arc<ServerContext<D>>,
        period: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; use it to take the
            // baseline counter value.
            ticker.tick().await;
            let mut last_seen = ctx.read_activity();

            loop {
                ticker.tick().await;
                let current = ctx.read_activity();
                if current == last_seen {
                    if ctx.stop_active().await {
                        info!(
                            "No reads for {:?}; stopped capture and reclaimed the tuner",
                            period
                        );
                    }
                } else {
                    debug!(
                        "Reaper: {} reads since last check, capture stays up",
                        current - last_seen
                    );
                }
                last_seen = current;
            }
        })
    }
}
