//! Channel liveness probing
//!
//! One monitor task per connection walks every channel on its own timer. It
//! never waits on a channel's tasks, so a member that stops answering on one
//! channel is detected even while that channel's traffic is stuck.

use crate::config::HeartbeatConfig;
use crate::errors::CloseReason;
use crate::net::channel::Channel;
use crate::net::frame::Frame;
use crate::net::stopped;
use slog::{debug, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// What the monitor decided for one channel on one tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Recent traffic in both directions
    Idle,
    /// Nothing written for a full interval; send a ping
    Probe,
    /// Nothing read within the timeout; close the channel
    Timeout,
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    logger: Logger,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, logger: Logger) -> Self {
        Self { config, logger }
    }

    /// Decide the action from how long a channel has been silent in each
    /// direction, measured on the monotonic clock.
    ///
    /// # Arguments
    /// * `read_idle` - Time since the last frame arrived
    /// * `write_idle` - Time since the last frame went out
    pub fn assess(&self, read_idle: Duration, write_idle: Duration) -> HeartbeatAction {
        if read_idle >= self.config.timeout {
            HeartbeatAction::Timeout
        } else if write_idle >= self.config.interval {
            HeartbeatAction::Probe
        } else {
            HeartbeatAction::Idle
        }
    }

    /// Assess one channel and act on it
    pub fn check(&self, channel: &Channel, now: Instant) -> HeartbeatAction {
        let read_idle = channel.read_idle(now);
        let action = self.assess(read_idle, channel.write_idle(now));
        match action {
            HeartbeatAction::Timeout => {
                warn!(self.logger, "Heartbeat timed out";
                    "channel" => %channel.target(),
                    "silent_ms" => read_idle.as_millis() as u64
                );
                channel.close(CloseReason::HeartbeatTimeout);
            }
            HeartbeatAction::Probe => {
                if channel.send(Frame::Ping).is_err() {
                    debug!(self.logger, "Probe skipped on closed channel"; "channel" => %channel.target());
                }
            }
            HeartbeatAction::Idle => {}
        }
        action
    }

    /// Run the monitor over `channels` until `stop` turns true
    pub fn spawn(self, channels: Vec<Arc<Channel>>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        for channel in channels.iter().filter(|c| c.is_alive()) {
                            self.check(channel, now);
                        }
                    }
                }
            }
            debug!(self.logger, "Heartbeat monitor stopped");
        })
    }
}
