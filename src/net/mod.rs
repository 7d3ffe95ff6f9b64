//! Physical channels
//!
//! - `connector`: opens raw streams to member addresses
//! - `frame`: the envelope every channel speaks
//! - `channel`: one stream with its reader and writer tasks
//! - `heartbeat`: liveness probing across the channels of a connection

pub mod channel;
pub mod connector;
pub mod frame;
pub mod heartbeat;

pub use channel::{Channel, ChannelOwner, ChannelState};
pub use connector::{BoxedStream, ChannelStream, Connector, TcpConnector};
pub use frame::Frame;
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resolves once `flag` turns true, or once its sender is gone.
///
/// Completes with `()` so that no `watch::Ref` guard ends up in the output of
/// a `select!` whose other branches await.
pub async fn stopped(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}
