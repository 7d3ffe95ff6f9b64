//! Channel selection within a connection
//!
//! The router only ever picks a channel inside one connection. Which member
//! (and therefore which connection) serves a partition is the partition
//! directory's business and is resolved by the connection manager.

use crate::connection::Connection;
use crate::invocation::Request;
use crate::net::Channel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which channel of a connection carries a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelTarget {
    /// The connection's generic channel
    Generic,
    /// Partition channel at this index
    Partition(usize),
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelTarget::Generic => write!(f, "generic"),
            ChannelTarget::Partition(index) => write!(f, "partition[{}]", index),
        }
    }
}

/// Stateless channel router
pub struct Router;

impl Router {
    /// Pick the target for a request on a connection with `partition_channels`
    /// partition channels.
    ///
    /// Depends only on its inputs, never on channel health; a closed target is
    /// reported by the send path rather than rerouted.
    pub fn select(partition_id: Option<u32>, partition_channels: usize) -> ChannelTarget {
        match partition_id {
            Some(pid) if partition_channels > 0 => {
                ChannelTarget::Partition(pid as usize % partition_channels)
            }
            _ => ChannelTarget::Generic,
        }
    }

    /// The channel of `connection` that should carry `request`
    pub fn route(connection: &Connection, request: &Request) -> Arc<Channel> {
        let target = Self::select(request.partition_id, connection.partition_channel_count());
        // `select` stays within the connection's channel count
        connection
            .channel(target)
            .unwrap_or_else(|| connection.generic_channel())
    }
}
