//! gridlink - client transport for a partitioned in-memory data grid
//!
//! The stack, bottom to top:
//! - Layer 0: Connector (TCP or in-process byte streams)
//! - Layer 1: Channel (framed stream with its own reader and writer tasks)
//! - Layer 2: HeartbeatMonitor (liveness across a connection's channels)
//! - Layer 3: InvocationRegistry (pending requests by correlation id)
//! - Layer 4: Connection (generic channel + N partition channels) and Router
//! - Layer 5: ConnectionManager (one connection per member, reconnection,
//!   lifecycle events on the EventBus)

pub mod codec;
pub mod config;
pub mod connection;
pub mod errors;
pub mod event_bus;
pub mod invocation;
pub mod manager;
pub mod member;
pub mod net;
pub mod routing;
pub mod server;

pub use codec::{Codec, JsonCodec};
pub use config::{ClientConfig, HeartbeatConfig, InvocationConfig, ReconnectPolicy, RetryPolicy, UnavailablePolicy};
pub use connection::Connection;
pub use errors::{ChannelError, CloseReason, CodecError, ConfigError, ConnectError, FrameError, InvocationError};
pub use invocation::{Invocation, InvocationOptions, InvocationRegistry, Request};
pub use manager::{ConnectionManager, LifecycleEvent};
pub use member::{
    ClusterMembership, Member, MemberId, MembershipEvent, PartitionDirectory, StaticMembership,
    StaticPartitionDirectory,
};
pub use net::{Channel, ChannelState, Connector, TcpConnector};
pub use routing::{ChannelTarget, Router};
