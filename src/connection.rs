//! Logical connection to one member
//!
//! A connection is one generic channel plus a fixed number of partition
//! channels, opened together and torn down together. Every teardown trigger
//! (explicit close, a channel closing, heartbeat timeout, protocol violation)
//! goes through [`Connection::close`], and only the first one has any effect.

use crate::config::ClientConfig;
use crate::errors::{CloseReason, ConnectError, InvocationError};
use crate::invocation::{Invocation, InvocationRegistry, Request};
use crate::member::{Member, MemberId};
use crate::net::{stopped, Channel, ChannelOwner, Connector, HeartbeatMonitor};
use crate::routing::{ChannelTarget, Router};
use bytes::Bytes;
use futures::future::join_all;
use slog::{debug, info, o, warn, Logger};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

struct ChannelSet {
    generic: Arc<Channel>,
    partitions: Vec<Arc<Channel>>,
}

impl ChannelSet {
    fn get(&self, target: ChannelTarget) -> Option<&Arc<Channel>> {
        match target {
            ChannelTarget::Generic => Some(&self.generic),
            ChannelTarget::Partition(index) => self.partitions.get(index),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<Channel>> {
        std::iter::once(&self.generic).chain(self.partitions.iter())
    }
}

/// State shared between the connection handles and its channels
struct ConnectionShared {
    member: Member,
    client_id: Uuid,
    /// False until every channel is open, false again after teardown
    alive: AtomicBool,
    registry: Arc<InvocationRegistry>,
    channels: OnceLock<Arc<ChannelSet>>,
    close_reason: Mutex<Option<CloseReason>>,
    closed: watch::Sender<bool>,
    logger: Logger,
}

impl ConnectionShared {
    fn close(&self, reason: CloseReason) -> bool {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return false;
        }
        *self.close_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());

        if let Some(channels) = self.channels.get() {
            for channel in channels.iter() {
                channel.close(reason.clone());
            }
        }

        for pending in self.registry.pending() {
            debug!(self.logger, "Cancelling invocation";
                "correlation_id" => pending.correlation_id,
                "channel" => %pending.target,
                "retryable" => pending.retryable
            );
        }
        let cancelled = self.registry.cancel_all(&reason);
        self.closed.send_replace(true);

        info!(self.logger, "Connection closed";
            "reason" => %reason,
            "cancelled_invocations" => cancelled
        );
        true
    }
}

impl ChannelOwner for ConnectionShared {
    fn on_response(&self, target: ChannelTarget, correlation_id: u64, result: Result<Bytes, String>) {
        if !self.registry.resolve(correlation_id, result.map_err(InvocationError::Remote)) {
            debug!(self.logger, "Discarding response for unknown invocation";
                "channel" => %target,
                "correlation_id" => correlation_id
            );
        }
    }

    fn on_channel_closed(&self, target: ChannelTarget, reason: CloseReason) {
        if self.alive.load(Ordering::SeqCst) {
            debug!(self.logger, "Channel closed under a live connection";
                "channel" => %target,
                "pending_on_channel" => self.registry.pending_on(target)
            );
        }
        self.close(CloseReason::SiblingClosed { target, cause: Box::new(reason) });
    }
}

/// Handle to an established connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
    channels: Arc<ChannelSet>,
}

impl Connection {
    /// Open the generic channel and every partition channel concurrently.
    ///
    /// The connection is returned only once all of them are open; if any fails
    /// or `connect_timeout` passes, the ones already open are closed and the
    /// whole attempt fails.
    ///
    /// # Arguments
    /// * `member` - Member to connect to
    /// * `config` - Partition channel count, connect timeout and heartbeat settings
    /// * `connector` - Opens the raw stream for each channel
    /// * `logger` - Parent logger; the connection logs under the member's id
    ///
    /// # Returns
    /// A live connection whose heartbeat monitor is already running
    pub async fn establish(
        member: Member,
        config: &ClientConfig,
        connector: &dyn Connector,
        logger: &Logger,
    ) -> Result<Connection, ConnectError> {
        let partition_count = config.effective_partition_channels(member.partition_channels_supported);
        let client_id = Uuid::new_v4();
        let logger = logger.new(o!("member" => member.id.to_string()));
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(ConnectionShared {
            registry: Arc::new(InvocationRegistry::new(member.id)),
            member,
            client_id,
            alive: AtomicBool::new(false),
            channels: OnceLock::new(),
            close_reason: Mutex::new(None),
            closed,
            logger,
        });
        let owner: Weak<dyn ChannelOwner> = Arc::downgrade(&shared) as Weak<dyn ChannelOwner>;

        let deadline = Instant::now() + config.connect_timeout;
        let open = |target: ChannelTarget| {
            let owner = owner.clone();
            let shared = &shared;
            async move {
                let opened = Channel::open(
                    connector,
                    &shared.member.address,
                    shared.client_id,
                    target,
                    owner,
                    &shared.logger,
                );
                match timeout_at(deadline, opened).await {
                    Ok(Ok(channel)) => Ok(channel),
                    Ok(Err(source)) => Err(ConnectError::Channel { target, source }),
                    Err(_) => Err(ConnectError::Timeout(config.connect_timeout)),
                }
            }
        };

        let (generic, partitions) = futures::join!(
            open(ChannelTarget::Generic),
            join_all((0..partition_count).map(|index| open(ChannelTarget::Partition(index))))
        );

        let mut opened = Vec::with_capacity(partition_count + 1);
        let mut failure = None;
        let generic = match generic {
            Ok(channel) => {
                opened.push(channel.clone());
                Some(channel)
            }
            Err(e) => {
                failure = Some(e);
                None
            }
        };
        let mut partition_channels = Vec::with_capacity(partition_count);
        for result in partitions {
            match result {
                Ok(channel) => {
                    opened.push(channel.clone());
                    partition_channels.push(channel);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        let generic = match (generic, failure) {
            (Some(generic), None) => generic,
            (_, failure) => {
                // Not alive yet, so these closes do not reach the connection
                for channel in &opened {
                    channel.close(CloseReason::Explicit("connection establishment failed".to_string()));
                }
                let error = failure.unwrap_or(ConnectError::Aborted(CloseReason::Explicit(
                    "generic channel missing".to_string(),
                )));
                warn!(shared.logger, "Connection establishment failed"; "error" => %error);
                return Err(error);
            }
        };

        let channels = Arc::new(ChannelSet { generic, partitions: partition_channels });
        // A fresh OnceLock cannot already be set
        let _ = shared.channels.set(channels.clone());
        shared.alive.store(true, Ordering::SeqCst);

        // A channel that closed while the connection was not yet alive was not
        // propagated; catch it here
        if let Some(dead) = channels.iter().find(|c| !c.is_alive()) {
            let reason = dead
                .close_reason()
                .unwrap_or_else(|| CloseReason::Io("channel closed during establishment".to_string()));
            let reason = CloseReason::SiblingClosed { target: dead.target(), cause: Box::new(reason) };
            shared.close(reason.clone());
            return Err(ConnectError::Aborted(reason));
        }

        HeartbeatMonitor::new(config.heartbeat.clone(), shared.logger.clone())
            .spawn(channels.iter().cloned().collect(), shared.closed.subscribe());

        info!(shared.logger, "Connection established";
            "address" => &shared.member.address,
            "partition_channels" => partition_count
        );
        Ok(Connection { shared, channels })
    }

    pub fn member(&self) -> &Member {
        &self.shared.member
    }

    pub fn member_id(&self) -> MemberId {
        self.shared.member.id
    }

    /// Client id announced on every channel of this connection
    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Generic channel first, then partition channels by index
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().cloned().collect()
    }

    pub fn generic_channel(&self) -> Arc<Channel> {
        self.channels.generic.clone()
    }

    pub fn partition_channels(&self) -> &[Arc<Channel>] {
        &self.channels.partitions
    }

    /// Number of partition channels, fixed for the life of the connection
    pub fn partition_channel_count(&self) -> usize {
        self.channels.partitions.len()
    }

    pub fn channel(&self, target: ChannelTarget) -> Option<Arc<Channel>> {
        self.channels.get(target).cloned()
    }

    /// Why the connection was torn down, once it has been
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Tear the connection down. Returns whether this call did it.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.shared.close(reason)
    }

    /// Resolves once the connection has been torn down
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        stopped(&mut closed).await;
    }

    /// Send on the channel the router picks for this request
    pub fn send(&self, request: &Request) -> Result<Invocation, InvocationError> {
        self.send_via(Router::route(self, request), request)
    }

    /// Send on an explicit channel, bypassing the router
    ///
    /// # Arguments
    /// * `target` - Channel to write the request to
    /// * `request` - Payload and invocation options
    ///
    /// # Returns
    /// The invocation handle, or `ConnectionUnavailable` when the connection
    /// has no such channel
    pub fn send_on(&self, target: ChannelTarget, request: &Request) -> Result<Invocation, InvocationError> {
        let channel = self.channel(target).ok_or_else(|| InvocationError::ConnectionUnavailable {
            reason: format!("connection to {} has no {} channel", self.member_id(), target),
        })?;
        self.send_via(channel, request)
    }

    fn send_via(&self, channel: Arc<Channel>, request: &Request) -> Result<Invocation, InvocationError> {
        let target = channel.target();
        if !self.is_alive() {
            return Err(self.disconnected("connection closed"));
        }

        let deadline = request.deadline.map(|d| Instant::now() + d);
        let invocation = self.shared.registry.register(target, request.retryable, deadline)?;
        let correlation_id = invocation.correlation_id();

        if channel.send_request(correlation_id, request.payload.clone()).is_err() {
            // Dropping the invocation removes its entry
            let reason = channel
                .close_reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "channel closed".to_string());
            return Err(InvocationError::TargetDisconnected { member: self.member_id(), reason });
        }

        debug!(self.shared.logger, "Request sent";
            "channel" => %target,
            "correlation_id" => correlation_id
        );
        Ok(invocation)
    }

    pub fn pending_invocations(&self) -> usize {
        self.shared.registry.pending_count()
    }

    /// Whether both handles refer to the same connection
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn disconnected(&self, fallback: &str) -> InvocationError {
        InvocationError::TargetDisconnected {
            member: self.member_id(),
            reason: self
                .close_reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| fallback.to_string()),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("member", &self.shared.member.id)
            .field("address", &self.shared.member.address)
            .field("partition_channels", &self.partition_channel_count())
            .field("alive", &self.is_alive())
            .finish()
    }
}
