//! Connection manager: one connection per member
//!
//! Owns the member → connection map, reacts to membership changes, keeps
//! connections alive through reconnection, and is the entry point for
//! sending requests. Lookups take a read lock only; the map is never locked
//! across an await.

pub mod events;
mod reconnect;

pub use events::LifecycleEvent;

use reconnect::ConnectTask;

use crate::codec::Codec;
use crate::config::{ClientConfig, UnavailablePolicy};
use crate::connection::Connection;
use crate::errors::{CloseReason, ConfigError, ConnectError, InvocationError};
use crate::event_bus::EventBus;
use crate::invocation::{InvocationOptions, InvocationResult, Request};
use crate::member::{ClusterMembership, Member, MemberId, MembershipEvent, PartitionDirectory};
use crate::net::{stopped, Connector};
use rand::seq::IteratorRandom;
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

struct ManagerInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    directory: RwLock<Option<Arc<dyn PartitionDirectory>>>,
    /// Members this manager keeps connected
    members: RwLock<HashMap<MemberId, Member>>,
    connections: RwLock<HashMap<MemberId, Connection>>,
    /// Connect loops by member
    connecting: Mutex<HashMap<MemberId, ConnectTask>>,
    next_generation: AtomicU64,
    membership_task: Mutex<Option<JoinHandle<()>>>,
    events: EventBus<LifecycleEvent>,
    /// Bumped whenever a connection is added to or removed from the map
    topology: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    logger: Logger,
}

/// Handle to the connection manager. Clones share the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager; nothing connects until `start` or `connect`
    ///
    /// # Arguments
    /// * `config` - Client configuration, validated here
    /// * `connector` - Opens streams to member addresses
    /// * `logger` - Parent logger
    ///
    /// # Returns
    /// The manager, or `ConfigError` when `config` is invalid
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>, logger: &Logger) -> Result<Self, ConfigError> {
        config.validate()?;
        let (topology, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                events: EventBus::new(config.event_capacity),
                config,
                connector,
                directory: RwLock::new(None),
                members: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                connecting: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                membership_task: Mutex::new(None),
                topology,
                shutdown,
                logger: logger.new(o!("component" => "connection_manager")),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Use `directory` to find the member owning a request's partition
    pub fn set_partition_directory(&self, directory: Arc<dyn PartitionDirectory>) {
        *self.inner.directory.write().unwrap_or_else(|e| e.into_inner()) = Some(directory);
    }

    /// Connect to every current member and follow membership changes until `stop`
    pub fn start(&self, membership: Arc<dyn ClusterMembership>) {
        if self.is_shut_down() {
            warn!(self.inner.logger, "Start requested after stop");
            return;
        }
        // Subscribe before the snapshot so no change in between is missed
        let events = membership.subscribe();
        let members = membership.members();
        info!(self.inner.logger, "Connection manager starting"; "members" => members.len());

        for member in members {
            self.inner.member_added(member);
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.consume_membership(membership, events).await });
        if let Some(previous) = self
            .inner
            .membership_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            previous.abort();
        }
    }

    /// Close every connection, stop reconnecting and refuse further requests
    pub async fn stop(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!(self.inner.logger, "Connection manager stopping");

        let membership_task = self
            .inner
            .membership_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = membership_task {
            let _ = task.await;
        }

        // Connect loops observe the shutdown flag and finish their current attempt
        let connecting: Vec<JoinHandle<()>> = self
            .inner
            .connecting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, task)| task.into_handle())
            .collect();
        for task in connecting {
            let _ = task.await;
        }

        for connection in self.get_active_connections() {
            self.inner.close_and_retire(&connection, CloseReason::Shutdown);
        }
        info!(self.inner.logger, "Connection manager stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Start keeping `member` connected
    pub fn member_added(&self, member: Member) {
        self.inner.member_added(member);
    }

    /// Stop keeping `member_id` connected and close its connection
    pub fn member_removed(&self, member_id: MemberId) {
        self.inner.member_removed(member_id);
    }

    /// Connect to `member` now, returning the existing connection if one is alive
    pub async fn connect(&self, member: Member) -> Result<Connection, ConnectError> {
        if self.is_shut_down() {
            return Err(ConnectError::Shutdown);
        }
        self.inner
            .members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(member.id, member.clone());

        if let Some(existing) = self.get_connection(member.id) {
            return Ok(existing);
        }

        let connection =
            Connection::establish(member, &self.inner.config, self.inner.connector.as_ref(), &self.inner.logger)
                .await?;
        self.inner.install(connection)
    }

    /// Close the connection to `member_id` without reconnecting it.
    ///
    /// The member stays known; `connect` or a new membership event brings it back.
    pub fn disconnect(&self, member_id: MemberId, reason: CloseReason) -> bool {
        self.inner.cancel_connect(member_id);
        let connection = self
            .inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&member_id)
            .cloned();
        match connection {
            Some(connection) => {
                self.inner.retire(&connection, reason.clone());
                connection.close(reason)
            }
            None => false,
        }
    }

    pub fn get_active_connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| c.is_alive())
            .cloned()
            .collect()
    }

    pub fn get_connection(&self, member_id: MemberId) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&member_id)
            .filter(|c| c.is_alive())
            .cloned()
    }

    /// Any one alive connection
    pub fn get_random_connection(&self) -> Option<Connection> {
        self.inner.random_connection()
    }

    pub fn connection_count(&self) -> usize {
        self.get_active_connections().len()
    }

    pub fn members(&self) -> Vec<Member> {
        self.inner
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Send a request to the member owning its partition (or any member) and
    /// wait for the result.
    ///
    /// A retryable request is resent after `TargetDisconnected` or
    /// `ConnectionUnavailable` while the retry budget and the deadline allow.
    /// Resends wait for a replacement connection regardless of the
    /// unavailable policy.
    ///
    /// # Arguments
    /// * `request` - Payload, optional partition, retry flag and deadline
    ///
    /// # Returns
    /// The member's response, or the error of the last attempt. `Timeout`
    /// reports the time spent across all attempts.
    pub async fn send(&self, request: Request) -> InvocationResult {
        let inner = &self.inner;
        if self.is_shut_down() {
            return Err(InvocationError::Shutdown);
        }

        let started = Instant::now();
        let deadline = started + request.deadline.unwrap_or(inner.config.invocation.default_deadline);
        let retry = &inner.config.invocation.retry;
        let mut attempt = 1;

        loop {
            // A resend waits for a replacement connection until the deadline,
            // whatever the unavailable policy allows a first attempt.
            let wait_limit = if attempt == 1 {
                inner.unavailable_wait_limit(deadline)
            } else {
                Some(deadline)
            };
            let connection = inner.resolve_connection(request.partition_id, wait_limit).await?;
            let result = match connection.send(&request) {
                Ok(invocation) => invocation.wait_until(deadline).await,
                Err(e) => Err(e),
            };

            match result {
                Err(e) if e.is_retryable() && request.retryable && attempt < retry.max_attempts => {
                    debug!(inner.logger, "Retrying request";
                        "attempt" => attempt,
                        "member" => %connection.member_id(),
                        "error" => %e
                    );
                    attempt += 1;

                    let resume = Instant::now() + retry.backoff;
                    if resume >= deadline {
                        return Err(InvocationError::Timeout { elapsed: started.elapsed() });
                    }
                    let mut shutdown = inner.shutdown.subscribe();
                    tokio::select! {
                        biased;
                        _ = stopped(&mut shutdown) => return Err(InvocationError::Shutdown),
                        _ = sleep_until(resume) => {}
                    }
                }
                Err(InvocationError::Timeout { .. }) => {
                    return Err(InvocationError::Timeout { elapsed: started.elapsed() });
                }
                other => return other,
            }
        }
    }

    /// Encode `operation`, send it and decode the response
    ///
    /// # Arguments
    /// * `codec` - Encodes the operation and decodes the response
    /// * `operation` - Operation to send
    /// * `options` - Partition, retry flag and deadline
    ///
    /// # Returns
    /// The decoded response; codec failures fail only this invocation
    pub async fn invoke<C: Codec>(
        &self,
        codec: &C,
        operation: &C::Operation,
        options: InvocationOptions,
    ) -> Result<C::Response, InvocationError> {
        let payload = codec.encode(operation).map_err(InvocationError::Encode)?;
        let response = self.send(Request::with_options(payload, options)).await?;
        codec.decode(response).map_err(InvocationError::Decode)
    }
}

impl ManagerInner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn is_member(&self, member_id: MemberId) -> bool {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&member_id)
    }

    fn live_connection(&self, member_id: MemberId) -> Option<Connection> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&member_id)
            .filter(|c| c.is_alive())
            .cloned()
    }

    fn random_connection(&self) -> Option<Connection> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| c.is_alive())
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    fn member_added(self: &Arc<Self>, member: Member) {
        if self.is_shut_down() {
            return;
        }
        debug!(self.logger, "Member added"; "member" => %member.id, "address" => &member.address);
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(member.id, member.clone());

        if self.live_connection(member.id).is_none() {
            self.spawn_connect(member, false);
        }
    }

    fn member_removed(self: &Arc<Self>, member_id: MemberId) {
        let known = self
            .members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&member_id)
            .is_some();
        if !known {
            return;
        }
        debug!(self.logger, "Member removed"; "member" => %member_id);
        self.cancel_connect(member_id);

        let connection = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&member_id)
            .cloned();
        if let Some(connection) = connection {
            self.close_and_retire(&connection, CloseReason::MemberRemoved);
        }
    }

    /// Reconcile with a full membership snapshot
    fn sync_members(self: &Arc<Self>, snapshot: Vec<Member>) {
        let current: Vec<MemberId> = self
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        for id in current {
            if !snapshot.iter().any(|m| m.id == id) {
                self.member_removed(id);
            }
        }
        for member in snapshot {
            self.member_added(member);
        }
    }

    async fn consume_membership(
        self: Arc<Self>,
        membership: Arc<dyn ClusterMembership>,
        mut events: broadcast::Receiver<MembershipEvent>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                event = events.recv() => event,
            };
            match event {
                Ok(MembershipEvent::MemberAdded(member)) => self.member_added(member),
                Ok(MembershipEvent::MemberRemoved(member_id)) => self.member_removed(member_id),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(self.logger, "Membership events missed, resynchronizing"; "missed" => missed);
                    self.sync_members(membership.members());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(self.logger, "Membership consumer stopped");
    }

    /// Put a freshly established connection in the map.
    ///
    /// A dead entry for the same member is retired first, so its `Disconnected`
    /// is published before this connection's `Connected`.
    fn install(self: &Arc<Self>, connection: Connection) -> Result<Connection, ConnectError> {
        let member_id = connection.member_id();
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());

        if self.is_shut_down() {
            drop(connections);
            connection.close(CloseReason::Shutdown);
            return Err(ConnectError::Shutdown);
        }
        if !self.is_member(member_id) {
            drop(connections);
            connection.close(CloseReason::MemberRemoved);
            return Err(ConnectError::MemberUnknown(member_id));
        }

        if let Some(existing) = connections.get(&member_id).cloned() {
            if existing.is_alive() {
                drop(connections);
                debug!(self.logger, "Discarding duplicate connection"; "member" => %member_id);
                connection.close(CloseReason::Explicit("duplicate connection".to_string()));
                return Ok(existing);
            }
            connections.remove(&member_id);
            self.publish_disconnected(&existing, None);
        }

        if !connection.is_alive() {
            let reason = connection
                .close_reason()
                .unwrap_or_else(|| CloseReason::Io("connection closed before it was installed".to_string()));
            return Err(ConnectError::Aborted(reason));
        }

        connections.insert(member_id, connection.clone());
        self.events.publish(LifecycleEvent::Connected {
            member: member_id,
            address: connection.member().address.clone(),
            partition_channels: connection.partition_channel_count(),
        });
        self.topology.send_modify(|version| *version += 1);
        drop(connections);

        info!(self.logger, "Member connected";
            "member" => %member_id,
            "address" => &connection.member().address,
            "partition_channels" => connection.partition_channel_count()
        );
        self.spawn_supervisor(connection.clone());
        Ok(connection)
    }

    /// Remove `connection` from the map if it is still the member's entry and
    /// publish `Disconnected`. Returns whether this call removed it.
    fn retire(&self, connection: &Connection, fallback: CloseReason) -> bool {
        let member_id = connection.member_id();
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        match connections.get(&member_id) {
            Some(current) if current.same_as(connection) => {
                connections.remove(&member_id);
                self.publish_disconnected(connection, Some(fallback));
                true
            }
            _ => false,
        }
    }

    fn close_and_retire(&self, connection: &Connection, reason: CloseReason) {
        connection.close(reason.clone());
        self.retire(connection, reason);
    }

    /// Called with the connection map locked
    fn publish_disconnected(&self, connection: &Connection, fallback: Option<CloseReason>) {
        let reason = connection
            .close_reason()
            .or(fallback)
            .unwrap_or_else(|| CloseReason::Explicit("connection replaced".to_string()));
        info!(self.logger, "Member disconnected"; "member" => %connection.member_id(), "reason" => %reason);
        self.events.publish(LifecycleEvent::Disconnected { member: connection.member_id(), reason });
        self.topology.send_modify(|version| *version += 1);
    }

    /// How long a first attempt may wait for a connection
    fn unavailable_wait_limit(&self, deadline: Instant) -> Option<Instant> {
        match &self.config.invocation.unavailable {
            UnavailablePolicy::FailFast => None,
            UnavailablePolicy::Await(max_wait) => Some(deadline.min(Instant::now() + *max_wait)),
        }
    }

    /// Connection for a request, waiting for topology changes until
    /// `wait_limit`, or failing at once without one
    async fn resolve_connection(
        &self,
        partition_id: Option<u32>,
        wait_limit: Option<Instant>,
    ) -> Result<Connection, InvocationError> {
        let mut topology = self.topology.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            topology.borrow_and_update();
            if self.is_shut_down() {
                return Err(InvocationError::Shutdown);
            }
            if let Some(connection) = self.pick_connection(partition_id) {
                return Ok(connection);
            }

            let Some(limit) = wait_limit else {
                return Err(InvocationError::ConnectionUnavailable {
                    reason: "no live connection to any member".to_string(),
                });
            };
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => return Err(InvocationError::Shutdown),
                changed = topology.changed() => {
                    if changed.is_err() {
                        return Err(InvocationError::Shutdown);
                    }
                }
                _ = sleep_until(limit) => {
                    return Err(InvocationError::ConnectionUnavailable {
                        reason: "no connection became available in time".to_string(),
                    });
                }
            }
        }
    }

    /// The partition owner's connection when it is alive, otherwise any live one
    fn pick_connection(&self, partition_id: Option<u32>) -> Option<Connection> {
        let owner = partition_id.and_then(|pid| {
            self.directory
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .and_then(|directory| directory.owner_of(pid))
        });
        if let Some(owner) = owner {
            if let Some(connection) = self.live_connection(owner) {
                return Some(connection);
            }
            debug!(self.logger, "Partition owner not connected, falling back"; "owner" => %owner);
        }
        self.random_connection()
    }
}
