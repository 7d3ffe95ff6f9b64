//! Cluster members and the external collaborators that describe them
//!
//! Membership and partition ownership are decided elsewhere; this module only
//! defines the interfaces the connection manager consumes, plus simple
//! in-memory implementations for embedding and tests.

use crate::event_bus::EventBus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Stable identity of a cluster member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cluster member as reported by the membership service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member identity
    pub id: MemberId,

    /// Connector-specific address ("10.0.0.5:5701" for TCP, "node:1" in-process)
    pub address: String,

    /// Whether the member accepts partition-affine channels
    pub partition_channels_supported: bool,
}

impl Member {
    /// Create a member that accepts partition channels
    pub fn new(id: MemberId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            partition_channels_supported: true,
        }
    }

    /// Mark the member as serving only the generic channel
    pub fn without_partition_channels(mut self) -> Self {
        self.partition_channels_supported = false;
        self
    }
}

/// Membership change notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    MemberAdded(Member),
    MemberRemoved(MemberId),
}

/// Source of cluster membership (external collaborator)
pub trait ClusterMembership: Send + Sync {
    /// Members known right now
    fn members(&self) -> Vec<Member>;

    /// Receive every membership change from now on
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Maps a partition to the member that owns it (external collaborator)
pub trait PartitionDirectory: Send + Sync {
    /// Owner of the partition, if known
    fn owner_of(&self, partition_id: u32) -> Option<MemberId>;
}

/// In-memory membership list that broadcasts its own changes
pub struct StaticMembership {
    members: RwLock<HashMap<MemberId, Member>>,
    events: EventBus<MembershipEvent>,
}

impl StaticMembership {
    pub fn new(initial: Vec<Member>) -> Self {
        Self {
            members: RwLock::new(initial.into_iter().map(|m| (m.id, m)).collect()),
            events: EventBus::new(64),
        }
    }

    /// Add a member and notify subscribers
    pub fn add_member(&self, member: Member) {
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(member.id, member.clone());
        self.events.publish(MembershipEvent::MemberAdded(member));
    }

    /// Remove a member and notify subscribers
    pub fn remove_member(&self, id: MemberId) {
        let removed = self
            .members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if removed.is_some() {
            self.events.publish(MembershipEvent::MemberRemoved(id));
        }
    }
}

impl ClusterMembership for StaticMembership {
    fn members(&self) -> Vec<Member> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

/// In-memory partition table
#[derive(Default)]
pub struct StaticPartitionDirectory {
    owners: RwLock<HashMap<u32, MemberId>>,
}

impl StaticPartitionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign partitions round-robin over the given members
    pub fn round_robin(partition_count: u32, members: &[MemberId]) -> Self {
        let directory = Self::new();
        if !members.is_empty() {
            for partition_id in 0..partition_count {
                let owner = members[partition_id as usize % members.len()];
                directory.set_owner(partition_id, owner);
            }
        }
        directory
    }

    pub fn set_owner(&self, partition_id: u32, owner: MemberId) {
        self.owners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(partition_id, owner);
    }

    pub fn partition_count(&self) -> usize {
        self.owners.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl PartitionDirectory for StaticPartitionDirectory {
    fn owner_of(&self, partition_id: u32) -> Option<MemberId> {
        self.owners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&partition_id)
            .copied()
    }
}
