//! Connection lifecycle notifications

use crate::errors::CloseReason;
use crate::member::MemberId;

/// Published by the connection manager.
///
/// For one member, a `Disconnected` always comes before the next `Connected`.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// A connection became ready
    Connected {
        member: MemberId,
        address: String,
        partition_channels: usize,
    },
    /// A ready connection went away
    Disconnected { member: MemberId, reason: CloseReason },
    /// The reconnection budget for a member ran out
    ReconnectFailed { member: MemberId, attempts: u32 },
}

impl LifecycleEvent {
    pub fn member(&self) -> MemberId {
        match self {
            LifecycleEvent::Connected { member, .. }
            | LifecycleEvent::Disconnected { member, .. }
            | LifecycleEvent::ReconnectFailed { member, .. } => *member,
        }
    }
}
