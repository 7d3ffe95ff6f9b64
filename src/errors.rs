//! Error types for the transport layer

use crate::member::MemberId;
use crate::routing::ChannelTarget;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a channel or connection was torn down.
///
/// Heartbeat timeouts and protocol violations never reach callers directly;
/// they close the connection and the cancelled invocations surface as
/// [`InvocationError::TargetDisconnected`] carrying this reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Caller asked for the connection to be closed
    Explicit(String),
    /// No inbound traffic within the heartbeat timeout
    HeartbeatTimeout,
    /// Malformed or unexpected frame observed on a channel
    ProtocolViolation(String),
    /// The peer closed the stream or an I/O operation failed
    Io(String),
    /// The member left the cluster
    MemberRemoved,
    /// The owning client is shutting down
    Shutdown,
    /// A sibling channel of the same connection closed
    SiblingClosed { target: ChannelTarget, cause: Box<CloseReason> },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Explicit(msg) => write!(f, "{}", msg),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            CloseReason::Io(msg) => write!(f, "i/o failure: {}", msg),
            CloseReason::MemberRemoved => write!(f, "member removed"),
            CloseReason::Shutdown => write!(f, "client shutdown"),
            CloseReason::SiblingClosed { target, cause } => {
                write!(f, "{} channel closed ({})", target, cause)
            }
        }
    }
}

/// Errors from the external operation codec
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CodecError(pub String);

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError(e.to_string())
    }
}

/// Errors surfaced to the caller of a single invocation
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    /// The connection or channel carrying the invocation closed
    #[error("target member {member} disconnected: {reason}")]
    TargetDisconnected { member: MemberId, reason: String },

    /// No route to the target member and no reconnection in time
    #[error("no connection available: {reason}")]
    ConnectionUnavailable { reason: String },

    /// The per-request deadline passed before a response arrived
    #[error("invocation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The operation could not be encoded
    #[error("failed to encode operation: {0}")]
    Encode(CodecError),

    /// The response could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(CodecError),

    /// The member answered with an error
    #[error("member returned an error: {0}")]
    Remote(String),

    /// The client was stopped
    #[error("client is shut down")]
    Shutdown,
}

impl InvocationError {
    /// Whether a retryable request may be resent after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InvocationError::TargetDisconnected { .. } | InvocationError::ConnectionUnavailable { .. }
        )
    }
}

/// Errors from a single physical channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Errors while establishing a connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to open {target} channel: {source}")]
    Channel {
        target: ChannelTarget,
        #[source]
        source: ChannelError,
    },

    #[error("connection establishment timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection aborted during establishment: {0}")]
    Aborted(CloseReason),

    #[error("member {0} is not part of the cluster")]
    MemberUnknown(MemberId),

    #[error("connection manager is shut down")]
    Shutdown,
}

/// Errors decoding the channel envelope
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    TooLarge(usize),

    #[error("frame of {0} bytes is shorter than the envelope header")]
    Truncated(usize),

    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("malformed {kind} body: {reason}")]
    MalformedBody { kind: &'static str, reason: String },
}

/// Errors loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_failures_are_retryable() {
        let disconnected = InvocationError::TargetDisconnected {
            member: MemberId::new_random(),
            reason: "heartbeat timeout".to_string(),
        };
        assert!(disconnected.is_retryable());
        assert!(InvocationError::ConnectionUnavailable { reason: "none".to_string() }.is_retryable());
        assert!(!InvocationError::Shutdown.is_retryable());
        assert!(!InvocationError::Remote("boom".to_string()).is_retryable());
        assert!(!InvocationError::Timeout {
            elapsed: Duration::from_millis(5)
        }
        .is_retryable());
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::HeartbeatTimeout.to_string(), "heartbeat timeout");
        let nested = CloseReason::SiblingClosed {
            target: ChannelTarget::Partition(2),
            cause: Box::new(CloseReason::ProtocolViolation("unknown frame kind 0xff".into())),
        };
        assert_eq!(
            nested.to_string(),
            "partition[2] channel closed (protocol violation: unknown frame kind 0xff)"
        );
    }
}
