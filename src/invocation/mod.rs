//! Requests and their pending results

pub mod registry;

pub use registry::{Invocation, InvocationRegistry, InvocationResult, PendingInfo};

use bytes::Bytes;
use std::time::Duration;

/// Per-request routing and retry options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvocationOptions {
    /// Partition the request operates on; `None` routes to the generic channel
    pub partition_id: Option<u32>,
    /// Resend after `TargetDisconnected` while the retry budget lasts
    pub retryable: bool,
    /// Overrides the configured default deadline
    pub deadline: Option<Duration>,
}

impl InvocationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition(mut self, partition_id: u32) -> Self {
        self.partition_id = Some(partition_id);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// An encoded operation ready to be sent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub payload: Bytes,
    pub partition_id: Option<u32>,
    pub retryable: bool,
    pub deadline: Option<Duration>,
}

impl Request {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::with_options(payload, InvocationOptions::default())
    }

    pub fn with_options(payload: impl Into<Bytes>, options: InvocationOptions) -> Self {
        Self {
            payload: payload.into(),
            partition_id: options.partition_id,
            retryable: options.retryable,
            deadline: options.deadline,
        }
    }

    pub fn with_partition(mut self, partition_id: u32) -> Self {
        self.partition_id = Some(partition_id);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}
