//! In-process member network for testing
//!
//! Members register their server under `node:<member id>`; connecting to that
//! address hands one end of an in-memory duplex pipe to the member.

use crate::errors::ChannelError;
use crate::member::{Member, MemberId};
use crate::net::{BoxedStream, Connector};
use crate::server::member::MemberServer;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const PIPE_CAPACITY: usize = 256 * 1024;

pub struct InProcessNetwork {
    /// Routes: member id → server accepting its channels
    routes: Arc<Mutex<HashMap<MemberId, Arc<MemberServer>>>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Address under which a member is reachable on this network
    pub fn address_of(id: MemberId) -> String {
        format!("node:{}", id)
    }

    /// Make a member reachable and describe it for membership
    pub async fn register_member(&self, server: Arc<MemberServer>) -> Member {
        let id = server.id();
        self.routes.lock().await.insert(id, server);
        Member::new(id, Self::address_of(id))
    }

    /// Make a member unreachable and drop every channel it serves
    pub async fn unregister_member(&self, id: MemberId) -> Option<Arc<MemberServer>> {
        let server = self.routes.lock().await.remove(&id);
        if let Some(server) = &server {
            server.shutdown();
        }
        server
    }

    pub async fn member_count(&self) -> usize {
        self.routes.lock().await.len()
    }

    fn parse_member_id(address: &str) -> Result<MemberId, ChannelError> {
        let id = address.strip_prefix("node:").ok_or_else(|| {
            invalid_address(format!(
                "invalid in-process address '{}', expected format 'node:<id>'",
                address
            ))
        })?;
        Uuid::parse_str(id)
            .map(MemberId::new)
            .map_err(|e| invalid_address(format!("invalid member id in '{}': {}", address, e)))
    }
}

impl Default for InProcessNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_address(reason: String) -> ChannelError {
    ChannelError::Io(io::Error::new(io::ErrorKind::InvalidInput, reason))
}

#[async_trait]
impl Connector for InProcessNetwork {
    async fn connect(&self, address: &str) -> Result<BoxedStream, ChannelError> {
        let id = Self::parse_member_id(address)?;
        let server = self.routes.lock().await.get(&id).cloned().ok_or_else(|| {
            ChannelError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no member listening on {}", address),
            ))
        })?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        server.accept(far);
        Ok(Box::new(near))
    }
}
