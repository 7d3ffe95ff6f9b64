//! Opening raw duplex streams to members

use crate::errors::ChannelError;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A raw bidirectional byte stream a channel runs on
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ChannelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ChannelStream>;

/// Opens streams to member addresses.
///
/// Implemented once per physical transport (TCP, in-process). Everything above
/// this trait is transport-agnostic.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new stream to `address`
    async fn connect(&self, address: &str) -> Result<BoxedStream, ChannelError>;
}

/// Connector for `host:port` addresses over TCP
#[derive(Clone, Debug, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<BoxedStream, ChannelError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
