//! Member server listening on TCP

use crate::member::Member;
use crate::net::stopped;
use crate::server::member::MemberServer;
use slog::{info, warn, Logger};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct TcpMemberServer {
    local_addr: SocketAddr,
    server: Arc<MemberServer>,
    stop: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl TcpMemberServer {
    /// Bind `address` (port 0 picks a free port) and start accepting channels
    pub async fn bind(address: &str, server: Arc<MemberServer>, logger: &Logger) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let (stop, mut stop_rx) = watch::channel(false);
        info!(logger, "Member server listening"; "address" => %local_addr, "member" => %server.id());

        let accept_server = server.clone();
        let logger = logger.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop_rx) => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!(logger, "Failed to set TCP_NODELAY"; "error" => %e);
                            }
                            accept_server.accept(stream);
                        }
                        Err(e) => warn!(logger, "Accept failed"; "error" => %e),
                    },
                }
            }
        });

        Ok(Self { local_addr, server, stop, accept_task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Membership entry pointing at this listener
    pub fn member(&self) -> Member {
        Member::new(self.server.id(), self.local_addr.to_string())
    }

    pub fn server(&self) -> &Arc<MemberServer> {
        &self.server
    }

    /// Stop accepting and drop every open channel
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        self.server.shutdown();
    }

    /// Run until the accept loop ends
    pub async fn join(&mut self) {
        let _ = (&mut self.accept_task).await;
    }
}

impl Drop for TcpMemberServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
