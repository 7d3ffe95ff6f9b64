//! Member side of the channel protocol
//!
//! Serves each accepted channel on its own task, one frame at a time. A slow
//! handler therefore also delays that channel's pongs, which is what a member
//! with a blocked event loop looks like from the client.

use crate::member::MemberId;
use crate::net::frame::{read_frame, write_frame, Frame};
use crate::net::stopped;
use crate::routing::ChannelTarget;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use slog::{debug, info, o, warn, Logger};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Produces the reply for one request body
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// `Err` is sent back as an error response
    async fn handle(&self, target: ChannelTarget, payload: Bytes) -> Result<Bytes, String>;
}

/// Replies with the request body
#[derive(Clone, Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, _target: ChannelTarget, payload: Bytes) -> Result<Bytes, String> {
        Ok(payload)
    }
}

pub struct MemberServer {
    id: MemberId,
    handler: Arc<dyn RequestHandler>,
    /// Channels whose next reply is replaced by a malformed frame
    corrupt: Mutex<Vec<ChannelTarget>>,
    /// Target of every channel that completed its hello
    accepted: Mutex<Vec<ChannelTarget>>,
    active: AtomicUsize,
    requests: AtomicUsize,
    shutdown: watch::Sender<bool>,
    logger: Logger,
}

impl MemberServer {
    pub fn new(id: MemberId, handler: Arc<dyn RequestHandler>, logger: &Logger) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            handler,
            corrupt: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            shutdown,
            logger: logger.new(o!("member" => id.to_string())),
        })
    }

    /// Member server answering every request with its own body
    pub fn echo(id: MemberId, logger: &Logger) -> Arc<Self> {
        Self::new(id, Arc::new(EchoHandler), logger)
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Replace the next reply sent on a `target` channel with an undecodable frame
    pub fn corrupt_next_reply(&self, target: ChannelTarget) {
        self.corrupt.lock().unwrap_or_else(|e| e.into_inner()).push(target);
    }

    /// Channels currently being served
    pub fn active_channels(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Targets announced by every channel accepted so far, in order
    pub fn accepted_channels(&self) -> Vec<ChannelTarget> {
        self.accepted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Requests handled so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Drop every channel and refuse to serve new ones
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(self.logger, "Member server shutting down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Serve one channel on a new task
    pub fn accept<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.serve_channel(stream).await });
    }

    fn take_corruption(&self, target: ChannelTarget) -> bool {
        let mut corrupt = self.corrupt.lock().unwrap_or_else(|e| e.into_inner());
        match corrupt.iter().position(|t| *t == target) {
            Some(index) => {
                corrupt.remove(index);
                true
            }
            None => false,
        }
    }

    async fn serve_channel<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = BytesMut::new();

        let hello = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => return,
            hello = read_frame(&mut reader, &mut buf) => hello,
        };
        let target = match hello {
            Ok(Some(Frame::Hello { client_id, target })) => {
                debug!(self.logger, "Channel accepted"; "client" => %client_id, "channel" => %target);
                target
            }
            Ok(Some(other)) => {
                warn!(self.logger, "Channel did not start with hello"; "kind" => other.kind_name());
                return;
            }
            Ok(None) => return,
            Err(e) => {
                warn!(self.logger, "Failed to read hello"; "error" => %e);
                return;
            }
        };

        self.accepted.lock().unwrap_or_else(|e| e.into_inner()).push(target);
        self.active.fetch_add(1, Ordering::SeqCst);

        loop {
            let frame = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                frame = read_frame(&mut reader, &mut buf) => frame,
            };

            let reply = match frame {
                Ok(Some(Frame::Request { correlation_id, payload })) => {
                    self.requests.fetch_add(1, Ordering::SeqCst);
                    let handled = tokio::select! {
                        biased;
                        _ = stopped(&mut shutdown) => break,
                        handled = self.handler.handle(target, payload) => handled,
                    };
                    if self.take_corruption(target) {
                        warn!(self.logger, "Sending corrupted reply"; "channel" => %target);
                        if writer.write_all(&malformed_frame()).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    match handled {
                        Ok(payload) => Frame::Response { correlation_id, payload },
                        Err(message) => Frame::ErrorResponse { correlation_id, message },
                    }
                }
                Ok(Some(Frame::Ping)) => Frame::Pong,
                Ok(Some(Frame::Pong)) => continue,
                Ok(Some(other)) => {
                    warn!(self.logger, "Unexpected frame from client"; "kind" => other.kind_name());
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(self.logger, "Channel read failed"; "channel" => %target, "error" => %e);
                    break;
                }
            };

            if write_frame(&mut writer, &reply).await.is_err() {
                break;
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(self.logger, "Channel finished"; "channel" => %target);
    }
}

/// Header of a frame with an unknown kind
fn malformed_frame() -> Bytes {
    let mut frame = BytesMut::with_capacity(13);
    frame.put_u32(9);
    frame.put_u8(0xee);
    frame.put_u64(0);
    frame.freeze()
}
