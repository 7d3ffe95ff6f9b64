//! One physical channel: a duplex stream driven by its own reader and writer tasks

use crate::errors::{ChannelError, CloseReason};
use crate::net::connector::Connector;
use crate::net::frame::{read_frame, write_frame, Frame};
use crate::net::{now_millis, stopped};
use crate::routing::ChannelTarget;
use bytes::{Bytes, BytesMut};
use slog::{debug, info, o, warn, Logger};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle of a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Receives what a channel observes. Implemented by the owning connection.
pub trait ChannelOwner: Send + Sync {
    /// A response (or member-side error) for `correlation_id` arrived
    fn on_response(&self, target: ChannelTarget, correlation_id: u64, result: Result<Bytes, String>);

    /// The channel closed; called exactly once per channel
    fn on_channel_closed(&self, target: ChannelTarget, reason: CloseReason);
}

pub struct Channel {
    target: ChannelTarget,
    address: String,
    state: AtomicU8,
    /// Origin of the monotonic activity ticks
    opened: Instant,
    /// Milliseconds after `opened` of the last frame written
    write_tick: AtomicU64,
    /// Milliseconds after `opened` of the last frame read
    read_tick: AtomicU64,
    /// Wall-clock epoch millis of the last write, for reporting only
    last_write: AtomicU64,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: watch::Sender<bool>,
    close_reason: Mutex<Option<CloseReason>>,
    owner: Weak<dyn ChannelOwner>,
    logger: Logger,
}

impl Channel {
    /// Connect to `address`, announce the channel target, and start its tasks.
    pub async fn open(
        connector: &dyn Connector,
        address: &str,
        client_id: Uuid,
        target: ChannelTarget,
        owner: Weak<dyn ChannelOwner>,
        logger: &Logger,
    ) -> Result<Arc<Channel>, ChannelError> {
        let stream = connector.connect(address).await?;
        let (reader, mut writer) = tokio::io::split(stream);

        write_frame(&mut writer, &Frame::Hello { client_id, target })
            .await
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;

        let channel = Self::start(reader, writer, address, target, owner, logger);
        debug!(channel.logger, "Channel opened");
        Ok(channel)
    }

    fn start<S>(
        reader: ReadHalf<S>,
        writer: WriteHalf<S>,
        address: &str,
        target: ChannelTarget,
        owner: Weak<dyn ChannelOwner>,
        logger: &Logger,
    ) -> Arc<Channel>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let now = now_millis();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let channel = Arc::new(Channel {
            target,
            address: address.to_string(),
            state: AtomicU8::new(STATE_OPEN),
            opened: Instant::now(),
            write_tick: AtomicU64::new(0),
            read_tick: AtomicU64::new(0),
            last_write: AtomicU64::new(now),
            outbound,
            close_reason: Mutex::new(None),
            owner,
            logger: logger.new(o!("channel" => target.to_string(), "address" => address.to_string())),
            shutdown,
        });

        tokio::spawn(write_loop(channel.clone(), writer, outbound_rx));
        tokio::spawn(read_loop(channel.clone(), reader));
        channel
    }

    pub fn target(&self) -> ChannelTarget {
        self.target
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ChannelState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ChannelState::Open,
            STATE_CLOSING => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Milliseconds since the epoch of the last frame written to the stream
    pub fn last_write_millis(&self) -> u64 {
        self.last_write.load(Ordering::SeqCst)
    }

    /// Time since the last frame was written, on the monotonic clock
    pub fn write_idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.opened + Duration::from_millis(self.write_tick.load(Ordering::SeqCst)))
    }

    /// Time since the last frame was read, on the monotonic clock
    pub fn read_idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.opened + Duration::from_millis(self.read_tick.load(Ordering::SeqCst)))
    }

    fn ticks(&self) -> u64 {
        self.opened.elapsed().as_millis() as u64
    }

    fn mark_written(&self) {
        self.write_tick.store(self.ticks(), Ordering::SeqCst);
        self.last_write.store(now_millis(), Ordering::SeqCst);
    }

    fn mark_read(&self) {
        self.read_tick.store(self.ticks(), Ordering::SeqCst);
    }

    /// Why the channel closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Queue a frame on the channel's writer.
    pub fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if !self.is_alive() {
            return Err(ChannelError::Closed);
        }
        self.outbound.send(frame).map_err(|_| ChannelError::Closed)
    }

    pub fn send_request(&self, correlation_id: u64, payload: Bytes) -> Result<(), ChannelError> {
        self.send(Frame::Request { correlation_id, payload })
    }

    /// Close the channel. Only the first call has any effect; it stops both
    /// tasks and notifies the owner. Returns whether this call closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        *self.close_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        match &reason {
            CloseReason::HeartbeatTimeout | CloseReason::ProtocolViolation(_) | CloseReason::Io(_) => {
                warn!(self.logger, "Channel closed"; "reason" => %reason);
            }
            _ => {
                debug!(self.logger, "Channel closed"; "reason" => %reason);
            }
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.on_channel_closed(self.target, reason);
        }
        true
    }

    fn handle_inbound(&self, frame: Frame) {
        match frame {
            Frame::Response { correlation_id, payload } => {
                self.notify_response(correlation_id, Ok(payload));
            }
            Frame::ErrorResponse { correlation_id, message } => {
                self.notify_response(correlation_id, Err(message));
            }
            Frame::Pong => {}
            Frame::Ping => {
                let _ = self.send(Frame::Pong);
            }
            unexpected @ (Frame::Hello { .. } | Frame::Request { .. }) => {
                self.close(CloseReason::ProtocolViolation(format!(
                    "unexpected {} frame from member",
                    unexpected.kind_name()
                )));
            }
        }
    }

    fn notify_response(&self, correlation_id: u64, result: Result<Bytes, String>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.on_response(self.target, correlation_id, result);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.target)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

async fn write_loop<W>(channel: Arc<Channel>, mut writer: WriteHalf<W>, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite,
{
    let mut shutdown = channel.shutdown.subscribe();
    let drained = loop {
        let frame = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break false,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break true,
            },
        };

        // The write itself races shutdown; a member that stopped reading
        // must not hold the stream open past close.
        let written = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break false,
            written = write_frame(&mut writer, &frame) => written,
        };
        match written {
            Ok(()) => channel.mark_written(),
            Err(e) => {
                channel.close(CloseReason::Io(format!("write failed: {}", e)));
                break false;
            }
        }
    };

    // Frames queued behind a close are never written
    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(channel.logger, "Dropped queued frames on close"; "frames" => dropped);
    }

    if drained {
        let _ = writer.shutdown().await;
    }
}

async fn read_loop<R>(channel: Arc<Channel>, mut reader: ReadHalf<R>)
where
    R: AsyncRead,
{
    let mut shutdown = channel.shutdown.subscribe();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        let result = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => return,
            result = read_frame(&mut reader, &mut buf) => result,
        };

        match result {
            Ok(Some(frame)) => {
                channel.mark_read();
                channel.handle_inbound(frame);
            }
            Ok(None) => {
                info!(channel.logger, "Member closed the channel");
                channel.close(CloseReason::Io("connection closed by member".to_string()));
                return;
            }
            Err(ChannelError::ProtocolViolation(msg)) => {
                channel.close(CloseReason::ProtocolViolation(msg));
                return;
            }
            Err(e) => {
                channel.close(CloseReason::Io(e.to_string()));
                return;
            }
        }
    }
}
