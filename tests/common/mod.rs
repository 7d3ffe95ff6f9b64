#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use gridlink::net::BoxedStream;
use gridlink::server::{InProcessNetwork, MemberServer, RequestHandler};
use gridlink::{
    ChannelError, ChannelTarget, ClientConfig, Connector, LifecycleEvent, Member, MemberId,
    ReconnectPolicy, RetryPolicy,
};
use slog::{o, Drain, Logger};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn create_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Short timers so failure scenarios finish quickly
pub fn fast_config() -> ClientConfig {
    ClientConfig::default()
        .with_heartbeat(Duration::from_millis(50), Duration::from_millis(300))
        .with_connect_timeout(Duration::from_secs(2))
        .with_reconnect(ReconnectPolicy {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            max_attempts: 20,
        })
        .with_retry(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(20),
        })
        .with_default_deadline(Duration::from_secs(5))
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Next lifecycle event, failing the test after five seconds
pub async fn next_event(events: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("lifecycle event should arrive")
        .expect("lifecycle channel should stay open")
}

/// Echoes, except that payloads starting with `block` are held for `hold`
pub struct BlockingHandler {
    pub hold: Duration,
}

#[async_trait]
impl RequestHandler for BlockingHandler {
    async fn handle(&self, _target: ChannelTarget, payload: Bytes) -> Result<Bytes, String> {
        if payload.starts_with(b"block") {
            tokio::time::sleep(self.hold).await;
        }
        Ok(payload)
    }
}

/// Holds the first request for a long time, echoes the rest
#[derive(Default)]
pub struct StallFirstHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl RequestHandler for StallFirstHandler {
    async fn handle(&self, _target: ChannelTarget, payload: Bytes) -> Result<Bytes, String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(payload)
    }
}

/// Answers every request with an error
pub struct RejectingHandler;

#[async_trait]
impl RequestHandler for RejectingHandler {
    async fn handle(&self, _target: ChannelTarget, _payload: Bytes) -> Result<Bytes, String> {
        Err("operation rejected".to_string())
    }
}

pub async fn echo_member(network: &InProcessNetwork, logger: &Logger) -> (Member, Arc<MemberServer>) {
    member_with(network, Arc::new(gridlink::server::EchoHandler), logger).await
}

pub async fn member_with(
    network: &InProcessNetwork,
    handler: Arc<dyn RequestHandler>,
    logger: &Logger,
) -> (Member, Arc<MemberServer>) {
    let server = MemberServer::new(MemberId::new_random(), handler, logger);
    let member = network.register_member(server.clone()).await;
    (member, server)
}

/// In-process connector whose streams after the first `prompt` ones open only
/// after `delay`
pub struct SlowReconnector {
    network: Arc<InProcessNetwork>,
    prompt: usize,
    delay: Duration,
    opened: AtomicUsize,
}

impl SlowReconnector {
    pub fn new(network: Arc<InProcessNetwork>, prompt: usize, delay: Duration) -> Self {
        Self { network, prompt, delay, opened: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Connector for SlowReconnector {
    async fn connect(&self, address: &str) -> Result<BoxedStream, ChannelError> {
        if self.opened.fetch_add(1, Ordering::SeqCst) >= self.prompt {
            tokio::time::sleep(self.delay).await;
        }
        self.network.connect(address).await
    }
}
