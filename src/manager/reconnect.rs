//! Connect loops and connection supervision
//!
//! A connect loop is never aborted. Each loop carries a generation number and
//! keeps going only while its generation is the one registered for the
//! member, so cancelling means replacing or removing the registration. This
//! keeps an establishment that is already underway from leaking channels:
//! whatever it produces is either installed or closed.

use super::{LifecycleEvent, ManagerInner};
use crate::connection::Connection;
use crate::errors::{CloseReason, ConnectError};
use crate::member::{Member, MemberId};
use crate::net::stopped;
use slog::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub(super) struct ConnectTask {
    generation: u64,
    handle: JoinHandle<()>,
}

impl ConnectTask {
    pub(super) fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

impl ManagerInner {
    /// Start a connect loop for `member`.
    ///
    /// Unless `replace` is set, an already running loop for the member is kept.
    pub(super) fn spawn_connect(self: &Arc<Self>, member: Member, replace: bool) {
        if self.is_shut_down() {
            return;
        }
        let mut connecting = self.connecting.lock().unwrap_or_else(|e| e.into_inner());
        if !replace {
            if let Some(task) = connecting.get(&member.id) {
                if !task.handle.is_finished() {
                    return;
                }
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let member_id = member.id;
        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.connect_loop(member, generation).await });
        connecting.insert(member_id, ConnectTask { generation, handle });
    }

    /// Stop the member's connect loop after its current attempt
    pub(super) fn cancel_connect(&self, member_id: MemberId) {
        self.connecting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&member_id);
    }

    fn is_current(&self, member_id: MemberId, generation: u64) -> bool {
        self.connecting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&member_id)
            .map_or(false, |task| task.generation == generation)
    }

    fn release(&self, member_id: MemberId, generation: u64) {
        let mut connecting = self.connecting.lock().unwrap_or_else(|e| e.into_inner());
        if connecting.get(&member_id).map_or(false, |task| task.generation == generation) {
            connecting.remove(&member_id);
        }
    }

    async fn connect_loop(self: Arc<Self>, member: Member, generation: u64) {
        let policy = self.config.reconnect.clone();
        let mut backoff = policy.initial_backoff;
        let mut shutdown = self.shutdown.subscribe();

        for attempt in 1..=policy.max_attempts {
            if self.is_shut_down() || !self.is_current(member.id, generation) {
                return;
            }
            if self.live_connection(member.id).is_some() {
                self.release(member.id, generation);
                return;
            }

            let established =
                Connection::establish(member.clone(), &self.config, self.connector.as_ref(), &self.logger).await;
            match established {
                Ok(connection) => {
                    if !self.is_current(member.id, generation) {
                        connection.close(CloseReason::Explicit("connect cancelled".to_string()));
                        return;
                    }
                    match self.install(connection) {
                        Ok(_) => {
                            if attempt > 1 {
                                info!(self.logger, "Reconnected"; "member" => %member.id, "attempts" => attempt);
                            }
                            self.release(member.id, generation);
                            return;
                        }
                        Err(ConnectError::Aborted(reason)) => {
                            warn!(self.logger, "Connection died before it was installed";
                                "member" => %member.id,
                                "reason" => %reason
                            );
                        }
                        Err(e) => {
                            debug!(self.logger, "Connect loop ending"; "member" => %member.id, "reason" => %e);
                            self.release(member.id, generation);
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(self.logger, "Connection attempt failed";
                        "member" => %member.id,
                        "attempt" => attempt,
                        "retry_in_ms" => backoff.as_millis() as u64,
                        "error" => %e
                    );
                }
            }

            if attempt == policy.max_attempts {
                break;
            }
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = policy.next_backoff(backoff);
        }

        if self.is_current(member.id, generation) {
            error!(self.logger, "Giving up on member";
                "member" => %member.id,
                "attempts" => policy.max_attempts
            );
            self.release(member.id, generation);
            self.events.publish(LifecycleEvent::ReconnectFailed {
                member: member.id,
                attempts: policy.max_attempts,
            });
        }
    }

    /// Watch an installed connection and reconnect when it dies on its own
    pub(super) fn spawn_supervisor(self: &Arc<Self>, connection: Connection) {
        let inner = self.clone();
        tokio::spawn(async move {
            connection.closed().await;
            let reason = connection
                .close_reason()
                .unwrap_or_else(|| CloseReason::Io("connection closed".to_string()));

            // Explicit disconnects, removals and shutdown retire the entry themselves
            if !inner.retire(&connection, reason) || inner.is_shut_down() {
                return;
            }
            let member = inner
                .members
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&connection.member_id())
                .cloned();
            if let Some(member) = member {
                info!(inner.logger, "Reconnecting"; "member" => %member.id);
                inner.spawn_connect(member, true);
            }
        });
    }
}
