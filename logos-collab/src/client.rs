//! WebSocket sync client.
//!
//! Provides:
//! - [`connect_websocket`]: one connection as a pair of byte channels
//! - [`SyncClient`]: connect, history sync, live session and reconnect
//!   with backoff, driving a [`SyncOrchestrator`]
//!
//! Local edits made while disconnected stay in the store's change feed and
//! are sent once the session is live again; unacknowledged batches are
//! retried by the outbound queue across reconnects.
//!
//! Reference: Kleppmann, Chapter 5, "Replication"

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use logos_core::{DocumentStore, ModelRegistry};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::orchestrator::{RunExit, SyncConfig, SyncEvent, SyncOrchestrator};
use crate::protocol::{ProtocolError, SyncMessage};
use crate::transport::{ChannelTransport, Transport};
use crate::ParticipantId;

/// Frames buffered per direction on one connection.
const CHANNEL_CAPACITY: usize = 256;

/// Reconnect backoff: `initial_delay`, doubling up to `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once
    /// the attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Open a WebSocket and expose it as channels.
///
/// Spawns a writer task (outgoing channel → binary frames) and a reader
/// task (binary or text frames → incoming channel). The incoming channel
/// closes when the socket does; dropping the outgoing sender closes the
/// socket.
pub async fn connect_websocket(
    url: &str,
) -> Result<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>), ProtocolError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

    // Writer task: forward outgoing channel to WebSocket
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Reader task: forward WebSocket frames to the incoming channel
    tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            let bytes: Vec<u8> = match msg {
                Ok(Message::Binary(data)) => data.into(),
                Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if in_tx.send(bytes).await.is_err() {
                break;
            }
        }
    });

    Ok((out_tx, in_rx))
}

/// Sends ephemeral commands on the client's current connection.
///
/// Cloneable and usable while [`SyncClient::run`] owns the session.
#[derive(Clone)]
pub struct CommandSender {
    participant_id: ParticipantId,
    transport: Arc<ChannelTransport>,
}

impl CommandSender {
    /// Best effort: `Ok(false)` when disconnected or the socket is backed up.
    pub fn send(
        &self,
        command_type: impl Into<String>,
        params: serde_json::Value,
    ) -> Result<bool, ProtocolError> {
        let bytes = SyncMessage::command(self.participant_id, command_type, params).encode()?;
        Ok(self.transport.send(bytes))
    }
}

/// The sync client: one participant in one session.
pub struct SyncClient {
    orchestrator: SyncOrchestrator,
    transport: Arc<ChannelTransport>,
    store: Arc<dyn DocumentStore>,
    server_url: String,
    reconnect: ReconnectPolicy,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(
        participant_id: ParticipantId,
        session_id: Uuid,
        server_url: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        registry: Arc<ModelRegistry>,
        config: SyncConfig,
    ) -> Self {
        let transport = Arc::new(ChannelTransport::new());
        let (orchestrator, event_rx) = SyncOrchestrator::new(
            participant_id,
            session_id,
            config,
            store.clone(),
            registry,
            transport.clone(),
        );
        Self {
            orchestrator,
            transport,
            store,
            server_url: server_url.into(),
            reconnect: ReconnectPolicy::default(),
            event_rx: Some(event_rx),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Session endpoint: `<server_url>/<session_id>`.
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            self.orchestrator.session_id()
        )
    }

    pub fn commands(&self) -> CommandSender {
        CommandSender {
            participant_id: self.orchestrator.participant_id(),
            transport: self.transport.clone(),
        }
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    /// Connect and sync until `shutdown` fires (or its sender is dropped).
    ///
    /// Lost connections are re-established per the reconnect policy. Fails
    /// only when the policy's attempt budget runs out.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), ProtocolError> {
        // Subscribed before the first connect so no local edit is missed
        let mut changes = self.store.subscribe();
        let url = self.url();
        let mut failures: u32 = 0;

        loop {
            self.orchestrator.connect();
            match connect_websocket(&url).await {
                Ok((outgoing, mut inbound)) => {
                    log::info!("Connected to {url}");
                    failures = 0;
                    self.transport.attach(outgoing);
                    if let Err(e) = self.orchestrator.begin_sync() {
                        log::warn!("Sync request failed: {e}");
                    }

                    let exit = self
                        .orchestrator
                        .run(&mut changes, &mut inbound, &mut shutdown)
                        .await;
                    self.transport.detach();

                    match exit {
                        RunExit::Shutdown | RunExit::ChangeFeedClosed => {
                            self.orchestrator.dispose();
                            return Ok(());
                        }
                        RunExit::InboundClosed => {
                            log::warn!("Lost connection to {url}");
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Connect to {url} failed: {e}");
                    self.orchestrator.mark_disconnected();
                }
            }

            failures += 1;
            let Some(delay) = self.reconnect.delay_for(failures) else {
                log::error!("Giving up on {url} after {} attempts", failures);
                self.orchestrator.dispose();
                return Err(ProtocolError::ConnectionFailed(format!(
                    "{url}: reconnect attempts exhausted"
                )));
            };
            log::debug!("Reconnecting to {url} in {delay:?}");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => {
                    self.orchestrator.dispose();
                    return Ok(());
                }
            }
        }
    }
}
