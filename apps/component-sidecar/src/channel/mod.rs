//! Persistent connection to the orchestrator.
//!
//! The orchestrator speaks Socket.IO over a plain WebSocket. The channel
//! authenticates with a fresh ASAP token on every connection attempt,
//! reconnects forever with jittered exponential backoff, runs each
//! `command` event in its own task and acknowledges it exactly once on the
//! connection that delivered it.

pub mod packet;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use sidecar_proto::{error_keys, Command, CommandResponse, CommandType, ErrorPayload, EVENT_COMMAND};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;

use crate::auth::{AsapSigner, AuthError};
use crate::commander::{invalid_command_response, CommandHandler};
use crate::metrics;
use crate::stats::ReportSink;
use packet::{Packet, PacketError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub path: String,
    pub component_key: String,
    /// Drop emissions instead of waiting when the outbound queue is full.
    pub volatile_events: bool,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub outbound_capacity: usize,
}

impl ChannelConfig {
    /// `<url><path>/?EIO=4&transport=websocket&componentKey=<key>`
    pub fn endpoint(&self) -> Result<Url, ChannelError> {
        let path = self.path.trim_matches('/');
        let base = self.url.trim_end_matches('/');
        let raw = if path.is_empty() {
            format!("{base}/")
        } else {
            format!("{base}/{path}/")
        };
        let mut url = Url::parse(&raw)?;
        url.query_pairs_mut()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket")
            .append_pair("componentKey", &self.component_key);
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("socket not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection rejected: {0}")]
    ConnectRejected(String),
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("invalid orchestrator url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

struct Session {
    sid: String,
    outbound: mpsc::Sender<String>,
}

struct ChannelInner {
    config: ChannelConfig,
    signer: Arc<AsapSigner>,
    handler: Arc<dyn CommandHandler>,
    state: watch::Sender<ChannelState>,
    session: RwLock<Option<Session>>,
}

#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<ChannelInner>,
}

impl CommandChannel {
    pub fn new(
        config: ChannelConfig,
        signer: Arc<AsapSigner>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                signer,
                handler,
                state,
                session: RwLock::new(None),
            }),
        }
    }

    /// Starts the connection loop. It only ends when the handle is aborted.
    pub fn spawn(&self) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move { channel.run().await })
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    pub fn socket_id(&self) -> Option<String> {
        self.inner.session.read().as_ref().map(|s| s.sid.clone())
    }

    /// Emits `event` with `payload` as its single argument. Fails with
    /// [`ChannelError::NotConnected`] while no session is established.
    pub async fn push<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), ChannelError> {
        let payload = serde_json::to_value(payload).map_err(ChannelError::Encode)?;
        self.emit(event, payload).await
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        let outbound = match self.inner.session.read().as_ref() {
            Some(session) => session.outbound.clone(),
            None => {
                warn!(event, "could not emit updates, socket not connected");
                return Err(ChannelError::NotConnected);
            }
        };
        let frame = Packet::Event {
            id: None,
            name: event.to_string(),
            args: vec![payload],
        }
        .encode();

        if self.inner.config.volatile_events {
            match outbound.try_send(frame) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(event, "outbound queue full, dropping volatile event");
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::NotConnected),
            }
        } else {
            outbound
                .send(frame)
                .await
                .map_err(|_| ChannelError::NotConnected)
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.inner.state.send_replace(state);
    }

    async fn run(self) {
        let base_delay = self.inner.config.reconnect_delay;
        let max_delay = self.inner.config.reconnect_max_delay.max(base_delay);
        let mut delay = base_delay;
        loop {
            self.set_state(ChannelState::Connecting);
            match self.connect_and_run().await {
                Ok(reason) => {
                    info!(reason = %reason, "socket disconnected");
                    delay = base_delay;
                }
                Err(err) => {
                    metrics::SOCKET_CONNECTS.with_label_values(&["error"]).inc();
                    error!(error = %err, "socket connect error, regenerating token");
                }
            }
            *self.inner.session.write() = None;
            metrics::SOCKET_CONNECTED.set(0);

            let wait = jitter(delay);
            debug!(delay_ms = wait.as_millis() as u64, "reconnecting");
            tokio::time::sleep(wait).await;
            delay = (delay * 2).min(max_delay);
        }
    }

    /// One connection attempt. `Err` means no session was established;
    /// `Ok` carries the reason an established session ended.
    async fn connect_and_run(&self) -> Result<String, ChannelError> {
        let config = &self.inner.config;
        let url = config.endpoint()?;
        let token = self.inner.signer.sign()?;
        debug!(url = %url, "connecting to orchestrator");

        let (ws_stream, _) =
            tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
                .await
                .map_err(|_| ChannelError::Handshake("timed out connecting".into()))??;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let handshake = match next_packet(&mut ws_receiver).await? {
            Packet::Open(handshake) => handshake,
            other => {
                return Err(ChannelError::Handshake(format!(
                    "expected open packet, got {other:?}"
                )))
            }
        };
        ws_sender
            .send(Message::Text(
                Packet::Connect(Some(json!({ "token": token }))).encode(),
            ))
            .await?;

        let sid = loop {
            match next_packet(&mut ws_receiver).await? {
                Packet::Connect(data) => {
                    break data
                        .as_ref()
                        .and_then(|d| d.get("sid"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| handshake.sid.clone());
                }
                Packet::ConnectError(data) => {
                    let message = data
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| data.to_string());
                    return Err(ChannelError::ConnectRejected(message));
                }
                Packet::Ping => ws_sender.send(Message::Text(Packet::Pong.encode())).await?,
                Packet::Close | Packet::Disconnect => return Err(ChannelError::Closed),
                _ => {}
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(config.outbound_capacity.max(1));
        *self.inner.session.write() = Some(Session {
            sid: sid.clone(),
            outbound: outbound_tx.clone(),
        });
        self.set_state(ChannelState::Connected);
        metrics::SOCKET_CONNECTS.with_label_values(&["ok"]).inc();
        metrics::SOCKET_CONNECTED.set(1);
        info!(
            component_key = %config.component_key,
            socket = %sid,
            "socket connected"
        );

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if ws_sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        let liveness = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
        let reason = loop {
            let message = match tokio::time::timeout(liveness, ws_receiver.next()).await {
                Err(_) => break "ping timeout".to_string(),
                Ok(None) => break "transport close".to_string(),
                Ok(Some(Err(err))) => break format!("transport error: {err}"),
                Ok(Some(Ok(message))) => message,
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break "transport close".to_string(),
                _ => continue,
            };
            match Packet::decode(&text) {
                Ok(Packet::Ping) => {
                    if outbound_tx.send(Packet::Pong.encode()).await.is_err() {
                        break "transport close".to_string();
                    }
                }
                Ok(Packet::Event { id, name, args }) if name == EVENT_COMMAND => {
                    self.dispatch_command(id, args, outbound_tx.clone());
                }
                Ok(Packet::Event { name, .. }) => debug!(event = %name, "ignoring event"),
                Ok(Packet::Disconnect) => break "io server disconnect".to_string(),
                Ok(Packet::Close) => break "transport close".to_string(),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "ignoring undecodable packet"),
            }
        };

        *self.inner.session.write() = None;
        self.set_state(ChannelState::Disconnected);
        writer.abort();
        Ok(reason)
    }

    /// Handles one `command` event in its own task. The handler runs in a
    /// nested task so a panic still produces an ERROR acknowledgement.
    fn dispatch_command(&self, ack_id: Option<u64>, args: Vec<Value>, outbound: mpsc::Sender<String>) {
        let raw = args.into_iter().next().unwrap_or(Value::Null);
        let cmd_id = match raw.get("cmdId") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let span = info_span!("command", cmd_id = %cmd_id, kind = %kind);
        let handler = Arc::clone(&self.inner.handler);

        tokio::spawn(
            async move {
                let response = match serde_json::from_value::<Command>(raw.clone()) {
                    Ok(command) => {
                        info!("received command");
                        run_handler(handler, command).await
                    }
                    Err(err) => {
                        warn!(error = %err, "received invalid command");
                        invalid_command_response(&raw, &err.to_string())
                    }
                };

                let Some(id) = ack_id else {
                    warn!("command arrived without ack id, response dropped");
                    return;
                };
                let payload = match serde_json::to_value(&response) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(error = %err, "failed to encode command response");
                        return;
                    }
                };
                let frame = Packet::Ack {
                    id,
                    args: vec![payload],
                }
                .encode();
                if outbound.send(frame).await.is_err() {
                    warn!("could not acknowledge command, socket closed");
                } else {
                    info!(response_type = ?response.response_type, "command acknowledged");
                }
            }
            .instrument(span),
        );
    }
}

async fn run_handler(handler: Arc<dyn CommandHandler>, command: Command) -> CommandResponse {
    let cmd_id = command.cmd_id.clone();
    let kind: CommandType = command.kind.clone();
    let component_key = command.payload.component_key.clone();
    match tokio::spawn(async move { handler.handle(command).await }.in_current_span()).await {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "command handler failed");
            CommandResponse::error(
                cmd_id,
                kind,
                ErrorPayload {
                    component_key,
                    session_id: None,
                    error_key: error_keys::COMMAND_FAILED.into(),
                    error_message: "Command handler failed".into(),
                },
            )
        }
    }
}

#[async_trait]
impl ReportSink for CommandChannel {
    async fn push(&self, event: &'static str, payload: Value) -> Result<(), ChannelError> {
        self.emit(event, payload).await
    }
}

async fn next_packet<S>(receiver: &mut S) -> Result<Packet, ChannelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(CONNECT_TIMEOUT, receiver.next())
            .await
            .map_err(|_| ChannelError::Handshake("timed out waiting for server".into()))?;
        match message {
            None | Some(Ok(Message::Close(_))) => return Err(ChannelError::Closed),
            Some(Err(err)) => return Err(err.into()),
            Some(Ok(Message::Text(text))) => match Packet::decode(&text)? {
                Packet::Noop => continue,
                packet => return Ok(packet),
            },
            Some(Ok(_)) => continue,
        }
    }
}

/// Spreads `delay` by ±50%.
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, path: &str) -> ChannelConfig {
        ChannelConfig {
            url: url.into(),
            path: path.into(),
            component_key: "key 1".into(),
            volatile_events: true,
            reconnect_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_millis(5_000),
            outbound_capacity: 16,
        }
    }

    #[test]
    fn endpoint_carries_engine_io_query() {
        let url = config("ws://localhost:8015", "/jitsi-component-selector/ws")
            .endpoint()
            .expect("url");
        assert_eq!(
            url.as_str(),
            "ws://localhost:8015/jitsi-component-selector/ws/?EIO=4&transport=websocket&componentKey=key+1"
        );
    }

    #[test]
    fn endpoint_tolerates_slashes() {
        let url = config("wss://selector.example/", "socket.io/")
            .endpoint()
            .expect("url");
        assert_eq!(url.path(), "/socket.io/");
        assert!(config("not a url", "/ws").endpoint().is_err());
    }

    struct IdleHandler;

    #[async_trait]
    impl CommandHandler for IdleHandler {
        async fn handle(&self, command: Command) -> CommandResponse {
            CommandResponse::error(
                command.cmd_id,
                command.kind,
                ErrorPayload {
                    component_key: command.payload.component_key,
                    session_id: None,
                    error_key: error_keys::COMMAND_FAILED.into(),
                    error_message: "unused".into(),
                },
            )
        }
    }

    /// A channel with a session whose writer never drains `rx`.
    fn stalled(volatile_events: bool) -> (CommandChannel, mpsc::Receiver<String>) {
        let mut config = config("ws://localhost:8015", "/ws");
        config.volatile_events = volatile_events;
        config.outbound_capacity = 1;
        let channel = CommandChannel::new(
            config,
            Arc::new(crate::auth::tests::test_signer()),
            Arc::new(IdleHandler),
        );
        let (outbound, rx) = mpsc::channel(1);
        *channel.inner.session.write() = Some(Session {
            sid: "socket-1".into(),
            outbound,
        });
        (channel, rx)
    }

    #[tokio::test]
    async fn volatile_push_drops_frame_when_queue_is_full() {
        let (channel, mut rx) = stalled(true);
        channel
            .push("status-updates", &json!({"n": 1}))
            .await
            .expect("queued");
        channel
            .push("status-updates", &json!({"n": 2}))
            .await
            .expect("dropped but ok");

        let frame = rx.try_recv().expect("first frame");
        assert_eq!(
            Packet::decode(&frame).expect("packet"),
            Packet::Event {
                id: None,
                name: "status-updates".into(),
                args: vec![json!({"n": 1})],
            }
        );
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn push_to_closed_writer_is_not_connected() {
        for volatile_events in [true, false] {
            let (channel, rx) = stalled(volatile_events);
            drop(rx);
            let err = channel
                .push("status-updates", &json!({}))
                .await
                .expect_err("writer gone");
            assert!(matches!(err, ChannelError::NotConnected));
        }
    }

    #[test]
    fn jitter_stays_within_half() {
        for _ in 0..100 {
            let wait = jitter(Duration::from_millis(1_000));
            assert!(wait >= Duration::from_millis(500) && wait <= Duration::from_millis(1_500));
        }
    }
}
