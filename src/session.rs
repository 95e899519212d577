use anyhow::{Result, anyhow, bail};
use futures_util::{Sink, SinkExt, StreamExt};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as TungsteniteError, Message},
};
use tracing::{debug, info, warn};

use crate::channel::{Frame, OUTBOUND_QUEUE, read_frame, send_frame};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::pending::PendingRequests;
use crate::protocol::{TunnelMessage, TunnelRequest, TunnelResponse};
use crate::registry::{ChannelHandle, Outbound, TunnelRegistry};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Writes one message, giving up once the peer has stopped reading for `limit`.
async fn write_frame<S>(sink: &mut S, message: &TunnelMessage, limit: Duration) -> Result<()>
where
    S: Sink<Message, Error = TungsteniteError> + Unpin,
{
    timeout(limit, send_frame(sink, message))
        .await
        .map_err(|_| {
            anyhow!(
                "Peer stopped reading: {} message not written within {limit:?}",
                message.kind()
            )
        })?
}

/// State shared by every session and the public HTTP listener.
pub struct RelayState {
    pub config: RelayConfig,
    registry: TunnelRegistry,
    pending: Arc<PendingRequests>,
    connections: AtomicU64,
}

impl RelayState {
    #[must_use]
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Self::with_registry(config, TunnelRegistry::new())
    }

    #[must_use]
    pub fn with_registry(config: RelayConfig, registry: TunnelRegistry) -> Arc<Self> {
        let pending = PendingRequests::new(config.request_timeout);
        Arc::new(Self {
            config,
            registry,
            pending,
            connections: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub const fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    fn next_connection(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `request` through the tunnel registered as `identifier` and waits
    /// for its single outcome: the client's response, a timeout, or a failure
    /// of the tunnel.
    pub async fn forward(
        &self,
        identifier: &str,
        request: TunnelRequest,
    ) -> Result<TunnelResponse, RelayError> {
        let channel = self
            .registry
            .lookup(identifier)
            .ok_or_else(|| RelayError::TunnelNotFound(identifier.to_string()))?;
        if !channel.is_writable() {
            return Err(RelayError::TunnelUnavailable(identifier.to_string()));
        }

        let id = correlation_id(channel.connection());
        self.dispatch(identifier, &channel, id, request).await
    }

    async fn dispatch(
        &self,
        identifier: &str,
        channel: &ChannelHandle,
        id: String,
        request: TunnelRequest,
    ) -> Result<TunnelResponse, RelayError> {
        let (sink, outcome) = oneshot::channel();
        if let Err(e) = self.pending.add(&id, identifier, sink) {
            // Correlation on this channel can no longer be trusted.
            channel.close(e.to_string()).await;
            return Err(e);
        }

        debug!(
            request_id = %id,
            identifier = %identifier,
            method = %request.method,
            path = %request.path,
            "Dispatching request to tunnel"
        );
        // Registered before sending: a response can never overtake its entry.
        if !channel
            .send(TunnelMessage::request(id.clone(), request))
            .await
        {
            self.pending
                .fail(&id, RelayError::TunnelUnavailable(identifier.to_string()));
        }

        outcome.await.unwrap_or(Err(RelayError::TunnelDisconnected))
    }
}

/// `<connection>-<unix millis>-<random>`, all hex.
fn correlation_id(connection: u64) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{connection:x}-{millis:x}-{:016x}", rand::random::<u64>())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingHandshake,
    Active,
    Closed,
}

/// Server side of one accepted tunnel channel.
struct RelaySession {
    state: Arc<RelayState>,
    connection: u64,
    phase: SessionPhase,
    identifier: Option<String>,
    outbound: mpsc::Sender<Outbound>,
    last_seen: Instant,
}

impl RelaySession {
    fn new(state: Arc<RelayState>, connection: u64, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            state,
            connection,
            phase: SessionPhase::AwaitingHandshake,
            identifier: None,
            outbound,
            last_seen: Instant::now(),
        }
    }

    /// Applies one inbound message; returns the reply to send, if any.
    fn handle_message(&mut self, message: TunnelMessage) -> Result<Option<TunnelMessage>> {
        match (self.phase, message) {
            (SessionPhase::AwaitingHandshake | SessionPhase::Active, TunnelMessage::Init { local_port }) => {
                Ok(Some(self.handshake(local_port)))
            }
            (SessionPhase::Active, TunnelMessage::Response { id, status, headers, body }) => {
                let response = TunnelResponse {
                    status,
                    headers,
                    body,
                };
                if !self.state.pending.complete(&id, response) {
                    debug!(request_id = %id, "Unknown request, response dropped");
                }
                Ok(None)
            }
            (SessionPhase::Active, TunnelMessage::Pong) => {
                self.last_seen = Instant::now();
                Ok(None)
            }
            (phase, other) => bail!(
                "Protocol violation: unexpected {} message while {phase:?}",
                other.kind()
            ),
        }
    }

    /// Registers a fresh tunnel. A repeated handshake then gives up the
    /// previous identifier, failing whatever was still pending on it. The old
    /// identifier is still registered while the new one is drawn, so it is
    /// never handed back.
    fn handshake(&mut self, local_port: u16) -> TunnelMessage {
        let channel = ChannelHandle::new(self.connection, self.outbound.clone());
        let identifier = self.state.registry.register(channel);
        self.release();
        let url = self.state.config.public_url(&identifier);

        info!(identifier = %identifier, local_port, url = %url, "Tunnel ready");
        self.identifier = Some(identifier.clone());
        self.phase = SessionPhase::Active;
        self.last_seen = Instant::now();
        TunnelMessage::Ready { url, identifier }
    }

    /// Keepalive tick: the ping to send, or an error if the peer is gone quiet.
    fn keepalive(&self) -> Result<Option<TunnelMessage>> {
        let silent_for = self.last_seen.elapsed();
        let limit = self.state.config.liveness_timeout;
        match self.phase {
            SessionPhase::AwaitingHandshake if silent_for > limit => {
                Err(anyhow!("No handshake within {limit:?}"))
            }
            SessionPhase::Active if silent_for > limit => {
                Err(anyhow!("No pong for {silent_for:?}, closing dead channel"))
            }
            SessionPhase::Active => Ok(Some(TunnelMessage::Ping)),
            SessionPhase::AwaitingHandshake | SessionPhase::Closed => Ok(None),
        }
    }

    fn release(&mut self) {
        if let Some(identifier) = self.identifier.take() {
            self.state.registry.remove(&identifier);
            self.state.pending.fail_all(&identifier);
        }
    }

    fn close(&mut self) {
        self.release();
        self.phase = SessionPhase::Closed;
    }
}

/// Runs the relay side of one tunnel channel until it closes.
///
/// However the loop ends, the tunnel is unregistered and every request still
/// waiting on it fails with [`RelayError::TunnelDisconnected`].
#[tracing::instrument(skip(websocket, state, peer), fields(client_addr = %peer))]
pub async fn run_session<S>(
    websocket: WebSocketStream<S>,
    state: Arc<RelayState>,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection = state.next_connection();
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let mut session = RelaySession::new(state.clone(), connection, outbound_tx);

    let write_limit = state.config.liveness_timeout;
    let period = state.config.keepalive_interval;
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(connection, "Awaiting tunnel handshake");

    let result: Result<()> = loop {
        tokio::select! {
            item = ws_receiver.next() => {
                let message = match read_frame(item) {
                    Ok(Frame::Message(message)) => message,
                    Ok(Frame::Control) => continue,
                    Ok(Frame::Closed) => break Ok(()),
                    Err(e) => break Err(e),
                };
                match session.handle_message(message) {
                    Ok(Some(reply)) => {
                        if let Err(e) = write_frame(&mut ws_sender, &reply, write_limit).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => break Err(e),
                }
            }
            Some(outbound) = outbound_rx.recv() => match outbound {
                Outbound::Frame(message) => {
                    if let Err(e) = write_frame(&mut ws_sender, &message, write_limit).await {
                        break Err(e);
                    }
                }
                Outbound::Close(reason) => break Err(anyhow!(reason)),
            },
            _ = keepalive.tick() => match session.keepalive() {
                Ok(Some(ping)) => {
                    if let Err(e) = write_frame(&mut ws_sender, &ping, write_limit).await {
                        break Err(e);
                    }
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            },
        }
    };

    // The queue closes before pending requests are failed, so a concurrent
    // forward either lands in fail_all or sees its send rejected.
    drop(outbound_rx);
    session.close();
    if timeout(CLOSE_TIMEOUT, ws_sender.close()).await.is_err() {
        debug!("Timed out sending close frame");
    }

    match &result {
        Ok(()) => info!(connection, "Tunnel session closed"),
        Err(e) => warn!(connection, error = %e, "Tunnel session closed with error"),
    }
    result
}
