//! Client side of the tunnel: keeps one channel to the relay open and answers
//! the requests it carries.
//!
//! The channel moves through [`ChannelState`] and is reopened after every
//! failure with exponential backoff. The backoff only resets once the relay has
//! completed a handshake, so a relay that accepts connections but never sends
//! `ready` is retried ever more slowly. An open channel on which the relay has
//! gone silent is treated as lost.

use anyhow::{Context, Result, anyhow, bail};
use futures_util::StreamExt;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::{Instant, sleep_until, timeout},
};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::channel::{Frame, OUTBOUND_QUEUE, read_frame, send_frame};
use crate::config::ClientConfig;
use crate::forward::LocalForwarder;
use crate::protocol::{Headers, TunnelMessage, TunnelRequest, TunnelResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    HandshakePending,
    Open { url: String, identifier: String },
}

/// Reconnect delay: `min(base * 2^attempts, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = 2u32
            .checked_pow(self.attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max));
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

pub struct Supervisor<F> {
    config: ClientConfig,
    forwarder: Arc<F>,
    state: watch::Sender<ChannelState>,
    backoff: Backoff,
}

impl<F: LocalForwarder> Supervisor<F> {
    pub fn new(config: ClientConfig, forwarder: F) -> Self {
        let backoff = Backoff::new(config.base_delay, config.max_delay);
        Self {
            config,
            forwarder: Arc::new(forwarder),
            state: watch::Sender::new(ChannelState::Disconnected),
            backoff,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Connects and reconnects until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            self.state.send_replace(ChannelState::Connecting);
            info!(relay_url = %self.config.relay_url, "Connecting to relay");

            let outcome = tokio::select! {
                () = &mut shutdown => break,
                outcome = self.connect_and_serve() => outcome,
            };
            self.state.send_replace(ChannelState::Disconnected);
            match outcome {
                Ok(()) => info!("Relay closed the tunnel channel"),
                Err(e) => warn!(error = format!("{e:#}"), "Tunnel channel failed"),
            }

            let delay = self.backoff.next_delay();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.attempts(),
                "Reconnecting"
            );
            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.state.send_replace(ChannelState::Disconnected);
        info!("Tunnel client stopped");
    }

    /// One channel lifetime: handshake, then serve requests until it closes.
    async fn connect_and_serve(&mut self) -> Result<()> {
        let handshake_limit = self.config.handshake_timeout;
        let liveness_limit = self.config.liveness_timeout;
        let handshake_deadline = Instant::now() + handshake_limit;

        let (ws_stream, _) = timeout(handshake_limit, connect_async(self.config.relay_url.as_str()))
            .await
            .map_err(|_| anyhow!("No connection to relay within {handshake_limit:?}"))?
            .with_context(|| format!("Failed to connect to relay {}", self.config.relay_url))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let init = TunnelMessage::Init {
            local_port: self.config.local_port,
        };
        timeout(handshake_limit, send_frame(&mut ws_sender, &init))
            .await
            .map_err(|_| anyhow!("Handshake not written within {handshake_limit:?}"))??;
        self.state.send_replace(ChannelState::HandshakePending);
        debug!(local_port = self.config.local_port, "Handshake sent");

        let (responses_tx, mut responses_rx) = mpsc::channel(OUTBOUND_QUEUE);
        // Dropped with this function: requests still in flight are abandoned.
        let mut in_flight = JoinSet::new();
        let mut open = false;
        // Until `ready`, the handshake deadline; afterwards, last frame + liveness limit.
        let mut deadline = handshake_deadline;

        loop {
            tokio::select! {
                item = ws_receiver.next() => {
                    let frame = read_frame(item)?;
                    if open {
                        deadline = Instant::now() + liveness_limit;
                    }
                    let message = match frame {
                        Frame::Message(message) => message,
                        Frame::Control => continue,
                        Frame::Closed => return Ok(()),
                    };
                    match message {
                        TunnelMessage::Ready { url, identifier } if !open => {
                            open = true;
                            deadline = Instant::now() + liveness_limit;
                            self.backoff.reset();
                            info!(url = %url, identifier = %identifier, local_port = self.config.local_port, "Tunnel ready");
                            self.state.send_replace(ChannelState::Open { url, identifier });
                        }
                        TunnelMessage::Ping => send_frame(&mut ws_sender, &TunnelMessage::Pong).await?,
                        TunnelMessage::Request { id, method, path, headers, body } if open => {
                            let request = TunnelRequest { method, path, headers, body };
                            let forwarder = self.forwarder.clone();
                            let responses = responses_tx.clone();
                            in_flight.spawn(async move {
                                let response = answer(forwarder.as_ref(), &id, request).await;
                                // The channel may be gone; the relay fails the request itself then.
                                let _ = responses.send(TunnelMessage::response(id, response)).await;
                            });
                        }
                        other => bail!(
                            "Protocol violation: unexpected {} message (handshake complete: {open})",
                            other.kind()
                        ),
                    }
                }
                Some(response) = responses_rx.recv() => send_frame(&mut ws_sender, &response).await?,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                () = sleep_until(deadline) => {
                    if open {
                        bail!("Relay silent for {liveness_limit:?}, dropping channel");
                    }
                    bail!("No ready from relay within {handshake_limit:?}");
                }
            }
        }
    }
}

/// Produces the one response owed for a request, whatever the local service did.
async fn answer<F: LocalForwarder>(forwarder: &F, id: &str, request: TunnelRequest) -> TunnelResponse {
    debug!(request_id = %id, method = %request.method, path = %request.path, "Forwarding to local service");
    match forwarder.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(request_id = %id, error = %e, "Local service request failed");
            TunnelResponse {
                status: e.status().as_u16(),
                headers: Headers::from([(
                    "content-type".to_string(),
                    "text/plain; charset=utf-8".to_string(),
                )]),
                body: Some(format!("Bad Gateway: {e}")),
            }
        }
    }
}
