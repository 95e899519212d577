use std::{collections::HashMap, sync::Mutex, time::SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::TunnelMessage;

/// Length in bytes of the random part of an identifier; rendered as hex.
const IDENTIFIER_BYTES: usize = 6;

/// Work queued for a session writer by request handlers.
#[derive(Debug)]
pub enum Outbound {
    Frame(TunnelMessage),
    /// Tear the channel down with the given reason.
    Close(String),
}

/// Sending half of a session's outbound frame queue.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    connection: u64,
    outbound: mpsc::Sender<Outbound>,
}

impl ChannelHandle {
    #[must_use]
    pub const fn new(connection: u64, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            connection,
            outbound,
        }
    }

    #[must_use]
    pub const fn connection(&self) -> u64 {
        self.connection
    }

    /// The session is still draining the queue onto its socket.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queues a frame for the session writer. Returns false once the session
    /// has stopped reading its queue.
    pub async fn send(&self, message: TunnelMessage) -> bool {
        self.outbound.send(Outbound::Frame(message)).await.is_ok()
    }

    /// Asks the session to close its channel. A no-op if it already has.
    pub async fn close(&self, reason: String) {
        let _ = self.outbound.send(Outbound::Close(reason)).await;
    }
}

struct Tunnel {
    channel: ChannelHandle,
    created_at: SystemTime,
}

pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<String, Tunnel>>,
    generate: fn() -> String,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::with_generator(random_identifier)
    }
}

impl TunnelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry drawing candidate identifiers from `generate`.
    #[must_use]
    pub fn with_generator(generate: fn() -> String) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            generate,
        }
    }

    /// Allocates a fresh identifier for `channel` and registers it. An
    /// identifier still registered is never handed out again.
    pub fn register(&self, channel: ChannelHandle) -> String {
        self.register_with(channel, self.generate)
    }

    /// Generation and insertion happen under one lock, so two registrations
    /// can never both commit the same identifier.
    pub fn register_with(
        &self,
        channel: ChannelHandle,
        mut generate: impl FnMut() -> String,
    ) -> String {
        let mut tunnels = self.lock();
        let identifier = loop {
            let candidate = generate();
            if !tunnels.contains_key(&candidate) {
                break candidate;
            }
            debug!(identifier = %candidate, "Identifier collision, regenerating");
        };

        info!(
            identifier = %identifier,
            connection = channel.connection(),
            active_tunnels = tunnels.len() + 1,
            "Tunnel registered"
        );
        tunnels.insert(
            identifier.clone(),
            Tunnel {
                channel,
                created_at: SystemTime::now(),
            },
        );
        identifier
    }

    #[must_use]
    pub fn lookup(&self, identifier: &str) -> Option<ChannelHandle> {
        self.lock().get(identifier).map(|t| t.channel.clone())
    }

    /// Removes the tunnel if present. Returns whether anything was removed.
    pub fn remove(&self, identifier: &str) -> bool {
        let Some(tunnel) = self.lock().remove(identifier) else {
            return false;
        };
        let lifetime = tunnel.created_at.elapsed().unwrap_or_default();
        info!(
            identifier = %identifier,
            lifetime_secs = lifetime.as_secs(),
            "Tunnel removed"
        );
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Tunnel>> {
        // Poisoning is ignored: no critical section leaves the map half-updated.
        self.tunnels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn random_identifier() -> String {
    hex::encode(rand::random::<[u8; IDENTIFIER_BYTES]>())
}
