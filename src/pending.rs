use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{debug, warn};

use crate::{error::RelayError, protocol::TunnelResponse};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type Outcome = Result<TunnelResponse, RelayError>;

/// Receives the single outcome of a forwarded request.
pub type ResponseSink = oneshot::Sender<Outcome>;

struct PendingRequest {
    sink: ResponseSink,
    tunnel: String,
    dispatched_at: Instant,
    deadline: JoinHandle<()>,
}

impl PendingRequest {
    /// Consumes the entry. Callers must already have removed it from the table.
    fn resolve(self, outcome: Outcome) {
        self.deadline.abort();
        // The caller may have gone away; nobody is left to tell.
        let _ = self.sink.send(outcome);
    }
}

/// Requests dispatched to tunnels and still waiting for an answer.
///
/// Every entry leaves the table exactly once, through `complete`, `expire`,
/// `fail` or `fail_all`. Removal and deadline cancellation happen under the
/// same lock, so only the first of those to run reaches the sink.
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingRequest>>,
    timeout: Duration,
}

impl PendingRequests {
    #[must_use]
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a waiter for `id` and arms its deadline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add(
        self: &Arc<Self>,
        id: &str,
        tunnel: &str,
        sink: ResponseSink,
    ) -> Result<(), RelayError> {
        let mut entries = self.lock();
        if entries.contains_key(id) {
            return Err(RelayError::DuplicateRequest(id.to_string()));
        }

        // Spawned while the lock is held: the timer cannot observe the table
        // before the entry is in it.
        let deadline = tokio::spawn(expire_after(Arc::downgrade(self), id.to_string(), self.timeout));
        entries.insert(
            id.to_string(),
            PendingRequest {
                sink,
                tunnel: tunnel.to_string(),
                dispatched_at: Instant::now(),
                deadline,
            },
        );
        Ok(())
    }

    /// Delivers `response` to the waiter for `id`. Returns false when no such
    /// request is pending, e.g. because it already timed out.
    pub fn complete(&self, id: &str, response: TunnelResponse) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            debug!(request_id = %id, "Response for unknown request ignored");
            return false;
        };
        debug!(
            request_id = %id,
            identifier = %entry.tunnel,
            status = response.status,
            elapsed_ms = entry.dispatched_at.elapsed().as_millis() as u64,
            "Request completed"
        );
        entry.resolve(Ok(response));
        true
    }

    /// Fails the waiter for `id` with a gateway timeout, if still pending.
    pub fn expire(&self, id: &str) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        warn!(
            request_id = %id,
            identifier = %entry.tunnel,
            timeout_secs = self.timeout.as_secs(),
            "Request timed out"
        );
        entry.resolve(Err(RelayError::RequestTimeout(self.timeout)));
        true
    }

    /// Fails the waiter for `id` with `error`, if still pending.
    pub fn fail(&self, id: &str, error: RelayError) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        debug!(request_id = %id, identifier = %entry.tunnel, error = %error, "Request failed");
        entry.resolve(Err(error));
        true
    }

    /// Fails every request dispatched to `tunnel`. Returns how many there were.
    pub fn fail_all(&self, tunnel: &str) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.tunnel == tunnel)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = failed.len();
        for entry in failed {
            entry.resolve(Err(RelayError::TunnelDisconnected));
        }
        if count > 0 {
            warn!(identifier = %tunnel, failed = count, "Failed pending requests of closed tunnel");
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn expire_after(table: Weak<PendingRequests>, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(table) = table.upgrade() {
        table.expire(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Headers;
    use tokio_test::{assert_err, assert_ok};

    fn response(status: u16, body: &str) -> TunnelResponse {
        TunnelResponse {
            status,
            headers: Headers::from([("content-type".to_string(), "text/plain".to_string())]),
            body: Some(body.to_string()),
        }
    }

    #[tokio::test]
    async fn complete_delivers_response_once() {
        let table = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        let (tx, rx) = oneshot::channel();
        assert_ok!(table.add("r1", "t1", tx));

        assert!(table.complete("r1", response(200, "hello")));
        assert!(!table.complete("r1", response(500, "again")));

        assert_eq!(rx.await.unwrap().unwrap(), response(200, "hello"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let table = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert_ok!(table.add("r1", "t1", tx1));

        let err = assert_err!(table.add("r1", "t2", tx2));
        assert_eq!(err, RelayError::DuplicateRequest("r1".into()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn unknown_completion_is_ignored() {
        let table = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        assert!(!table.complete("missing", response(200, "")));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_with_gateway_timeout() {
        let table = PendingRequests::new(Duration::from_secs(30));
        assert_eq!(table.timeout(), Duration::from_secs(30));
        let (tx, rx) = oneshot::channel();
        assert_ok!(table.add("r1", "t1", tx));

        let outcome = rx.await.unwrap();
        assert_eq!(
            outcome,
            Err(RelayError::RequestTimeout(Duration::from_secs(30)))
        );
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_expiry_is_ignored() {
        let table = PendingRequests::new(Duration::from_secs(5));
        let (tx, rx) = oneshot::channel();
        assert_ok!(table.add("r1", "t1", tx));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!table.complete("r1", response(200, "late")));
        assert!(matches!(rx.await.unwrap(), Err(RelayError::RequestTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_cancels_deadline() {
        let table = PendingRequests::new(Duration::from_secs(5));
        let (tx, rx) = oneshot::channel();
        assert_ok!(table.add("r1", "t1", tx));
        assert!(table.complete("r1", response(201, "")));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!table.expire("r1"));
        assert_eq!(rx.await.unwrap().unwrap().status, 201);
    }

    #[tokio::test]
    async fn fail_all_only_touches_matching_tunnel() {
        let table = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        let (tx_a1, rx_a1) = oneshot::channel();
        let (tx_a2, rx_a2) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        assert_ok!(table.add("a1", "alpha", tx_a1));
        assert_ok!(table.add("a2", "alpha", tx_a2));
        assert_ok!(table.add("b1", "beta", tx_b));

        assert_eq!(table.fail_all("alpha"), 2);
        assert_eq!(table.fail_all("alpha"), 0);

        assert_eq!(rx_a1.await.unwrap(), Err(RelayError::TunnelDisconnected));
        assert_eq!(rx_a2.await.unwrap(), Err(RelayError::TunnelDisconnected));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(table.len(), 1);
        assert!(!table.complete("a1", response(200, "")));
        assert!(table.complete("b1", response(200, "")));
    }

    #[tokio::test]
    async fn fail_resolves_single_entry() {
        let table = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        let (tx, rx) = oneshot::channel();
        assert_ok!(table.add("r1", "t1", tx));

        assert!(table.fail("r1", RelayError::TunnelUnavailable("t1".into())));
        assert!(!table.fail("r1", RelayError::TunnelDisconnected));
        assert_eq!(
            rx.await.unwrap(),
            Err(RelayError::TunnelUnavailable("t1".into()))
        );
    }

    #[tokio::test]
    async fn dropped_caller_does_not_block_completion() {
        let table = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        let (tx, rx) = oneshot::channel();
        assert_ok!(table.add("r1", "t1", tx));
        drop(rx);
        assert!(table.complete("r1", response(200, "")));
        assert!(table.is_empty());
    }
}
