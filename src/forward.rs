use bytes::Bytes;
use http::{Method, Request, header::HOST};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::future::Future;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::RelayError;
use crate::protocol::{TunnelRequest, TunnelResponse, headers_from_map};

/// Headers that describe one hop and must not be replayed on the next.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Issues a tunnelled request against the protected local service.
pub trait LocalForwarder: Send + Sync + 'static {
    fn forward(
        &self,
        request: TunnelRequest,
    ) -> impl Future<Output = Result<TunnelResponse, RelayError>> + Send;
}

/// Forwards over a fresh HTTP/1 connection to `host:port` per request.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    host: String,
    port: u16,
}

impl HttpForwarder {
    #[must_use]
    pub const fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn is_reframed(name: &str) -> bool {
    HOP_BY_HOP.contains(&name) || name == "content-length"
}

impl LocalForwarder for HttpForwarder {
    async fn forward(&self, request: TunnelRequest) -> Result<TunnelResponse, RelayError> {
        let authority = self.authority();
        let stream = TcpStream::connect(&authority).await.map_err(|e| {
            RelayError::LocalForward(format!("failed to connect to {authority}: {e}"))
        })?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| RelayError::LocalForward(format!("HTTP handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Local connection error");
            }
        });

        let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            RelayError::LocalForward(format!("invalid method {:?}", request.method))
        })?;
        let mut builder = Request::builder()
            .method(method)
            .uri(&request.path)
            .header(HOST, &authority);
        for (name, value) in &request.headers {
            if name != "host" && !is_reframed(name) {
                builder = builder.header(name, value);
            }
        }
        let local_request = builder
            .body(Full::new(Bytes::from(request.body.unwrap_or_default())))
            .map_err(|e| RelayError::LocalForward(format!("invalid request: {e}")))?;

        let response = sender
            .send_request(local_request)
            .await
            .map_err(|e| RelayError::LocalForward(format!("request failed: {e}")))?;
        let status = response.status().as_u16();
        let mut headers = headers_from_map(response.headers());
        headers.retain(|name, _| !is_reframed(name));
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RelayError::LocalForward(format!("failed to read response: {e}")))?
            .to_bytes();

        debug!(status, bytes = body.len(), "Local service responded");
        Ok(TunnelResponse {
            status,
            headers,
            body: (!body.is_empty()).then(|| String::from_utf8_lossy(&body).into_owned()),
        })
    }
}
