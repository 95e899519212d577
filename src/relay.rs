use anyhow::{Context, Result};
use bytes::Bytes;
use http::{
    HeaderName, HeaderValue, Request, Response, StatusCode,
    header::{CONTENT_TYPE, HOST},
    request::Parts,
};
use http_body_util::{BodyExt, Full};
use hyper::{body::Body, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use std::{convert::Infallible, fmt::Display, future::Future, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::protocol::{TunnelRequest, TunnelResponse, headers_from_map};
use crate::security::client_ip;
use crate::session::{RelayState, run_session};

/// Answered by the relay itself, never forwarded.
pub const HEALTH_PATH: &str = "/_health";

/// Both relay listeners, bound and ready to serve.
pub struct Relay {
    state: Arc<RelayState>,
    ws_listener: TcpListener,
    http_listener: TcpListener,
}

impl Relay {
    /// Binds the tunnel and public listeners. Port 0 picks a free port; the
    /// chosen one is what tunnel URLs advertise.
    pub async fn bind(mut config: RelayConfig) -> Result<Self> {
        let ws_addr = SocketAddr::new(config.bind_ip, config.ws_port);
        let ws_listener = TcpListener::bind(ws_addr)
            .await
            .with_context(|| format!("Failed to bind to address {ws_addr}"))?;
        let http_addr = SocketAddr::new(config.bind_ip, config.http_port);
        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind to address {http_addr}"))?;

        config.ws_port = ws_listener
            .local_addr()
            .context("Failed to get tunnel listener local address")?
            .port();
        config.http_port = http_listener
            .local_addr()
            .context("Failed to get public listener local address")?
            .port();

        Ok(Self {
            state: RelayState::new(config),
            ws_listener,
            http_listener,
        })
    }

    #[must_use]
    pub fn state(&self) -> Arc<RelayState> {
        self.state.clone()
    }

    /// Accepts tunnel clients and public traffic until `shutdown` resolves,
    /// then drops every open channel and connection.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let config = &self.state.config;
        info!(
            ws_port = config.ws_port,
            http_port = config.http_port,
            base_domain = %config.base_domain,
            request_timeout_secs = self.state.pending().timeout().as_secs(),
            "Relay listening"
        );

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.ws_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let state = self.state.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                error!(client_addr = %addr, error = %e, "Connection failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept tunnel connection"),
                },
                accepted = self.http_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        connections.spawn(serve_public(stream, addr, self.state.clone()));
                    }
                    Err(e) => error!(error = %e, "Failed to accept public connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(
            open_connections = connections.len(),
            active_tunnels = self.state.registry().len(),
            "Relay shutting down"
        );
        connections.shutdown().await;
        Ok(())
    }
}

#[tracing::instrument(skip(stream, addr, state), fields(client_addr = %addr))]
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RelayState>,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .context("Failed to perform WebSocket handshake")?;
    info!("Tunnel client connected");
    run_session(ws_stream, state, addr).await
}

async fn serve_public(stream: TcpStream, addr: SocketAddr, state: Arc<RelayState>) {
    let service = service_fn(move |req| handle_public_request(state.clone(), addr, req));
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(client_addr = %addr, error = %e, "Public connection ended with error");
    }
}

/// Routes one public request by the first label of its host.
pub async fn handle_public_request<B>(
    state: Arc<RelayState>,
    peer: SocketAddr,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Display,
{
    Ok(route(&state, peer, req).await)
}

async fn route<B>(state: &RelayState, peer: SocketAddr, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Display,
{
    if req.uri().path() == HEALTH_PATH {
        return json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "active_tunnels": state.registry().len(),
                "pending_requests": state.pending().len(),
            }),
        );
    }

    let host = request_host(&req);
    let Some(identifier) = tunnel_identifier(&host) else {
        return error_response(state, &RelayError::TunnelNotFound(host));
    };
    let forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let client = client_ip(peer, forwarded_for, &state.config.trusted_proxies);

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(identifier = %identifier, error = %e, "Failed to read request body");
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({"error": format!("Failed to read request body: {e}")}),
            );
        }
    };
    let request = tunnel_request(&parts, &body, peer, &host);

    info!(
        identifier = %identifier,
        client_ip = %client,
        method = %request.method,
        path = %request.path,
        "Forwarding request"
    );

    match state.forward(&identifier, request).await {
        Ok(response) => {
            debug!(identifier = %identifier, status = response.status, "Tunnel responded");
            into_http_response(response)
        }
        Err(e) => {
            warn!(identifier = %identifier, error = %e, "Request failed");
            error_response(state, &e)
        }
    }
}

fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default()
        .to_string()
}

/// First DNS label of a Host value, ignoring any `:port` suffix.
#[must_use]
pub fn tunnel_identifier(host: &str) -> Option<String> {
    let name = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    };
    name.split('.')
        .next()
        .filter(|label| !label.is_empty())
        .map(str::to_ascii_lowercase)
}

fn tunnel_request(parts: &Parts, body: &Bytes, peer: SocketAddr, host: &str) -> TunnelRequest {
    let mut headers = headers_from_map(&parts.headers);
    let peer_ip = peer.ip().to_string();
    headers
        .entry("x-forwarded-for".to_string())
        .and_modify(|chain| {
            chain.push_str(", ");
            chain.push_str(&peer_ip);
        })
        .or_insert_with(|| peer_ip.clone());
    headers
        .entry("x-forwarded-host".to_string())
        .or_insert_with(|| host.to_string());
    headers
        .entry("x-forwarded-proto".to_string())
        .or_insert_with(|| "http".to_string());

    TunnelRequest {
        method: parts.method.to_string(),
        path: parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string(),
        headers,
        body: (!body.is_empty()).then(|| String::from_utf8_lossy(body).into_owned()),
    }
}

fn into_http_response(response: TunnelResponse) -> Response<Full<Bytes>> {
    let Ok(status) = StatusCode::from_u16(response.status) else {
        return json_response(
            StatusCode::BAD_GATEWAY,
            &json!({"error": format!("Tunnel returned invalid status {}", response.status)}),
        );
    };

    let mut http_response = Response::new(Full::new(Bytes::from(
        response.body.unwrap_or_default(),
    )));
    *http_response.status_mut() = status;
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(header_name), Ok(header_value)) => {
                http_response.headers_mut().append(header_name, header_value);
            }
            _ => debug!(header = %name, "Dropping invalid response header"),
        }
    }
    http_response
}

fn error_response(state: &RelayState, error: &RelayError) -> Response<Full<Bytes>> {
    let body = match error {
        RelayError::TunnelNotFound(identifier) => json!({
            "error": "Tunnel not found",
            "subdomain": identifier,
            "active_tunnels": state.registry().len(),
        }),
        other => json!({"error": other.to_string()}),
    };
    json_response(error.status(), &body)
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
