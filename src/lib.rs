//! HTTP Tunnel Relay
//!
//! Exposes a local HTTP service through a public relay. A tunnel client keeps a
//! persistent WebSocket channel open to the relay; the relay routes public HTTP
//! requests by Host subdomain onto that channel and returns the replies.

pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod security;
pub mod session;
pub mod supervisor;

// Re-export commonly used types and functions
pub use config::{ClientConfig, FileConfig, RelayConfig, load_config};
pub use error::RelayError;
pub use forward::{HttpForwarder, LocalForwarder};
pub use pending::PendingRequests;
pub use protocol::{TunnelMessage, TunnelRequest, TunnelResponse};
pub use registry::{ChannelHandle, TunnelRegistry};
pub use relay::{Relay, handle_public_request};
pub use security::{client_ip, parse_original_client_ip};
pub use session::{RelayState, run_session};
pub use supervisor::{Backoff, ChannelState, Supervisor};
