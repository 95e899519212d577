use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tunnel-relay",
    version,
    about = "Expose a local HTTP service through a public relay"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Optional TOML file with timeout, keepalive and reconnect settings
    #[arg(short, long, env = "TUNNEL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay: accept tunnel clients and serve public HTTP traffic
    Relay(RelayArgs),

    /// Connect to a relay and forward its traffic to a local port
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Port tunnel clients connect to
    #[arg(long, env = "WS_PORT", default_value_t = 8080)]
    pub ws_port: u16,

    /// Port public HTTP traffic arrives on
    #[arg(long, env = "HTTP_PORT", default_value_t = 8081)]
    pub http_port: u16,

    /// Domain tunnel identifiers are prefixed to in public URLs
    #[arg(long, env = "BASE_DOMAIN", default_value = "tunnel.localhost")]
    pub base_domain: String,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Local port to expose
    #[arg(default_value_t = 3000)]
    pub local_port: u16,

    /// WebSocket address of the relay
    #[arg(long, env = "RELAY_URL", default_value = "ws://localhost:8080")]
    pub relay_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_port_defaults_to_3000() {
        let cli = Cli::try_parse_from(["tunnel-relay", "client"]).unwrap();
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.local_port, 3000);
    }

    #[test]
    fn client_takes_positional_port() {
        let cli = Cli::try_parse_from([
            "tunnel-relay",
            "client",
            "5173",
            "--relay-url",
            "ws://relay.example:9000",
        ])
        .unwrap();
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.local_port, 5173);
        assert_eq!(args.relay_url, "ws://relay.example:9000");
    }

    #[test]
    fn relay_accepts_port_overrides() {
        let cli = Cli::try_parse_from([
            "tunnel-relay",
            "relay",
            "--ws-port",
            "9000",
            "--http-port",
            "9001",
            "--config",
            "relay.toml",
        ])
        .unwrap();
        let Command::Relay(args) = cli.command else {
            panic!("expected relay subcommand");
        };
        assert_eq!(args.ws_port, 9000);
        assert_eq!(args.http_port, 9001);
        assert_eq!(cli.config, Some(PathBuf::from("relay.toml")));
    }

    #[test]
    fn rejects_invalid_port() {
        assert!(Cli::try_parse_from(["tunnel-relay", "client", "70000"]).is_err());
    }
}
