//! Command-line configuration for both tunnel roles.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::auth;
use crate::keys;

pub const DEFAULT_INITIATOR_PORT: u16 = 9876;
pub const DEFAULT_ACCEPTOR_PORT: u16 = 9877;
pub const DEFAULT_WS_PATH: &str = "jdwp";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_DEADLINE_MINS: u64 = 60;

/// Tunnels JDWP over an authenticated WebSocket.
#[derive(Debug, Parser)]
#[command(name = "jdwptun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run next to the debugger: accept local connections and tunnel them to
    /// a remote acceptor
    #[command(visible_alias = "client")]
    Initiator(InitiatorArgs),

    /// Run next to the debuggee: terminate tunnels and forward them to
    /// allow-listed local ports
    #[command(visible_alias = "server")]
    Acceptor(AcceptorArgs),
}

#[derive(Debug, Args, Serialize)]
pub struct InitiatorArgs {
    /// Local address the debugger connects to
    #[arg(long, default_value = "127.0.0.1")]
    pub bind_host: String,

    /// Local port the debugger connects to
    #[arg(long, default_value_t = DEFAULT_INITIATOR_PORT)]
    pub bind_port: u16,

    /// Remote acceptor host
    #[arg(long)]
    pub server_host: String,

    /// Remote acceptor port
    #[arg(long, default_value_t = DEFAULT_ACCEPTOR_PORT)]
    pub server_port: u16,

    /// WebSocket upgrade path on the acceptor
    #[arg(long, default_value = DEFAULT_WS_PATH)]
    pub ws_path: String,

    /// Origin header to send with the upgrade request
    #[arg(long)]
    pub ws_origin: Option<String>,

    /// Debuggee JDWP port to request; must be allow-listed on the acceptor
    #[arg(long)]
    pub jdwp_port: u16,

    /// Public key file published by the acceptor
    #[arg(long, env = "JDWPTUN_KEY_FILE", default_value = keys::DEFAULT_KEY_FILE)]
    pub key_file: PathBuf,

    /// Seconds a relay direction may stay idle, 0 disables the deadline
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout: u64,
}

#[derive(Debug, Args, Serialize)]
pub struct AcceptorArgs {
    /// Address the WebSocket endpoint binds to
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Port the WebSocket endpoint binds to
    #[arg(long, default_value_t = DEFAULT_ACCEPTOR_PORT)]
    pub bind_port: u16,

    /// WebSocket upgrade path
    #[arg(long, default_value = DEFAULT_WS_PATH)]
    pub ws_path: String,

    /// Debuggee ports that may be tunneled to, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub allowed_ports: Vec<u16>,

    /// Host the verified debuggee port is dialed on
    #[arg(long, default_value = "127.0.0.1")]
    pub target_host: String,

    /// File the public key is published to
    #[arg(long, env = "JDWPTUN_KEY_FILE", default_value = keys::DEFAULT_KEY_FILE)]
    pub key_file: PathBuf,

    /// Seconds a freshness token stays acceptable
    #[arg(long, default_value_t = auth::DEFAULT_TOKEN_WINDOW_SECS)]
    pub token_window: u64,

    /// Seconds a relay direction may stay idle, 0 disables the deadline
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout: u64,

    /// Minutes until the acceptor shuts itself down, 0 disables
    #[arg(long, default_value_t = DEFAULT_DEADLINE_MINS)]
    pub deadline: u64,
}

/// WebSocket paths may be configured with or without the leading slash.
pub fn normalize_ws_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Maps the idle-timeout flag to the relay policy; 0 means no deadline.
pub fn idle_timeout(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_acceptor_port_list() {
        let cli =
            Cli::try_parse_from(["jdwptun", "acceptor", "--allowed-ports", "5005,5006"]).unwrap();
        match cli.command {
            Command::Acceptor(args) => {
                assert_eq!(args.allowed_ports, vec![5005, 5006]);
                assert_eq!(args.bind_port, DEFAULT_ACCEPTOR_PORT);
                assert_eq!(args.token_window, auth::DEFAULT_TOKEN_WINDOW_SECS);
            }
            _ => panic!("expected acceptor mode"),
        }
    }

    #[test]
    fn acceptor_requires_allowed_ports() {
        assert!(Cli::try_parse_from(["jdwptun", "acceptor"]).is_err());
    }

    #[test]
    fn parses_initiator_flags() {
        assert!(Cli::try_parse_from(["jdwptun", "initiator"]).is_err());
        let cli = Cli::try_parse_from([
            "jdwptun",
            "initiator",
            "--server-host",
            "debug.example.com",
            "--jdwp-port",
            "5005",
        ])
        .unwrap();
        match cli.command {
            Command::Initiator(args) => {
                assert_eq!(args.server_host, "debug.example.com");
                assert_eq!(args.jdwp_port, 5005);
                assert_eq!(args.bind_port, DEFAULT_INITIATOR_PORT);
                assert_eq!(args.server_port, DEFAULT_ACCEPTOR_PORT);
            }
            _ => panic!("expected initiator mode"),
        }
    }

    #[test]
    fn subcommand_aliases_match_the_roles() {
        let client = Cli::try_parse_from([
            "jdwptun",
            "client",
            "--server-host",
            "h",
            "--jdwp-port",
            "5005",
        ])
        .unwrap();
        assert!(matches!(client.command, Command::Initiator(_)));

        let server =
            Cli::try_parse_from(["jdwptun", "server", "--allowed-ports", "5005"]).unwrap();
        assert!(matches!(server.command, Command::Acceptor(_)));
    }

    #[test]
    fn ws_path_gets_a_leading_slash() {
        assert_eq!(normalize_ws_path("jdwp"), "/jdwp");
        assert_eq!(normalize_ws_path("/jdwp"), "/jdwp");
    }

    #[test]
    fn zero_idle_timeout_disables_the_deadline() {
        assert_eq!(idle_timeout(0), None);
        assert_eq!(idle_timeout(90), Some(Duration::from_secs(90)));
    }
}
