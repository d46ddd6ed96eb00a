use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::registry::DEFAULT_NAMESPACE_LEN;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, handing out namespaces on `/`.
    Server(ServerArgs),
    /// Connect to a relay server and exchange messages in a namespace.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "SQW_LISTEN", default_value = "127.0.0.1:8000")]
    pub listen: SocketAddr,

    /// Length of generated namespace ids.
    #[arg(long, env = "NAMESPACE_LEN", default_value_t = DEFAULT_NAMESPACE_LEN)]
    pub namespace_len: usize,

    /// How long a relayed broadcast or request waits for each peer, in milliseconds.
    #[arg(long, env = "SQW_RELAY_TIMEOUT_MS", default_value_t = 5_000)]
    pub relay_timeout_ms: u64,

    /// How long a new connection may take to send its `connect` packet, in milliseconds.
    #[arg(long, env = "SQW_HANDSHAKE_TIMEOUT_MS", default_value_t = 10_000)]
    pub handshake_timeout_ms: u64,

    /// How long an allocated namespace may wait for its first member, in milliseconds.
    #[arg(long, env = "SQW_UNJOINED_TIMEOUT_MS", default_value_t = 30_000)]
    pub unjoined_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, env = "SQW_SERVER", default_value = "127.0.0.1:8000")]
    pub server: SocketAddr,

    /// Join this namespace directly instead of asking for one with a preflight.
    #[arg(value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Payload sent with `sqw:broadcast`.
    #[arg(long, default_value = "Hello world!")]
    pub message: String,

    /// Reply sent back for every `sqw:data` push.
    #[arg(long, default_value = "Thanks!")]
    pub reply: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults_to_preflight_mode() {
        let cli = Cli::try_parse_from(["sqw-relay", "client"]).expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.namespace, None);
        assert_eq!(args.reply, "Thanks!");
        assert_eq!(args.message, "Hello world!");
    }

    #[test]
    fn client_accepts_a_direct_namespace() {
        let cli = Cli::try_parse_from(["sqw-relay", "client", "abc123", "--reply", "ok"])
            .expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.namespace.as_deref(), Some("abc123"));
        assert_eq!(args.reply, "ok");
    }

    #[test]
    fn server_flags_parse() {
        let cli = Cli::try_parse_from([
            "sqw-relay",
            "server",
            "--listen",
            "127.0.0.1:0",
            "--namespace-len",
            "12",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.listen.port(), 0);
        assert_eq!(args.namespace_len, 12);
    }
}
