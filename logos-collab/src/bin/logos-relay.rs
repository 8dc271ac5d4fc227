//! Standalone relay. Log level via `RUST_LOG`.

use std::time::Duration;

use clap::Parser;
use log::info;
use logos_collab::{ServerConfig, SyncServer};

#[derive(Debug, Parser)]
#[command(name = "logos-relay")]
#[command(about = "Relay for Logos operation sync sessions", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(env = "LOGOS_RELAY_ADDR", default_value = "127.0.0.1:9090")]
    bind_addr: String,

    /// Batches kept per room for late joiners
    #[arg(long, env = "LOGOS_RELAY_HISTORY", default_value_t = 4096,
          value_parser = clap::value_parser!(u32).range(1..))]
    history_capacity: u32,

    /// Maximum peers per room
    #[arg(long, env = "LOGOS_RELAY_MAX_PEERS", default_value_t = 100,
          value_parser = clap::value_parser!(u32).range(1..))]
    max_peers: u32,

    /// Seconds an empty room keeps its history
    #[arg(long, env = "LOGOS_RELAY_IDLE_TTL", default_value_t = 3600)]
    idle_room_ttl_secs: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr,
            history_capacity: self.history_capacity as usize,
            max_peers_per_room: self.max_peers as usize,
            idle_room_ttl: Duration::from_secs(self.idle_room_ttl_secs),
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Args::parse().into_config();
    info!(
        "Starting Logos relay on {} (history {} batches per room, idle rooms kept {:?})",
        config.bind_addr, config.history_capacity, config.idle_room_ttl
    );

    SyncServer::new(config).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let config = Args::try_parse_from(["logos-relay"]).unwrap().into_config();
        let defaults = ServerConfig::default();
        assert_eq!(config.history_capacity, defaults.history_capacity);
        assert_eq!(config.max_peers_per_room, defaults.max_peers_per_room);
        assert_eq!(config.idle_room_ttl, defaults.idle_room_ttl);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Args::try_parse_from([
            "logos-relay",
            "0.0.0.0:7000",
            "--history-capacity",
            "16",
            "--idle-room-ttl-secs",
            "5",
        ])
        .unwrap()
        .into_config();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.history_capacity, 16);
        assert_eq!(config.idle_room_ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_bad_history_capacity() {
        for bad in ["0", "-3", "lots"] {
            let parsed =
                Args::try_parse_from(["logos-relay", "--history-capacity", bad]);
            assert!(parsed.is_err(), "accepted {bad}");
        }
    }
}
