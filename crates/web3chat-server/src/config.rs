use std::net::SocketAddr;

use clap::Parser;
use web3chat_core::{BackendConfig, RetryPolicy, StoreConfig};

/// Command-line arguments for the relay daemon.
#[derive(Parser, Debug)]
#[command(author, version, about = "web3chat encrypted message relay", long_about = None)]
pub struct Args {
    /// SQLite database file.
    #[arg(long, env = "WEB3CHAT_DB", default_value = "web3chat.db")]
    pub db: String,

    /// Keep everything in memory instead of SQLite. Overrides `--db`.
    #[arg(long)]
    pub memory: bool,

    #[arg(long, env = "WEB3CHAT_BIND", default_value = "127.0.0.1:3001")]
    pub bind: SocketAddr,

    /// Identity the relay signs in to the backend as.
    #[arg(long, env = "WEB3CHAT_SERVICE_IDENTITY", default_value = "relay")]
    pub service_identity: String,

    /// Sign-in attempts before the relay gives up on a session.
    #[arg(long, default_value_t = RetryPolicy::default().max_attempts)]
    pub max_attempts: u32,
}

impl Args {
    pub fn store_config(&self) -> StoreConfig {
        let backend = if self.memory {
            BackendConfig::Memory
        } else {
            BackendConfig::Sqlite {
                path: self.db.clone(),
            }
        };
        StoreConfig {
            backend,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_sqlite() {
        let args = Args::parse_from(["web3chat-server"]);
        assert_eq!(args.bind, "127.0.0.1:3001".parse().unwrap());
        assert_eq!(args.service_identity, "relay");
        assert_eq!(
            args.store_config().backend,
            BackendConfig::Sqlite {
                path: "web3chat.db".into()
            }
        );
    }

    #[test]
    fn memory_flag_and_retry_override() {
        let args = Args::parse_from(["web3chat-server", "--memory", "--max-attempts", "7"]);
        let config = args.store_config();
        assert_eq!(config.backend, BackendConfig::Memory);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
    }
}
