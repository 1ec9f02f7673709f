use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::auth::AccountEntry;
use crate::error::ConfigError;

/// Real-time chat hub
#[derive(Parser, Debug, Clone)]
#[command(name = "chat_hub")]
#[command(about = "WebSocket chat hub with rooms, presence and history")]
#[command(version)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CHAT_LISTEN", default_value = "127.0.0.1:9999")]
    pub listen: SocketAddr,

    /// JSON file listing accounts and their token digests
    #[arg(long, env = "CHAT_ACCOUNTS")]
    pub accounts: Option<PathBuf>,

    /// Largest accepted inbound frame, in bytes
    #[arg(long, env = "CHAT_MAX_FRAME_SIZE", default_value_t = 4096)]
    pub max_frame_size: usize,

    /// Drop a connection that sends nothing for this long
    #[arg(long, env = "CHAT_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    /// Per-connection outbound queue capacity
    #[arg(long, env = "CHAT_OUTBOUND_CAPACITY", default_value_t = 100)]
    pub outbound_capacity: usize,

    /// Shared inbound queue capacity
    #[arg(long, env = "CHAT_INBOUND_CAPACITY", default_value_t = 100)]
    pub inbound_capacity: usize,

    /// Path to TLS certificate (PEM format)
    #[arg(long, env = "CHAT_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(long, env = "CHAT_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Print the digest to put in the accounts file for a token, then exit
    #[arg(long)]
    pub hash_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: SocketAddr::from(([127, 0, 0, 1], 9999)),
            accounts: None,
            max_frame_size: 4096,
            idle_timeout_secs: 600,
            outbound_capacity: 100,
            inbound_capacity: 100,
            tls_cert: None,
            tls_key: None,
            hash_token: None,
        }
    }
}

impl Config {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn tls(&self) -> Result<Option<(&Path, &Path)>, ConfigError> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some((cert.as_path(), key.as_path()))),
            (None, None) => Ok(None),
            _ => Err(ConfigError::IncompleteTls),
        }
    }

    pub fn load_accounts(&self) -> Result<Vec<AccountEntry>, ConfigError> {
        match &self.accounts {
            Some(path) => load_accounts(path),
            None => Ok(Vec::new()),
        }
    }
}

pub fn load_accounts(path: &Path) -> Result<Vec<AccountEntry>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_digest;
    use crate::messages::Role;
    use std::io::Write;

    #[test]
    fn parses_flags_with_defaults() {
        let config = Config::parse_from(["chat_hub", "--listen", "0.0.0.0:8080"]);
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.max_frame_size, 4096);
        assert_eq!(config.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.outbound_capacity, 100);
        assert!(config.tls().unwrap().is_none());
    }

    #[test]
    fn tls_needs_both_halves() {
        let config = Config::parse_from(["chat_hub", "--tls-cert", "cert.pem"]);
        assert!(matches!(config.tls(), Err(ConfigError::IncompleteTls)));
    }

    #[test]
    fn loads_accounts_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let body = format!(
            r#"[{{"id":"alice","name":"Alice","role":"admin","token_sha256":"{}"}},
                {{"id":"bob","name":"Bob","token_sha256":"{}"}}]"#,
            token_digest("a"),
            token_digest("b")
        );
        file.write_all(body.as_bytes()).unwrap();

        let entries = load_accounts(file.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].account.role, Role::Admin);
        assert_eq!(entries[1].account.role, Role::User);
    }

    #[test]
    fn missing_accounts_file_is_an_error() {
        let config = Config {
            accounts: Some(PathBuf::from("/definitely/not/here.json")),
            ..Config::default()
        };
        assert!(matches!(config.load_accounts(), Err(ConfigError::Io(_))));
    }
}
