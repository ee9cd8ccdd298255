//! Runtime configuration from the environment (and `.env`).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{ChatError, ChatResult};
use crate::logging::LogConfig;
use crate::models::input::{UserIdInput, ValidateExt};

const DEFAULT_RELAY_URL: &str = "ws://localhost:9001";
const DEFAULT_DB_PATH: &str = "infomundi-chat.db";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Where the local key pair is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStoreBackend {
    /// Platform credential store (Keychain, Credential Manager, kernel keyutils)
    Keyring,
    /// `identity_keys` table in the chat database
    #[default]
    Sqlite,
    /// Lost on exit; every run is a new identity
    Memory,
}

impl FromStr for KeyStoreBackend {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(ChatError::Config(format!(
                "Unknown key store '{}' (expected keyring, sqlite or memory)",
                other
            ))),
        }
    }
}

impl fmt::Display for KeyStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Keyring => "keyring",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub user_id: String,
    pub relay_url: String,
    /// Directory and history go over HTTP when set, otherwise over the relay
    pub api_url: Option<String>,
    pub access_token: Option<String>,
    pub key_store: KeyStoreBackend,
    pub db_path: PathBuf,
    pub request_timeout: Duration,
    pub log: LogConfig,
}

impl ChatConfig {
    /// Read `INFOMUNDI_*` variables, loading `.env` first if present
    pub fn from_env() -> ChatResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ChatResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let user_id = get("INFOMUNDI_USER_ID")
            .ok_or_else(|| ChatError::Config("INFOMUNDI_USER_ID is required".to_string()))?;
        UserIdInput {
            user_id: user_id.clone(),
        }
        .validate_input()?;

        // Priority: build-time env -> runtime env -> default
        let relay_url = option_env!("INFOMUNDI_RELAY_URL")
            .map(String::from)
            .or_else(|| get("INFOMUNDI_RELAY_URL"))
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
        check_url(&relay_url, &["ws", "wss"])?;

        let api_url = get("INFOMUNDI_API_URL");
        if let Some(api_url) = &api_url {
            check_url(api_url, &["http", "https"])?;
        }

        let key_store = get("INFOMUNDI_KEY_STORE")
            .map(|v| v.parse::<KeyStoreBackend>())
            .transpose()?
            .unwrap_or_default();

        let request_timeout_secs = match get("INFOMUNDI_REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| {
                    ChatError::Config(format!(
                        "INFOMUNDI_REQUEST_TIMEOUT_SECS must be a positive integer, got '{}'",
                        raw
                    ))
                })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        Ok(Self {
            user_id,
            relay_url,
            api_url,
            access_token: get("INFOMUNDI_ACCESS_TOKEN"),
            key_store,
            db_path: get("INFOMUNDI_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            request_timeout: Duration::from_secs(request_timeout_secs),
            log: LogConfig {
                log_dir: get("INFOMUNDI_LOG_DIR").map(PathBuf::from),
                ..LogConfig::default()
            },
        })
    }
}

fn check_url(raw: &str, schemes: &[&str]) -> ChatResult<()> {
    let url = Url::parse(raw)
        .map_err(|e| ChatError::Config(format!("Invalid URL '{}': {}", raw, e)))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ChatError::Config(format!(
            "URL '{}' must use one of: {}",
            raw,
            schemes.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ChatResult<ChatConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ChatConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("INFOMUNDI_USER_ID", "alice")]).unwrap();

        assert_eq!(config.user_id, "alice");
        assert_eq!(
            config.relay_url,
            option_env!("INFOMUNDI_RELAY_URL").unwrap_or(DEFAULT_RELAY_URL)
        );
        assert!(config.api_url.is_none());
        assert!(config.access_token.is_none());
        assert_eq!(config.key_store, KeyStoreBackend::Sqlite);
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.log.log_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("INFOMUNDI_USER_ID", "alice"),
            ("INFOMUNDI_API_URL", "https://infomundi.net"),
            ("INFOMUNDI_ACCESS_TOKEN", "t0k"),
            ("INFOMUNDI_KEY_STORE", "KeyRing"),
            ("INFOMUNDI_DB_PATH", "/tmp/chat.db"),
            ("INFOMUNDI_REQUEST_TIMEOUT_SECS", "3"),
            ("INFOMUNDI_LOG_DIR", "/tmp/logs"),
        ])
        .unwrap();

        assert_eq!(config.api_url.as_deref(), Some("https://infomundi.net"));
        assert_eq!(config.access_token.as_deref(), Some("t0k"));
        assert_eq!(config.key_store, KeyStoreBackend::Keyring);
        assert_eq!(config.db_path, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.log.log_dir, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn test_missing_user_id() {
        let err = config(&[]).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));

        let err = config(&[("INFOMUNDI_USER_ID", "   ")]).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let with_alice = |key: &'static str, value: &'static str| {
            config(&[("INFOMUNDI_USER_ID", "alice"), (key, value)])
        };

        assert!(with_alice("INFOMUNDI_KEY_STORE", "vault").is_err());
        assert!(with_alice("INFOMUNDI_API_URL", "ftp://x").is_err());
        assert!(with_alice("INFOMUNDI_REQUEST_TIMEOUT_SECS", "0").is_err());
        assert!(config(&[("INFOMUNDI_USER_ID", "al\u{0007}ice")]).is_err());
    }

    #[test]
    fn test_key_store_names_round_trip() {
        let backends = [
            KeyStoreBackend::Keyring,
            KeyStoreBackend::Sqlite,
            KeyStoreBackend::Memory,
        ];
        for backend in backends {
            assert_eq!(backend.to_string().parse::<KeyStoreBackend>().unwrap(), backend);
        }
    }
}
