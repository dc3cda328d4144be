//! Environment-driven configuration for the relay server and the wrapper CLI.
//!
//! Both sides read `OMNARA_*` variables with the documented defaults.
//! Unparseable numeric values fall back to the default instead of aborting,
//! so a stray value never takes the relay down.

use std::sync::Once;

/// Install the rustls default crypto provider once (required by rustls 0.23+
/// before any TLS use; both reqwest and the wrapper's WebSocket client link
/// rustls).
pub fn ensure_rustls_provider() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Relay server settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub ws_host: String,
    pub ws_port: u16,
    pub history_bytes: usize,
    pub heartbeat_interval_secs: u64,
    /// Reserved for heartbeat-based eviction of stuck active sessions.
    pub heartbeat_miss_limit: u32,
    pub ended_retention_secs: u64,
    pub allowed_origins: Vec<String>,
    /// RS256 public key (PEM) used to verify API-key JWTs.
    pub jwt_public_key: Option<String>,
    /// Base URL of the external identity service for bearer tokens.
    pub identity_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 8787,
            history_bytes: 1024 * 1024,
            heartbeat_interval_secs: 10,
            heartbeat_miss_limit: 3,
            ended_retention_secs: 15 * 60,
            allowed_origins: vec![
                "https://claude.omnara.com".to_string(),
                "https://omnara.ai".to_string(),
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
                "null".to_string(),
            ],
            jwt_public_key: None,
            identity_url: None,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary lookup so tests can inject values without
    /// touching process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            ws_host: lookup("OMNARA_RELAY_WS_HOST").unwrap_or(defaults.ws_host),
            ws_port: parse_or("OMNARA_RELAY_WS_PORT", &lookup, defaults.ws_port),
            history_bytes: parse_or("OMNARA_RELAY_HISTORY_BYTES", &lookup, defaults.history_bytes),
            heartbeat_interval_secs: parse_or(
                "OMNARA_RELAY_HEARTBEAT_INTERVAL",
                &lookup,
                defaults.heartbeat_interval_secs,
            ),
            heartbeat_miss_limit: parse_or(
                "OMNARA_RELAY_HEARTBEAT_MISS_LIMIT",
                &lookup,
                defaults.heartbeat_miss_limit,
            ),
            ended_retention_secs: parse_or(
                "OMNARA_RELAY_ENDED_RETENTION",
                &lookup,
                defaults.ended_retention_secs,
            ),
            allowed_origins: list_or("OMNARA_RELAY_ALLOWED_ORIGINS", &lookup, defaults.allowed_origins),
            jwt_public_key: lookup("OMNARA_JWT_PUBLIC_KEY")
                .map(|pem| pem.replace("\\n", "\n"))
                .filter(|s| !s.is_empty()),
            identity_url: lookup("OMNARA_IDENTITY_URL").filter(|s| !s.is_empty()),
        }
    }
}

/// Wrapper CLI settings.
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub relay_host: String,
    pub relay_ws_port: u16,
    pub relay_disabled: bool,
    /// Stable session key; a fresh UUID is generated when absent.
    pub session_id: Option<String>,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://agent.omnara.com".to_string(),
            relay_host: "relay.omnara.com".to_string(),
            relay_ws_port: 8787,
            relay_disabled: false,
            session_id: None,
        }
    }
}

impl WrapperConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            api_key: lookup("OMNARA_API_KEY").filter(|s| !s.is_empty()),
            api_url: lookup("OMNARA_API_URL").unwrap_or(defaults.api_url),
            relay_host: lookup("OMNARA_RELAY_HOST").unwrap_or(defaults.relay_host),
            relay_ws_port: parse_or("OMNARA_RELAY_WS_PORT", &lookup, defaults.relay_ws_port),
            relay_disabled: lookup("OMNARA_RELAY_DISABLED")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            session_id: lookup("OMNARA_SESSION_ID").filter(|s| !s.is_empty()),
        }
    }

    /// WebSocket URL for the upstream endpoint. Local hosts get plain `ws`;
    /// anything else is assumed to sit behind TLS.
    pub fn relay_ws_url(&self, session_id: &str) -> String {
        let scheme = if self.relay_host.starts_with("localhost")
            || self.relay_host.starts_with("127.")
            || self.relay_host.starts_with("0.0.0.0")
        {
            "ws"
        } else {
            "wss"
        };
        format!(
            "{scheme}://{}:{}/agent?session_id={}",
            self.relay_host,
            self.relay_ws_port,
            urlencoding::encode(session_id)
        )
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_or<T, F>(name: &str, lookup: &F, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn list_or<F>(name: &str, lookup: &F, default: Vec<String>) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => default,
        Some(raw) => {
            let items: Vec<String> = raw
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
            if items.is_empty() {
                default
            } else {
                items
            }
        }
    }
}
