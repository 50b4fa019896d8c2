//! Client configuration: defaults, then config file, then env overrides.
//! Env: PESIT_CLIENT_HOST, PESIT_CLIENT_PORT, PESIT_CLIENT_REQUESTER.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Partner host (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,
    /// Partner port (default 5000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Requester identification announced in CONNECT.
    #[serde(default = "default_requester")]
    pub requester: String,
    /// Server identification the partner expects.
    #[serde(default = "default_server")]
    pub server: String,
    /// Access-control password, when the partner requires one.
    #[serde(default)]
    pub password: Option<String>,
    /// Fail on unexpected acknowledgment types instead of logging them.
    #[serde(default)]
    pub strict: bool,
    /// Negotiated maximum data entity size (default 4096).
    #[serde(default = "default_max_entity_size")]
    pub max_entity_size: u16,
    /// Kilobytes between sync points; 0 disables sync points.
    #[serde(default = "default_sync_interval_kb")]
    pub sync_interval_kb: u16,
    /// Retries after a failed transfer (default 3).
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Delay between retries in milliseconds (default 2000).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// PEM CA bundle; the connection uses TLS when set.
    #[serde(default)]
    pub tls_ca: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    5000
}
fn default_requester() -> String {
    "PESIT_CLIENT".into()
}
fn default_server() -> String {
    "PESIT_SERVER".into()
}
fn default_max_entity_size() -> u16 {
    4096
}
fn default_sync_interval_kb() -> u16 {
    32
}
fn default_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: default_host(),
            port: default_port(),
            requester: default_requester(),
            server: default_server(),
            password: None,
            strict: false,
            max_entity_size: default_max_entity_size(),
            sync_interval_kb: default_sync_interval_kb(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            tls_ca: None,
        }
    }
}

/// Load config: defaults, then the given file (or ./pesit-client.toml if
/// present), then env vars.
pub fn load(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let mut config = match path {
        Some(p) => parse_file(p)?,
        None => {
            let fallback = Path::new("pesit-client.toml");
            if fallback.exists() {
                parse_file(fallback)?
            } else {
                ClientConfig::default()
            }
        }
    };

    if let Ok(s) = std::env::var("PESIT_CLIENT_HOST") {
        config.host = s;
    }
    if let Ok(s) = std::env::var("PESIT_CLIENT_PORT") {
        if let Ok(p) = s.parse() {
            config.port = p;
        }
    }
    if let Ok(s) = std::env::var("PESIT_CLIENT_REQUESTER") {
        config.requester = s;
    }
    Ok(config)
}

fn parse_file(path: &Path) -> anyhow::Result<ClientConfig> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 5000);
        assert_eq!(c.max_entity_size, 4096);
        assert_eq!(c.sync_interval_kb, 32);
        assert!(!c.strict);
        assert!(c.tls_ca.is_none());
    }

    #[test]
    fn parses_overrides() {
        let c: ClientConfig = toml::from_str(
            r#"
            host = "partner.example"
            port = 1761
            requester = "BANK"
            password = "secret"
            strict = true
            sync_interval_kb = 8
            "#,
        )
        .unwrap();
        assert_eq!(c.host, "partner.example");
        assert_eq!(c.port, 1761);
        assert_eq!(c.requester, "BANK");
        assert_eq!(c.password.as_deref(), Some("secret"));
        assert!(c.strict);
        assert_eq!(c.sync_interval_kb, 8);
        assert_eq!(c.retries, 3);
    }
}
