//! Server configuration: defaults, then config file, then env overrides.
//! Env: PESIT_SERVER_PORT, PESIT_SERVER_ID, PESIT_SERVER_READ_TIMEOUT_MS,
//! PESIT_SERVER_MAX_CONNECTIONS, PESIT_SERVER_STORE_ROOT.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen port (default 5000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Server identification announced to partners.
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Socket read timeout in milliseconds (default 30000).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Maximum concurrent connections (default 16).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Directory receiving and serving transferred files.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
    /// Known partners; an empty list accepts any requester.
    #[serde(default)]
    pub partners: Vec<PartnerEntry>,
    /// TLS listener configuration; plain TCP when absent.
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartnerEntry {
    pub id: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn default_port() -> u16 {
    5000
}
fn default_server_id() -> String {
    "PESIT_SERVER".into()
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_max_connections() -> usize {
    16
}
fn default_store_root() -> PathBuf {
    PathBuf::from("pesit-files")
}
fn default_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: default_port(),
            server_id: default_server_id(),
            read_timeout_ms: default_read_timeout_ms(),
            max_connections: default_max_connections(),
            store_root: default_store_root(),
            partners: Vec::new(),
            tls: None,
        }
    }
}

/// Load config: defaults, then the given file (or ./pesit-server.toml if
/// present), then env vars.
pub fn load(path: Option<&Path>) -> anyhow::Result<ServerConfig> {
    let mut config = match path {
        Some(p) => parse_file(p)?,
        None => {
            let fallback = Path::new("pesit-server.toml");
            if fallback.exists() {
                parse_file(fallback)?
            } else {
                ServerConfig::default()
            }
        }
    };

    if let Ok(s) = std::env::var("PESIT_SERVER_PORT") {
        if let Ok(p) = s.parse() {
            config.port = p;
        }
    }
    if let Ok(s) = std::env::var("PESIT_SERVER_ID") {
        config.server_id = s;
    }
    if let Ok(s) = std::env::var("PESIT_SERVER_READ_TIMEOUT_MS") {
        if let Ok(t) = s.parse() {
            config.read_timeout_ms = t;
        }
    }
    if let Ok(s) = std::env::var("PESIT_SERVER_MAX_CONNECTIONS") {
        if let Ok(n) = s.parse() {
            config.max_connections = n;
        }
    }
    if let Ok(s) = std::env::var("PESIT_SERVER_STORE_ROOT") {
        config.store_root = PathBuf::from(s);
    }
    Ok(config)
}

fn parse_file(path: &Path) -> anyhow::Result<ServerConfig> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.port, 5000);
        assert_eq!(c.server_id, "PESIT_SERVER");
        assert!(c.partners.is_empty());
        assert!(c.tls.is_none());
    }

    #[test]
    fn parses_partner_list() {
        let c: ServerConfig = toml::from_str(
            r#"
            port = 1761
            [[partners]]
            id = "BANK"
            password = "secret"
            [[partners]]
            id = "OLD"
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(c.port, 1761);
        assert_eq!(c.partners.len(), 2);
        assert_eq!(c.partners[0].password.as_deref(), Some("secret"));
        assert!(!c.partners[1].enabled);
    }
}
