use serde::Deserialize;
use std::path::Path;

use crate::error::Error;

/// Connection settings for one XMPP account.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Peer domain, e.g. "example.net". Also the SRV lookup owner.
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Account credentials. Without a username the handshake stops before
    /// SASL (anonymous / deferred-auth mode).
    pub username: Option<String>,
    /// Supports ${ENV_VAR} substitution
    pub password: Option<String>,
    /// Preferred resource name; the server picks one when absent.
    pub resource: Option<String>,
    #[serde(default)]
    pub tls: TlsMode,
    /// Set to false for self-signed certs (dev servers)
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    /// Default timeout for blocking IQ requests, in milliseconds.
    /// -1 waits forever.
    #[serde(default = "default_iq_timeout")]
    pub default_iq_timeout_ms: i64,
    /// Log every stanza sent and received at debug level.
    #[serde(default)]
    pub debug_stanzas: bool,
    /// xml:lang announced in our stream header.
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub bytestreams: BytestreamConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plaintext for the whole session.
    None,
    /// Plaintext TCP, upgraded when the server advertises `<starttls/>`.
    #[default]
    StartTls,
    /// TLS wrap immediately after the TCP connect.
    TlsSocket,
}

/// XEP-0065 bytestream settings.
#[derive(Debug, Deserialize, Clone)]
pub struct BytestreamConfig {
    /// Allow mediated transfers through a proxy when we look NAT-bound.
    #[serde(default = "default_true")]
    pub proxy_allowed: bool,
    /// Proxies to prefer over server-discovered ones.
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    /// Listener port range for direct transfers, inclusive.
    #[serde(default = "default_port_from")]
    pub port_from: u16,
    #[serde(default = "default_port_to")]
    pub port_to: u16,
    /// STUN server consulted by an external address probe, if one is
    /// registered.
    #[serde(default)]
    pub stun_server: Option<StunServer>,
    /// Ask a UPnP probe for mapped addresses. Off by default; the probe
    /// itself is supplied by the caller.
    #[serde(default)]
    pub use_upnp: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    pub jid: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StunServer {
    pub host: String,
    #[serde(default = "default_stun_port")]
    pub port: u16,
}

impl Default for BytestreamConfig {
    fn default() -> Self {
        Self {
            proxy_allowed: true,
            proxies: Vec::new(),
            port_from: default_port_from(),
            port_to: default_port_to(),
            stun_server: None,
            use_upnp: false,
        }
    }
}

fn default_port() -> u16 {
    5222
}

fn default_true() -> bool {
    true
}

fn default_iq_timeout() -> i64 {
    -1
}

fn default_language() -> String {
    "en".to_string()
}

fn default_port_from() -> u16 {
    52000
}

fn default_port_to() -> u16 {
    52100
}

fn default_stun_port() -> u16 {
    3478
}

impl ClientConfig {
    /// A config with defaults for everything but the domain.
    pub fn for_domain(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            port: default_port(),
            username: None,
            password: None,
            resource: None,
            tls: TlsMode::default(),
            tls_verify: true,
            default_iq_timeout_ms: default_iq_timeout(),
            debug_stanzas: false,
            language: default_language(),
            bytestreams: BytestreamConfig::default(),
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Loads a TOML config file, expanding ${ENV_VAR} references in the
    /// password so secrets can stay out of the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::ProtocolViolation(format!("cannot read config: {e}")))?;
        let mut config: ClientConfig = toml::from_str(&raw)
            .map_err(|e| Error::ProtocolViolation(format!("invalid config: {e}")))?;

        if let Some(ref password) = config.password {
            let expanded = shellexpand::env(password)
                .map_err(|e| Error::ProtocolViolation(format!("bad config reference: {e}")))?;
            config.password = Some(expanded.into_owned());
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config: ClientConfig = toml::from_str("hostname = \"example.net\"").unwrap();
        assert_eq!(config.port, 5222);
        assert_eq!(config.tls, TlsMode::StartTls);
        assert!(config.tls_verify);
        assert_eq!(config.default_iq_timeout_ms, -1);
        assert_eq!(config.language, "en");
        assert!(config.bytestreams.proxy_allowed);
        assert_eq!(config.bytestreams.port_from, 52000);
        assert_eq!(config.bytestreams.port_to, 52100);
        assert!(!config.bytestreams.use_upnp);
    }

    #[test]
    fn test_full_config() {
        let config: ClientConfig = toml::from_str(
            r#"
            hostname = "example.net"
            port = 5223
            username = "alice"
            password = "s3cret"
            resource = "orchard"
            tls = "tls_socket"
            debug_stanzas = true

            [bytestreams]
            proxy_allowed = false
            port_from = 40000
            port_to = 40010

            [[bytestreams.proxies]]
            jid = "proxy.example.net"
            host = "198.51.100.4"
            port = 7777

            [bytestreams.stun_server]
            host = "stun.example.net"
            "#,
        )
        .unwrap();

        assert_eq!(config.tls, TlsMode::TlsSocket);
        assert!(!config.bytestreams.proxy_allowed);
        assert_eq!(config.bytestreams.proxies[0].port, 7777);
        assert_eq!(config.bytestreams.stun_server.unwrap().port, 3478);
    }

    #[test]
    fn test_load_expands_password_env() {
        std::env::set_var("XMPP_TRANSPORT_TEST_PW", "hunter2");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "hostname = \"example.net\"\nusername = \"alice\"\npassword = \"${{XMPP_TRANSPORT_TEST_PW}}\""
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.password.as_deref(), Some("hunter2"));
    }
}
