//! Connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration values.
pub mod defaults {
    /// Plain API port.
    pub const PLAIN_PORT: u16 = 8728;
    /// TLS API port.
    pub const TLS_PORT: u16 = 8729;
    /// Connect timeout in seconds.
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    pub(super) fn connect_timeout_secs() -> u64 {
        CONNECT_TIMEOUT_SECS
    }

    pub(super) fn enabled() -> bool {
        true
    }
}

/// Configuration for one router connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Router host name or address.
    pub host: String,

    /// API port; defaults to 8728, or 8729 when TLS is enabled.
    #[serde(default)]
    pub port: Option<u16>,

    /// TLS settings; plain TCP when absent.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Connect timeout in seconds.
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Close the connection when no bytes arrive for this long.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Enable TCP keepalive on the socket.
    #[serde(default = "defaults::enabled")]
    pub keepalive: bool,
}

/// TLS block of [`ApiConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Use TLS for this connection.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// PEM bundle of trusted CA certificates; system roots when absent.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,

    /// PEM client certificate chain for mutual TLS.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,

    /// PEM private key for `client_cert`.
    #[serde(default)]
    pub client_key: Option<PathBuf>,

    /// Verify the router's certificate and host name. Disabling accepts
    /// any certificate, which is how self-signed routers are usually
    /// reached; leave enabled whenever a CA bundle is available.
    #[serde(default = "defaults::enabled")]
    pub verify_hostname: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_bundle: None,
            client_cert: None,
            client_key: None,
            verify_hostname: true,
        }
    }
}

impl ApiConfig {
    /// Configuration for `host` with every default.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            tls: None,
            connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: None,
            keepalive: true,
        }
    }

    /// Enable TLS with default settings.
    #[must_use]
    pub fn with_tls(mut self) -> Self {
        self.tls = Some(TlsConfig::default());
        self
    }

    /// Whether TLS is in effect.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.enabled)
    }

    /// Effective port for this configuration.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.tls_enabled() {
            defaults::TLS_PORT
        } else {
            defaults::PLAIN_PORT
        })
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host cannot be empty".to_string());
        }

        if let Some(tls) = &self.tls {
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                return Err("client_cert and client_key must be set together".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let plain = ApiConfig::new("192.168.88.1");
        assert_eq!(plain.port(), 8728);

        let tls = ApiConfig::new("192.168.88.1").with_tls();
        assert_eq!(tls.port(), 8729);

        let mut explicit = ApiConfig::new("192.168.88.1");
        explicit.port = Some(1234);
        assert_eq!(explicit.port(), 1234);
    }

    #[test]
    fn test_validate_empty_host() {
        assert!(ApiConfig::new("  ").validate().is_err());
        assert!(ApiConfig::new("router.lan").validate().is_ok());
    }

    #[test]
    fn test_validate_client_cert_pair() {
        let mut config = ApiConfig::new("router.lan").with_tls();
        config.tls.as_mut().unwrap().client_cert = Some("cert.pem".into());
        assert!(config.validate().is_err());

        config.tls.as_mut().unwrap().client_key = Some("key.pem".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_minimal() {
        let config: ApiConfig =
            serde_json::from_str(r#"{"host": "10.0.0.1"}"#).unwrap();
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.connect_timeout_secs, 10);
        assert!(config.keepalive);
        assert!(!config.tls_enabled());
    }
}
