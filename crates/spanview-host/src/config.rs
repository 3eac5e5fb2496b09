use std::path::PathBuf;

use serde::Deserialize;

use spanview_session::SessionConfig;

/// Host configuration, loaded from a TOML file with CLI overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// IP address to bind the TCP listener and discovery responder on.
    pub bind: String,

    /// Name shown to devices in discovery results.
    pub server_name: String,

    /// Directory for the TLS certificate and key. Defaults to the user's
    /// app-data directory.
    pub data_dir: Option<PathBuf>,

    /// Session-layer settings (ports, timeouts, scheduler, ABR, FEC).
    pub session: SessionConfig,
}

fn default_server_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "spanview host".into())
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            server_name: default_server_name(),
            data_dir: None,
            session: SessionConfig::default(),
        }
    }
}

impl HostConfig {
    /// Resolve the certificate/trust directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("spanview")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HostConfig::default();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.session.listen_tcp_port, 15555);
        assert_eq!(config.session.listen_udp_port, 15556);
        assert!(config.session.tls_enabled);
    }

    #[test]
    fn toml_roundtrip() {
        let toml = r#"
            bind = "192.168.1.5"
            server_name = "Office PC"

            [session]
            listen_tcp_port = 16000
            require_pairing_code = true
        "#;
        let config: HostConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.bind, "192.168.1.5");
        assert_eq!(config.server_name, "Office PC");
        assert_eq!(config.session.listen_tcp_port, 16000);
        assert!(config.session.require_pairing_code);
        // Defaults survive for everything else.
        assert_eq!(config.session.listen_udp_port, 15556);
    }

    #[test]
    fn data_dir_override() {
        let config = HostConfig { data_dir: Some(PathBuf::from("/tmp/sv")), ..Default::default() };
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/sv"));
    }
}
