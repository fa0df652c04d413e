//! Configuration handling for the demo binary.
//!
//! Reads an optional YAML config file and applies environment variable
//! overrides on top, so the same binary works from a file, from the
//! environment, or from nothing at all.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirelineConfig {
    /// Address servers listen on.
    pub listen: String,
    /// Address clients connect to.
    pub connect: String,
    /// Initial receive-buffer chunk size.
    pub chunk_size: usize,
    /// Disable Nagle coalescing.
    pub no_delay: bool,
    /// TLS settings.
    pub tls: TlsConfig,
}

/// TLS file locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether TLS is enabled.
    pub enabled: bool,
    /// Path to the certificate chain (PEM).
    pub cert_file: String,
    /// Path to the private key (PEM, PKCS#8).
    pub key_file: String,
    /// Path to the trusted CA certificates (PEM).
    pub ca_file: String,
}

impl Default for WirelineConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:4444".to_string(),
            connect: "127.0.0.1:4444".to_string(),
            chunk_size: 8192,
            no_delay: true,
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RootConfig {
    endpoint: Option<EndpointSection>,
}

#[derive(Debug, Deserialize)]
struct EndpointSection {
    listen: Option<String>,
    connect: Option<String>,
    chunk_size: Option<usize>,
    no_delay: Option<bool>,
    tls: Option<TlsConfig>,
}

impl WirelineConfig {
    /// Load configuration from `config_path`, falling back to defaults, then
    /// apply environment overrides.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root);
                    info!("loaded configuration from {:?}", config_path.as_ref());
                }
                Err(err) => {
                    warn!(
                        "failed to parse config file {:?} ({err}), using defaults",
                        config_path.as_ref()
                    );
                }
            }
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        let Some(endpoint) = root.endpoint else {
            return;
        };
        if let Some(listen) = endpoint.listen {
            self.listen = listen;
        }
        if let Some(connect) = endpoint.connect {
            self.connect = connect;
        }
        if let Some(chunk_size) = endpoint.chunk_size {
            self.chunk_size = chunk_size;
        }
        if let Some(no_delay) = endpoint.no_delay {
            self.no_delay = no_delay;
        }
        if let Some(tls) = endpoint.tls {
            self.tls = tls;
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("WIRELINE_LISTEN") {
            info!("listen address overridden by environment: {listen}");
            self.listen = listen;
        }
        if let Ok(connect) = std::env::var("WIRELINE_CONNECT") {
            info!("connect address overridden by environment: {connect}");
            self.connect = connect;
        }
        if let Ok(chunk) = std::env::var("WIRELINE_CHUNK_SIZE") {
            if let Ok(chunk) = chunk.parse::<usize>() {
                self.chunk_size = chunk;
            }
        }
    }
}
