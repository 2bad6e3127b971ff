//! Daemon configuration
//!
//! Tunables with sensible defaults, overridable from the command
//! line. Loading configuration files is handled by the deployment, not
//! by the daemon.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root daemon configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub control: ControlConfig,
    pub backend_file: BackendConfig,
    pub backend_nbd: BackendConfig,
    pub backend_http: HttpBackendConfig,
}

/// General daemon tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Connections allowed per backend; bounds the limits advertised
    /// in OPTIONS.
    pub max_connections: u32,
    /// How long ticket removal waits for running operations.
    pub cancel_timeout_s: u64,
    /// Interval of the expired-ticket sweeper.
    pub sweep_interval_s: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            cancel_timeout_s: 60,
            sweep_interval_s: 30,
        }
    }
}

impl DaemonConfig {
    #[must_use]
    pub const fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_s)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_s)
    }
}

/// The remote data service, used by engine-driven transfers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Sort IPv4 addresses first when resolving the bind address.
    pub prefer_ipv4: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "::".to_string(),
            port: 54322,
            prefer_ipv4: false,
        }
    }
}

/// The local data service on a Unix socket, advertised to clients on
/// the same host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalConfig {
    pub enable: bool,
    pub socket: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enable: true,
            socket: PathBuf::from("/run/vmio/vmio.sock"),
        }
    }
}

/// The control service carrying the tickets API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlConfig {
    pub socket: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/vmio/control.sock"),
        }
    }
}

/// Per-backend tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    pub buffer_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    pub buffer_size: usize,
    /// CA bundle for verifying remote daemons.
    pub ca_file: Option<PathBuf>,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024 * 1024,
            ca_file: None,
        }
    }
}

impl Config {
    /// Buffer size for a backend by its url scheme.
    #[must_use]
    pub fn buffer_size(&self, scheme: &str) -> usize {
        match scheme {
            "file" => self.backend_file.buffer_size,
            "nbd" => self.backend_nbd.buffer_size,
            _ => self.backend_http.buffer_size,
        }
    }
}
