//! Relay configuration.
//!
//! Every field defaults to the relay's stock behavior, so a missing config
//! file yields a fully working instance: listeners on INADDR_ANY, the key
//! store and TLS assets in the working directory, 10 s conversation idle
//! cutoff and a 5 s tenant reload period.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Address the per-tenant listeners bind on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Key store file, resolved against the working directory.
    #[serde(default = "default_keydb_path")]
    pub keydb_path: PathBuf,
    /// Directory holding `fullchain.pem` / `privkey.pem` for TLS engineers.
    #[serde(default = "default_tls_cert_dir")]
    pub tls_cert_dir: PathBuf,
    /// A conversation ends after this many seconds of silence on an active
    /// side.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How often the supervisor re-scans the key store for new tenants.
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    /// Extra log file next to stdout.
    #[serde(default)]
    log_file: Option<PathBuf>,
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}

fn default_keydb_path() -> PathBuf {
    keydb::KEY_FILE.into()
}

fn default_tls_cert_dir() -> PathBuf {
    ".".into()
}

fn default_idle_timeout_secs() -> u64 {
    10
}

fn default_reload_interval_secs() -> u64 {
    5
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            keydb_path: default_keydb_path(),
            tls_cert_dir: default_tls_cert_dir(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reload_interval_secs: default_reload_interval_secs(),
            log_file: None,
        }
    }
}

impl RelayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}
