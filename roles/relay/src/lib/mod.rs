//! # MAVLink relay
//!
//! A multi-tenant relay bridging a vehicle and a support engineer over the
//! Internet. For each tenant record in the key store the supervisor listens
//! on a UDP/TCP port pair; a conversation task pumps MAVLink v2 frames
//! between the vehicle endpoint and up to eight engineer endpoints (UDP,
//! TCP, WebSocket or TLS WebSocket), enforcing packet signing on the
//! engineer side.

use std::{fs::OpenOptions, io, path::Path, str::FromStr};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

pub mod config;
pub mod error;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod task_manager;

pub use config::RelayConfig;
pub use error::{Error, RelayResult};

use supervisor::Supervisor;

#[derive(Debug)]
pub struct MavlinkRelay {
    config: RelayConfig,
}

impl MavlinkRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Bootstrap the tenant table from the key store and supervise until
    /// interrupted. An unopenable store is the only fatal error.
    pub async fn start(self) -> RelayResult<()> {
        let supervisor = Supervisor::bootstrap(self.config)?;
        supervisor.run().await
    }
}

/// Initialize logging to stdout and optionally to a file.
///
/// `RUST_LOG` overrides the `info` default.
pub fn init_logging(log_file: Option<&Path>) {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_level_filter = LevelFilter::from_str(&rust_log).unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::new(log_level_filter.to_string());

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match log_file {
        Some(path) => {
            let path = path.to_owned();
            let file_layer = fmt::layer().with_writer(move || {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .expect("Failed to open log file")
            });
            let stdout_layer = fmt::layer().with_writer(io::stdout);
            Box::new(
                Registry::default()
                    .with(env_filter)
                    .with(stdout_layer)
                    .with(file_layer),
            )
        }
        None => {
            let stdout_layer = fmt::layer().with_writer(io::stdout);
            Box::new(Registry::default().with(env_filter).with(stdout_layer))
        }
    };

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");
}
