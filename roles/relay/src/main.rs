mod args;

use args::Args;
use ext_config::{Config, File, FileFormat};
use mavlink_relay::{init_logging, Error, MavlinkRelay, RelayConfig, RelayResult};
use tracing::{error, info};

/// Process CLI args, if any. No config file means stock defaults.
fn process_cli_args() -> RelayResult<RelayConfig> {
    let args = Args::from_args().map_err(|help| {
        eprintln!("{help}");
        Error::BadCliArgs
    })?;

    match args.config_path {
        Some(path) => {
            let config_path = path.to_str().ok_or_else(|| {
                eprintln!("Invalid configuration path.");
                Error::BadCliArgs
            })?;
            let settings = Config::builder()
                .add_source(File::new(config_path, FileFormat::Toml))
                .build()?;
            Ok(settings.try_deserialize::<RelayConfig>()?)
        }
        None => Ok(RelayConfig::default()),
    }
}

#[tokio::main]
async fn main() {
    let config = match process_cli_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    init_logging(config.log_file());
    info!("Relay config: {:?}", &config);

    if let Err(e) = MavlinkRelay::new(config).start().await {
        error!("{e}");
        std::process::exit(1);
    }
}
