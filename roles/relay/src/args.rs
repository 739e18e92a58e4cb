use std::path::PathBuf;

/// CLI surface of the relay: it runs with no arguments at all, and
/// `-c/--config` points at an optional TOML file.
#[derive(Debug)]
pub struct Args {
    pub config_path: Option<PathBuf>,
}

impl Args {
    /// Picked up automatically when present in the working directory.
    const DEFAULT_CONFIG_PATH: &'static str = "relay-config.toml";

    pub fn from_args() -> Result<Self, String> {
        let mut config_path = None;
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => match args.next() {
                    Some(path) => config_path = Some(PathBuf::from(path)),
                    None => return Err(format!("{arg} needs a path argument")),
                },
                "-h" | "--help" => return Err(Self::usage()),
                other => return Err(format!("Unknown argument {other}\n{}", Self::usage())),
            }
        }
        if config_path.is_none() {
            let default = PathBuf::from(Self::DEFAULT_CONFIG_PATH);
            if default.exists() {
                config_path = Some(default);
            }
        }
        Ok(Self { config_path })
    }

    fn usage() -> String {
        format!(
            "Usage: -h/--help, -c/--config <path|default {}>",
            Self::DEFAULT_CONFIG_PATH
        )
    }
}
