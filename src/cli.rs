use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Code-intel worker - hosts the index queue lease manager, scheduler and resetter"
)]
pub struct Args {
    /// Path to a TOML config file (defaults to $CODEINTEL_CONFIG or the standard locations)
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short, long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the queue services until Ctrl-C (default)
    Run,

    /// Print the effective configuration as TOML and exit
    Config,
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let args = Args::parse_from(["codeintel-worker"]);
        assert_eq!(args.command(), Command::Run);
        assert_eq!(args.log_level, "info");
        assert!(args.config.is_none());
    }

    #[test]
    fn test_config_subcommand() {
        let args = Args::parse_from([
            "codeintel-worker",
            "--config",
            "/etc/codeintel/worker.toml",
            "-l",
            "debug",
            "config",
        ]);
        assert_eq!(args.command(), Command::Config);
        assert_eq!(args.log_level, "debug");
        assert_eq!(
            args.config,
            Some(PathBuf::from("/etc/codeintel/worker.toml"))
        );
    }
}
