use crate::config::DEFAULT_CONFIG_PATH;
use clap::Parser;
use std::path::PathBuf;

/// Publishes host metrics to MQTT with Home Assistant auto-discovery.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Write a sample configuration file to the config path and exit.
    #[arg(long)]
    pub create_config: bool,

    /// Enable debug logging, ignoring the configured level.
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["sysmon-mqtt"]);
        assert_eq!(args.config, PathBuf::from("config.json5"));
        assert!(!args.create_config);
        assert!(!args.debug);
    }

    #[test]
    fn test_flags() {
        let args = Args::parse_from(["sysmon-mqtt", "-c", "/etc/sysmon.json5", "--debug"]);
        assert_eq!(args.config, PathBuf::from("/etc/sysmon.json5"));
        assert!(args.debug);
    }
}
