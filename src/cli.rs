//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// ozonewatch - ozone monitoring ground station and satellite fleet
///
/// The coordinator receives readings from the fleet and redirects the
/// nearest other satellite whenever a reading is critically low.
#[derive(Parser, Debug)]
#[command(name = "ozonewatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ground station
    Coordinator {
        /// Path to configuration file
        #[arg(short, long, env = "OZONEWATCH_CONFIG")]
        config: Option<String>,

        /// Override the listen address (e.g. 127.0.0.1:8000)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Launch a simulated satellite fleet
    Fleet {
        /// Path to configuration file
        #[arg(short, long, env = "OZONEWATCH_CONFIG")]
        config: Option<String>,

        /// Number of satellites to launch (overrides fleet.peer_count)
        #[arg(short = 'n', long)]
        count: Option<u32>,
    },

    /// Display version and build information
    Version {
        /// Print a single line
        #[arg(long)]
        short: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_coordinator_command() {
        let cli = Cli::parse_from(["ozonewatch", "coordinator", "--listen", "127.0.0.1:8100"]);
        match cli.command {
            Commands::Coordinator { listen, .. } => {
                assert_eq!(listen, Some("127.0.0.1:8100".to_string()));
            }
            _ => panic!("Expected Coordinator command"),
        }
    }

    #[test]
    fn test_coordinator_with_config() {
        let cli = Cli::parse_from(["ozonewatch", "coordinator", "--config", "/path/to/config.toml"]);
        match cli.command {
            Commands::Coordinator { config, .. } => {
                assert_eq!(config, Some("/path/to/config.toml".to_string()));
            }
            _ => panic!("Expected Coordinator command"),
        }
    }

    #[test]
    fn test_fleet_count() {
        let cli = Cli::parse_from(["ozonewatch", "fleet", "-n", "12"]);
        match cli.command {
            Commands::Fleet { count, config } => {
                assert_eq!(count, Some(12));
                assert!(config.is_none());
            }
            _ => panic!("Expected Fleet command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["ozonewatch", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_quiet_flag_after_subcommand() {
        let cli = Cli::parse_from(["ozonewatch", "version", "--short", "--quiet"]);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Version { short: true }));
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["ozonewatch", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
