use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments shared by bus registry binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands available for all binaries
#[derive(Subcommand, Debug, Clone, Default, PartialEq)]
pub enum CommonCommands {
    /// Register publications, watch subscriptions and run until interrupted (default)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    /// Longest blocking query wait a Consul agent honours
    pub const MAX_WAIT_TIME: Duration = Duration::from_secs(600);

    /// Level used when `RUST_LOG` is not set
    pub fn default_log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Install the global log subscriber. `RUST_LOG` wins over the CLI flags.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_log_level(args)));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("Bus Registry Configuration:");
            println!("===========================");
            println!("Catalog address: {}", config.catalog.address);
            println!(
                "Catalog datacenter: {}",
                config.catalog.datacenter.as_deref().unwrap_or("(agent default)")
            );
            println!(
                "Catalog token: {}",
                if config.catalog.token.is_some() { "set" } else { "not set" }
            );
            println!("Watch wait time: {:?}", config.catalog.wait_time);

            for publication in &config.publish {
                println!(
                    "Publishes {}:v{} at {}:{}",
                    publication.event, publication.version, publication.host, publication.port
                );
            }
            for subscription in &config.subscribe {
                println!("Subscribes {}:v{}", subscription.event, subscription.version);
            }
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        if config.catalog.address.trim().is_empty() {
            anyhow::bail!("Catalog address cannot be empty");
        }

        if config.catalog.wait_time.is_zero() {
            anyhow::bail!("Catalog wait time must be greater than zero");
        }

        if config.catalog.wait_time > MAX_WAIT_TIME {
            anyhow::bail!(
                "Catalog wait time {:?} exceeds the maximum of {:?}",
                config.catalog.wait_time,
                MAX_WAIT_TIME
            );
        }

        for publication in &config.publish {
            if publication.event.trim().is_empty() {
                anyhow::bail!("Publication event name cannot be empty");
            }
            if publication.host.trim().is_empty() {
                anyhow::bail!("Publication host for {} cannot be empty", publication.event);
            }
        }

        for subscription in &config.subscribe {
            if subscription.event.trim().is_empty() {
                anyhow::bail!("Subscription event name cannot be empty");
            }
        }

        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle commands that don't require starting the service
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }

    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, PublicationConfig};
    use std::time::Duration;

    fn args(verbose: bool, quiet: bool) -> CommonArgs {
        CommonArgs {
            config: None,
            verbose,
            quiet,
        }
    }

    #[test]
    fn test_common_commands_default() {
        assert_eq!(CommonCommands::default(), CommonCommands::Start);
    }

    #[test]
    fn test_log_level_flags() {
        assert_eq!(utils::default_log_level(&args(false, false)), "info");
        assert_eq!(utils::default_log_level(&args(true, false)), "debug");
        assert_eq!(utils::default_log_level(&args(true, true)), "warn");
    }

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_validate_default_config() {
        assert!(utils::validate_config(&Configuration::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_publication_host() {
        let mut config = Configuration::default();
        config.publish.push(PublicationConfig {
            event: "orders.created".into(),
            version: 1,
            host: " ".into(),
            port: 7000,
        });

        let err = utils::validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("orders.created"));
    }

    #[test]
    fn test_validate_rejects_zero_wait_time() {
        let mut config = Configuration::default();
        config.catalog.wait_time = Duration::ZERO;
        assert!(utils::validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_wait_time_beyond_agent_maximum() {
        let mut config = Configuration::default();
        config.catalog.wait_time = utils::MAX_WAIT_TIME;
        assert!(utils::validate_config(&config).is_ok());

        config.catalog.wait_time = Duration::from_secs(u64::MAX);
        let err = utils::validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"));
    }

    #[test]
    fn test_start_is_not_handled() {
        let handled =
            utils::handle_common_command(&CommonCommands::Start, &Configuration::default())
                .unwrap();
        assert!(!handled);
    }
}
