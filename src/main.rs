use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use registry::{Deregistration, EventName, EventVersion, LogErrorSink, Registry, WatchHandle};
use tokio::signal;

#[derive(Parser)]
#[command(name = "bus-registry")]
#[command(about = "Advertises and discovers event bus publishers through a service catalog")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<BusRegistryCommands>,
}

#[derive(Subcommand)]
enum BusRegistryCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for BusRegistryCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    let command = cli.command.unwrap_or_default();
    let BusRegistryCommands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config)? {
        return Ok(());
    }

    utils::validate_config(&config)?;
    run(config).await
}

async fn run(config: Configuration) -> Result<()> {
    log::info!("Starting bus registry against {}", config.catalog.address);
    let registry = Registry::new(config.catalog.clone(), LogErrorSink);

    let mut registrations: Vec<Deregistration> = Vec::with_capacity(config.publish.len());
    for publication in &config.publish {
        let name = EventName::from(publication.event.as_str());
        let result = registry
            .register(
                &name,
                EventVersion(publication.version),
                &publication.host,
                publication.port,
            )
            .await;
        match result {
            Ok(deregistration) => registrations.push(deregistration),
            Err(e) => {
                deregister_all(registrations).await;
                return Err(e).with_context(|| {
                    format!(
                        "Failed to register {}:v{} at {}:{}",
                        publication.event, publication.version, publication.host, publication.port
                    )
                });
            }
        }
    }

    let mut watches: Vec<WatchHandle> = Vec::with_capacity(config.subscribe.len());
    for subscription in &config.subscribe {
        let name = EventName::from(subscription.event.as_str());
        let version = EventVersion(subscription.version);
        let key = format!("{}:v{}", subscription.event, subscription.version);
        let result = registry.watch(&name, version, move |endpoints| {
            let endpoints: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
            log::info!("Publishers for {key}: [{}]", endpoints.join(", "));
        });
        match result {
            Ok(handle) => watches.push(handle),
            Err(e) => {
                // Dropping the handles stops the watches already started
                drop(watches);
                deregister_all(registrations).await;
                return Err(e).with_context(|| {
                    format!("Failed to watch {}:v{}", subscription.event, subscription.version)
                });
            }
        }
    }

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    log::info!("Shutting down bus registry");

    for handle in watches {
        handle.join().await;
    }

    deregister_all(registrations).await;

    Ok(())
}

async fn deregister_all(registrations: Vec<Deregistration>) {
    for deregistration in registrations {
        let service_id = deregistration.service_id().clone();
        if let Err(e) = deregistration.deregister().await {
            log::error!("Failed to deregister {service_id}: {e}");
        }
    }
}
