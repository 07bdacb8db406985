//! The sable node daemon: configuration loading, tracing setup, and the
//! runtime that drives the networking core.

mod config;

use gumdrop::Options;
use tracing::{info, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use sable_network::Node;
use sable_state::ChainState;

use crate::config::SabledConfig;

#[derive(Debug, Options)]
struct SabledOptions {
    /// print this help message
    #[options(help = "print this help message")]
    help: bool,

    /// path to a TOML config file
    #[options(help = "path to a TOML config file", meta = "PATH")]
    config: Option<std::path::PathBuf>,

    /// log filter directives, overriding the config file
    #[options(help = "log filter, e.g. info,sable_network=debug", meta = "FILTER")]
    filter: Option<String>,
}

fn init_tracing(filter: &str) -> color_eyre::eyre::Result<()> {
    let filter_layer = EnvFilter::try_new(filter)?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .with(ErrorLayer::default())
        .init();
    Ok(())
}

fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;

    let options = SabledOptions::parse_args_default_or_exit();
    let config = match &options.config {
        Some(path) => SabledConfig::load(path)?,
        None => SabledConfig::default(),
    };
    let filter = options
        .filter
        .as_deref()
        .unwrap_or(&config.tracing_filter);
    init_tracing(filter)?;

    info!(network = %config.network.network, "starting sabled");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let chain = ChainState::new(config.network.network);
        let (mut node, shutdown) = Node::new(config.network, Box::new(chain));

        node.subscribe_blocks(Box::new(|block| {
            info!(%block, "block accepted");
        }));

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    shutdown.shutdown();
                }
                Err(error) => warn!(%error, "could not listen for shutdown signals"),
            }
        });

        node.run().await
    })?;

    info!("sabled exited cleanly");
    Ok(())
}
