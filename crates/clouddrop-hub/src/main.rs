//! Standalone signaling hub binary.

use std::net::SocketAddr;

use clap::Parser;

use clouddrop_core::protocol::IceServerEntry;
use clouddrop_hub::cli::Cli;
use clouddrop_hub::Hub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Default to info-level logging; -v raises it further.
    clouddrop_core::init_logging(
        cli.verbose.saturating_add(2),
        cli.log_file.as_deref(),
        cli.log_format.into(),
    )?;

    let ice_servers = match &cli.ice_servers_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str::<Vec<IceServerEntry>>(&raw)?
        }
        None => Hub::default_ice_servers(),
    };

    let hub = Hub::new(ice_servers);
    let addr = SocketAddr::new(cli.bind_addr, cli.port);
    hub.run(addr).await;
    Ok(())
}
