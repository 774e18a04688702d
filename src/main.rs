use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (DVM_FNE_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("DVM_FNE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("dvm_fne=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = dvm_fne::config::FneConfig::parse();
    config.load_overlay()?;

    tracing::info!(traffic_addr = %config.traffic_addr, otar_addr = %config.otar_addr, peer_id = config.peer_id, "starting FNE core");

    let server = dvm_fne::server::Server::new(config);
    server.run().await
}
