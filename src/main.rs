use anyhow::Result;
use clap::Parser;
use log::info;

use muse_bandpower::config::ServiceConfig;
use muse_bandpower::service;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::parse();

    // ── Logging ───────────────────────────────────────────────────────────────
    // RUST_LOG overrides -v, e.g.:
    //   RUST_LOG=muse_bandpower=debug muse-bandpower
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_filter()))
        .init();

    info!("muse-bandpower {}", env!("CARGO_PKG_VERSION"));
    service::run(config).await
}
