use anyhow::Result;
use clap::Parser;

use bit_swarm::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let cfg = Config::parse();

    if let Err(err) = bit_swarm::controller::run(cfg).await {
        tracing::error!(event = "fatal", error = %err);
        return Err(err.into());
    }
    Ok(())
}
