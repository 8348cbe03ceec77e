//! Standalone rendezvous relay server.

use clap::Parser;
use weft_relay::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "weft-relay-server", about = "Weft rendezvous relay server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:4700")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let server = RelayServer::bind(&args.listen).await?;
    tracing::info!("listening on {}", server.local_addr()?);
    server.run().await;
    Ok(())
}
