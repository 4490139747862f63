use std::time::Duration;

use clap::Parser;
use fleetlink_server::{Cli, Session};
use tokio_graceful_shutdown::Toplevel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    log::info!("fleetlink-server {} starting", fleetlink_server::VERSION);

    Toplevel::new(|s| async move {
        if let Err(err) = Session::new(&s, args).await {
            log::error!("failed to start session: {err}");
        }
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await?;

    Ok(())
}
