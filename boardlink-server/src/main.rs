use clap::Parser;

use boardlink_server::{config::Config, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::parse();
    config.log_summary();

    Daemon::new(config).run().await
}
