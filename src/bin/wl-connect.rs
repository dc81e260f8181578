//! Connects to the default Wayland display and disconnects again.
//!
//! The smallest possible liveness check: exits 0 if a compositor is
//! reachable through the environment, non-zero otherwise.

use anyhow::Context as _;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wayland_client::Connection;

fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let conn = Connection::connect_to_env().context("cannot connect to the wayland display")?;
    info!("connected to the wayland display");
    drop(conn);
    info!("disconnected");
    Ok(())
}
