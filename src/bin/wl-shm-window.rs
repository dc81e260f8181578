//! A solid-color toplevel window drawn through shared memory.
//!
//! Opens a window, keeps it filled with one color through every resize,
//! and exits 0 once the compositor asks it to close.

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wayland_smoke::{Color, Session, SessionConfig};

#[derive(Debug, Parser)]
#[command(name = "wl-shm-window", version, about)]
struct Args {
    /// Window width before the compositor proposes a size.
    #[arg(long, default_value_t = 480)]
    width: u32,
    /// Window height before the compositor proposes a size.
    #[arg(long, default_value_t = 360)]
    height: u32,
    /// Fill color, [#|0x]AARRGGBB or [#|0x]RRGGBB.
    #[arg(long, default_value_t = Color::BLUE)]
    color: Color,
    /// Window title.
    #[arg(long, default_value = "wayland-smoke")]
    title: String,
}

fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = SessionConfig {
        title: args.title,
        width: args.width,
        height: args.height,
        color: args.color,
        ..SessionConfig::default()
    };

    let (mut session, mut queue) = Session::connect(config).context("session setup failed")?;
    session.open_window(&mut queue).context("window setup failed")?;
    session.run(&mut queue).context("session ended abnormally")?;
    session.shutdown().context("teardown failed")?;
    Ok(())
}
