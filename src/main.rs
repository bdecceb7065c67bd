mod app;
mod capture;
mod config;
mod error;
mod geometry;
mod handoff;
mod interaction;
mod logger;
mod outputs;
mod rate;
mod render;
mod scan;
mod session;

use anyhow::Result;
use clap::Parser;
use log::debug;

use crate::{
    app::WaylandSurfaces, config::Cli, handoff::Coordinator, outputs::WaylandOutputs,
    render::TerminalHost,
};

fn main() -> Result<()> {
    logger::init_logger();
    let cli = Cli::parse();
    debug!("{cli:?}");

    let mut coordinator = Coordinator::new(
        Box::new(WaylandSurfaces::new(cli.capture_config())),
        Box::new(WaylandOutputs),
    );
    coordinator.register_host(Box::new(TerminalHost::default()));

    let scanned = futures::executor::block_on(coordinator.request_capture())?;
    let output = (!cli.no_image).then_some(&cli.output);
    render::present(scanned.as_ref(), output)
}
