use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use beamrt::engine::Engine;
use beamrt::utils::logger::LoggerConfig;

#[derive(Debug, Parser)]
#[command(about = "Coordinator for a distributed ray-tracing render farm")]
struct Args {
    /// Render configuration (workers, image, scene bounds).
    config: PathBuf,

    /// Scene description to distribute and render.
    scene: PathBuf,

    /// Consecutive quiet stats windows before the render is declared done.
    #[arg(long, default_value_t = 3)]
    intervals: u32,

    /// Skip the worker BVH and let workers forward rays by linear scan.
    #[arg(long)]
    linear_scan: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = LoggerConfig::from_env().init()?;

    let engine = Engine::init(&args.config, &args.scene, args.intervals, args.linear_scan)?;
    engine.run()
}
