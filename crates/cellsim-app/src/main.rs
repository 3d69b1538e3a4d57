use anyhow::{Context, Result};
use cellsim_app::{RunConfig, run};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cellsim", version, about = "Run an agent-based cell simulation")]
struct Cli {
    /// JSON run configuration; the built-in demo runs when omitted.
    #[arg(long, env = "CELLSIM_CONFIG")]
    config: Option<PathBuf>,
    /// Number of ticks to advance.
    #[arg(long)]
    ticks: Option<u64>,
    /// Seed of the site random source.
    #[arg(long)]
    seed: Option<u64>,
    /// Log a tick summary every N ticks.
    #[arg(long)]
    report_every: Option<u64>,
    /// Write the final scene as POV-Ray objects.
    #[arg(long)]
    pov: Option<PathBuf>,
    /// Write the final cell snapshot as JSON.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::demo(),
    };
    if let Some(ticks) = cli.ticks {
        config.ticks = ticks;
    }
    if let Some(seed) = cli.seed {
        config.world.site.rng_seed = Some(seed);
    }
    if let Some(every) = cli.report_every {
        config.report_every = every;
    }

    info!(ticks = config.ticks, "starting cellsim run");
    let report = run(config)?;

    if let Some(path) = &cli.pov {
        std::fs::write(path, &report.scene)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "scene written");
    }
    if let Some(path) = &cli.snapshot {
        let json = serde_json::to_string_pretty(&report.cells)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "snapshot written");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
