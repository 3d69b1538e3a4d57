//! Runner plumbing for the `cellsim` binary: run configuration, population seeding and the
//! tick loop.

use anyhow::{Context, Result, bail};
use cellsim_core::{
    Agent, BoundaryCondition, CellSnapshot, CellTypeConfig, INITIAL_STATE, MorphologyParameters,
    MovementKind, MovementParameters, SiteConfig, StateGraph, StateSpec, TickSummary,
    TransitionTrigger, Vector3, World, WorldConfig,
};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

const DEFAULT_PLACEMENT_SEED: u64 = 0xCE11_5EED_0123_4567;

/// Cells of one type placed uniformly inside the site before the first tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopulationSpec {
    pub agent_type: String,
    pub count: usize,
}

/// Everything one run needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub world: WorldConfig,
    pub population: Vec<PopulationSpec>,
    pub ticks: u64,
    /// Log a tick summary every this many ticks; zero logs only the final one.
    pub report_every: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            world: WorldConfig::default(),
            population: Vec::new(),
            ticks: 100,
            report_every: 50,
        }
    }
}

impl RunConfig {
    /// Read a JSON run configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Phagocytes hunting stationary conidia in a periodic box.
    #[must_use]
    pub fn demo() -> Self {
        let mut world = WorldConfig {
            site: SiteConfig {
                identifier: "demo".into(),
                upper_bound: Vector3::new(200.0, 200.0, 200.0),
                boundary: BoundaryCondition::Periodic,
                rng_seed: Some(0xFACA_DEAF),
                ..SiteConfig::default()
            },
            ..WorldConfig::default()
        };
        world.cell_types.insert(
            "Phagocyte".into(),
            CellTypeConfig {
                movement: MovementParameters {
                    kind: MovementKind::PersistentRandomWalk,
                    mean: 2.0,
                    std_dev: 0.5,
                    persistence_time: 5.0,
                    ..MovementParameters::default()
                },
                morphology: MorphologyParameters {
                    radius: 5.0,
                    std_dev: 0.5,
                    color: "Blue".into(),
                    ..MorphologyParameters::default()
                },
                ..CellTypeConfig::default()
            },
        );
        world.cell_types.insert(
            "Conidium".into(),
            CellTypeConfig {
                passive_movement: MovementParameters {
                    kind: MovementKind::RandomWalk,
                    diffusion_coefficient: 0.05,
                    ..MovementParameters::default()
                },
                morphology: MorphologyParameters {
                    radius: 1.5,
                    color: "Green".into(),
                    ..MorphologyParameters::default()
                },
                ..CellTypeConfig::default()
            },
        );
        world.state_graphs.insert(
            "Phagocyte".into(),
            StateGraph::default()
                .with_state(
                    INITIAL_STATE,
                    StateSpec::default().with_transition("Searching", TransitionTrigger::Immediate),
                )
                .with_state(
                    "Searching",
                    StateSpec::default().with_transition(
                        "Engulfing",
                        TransitionTrigger::OnContact {
                            partner_type: Some("Conidium".into()),
                        },
                    ),
                )
                .with_state(
                    "Engulfing",
                    StateSpec::default()
                        .immobile()
                        .with_transition("Searching", TransitionTrigger::AfterDuration { duration: 10.0 }),
                ),
        );
        world.state_graphs.insert(
            "Conidium".into(),
            StateGraph::default()
                .with_state(
                    INITIAL_STATE,
                    StateSpec::default()
                        .with_transition(
                            "Killed",
                            TransitionTrigger::OnContact {
                                partner_type: Some("Phagocyte".into()),
                            },
                        )
                        .with_transition("Swollen", TransitionTrigger::Rate { per_time: 0.002 }),
                )
                .with_state("Swollen", StateSpec::default())
                .with_state("Killed", StateSpec::default().deleting()),
        );
        Self {
            world,
            population: vec![
                PopulationSpec {
                    agent_type: "Phagocyte".into(),
                    count: 40,
                },
                PopulationSpec {
                    agent_type: "Conidium".into(),
                    count: 120,
                },
            ],
            ticks: 300,
            report_every: 50,
        }
    }
}

/// Place every requested cell uniformly inside the site. Returns the number spawned.
pub fn seed_population(
    world: &mut World,
    population: &[PopulationSpec],
    rng: &mut SmallRng,
) -> Result<usize> {
    let bounds = world.site().bounds();
    let (lo, hi) = (bounds.lower.to_array(), bounds.upper.to_array());
    let mut spawned = 0;
    for group in population {
        if world.cell_type(&group.agent_type).is_none() {
            bail!("population references unknown cell type {:?}", group.agent_type);
        }
        for _ in 0..group.count {
            let mut p = [0.0; 3];
            for axis in 0..3 {
                p[axis] = if axis < bounds.dimensions.count() {
                    rng.random_range(lo[axis]..=hi[axis])
                } else {
                    0.0
                };
            }
            world
                .spawn_cell(&group.agent_type, Vector3::from_array(p))
                .with_context(|| format!("failed to spawn {}", group.agent_type))?;
            spawned += 1;
        }
        debug!(agent_type = %group.agent_type, count = group.count, "population seeded");
    }
    Ok(spawned)
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summaries: Vec<TickSummary>,
    pub cells: Vec<CellSnapshot>,
    /// POV-Ray objects of every live cell at the end of the run.
    pub scene: String,
}

/// Build the world, seed it and advance it for the configured number of ticks.
pub fn run(config: RunConfig) -> Result<RunReport> {
    let placement_seed = config
        .world
        .site
        .rng_seed
        .map_or(DEFAULT_PLACEMENT_SEED, |seed| seed ^ DEFAULT_PLACEMENT_SEED);
    let mut world = World::new(config.world).context("invalid world configuration")?;
    let mut rng = SmallRng::seed_from_u64(placement_seed);
    let spawned = seed_population(&mut world, &config.population, &mut rng)?;
    info!(site = world.site().identifier(), cells = spawned, "world seeded");

    let mut summaries = Vec::new();
    for _ in 0..config.ticks {
        let summary = world.step();
        let stop = summary.stop_requested;
        if config.report_every > 0 && summary.tick.0 % config.report_every == 0 {
            log_summary(&summary);
        }
        summaries.push(summary);
        if stop {
            info!(tick = world.tick().0, "run stopped by state");
            break;
        }
    }

    match summaries.last() {
        Some(last) => log_summary(last),
        None => warn!("run finished without advancing any tick"),
    }

    let scene = world
        .cells()
        .iter()
        .filter_map(|(_, cell)| cell.external_representation())
        .collect::<String>();
    Ok(RunReport {
        summaries,
        cells: world.snapshot(),
        scene,
    })
}

fn log_summary(summary: &TickSummary) {
    info!(
        tick = summary.tick.0,
        time = summary.time,
        live = summary.live_cells,
        deletions = summary.deletions,
        crossings = summary.boundary_crossings,
        "tick summary",
    );
}
