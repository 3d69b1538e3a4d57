use cellsim_core::measurement::InteractionOccurrence;
use cellsim_core::{
    Agent, BoundaryCondition, CellTypeConfig, GeometryError, INITIAL_STATE, MovementKind,
    MovementParameters, RandomSource, RecordingMeasurements, SiteConfig, SpatialDimensions,
    StateGraph, StateSpec, TransitionTrigger, Vector3, World, WorldConfig, WorldError,
};

fn walker(mean: f64) -> CellTypeConfig {
    CellTypeConfig {
        movement: MovementParameters {
            kind: MovementKind::RandomWalk,
            mean,
            std_dev: mean * 0.25,
            ..MovementParameters::default()
        },
        ..CellTypeConfig::default()
    }
}

fn resting_graph() -> StateGraph {
    StateGraph::default().with_state(INITIAL_STATE, StateSpec::default())
}

fn base_config(seed: u64) -> WorldConfig {
    let mut config = WorldConfig {
        site: SiteConfig {
            rng_seed: Some(seed),
            ..SiteConfig::default()
        },
        ..WorldConfig::default()
    };
    config.cell_types.insert("Walker".into(), walker(2.0));
    config
        .state_graphs
        .insert("Walker".into(), resting_graph());
    config
}

fn seed_population(world: &mut World, count: usize, seed: u64) {
    let mut placement = RandomSource::from_seed(seed);
    for _ in 0..count {
        let position = Vector3::new(
            placement.generate_double(10.0, 90.0),
            placement.generate_double(10.0, 90.0),
            placement.generate_double(10.0, 90.0),
        );
        world.spawn_cell("Walker", position).expect("spawn");
    }
}

fn trajectory(seed: u64, ticks: usize) -> Vec<String> {
    let mut config = base_config(seed);
    config.state_graphs.insert(
        "Walker".into(),
        StateGraph::default()
            .with_state(
                INITIAL_STATE,
                StateSpec::default().with_transition("Tired", TransitionTrigger::Rate { per_time: 0.2 }),
            )
            .with_state(
                "Tired",
                StateSpec::default()
                    .with_transition(INITIAL_STATE, TransitionTrigger::Rate { per_time: 0.3 }),
            ),
    );
    let mut world = World::new(config).expect("world");
    seed_population(&mut world, 40, 11);
    (0..ticks)
        .map(|_| {
            world.step();
            serde_json::to_string(&world.snapshot()).expect("snapshot json")
        })
        .collect()
}

#[test]
fn identical_seeds_reproduce_identical_trajectories() {
    let first = trajectory(2024, 60);
    let second = trajectory(2024, 60);
    assert_eq!(first, second);
    assert_ne!(first, trajectory(2025, 60));
}

#[test]
fn leaving_the_site_is_handled_exactly_once() {
    let mut config = base_config(5);
    config.cell_types.insert("Walker".into(), walker(30.0));
    let spy = RecordingMeasurements::new();
    let mut world = World::with_measurements(config, Box::new(spy.clone())).expect("world");
    let key = world
        .spawn_cell("Walker", Vector3::new(5.0, 50.0, 50.0))
        .expect("spawn");

    let summaries = world.run(200);
    let crossings: usize = summaries.iter().map(|s| s.boundary_crossings).sum();
    assert_eq!(crossings, 1);
    assert_eq!(spy.boundary_crossings().len(), 1);
    assert!(spy.boundary_crossings()[0].deleted);
    assert!(world.cell(key).is_none());
    assert!(world.site().locator().is_empty());
    assert_eq!(summaries.last().map(|s| s.live_cells), Some(0));
}

#[test]
fn locator_tracks_exactly_the_live_cells() {
    let mut config = base_config(9);
    config.cell_types.insert("Walker".into(), walker(6.0));
    config.state_graphs.insert(
        "Walker".into(),
        StateGraph::default()
            .with_state(
                INITIAL_STATE,
                StateSpec::default().with_transition("Dead", TransitionTrigger::Rate { per_time: 0.05 }),
            )
            .with_state("Dead", StateSpec::default().deleting()),
    );
    let mut world = World::new(config).expect("world");
    seed_population(&mut world, 60, 3);

    let mut deletions = 0;
    for _ in 0..40 {
        deletions += world.step().deletions;
        let locator = world.site().locator();
        assert_eq!(locator.len(), world.cells().len());
        for (key, cell) in world.cells().iter() {
            assert!(!cell.is_deleted());
            assert!(locator.contains(key));
        }
    }
    assert!(deletions > 0);
}

#[test]
fn contact_events_drive_state_transitions() {
    let mut config = base_config(17);
    config
        .cell_types
        .insert("Blob".into(), CellTypeConfig::default());
    config.state_graphs.insert(
        "Blob".into(),
        StateGraph::default()
            .with_state(
                INITIAL_STATE,
                StateSpec::default().with_transition("Resting", TransitionTrigger::Immediate),
            )
            .with_state(
                "Resting",
                StateSpec::default().with_transition(
                    "Activated",
                    TransitionTrigger::OnContact {
                        partner_type: Some("Blob".into()),
                    },
                ),
            )
            .with_state("Activated", StateSpec::default()),
    );
    let spy = RecordingMeasurements::new();
    let mut world = World::with_measurements(config, Box::new(spy.clone())).expect("world");
    let a = world
        .spawn_cell("Blob", Vector3::new(50.0, 50.0, 50.0))
        .expect("a");
    let b = world
        .spawn_cell("Blob", Vector3::new(51.5, 50.0, 50.0))
        .expect("b");
    let loner = world
        .spawn_cell("Blob", Vector3::new(80.0, 80.0, 80.0))
        .expect("loner");

    world.run(2);

    for key in [a, b] {
        assert_eq!(
            world.cell(key).and_then(Agent::current_state_name),
            Some("Activated")
        );
    }
    assert_eq!(
        world.cell(loner).and_then(Agent::current_state_name),
        Some("Resting")
    );
    let started = spy
        .interactions()
        .iter()
        .filter(|record| record.occurrence == InteractionOccurrence::ContactStarted)
        .count();
    assert_eq!(started, 1);
}

#[test]
fn stop_states_end_the_run_early() {
    let mut config = base_config(1);
    config.site.stop_states = vec!["Done".into()];
    config.state_graphs.insert(
        "Walker".into(),
        StateGraph::default()
            .with_state(
                INITIAL_STATE,
                StateSpec::default()
                    .with_transition("Done", TransitionTrigger::AfterDuration { duration: 2.0 }),
            )
            .with_state("Done", StateSpec::default()),
    );
    let mut world = World::new(config).expect("world");
    world
        .spawn_cell("Walker", Vector3::new(50.0, 50.0, 50.0))
        .expect("spawn");

    let summaries = world.run(10);
    assert_eq!(summaries.len(), 3);
    assert!(summaries.iter().rev().skip(1).all(|s| !s.stop_requested));
    assert!(summaries.last().is_some_and(|s| s.stop_requested));
}

#[test]
fn nested_cells_are_placed_inside_without_overlap() {
    let mut config = base_config(8);
    let mut host = CellTypeConfig::default();
    host.morphology.radius = 10.0;
    let mut giant = CellTypeConfig::default();
    giant.morphology.radius = 10.0;
    config.cell_types.insert("Host".into(), host);
    config
        .cell_types
        .insert("Guest".into(), CellTypeConfig::default());
    config.cell_types.insert("Giant".into(), giant);
    for name in ["Host", "Guest", "Giant"] {
        config.state_graphs.insert(name.into(), resting_graph());
    }
    let mut world = World::new(config).expect("world");
    let host = world
        .spawn_cell("Host", Vector3::new(50.0, 50.0, 50.0))
        .expect("host");
    let guests: Vec<_> = (0..3)
        .map(|i| {
            world
                .spawn_cell("Guest", Vector3::new(10.0 + 5.0 * f64::from(i), 10.0, 10.0))
                .expect("guest")
        })
        .collect();
    for guest in &guests {
        world.insert_into(host, *guest).expect("insert");
    }

    let host_cell = world.cell(host).expect("host");
    assert_eq!(host_cell.ingestions().len(), 3);
    let spheres: Vec<_> = guests
        .iter()
        .map(|guest| world.cell(*guest).expect("guest").basic_sphere())
        .collect();
    for (i, sphere) in spheres.iter().enumerate() {
        assert!(host_cell.contains_position(sphere.center, sphere.radius));
        for other in &spheres[i + 1..] {
            assert!(!sphere.overlaps(other));
        }
    }
    let guest_cells: Vec<_> = guests.iter().filter_map(|g| world.cell(*g)).collect();
    assert!(!host_cell.collides_inside(guest_cells[0], &guest_cells));

    let giant = world
        .spawn_cell("Giant", Vector3::new(20.0, 80.0, 20.0))
        .expect("giant");
    assert_eq!(
        world.insert_into(host, giant),
        Err(WorldError::Geometry(GeometryError::IncomingTooLarge {
            host: 10.0,
            incoming: 10.0
        }))
    );
    assert_eq!(
        world.insert_into(host, host),
        Err(WorldError::InvalidConfig("a cell cannot be inserted into itself"))
    );
}

#[test]
fn planar_sites_keep_cells_in_the_plane() {
    let mut config = base_config(21);
    config.site.dimensions = SpatialDimensions::Two;
    config.site.boundary = BoundaryCondition::Periodic;
    config.cell_types.insert(
        "Walker".into(),
        CellTypeConfig {
            movement: MovementParameters {
                kind: MovementKind::PersistentRandomWalk,
                mean: 4.0,
                persistence_time: 5.0,
                ..MovementParameters::default()
            },
            ..CellTypeConfig::default()
        },
    );
    let mut world = World::new(config).expect("world");
    seed_population(&mut world, 25, 4);

    let summaries = world.run(100);
    assert!(summaries.iter().all(|s| s.deletions == 0));
    assert_eq!(world.cells().len(), 25);
    for snapshot in world.snapshot() {
        assert_eq!(snapshot.position.z, 0.0);
        assert!(world.site().contains_position(snapshot.position));
    }
}
