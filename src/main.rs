mod action;
mod algorithm;
mod common;
mod config;
mod map;
mod predictor;
mod scenario;
mod solver;
mod world;

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

use config::{Cli, Config};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {path}"))?;
            Config::from_yaml_str(&text)?
        }
        None => Config::default(),
    }
    .override_from_command_line(&cli)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut world = scenario::load_world(&config.scenario, &mut rng)
        .with_context(|| format!("loading scenario {}", config.scenario))?;

    let should_stop = Arc::new(AtomicBool::new(false));
    let mut solver = solver::make_solver(&config, should_stop);
    info!(solver = solver.name(), seed = config.seed, "episode start");

    let mut ticks = 0;
    while !solver::solved(&world) && ticks < config.max_ticks {
        solver.step(&mut world, &mut rng);
        world.next_tick(&mut rng);
        ticks += 1;
    }

    if solver::solved(&world) {
        info!(ticks, "all agents reached their targets");
    } else {
        warn!(
            ticks,
            remaining = world
                .agents()
                .iter()
                .filter(|(&p, a)| p != a.target)
                .count(),
            "episode stopped before completion"
        );
    }

    for (name, value) in solver.stat_names().iter().zip(solver.stat_values()) {
        info!("{name}: {value}");
    }

    Ok(())
}
