use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(
    name = "Rust dynamic MAPF",
    about = "Multi-agent path planning on grids with stochastic moving obstacles.",
    author = "Moriarty Yu",
    version = "1.0"
)]
pub struct Cli {
    #[arg(long, short, help = "Path to the YAML config file")]
    pub config: Option<String>,

    #[arg(long, help = "Scenario file, overrides the config")]
    pub scenario: Option<String>,

    #[arg(long, help = "Solver to run (lra | whca | od), overrides the config")]
    pub solver: Option<String>,

    #[arg(long, help = "RNG seed, overrides the config")]
    pub seed: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    Lra,
    Whca,
    Od,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PredictorKind {
    None,
    Diffusion,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub scenario: String,
    pub solver: SolverKind,
    /// Planning horizon of the windowed solvers; 0 searches to the goal.
    pub window: u32,
    /// Heuristic penalty added per unit of predicted obstacle probability.
    pub obstacle_penalty: u32,
    /// Cells whose predicted obstacle probability exceeds this are
    /// impassable.
    pub obstacle_threshold: f64,
    /// Node budget for splicing back onto an invalidated plan; 0 disables
    /// the rejoin search.
    pub rejoin_limit: usize,
    pub predictor: PredictorKind,
    pub predictor_move_probability: f64,
    pub predictor_horizon: u32,
    /// Ticks without recalculation after which agitation resets.
    pub agitation_window: u32,
    /// Numerator of the per-recalculation agitation increment.
    pub agitation_boost: f64,
    pub max_ticks: u32,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scenario: "map_file/test/test.json".to_string(),
            solver: SolverKind::Whca,
            window: 10,
            obstacle_penalty: 100,
            obstacle_threshold: 0.5,
            rejoin_limit: 0,
            predictor: PredictorKind::None,
            predictor_move_probability: 0.2,
            predictor_horizon: 8,
            agitation_window: 5,
            agitation_boost: 5.0,
            max_ticks: 500,
            seed: 42,
        }
    }
}

impl Config {
    pub fn from_yaml_str(config_str: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(config_str)?;
        config.validate()
    }

    pub fn override_from_command_line(mut self, cli: &Cli) -> anyhow::Result<Self> {
        if let Some(scenario) = &cli.scenario {
            self.scenario = scenario.clone();
        }
        if let Some(solver) = &cli.solver {
            self.solver = match solver.as_str() {
                "lra" => SolverKind::Lra,
                "whca" => SolverKind::Whca,
                "od" => SolverKind::Od,
                other => anyhow::bail!("unknown solver {other:?}"),
            };
        }
        if let Some(seed) = cli.seed {
            self.seed = seed;
        }
        self.validate()
    }

    pub fn validate(self) -> anyhow::Result<Self> {
        if !(0.0..=1.0).contains(&self.obstacle_threshold) {
            anyhow::bail!("obstacle_threshold must lie in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.predictor_move_probability) {
            anyhow::bail!("predictor_move_probability must lie in [0, 1]");
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let config = Config::default();
        let text = serde_yaml::to_string(&config).unwrap();
        let parsed = Config::from_yaml_str(&text).unwrap();
        assert_eq!(parsed.solver, config.solver);
        assert_eq!(parsed.window, config.window);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = Config::from_yaml_str("solver: od\nwindow: 4\n").unwrap();
        assert_eq!(config.solver, SolverKind::Od);
        assert_eq!(config.window, 4);
        assert_eq!(config.obstacle_penalty, 100);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        assert!(Config::from_yaml_str("obstacle_threshold: 1.5\n").is_err());
    }
}
