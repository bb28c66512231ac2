use serde::{Deserialize, Serialize};

use crate::arena;

pub const MIN_POPULATION_SIZE: usize = 4;
pub const DEFAULT_POPULATION_SIZE: usize = 16;
pub const DEFAULT_GENERATIONS: usize = 20;
pub const DEFAULT_ELITISM: usize = 2;
pub const DEFAULT_TOURNAMENT_SIZE: usize = 3;
pub const DEFAULT_ROLLOUT_SECONDS: f32 = 8.0;
pub const DEFAULT_TIMESTEP: f32 = 1.0 / 60.0;
pub const DEFAULT_SAMPLE_INTERVAL: f32 = 1.0 / 20.0;
pub const DEFAULT_MAX_ROOT_ACCELERATION: f32 = 300.0;
pub const DEFAULT_MAX_ROOT_HEIGHT: f32 = 5.0;

/// Full run configuration: every knob has a default and a sanitization
/// clamp, so a partially specified wire payload always yields a usable
/// config.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub population_size: usize,
    pub generations: usize,
    pub elitism: usize,
    pub tournament_size: usize,
    pub seed: u32,
    pub mutation: MutationConfig,
    pub selection: SelectionWeights,
    pub simulation: SimulationConfig,
    pub fitness: FitnessConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            population_size: DEFAULT_POPULATION_SIZE,
            generations: DEFAULT_GENERATIONS,
            elitism: DEFAULT_ELITISM,
            tournament_size: DEFAULT_TOURNAMENT_SIZE,
            seed: 1,
            mutation: MutationConfig::default(),
            selection: SelectionWeights::default(),
            simulation: SimulationConfig::default(),
            fitness: FitnessConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn sanitized(mut self) -> Self {
        self.population_size = self.population_size.max(MIN_POPULATION_SIZE);
        self.generations = self.generations.max(1);
        self.elitism = self.elitism.min(self.population_size);
        self.tournament_size = self.tournament_size.max(1);
        self.mutation = self.mutation.sanitized();
        self.selection = self.selection.sanitized();
        self.simulation = self.simulation.sanitized();
        self.fitness = self.fitness.sanitized();
        self
    }
}

/// Per-operator firing probabilities, all clamped to `[0, 1]`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MutationConfig {
    pub add_limb_chance: f64,
    pub resize_body_chance: f64,
    pub joint_limits_chance: f64,
    pub weight_jitter_chance: f64,
    pub oscillator_tune_chance: f64,
    pub add_connection_chance: f64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            add_limb_chance: 0.15,
            resize_body_chance: 0.35,
            joint_limits_chance: 0.3,
            weight_jitter_chance: 0.6,
            oscillator_tune_chance: 0.45,
            add_connection_chance: 0.12,
        }
    }
}

impl MutationConfig {
    pub fn sanitized(mut self) -> Self {
        self.add_limb_chance = self.add_limb_chance.clamp(0.0, 1.0);
        self.resize_body_chance = self.resize_body_chance.clamp(0.0, 1.0);
        self.joint_limits_chance = self.joint_limits_chance.clamp(0.0, 1.0);
        self.weight_jitter_chance = self.weight_jitter_chance.clamp(0.0, 1.0);
        self.oscillator_tune_chance = self.oscillator_tune_chance.clamp(0.0, 1.0);
        self.add_connection_chance = self.add_connection_chance.clamp(0.0, 1.0);
        self
    }
}

/// Weights of the composite selection score; all non-negative.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectionWeights {
    pub distance: f32,
    pub speed: f32,
    pub upright: f32,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            distance: 0.5,
            speed: 0.25,
            upright: 0.5,
        }
    }
}

impl SelectionWeights {
    pub fn sanitized(mut self) -> Self {
        self.distance = self.distance.max(0.0);
        self.speed = self.speed.max(0.0);
        self.upright = self.upright.max(0.0);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationConfig {
    pub duration: f32,
    pub timestep: f32,
    pub sample_interval: f32,
    pub stage_id: String,
    pub max_root_acceleration: f32,
    pub max_root_height: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration: DEFAULT_ROLLOUT_SECONDS,
            timestep: DEFAULT_TIMESTEP,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            stage_id: arena::STAGE_DASH.to_string(),
            max_root_acceleration: DEFAULT_MAX_ROOT_ACCELERATION,
            max_root_height: DEFAULT_MAX_ROOT_HEIGHT,
        }
    }
}

impl SimulationConfig {
    pub fn sanitized(mut self) -> Self {
        self.duration = self.duration.clamp(0.1, 120.0);
        self.timestep = self.timestep.clamp(1.0 / 480.0, 1.0 / 15.0);
        self.sample_interval = self.sample_interval.max(self.timestep);
        if self.stage_id.is_empty() {
            self.stage_id = arena::STAGE_DASH.to_string();
        }
        self.max_root_acceleration = self.max_root_acceleration.max(1.0);
        self.max_root_height = self.max_root_height.max(0.5);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FitnessConfig {
    /// Absolute floor of the fall threshold, in meters.
    pub fall_height: f32,
    pub fall_penalty: f32,
    pub height_weight: f32,
    pub velocity_weight: f32,
    pub upright_percentile: f32,
    pub fall_height_ratio: f32,
    pub objective_weight: f32,
    pub objective_reward_multiplier: f32,
    pub objective_position: [f32; 3],
}

impl Default for FitnessConfig {
    fn default() -> Self {
        Self {
            fall_height: 0.25,
            fall_penalty: 2.0,
            height_weight: 0.5,
            velocity_weight: 0.25,
            upright_percentile: 0.6,
            fall_height_ratio: 0.6,
            objective_weight: 1.0,
            objective_reward_multiplier: 1.0,
            objective_position: arena::OBJECTIVE_POSITION,
        }
    }
}

impl FitnessConfig {
    pub fn sanitized(mut self) -> Self {
        self.fall_height = self.fall_height.max(0.0);
        self.fall_penalty = self.fall_penalty.max(0.0);
        self.height_weight = self.height_weight.max(0.0);
        self.velocity_weight = self.velocity_weight.max(0.0);
        self.upright_percentile = self.upright_percentile.clamp(0.0, 1.0);
        self.fall_height_ratio = self.fall_height_ratio.clamp(0.0, 1.0);
        self.objective_weight = self.objective_weight.max(0.0);
        self.objective_reward_multiplier = self.objective_reward_multiplier.max(0.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_degenerate_values() {
        let config = EngineConfig {
            population_size: 1,
            generations: 0,
            elitism: 99,
            tournament_size: 0,
            mutation: MutationConfig {
                weight_jitter_chance: 3.0,
                add_limb_chance: -1.0,
                ..MutationConfig::default()
            },
            ..EngineConfig::default()
        }
        .sanitized();

        assert_eq!(config.population_size, MIN_POPULATION_SIZE);
        assert_eq!(config.generations, 1);
        assert!(config.elitism <= config.population_size);
        assert_eq!(config.tournament_size, 1);
        assert_eq!(config.mutation.weight_jitter_chance, 1.0);
        assert_eq!(config.mutation.add_limb_chance, 0.0);
    }

    #[test]
    fn default_round_trips_through_json() {
        let config = EngineConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.population_size, config.population_size);
        assert_eq!(back.simulation.stage_id, config.simulation.stage_id);
    }
}
