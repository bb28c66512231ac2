use rapier3d::na::Vector3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::actuation::apply_commands;
use crate::arena::{self, horizontal_distance_to_objective};
use crate::blueprint::{build_controller_blueprint, build_morphology_blueprint};
use crate::brain::BrainRuntime;
use crate::config::SimulationConfig;
use crate::error::{CancelToken, EngineError};
use crate::genome::{ControllerGenome, MorphGenome};
use crate::physics::{CreatureInstance, PhysicsWorld};
use crate::replay::{ReplayCommand, ReplayFrame, ReplayMetadata, ReplayRecord, REPLAY_VERSION};
use crate::sensors::read_sensors;

/// Root height below which the creature counts as fallen out of the world.
const BELOW_FLOOR_LIMIT: f32 = -2.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSample {
    pub t: f32,
    pub center_of_mass: [f32; 3],
    pub root_height: f32,
    pub objective_distance: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisqualificationReason {
    BelowFloor,
    AboveHeightLimit,
    AccelerationLimit,
    NumericalInstability,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disqualification {
    pub reason: DisqualificationReason,
    pub limit: f32,
    pub value: f32,
    pub timestamp: f32,
}

#[derive(Clone, Debug)]
pub struct RolloutOptions {
    pub duration: f32,
    pub timestep: f32,
    pub sample_interval: f32,
    pub stage_id: String,
    pub max_root_acceleration: f32,
    pub max_root_height: f32,
    pub record_replay: bool,
}

impl RolloutOptions {
    pub fn from_simulation(config: &SimulationConfig) -> Self {
        Self {
            duration: config.duration,
            timestep: config.timestep,
            sample_interval: config.sample_interval,
            stage_id: config.stage_id.clone(),
            max_root_acceleration: config.max_root_acceleration,
            max_root_height: config.max_root_height,
            record_replay: false,
        }
    }

    pub fn with_replay(mut self) -> Self {
        self.record_replay = true;
        self
    }
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self::from_simulation(&SimulationConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct RolloutOutcome {
    pub trace: Vec<TraceSample>,
    pub runtime: f32,
    pub root_id: String,
    pub disqualification: Option<Disqualification>,
    pub replay: Option<ReplayRecord>,
}

fn center_of_mass(world: &PhysicsWorld, creature: &CreatureInstance) -> Vector3<f32> {
    let mut weighted = Vector3::zeros();
    let mut total = 0.0f32;
    for handle in &creature.handles {
        if let Some(body) = world.body(*handle) {
            let mass = body.mass();
            weighted += body.translation() * mass;
            total += mass;
        }
    }
    if total > 0.0 {
        weighted / total
    } else {
        Vector3::zeros()
    }
}

fn sample_at(world: &PhysicsWorld, creature: &CreatureInstance, t: f32) -> TraceSample {
    let com = center_of_mass(world, creature);
    let root_height = world
        .body(creature.root)
        .map(|b| b.translation().y)
        .unwrap_or(0.0);
    TraceSample {
        t,
        center_of_mass: [com.x, com.y, com.z],
        root_height,
        objective_distance: horizontal_distance_to_objective(&com),
    }
}

/// Simulate one creature from rest for the configured duration, sampling its
/// trajectory at the configured interval.
///
/// The rollout ends early only on cancellation; a disqualification freezes
/// the physics but is reported alongside the trace collected so far.
pub fn run_rollout(
    morph: &MorphGenome,
    controller: &ControllerGenome,
    options: &RolloutOptions,
    cancel: &CancelToken,
) -> Result<RolloutOutcome, EngineError> {
    let stage = arena::stage_by_id(&options.stage_id).ok_or_else(|| {
        EngineError::Instantiation(format!("unknown stage '{}'", options.stage_id))
    })?;

    let morph_blueprint = build_morphology_blueprint(morph)?;
    let controller_blueprint = build_controller_blueprint(controller)?;

    let mut world = PhysicsWorld::new(options.timestep);
    world.add_arena(&stage);
    let creature = world.spawn_creature(&morph_blueprint)?;
    let mut brain = BrainRuntime::new(controller_blueprint);
    brain.reset();

    let dt = world.timestep();
    let total_steps = ((options.duration / dt).ceil() as usize).max(1);
    let sample_stride = ((options.sample_interval.max(dt) / dt).round() as usize).max(1);

    let mut trace = Vec::with_capacity(total_steps / sample_stride + 2);
    trace.push(sample_at(&world, &creature, 0.0));

    let mut replay_frames = if options.record_replay {
        Some(Vec::with_capacity(total_steps))
    } else {
        None
    };

    let mut disqualification = None;
    let mut previous_root_velocity = world
        .body(creature.root)
        .map(|b| *b.linvel())
        .unwrap_or_else(Vector3::zeros);

    for step_index in 1..=total_steps {
        cancel.check()?;

        let sensors = read_sensors(&world, &creature);
        let commands = brain.update(dt, &sensors);
        apply_commands(&mut world, &creature, &commands);
        world.step();

        let t = step_index as f32 * dt;

        if let Some(frames) = replay_frames.as_mut() {
            frames.push(ReplayFrame {
                t,
                commands: commands
                    .iter()
                    .map(|c| ReplayCommand {
                        actuator_id: Some(c.actuator_id.clone()),
                        target_id: c.target_id.clone(),
                        value: c.value,
                    })
                    .collect(),
            });
        }

        let root = world.body(creature.root);
        let (root_position, root_velocity) = match root {
            Some(body) => (*body.translation(), *body.linvel()),
            None => (Vector3::zeros(), Vector3::zeros()),
        };

        let finite = root_position.iter().all(|c| c.is_finite())
            && root_velocity.iter().all(|c| c.is_finite());
        let acceleration = if finite {
            (root_velocity - previous_root_velocity).norm() / dt
        } else {
            f32::INFINITY
        };
        previous_root_velocity = root_velocity;

        disqualification = if !finite {
            Some(Disqualification {
                reason: DisqualificationReason::NumericalInstability,
                limit: 0.0,
                value: f32::NAN,
                timestamp: t,
            })
        } else if root_position.y < BELOW_FLOOR_LIMIT {
            Some(Disqualification {
                reason: DisqualificationReason::BelowFloor,
                limit: BELOW_FLOOR_LIMIT,
                value: root_position.y,
                timestamp: t,
            })
        } else if root_position.y > options.max_root_height {
            Some(Disqualification {
                reason: DisqualificationReason::AboveHeightLimit,
                limit: options.max_root_height,
                value: root_position.y,
                timestamp: t,
            })
        } else if acceleration > options.max_root_acceleration {
            Some(Disqualification {
                reason: DisqualificationReason::AccelerationLimit,
                limit: options.max_root_acceleration,
                value: acceleration,
                timestamp: t,
            })
        } else {
            None
        };

        let last_step = step_index == total_steps || disqualification.is_some();
        if step_index % sample_stride == 0 || last_step {
            if disqualification.map(|d| d.reason) == Some(DisqualificationReason::NumericalInstability)
            {
                // Poisoned state: keep the last good samples only.
            } else {
                trace.push(sample_at(&world, &creature, t));
            }
        }

        if let Some(disqualification) = &disqualification {
            debug!(
                reason = ?disqualification.reason,
                t = disqualification.timestamp,
                "rollout disqualified"
            );
            break;
        }
    }

    let runtime = trace.last().map(|s| s.t).unwrap_or(0.0);
    let replay = replay_frames.map(|frames| ReplayRecord {
        version: REPLAY_VERSION,
        metadata: ReplayMetadata {
            joints: creature.joints.iter().map(|j| j.id.clone()).collect(),
            actuators: brain
                .blueprint()
                .actuator_indices
                .iter()
                .map(|&i| brain.blueprint().nodes[i].id.clone())
                .collect(),
            timestep: dt,
            frame_count: frames.len(),
            duration: runtime,
        },
        frames,
    });

    Ok(RolloutOutcome {
        trace,
        runtime,
        root_id: creature.root_id.clone(),
        disqualification,
        replay,
    })
}
