use std::collections::BTreeMap;
use std::f32::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::blueprint::ControllerBlueprint;
use crate::genome::{
    Activation, ActuatorChannel, NodeKind, SensorMetric, SourceKind, TargetKind,
};
use crate::sensors::SensorReadings;

const MIN_OSCILLATOR_RATE: f32 = 0.01;

/// One actuator output for this control step, addressed at a joint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorCommand {
    pub actuator_id: String,
    pub target_id: String,
    pub channel: ActuatorChannel,
    pub value: f32,
}

#[derive(Clone, Copy, Debug, Default)]
struct NodeState {
    output: f32,
    previous_output: f32,
    phase: f32,
}

/// Executes a controller blueprint step by step. Node evaluation order is
/// declaration order; recurrent edges read the previous step's outputs.
pub struct BrainRuntime {
    blueprint: ControllerBlueprint,
    states: Vec<NodeState>,
}

impl BrainRuntime {
    pub fn new(blueprint: ControllerBlueprint) -> Self {
        let states = vec![NodeState::default(); blueprint.nodes.len()];
        let mut runtime = Self { blueprint, states };
        runtime.reset();
        runtime
    }

    /// Zero all state; constants publish their value immediately so they are
    /// visible to recurrent reads on the very first step.
    pub fn reset(&mut self) {
        for (state, node) in self.states.iter_mut().zip(self.blueprint.nodes.iter()) {
            *state = NodeState::default();
            if let NodeKind::Constant { value } = node.kind {
                state.output = value;
                state.previous_output = value;
            }
        }
    }

    pub fn blueprint(&self) -> &ControllerBlueprint {
        &self.blueprint
    }

    /// Current output of every node keyed by id, for inspection streams.
    pub fn outputs(&self) -> BTreeMap<String, f32> {
        self.blueprint
            .nodes
            .iter()
            .zip(self.states.iter())
            .map(|(node, state)| (node.id.clone(), state.output))
            .collect()
    }

    /// Advance the network one control step and collect actuator commands.
    pub fn update(&mut self, dt: f32, sensors: &SensorReadings) -> Vec<ActuatorCommand> {
        for state in &mut self.states {
            state.previous_output = state.output;
        }

        let mut commands = Vec::new();
        for index in 0..self.blueprint.nodes.len() {
            let pre = self.weighted_input(index);
            let node = &self.blueprint.nodes[index];
            let state = &mut self.states[index];
            match &node.kind {
                NodeKind::Constant { value } => {
                    state.output = *value;
                }
                NodeKind::Sensor { gain, offset, source } => {
                    let raw = source
                        .as_ref()
                        .map(|s| sample_source(sensors, s))
                        .unwrap_or(0.0);
                    state.output = gain * raw + offset;
                }
                NodeKind::Oscillator {
                    amplitude,
                    frequency,
                    frequency_gain,
                    phase_offset,
                    offset,
                    ..
                } => {
                    let rate = (frequency + frequency_gain * pre).max(MIN_OSCILLATOR_RATE);
                    state.phase += dt * rate * TAU;
                    state.output = offset + amplitude * (state.phase + phase_offset).sin();
                }
                NodeKind::Neuron { leak, activation, .. } => {
                    let activated = apply_activation(*activation, pre);
                    state.output = leak * state.previous_output + (1.0 - leak) * activated;
                }
                NodeKind::Actuator {
                    activation,
                    gain,
                    clamp,
                    offset,
                    target,
                    ..
                } => {
                    let activated = apply_activation(*activation, pre);
                    let value = (offset + activated * gain).clamp(-clamp, *clamp);
                    state.output = value;
                    if let Some(target) = target {
                        if target.kind == TargetKind::Joint {
                            commands.push(ActuatorCommand {
                                actuator_id: node.id.clone(),
                                target_id: target.id.clone(),
                                channel: target.channel,
                                value,
                            });
                        }
                    }
                }
            }
        }
        commands
    }

    /// Weighted sum of inbound edges plus the node's bias. Feedforward edges
    /// read this step's outputs, recurrent edges read last step's.
    fn weighted_input(&self, index: usize) -> f32 {
        let node = &self.blueprint.nodes[index];
        let bias = match node.kind {
            NodeKind::Oscillator { bias, .. }
            | NodeKind::Neuron { bias, .. }
            | NodeKind::Actuator { bias, .. } => bias,
            NodeKind::Constant { .. } | NodeKind::Sensor { .. } => 0.0,
        };
        let mut sum = bias;
        for edge in &self.blueprint.feedforward[index] {
            sum += edge.weight * self.states[edge.source].output;
        }
        for edge in &self.blueprint.recurrent[index] {
            sum += edge.weight * self.states[edge.source].previous_output;
        }
        sum
    }
}

pub fn apply_activation(kind: Activation, x: f32) -> f32 {
    match kind {
        Activation::Linear => x,
        Activation::Tanh => x.tanh(),
        Activation::Relu => x.max(0.0),
        Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        Activation::Unknown => x,
    }
}

fn sample_source(sensors: &SensorReadings, source: &crate::genome::SensorSource) -> f32 {
    match source.kind {
        SourceKind::Body => {
            let Some(body) = sensors.body(&source.id) else { return 0.0 };
            match source.metric {
                SensorMetric::Height => body.translation[1],
                SensorMetric::VelocityX => body.linvel[0],
                SensorMetric::VelocityY => body.linvel[1],
                SensorMetric::VelocityZ => body.linvel[2],
                SensorMetric::Speed => body.speed,
                SensorMetric::Contact => {
                    if body.contact {
                        1.0
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            }
        }
        SourceKind::Joint => {
            let Some(joint) = sensors.joint(&source.id) else { return 0.0 };
            match source.metric {
                SensorMetric::Angle => joint.angle,
                SensorMetric::AngularVelocity => joint.angular_velocity,
                _ => 0.0,
            }
        }
        SourceKind::Unknown => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::build_controller_blueprint;
    use crate::genome::{
        default_controller, ActuatorTarget, ConnectionGene, ControllerGenome, NodeGene,
        SensorSource, CONTROLLER_SCHEMA_VERSION,
    };
    use crate::sensors::{BodyReading, JointReading, SensorReadings, SensorSummary};
    use std::collections::BTreeMap;

    fn empty_sensors() -> SensorReadings {
        SensorReadings {
            bodies: BTreeMap::new(),
            joints: BTreeMap::new(),
            summary: SensorSummary {
                root_height: 0.0,
                root_vertical_velocity: 0.0,
                root_speed: 0.0,
                foot_contact: false,
                primary_joint_angle: 0.0,
                primary_joint_velocity: 0.0,
                root_position: [0.0; 3],
                objective_distance: 0.0,
            },
        }
    }

    fn sensors_with_torso(height: f32) -> SensorReadings {
        let mut readings = empty_sensors();
        readings.bodies.insert(
            "torso".to_string(),
            BodyReading {
                translation: [0.0, height, 0.0],
                linvel: [0.0; 3],
                angvel: [0.0; 3],
                speed: 0.0,
                contact: false,
            },
        );
        readings
    }

    #[test]
    fn activations_match_their_definitions() {
        assert_eq!(apply_activation(Activation::Linear, -1.5), -1.5);
        assert_eq!(apply_activation(Activation::Relu, -1.5), 0.0);
        assert!((apply_activation(Activation::Tanh, 0.5) - 0.5f32.tanh()).abs() < 1e-6);
        assert!((apply_activation(Activation::Sigmoid, 0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn default_controller_emits_joint_commands() {
        let blueprint = build_controller_blueprint(&default_controller()).unwrap();
        let mut brain = BrainRuntime::new(blueprint);
        let sensors = sensors_with_torso(0.9);
        let commands = brain.update(1.0 / 60.0, &sensors);
        assert_eq!(commands.len(), 2);
        assert!(commands.iter().any(|c| c.target_id == "torso__leg"));
        assert!(commands.iter().any(|c| c.target_id == "leg__foot"));
        for command in &commands {
            assert!(command.value.abs() <= 1.0 + 1e-6);
            assert_eq!(command.channel, ActuatorChannel::Torque);
        }
    }

    #[test]
    fn oscillator_advances_with_dt() {
        let blueprint = build_controller_blueprint(&default_controller()).unwrap();
        let mut brain = BrainRuntime::new(blueprint);
        let sensors = empty_sensors();
        brain.update(1.0 / 60.0, &sensors);
        let first = brain.outputs()["osc"];
        for _ in 0..10 {
            brain.update(1.0 / 60.0, &sensors);
        }
        let later = brain.outputs()["osc"];
        assert_ne!(first, later);
        // Amplitude 1, offset 0: output stays within the unit band.
        assert!(later.abs() <= 1.0 + 1e-6);
    }

    #[test]
    fn missing_sensor_source_reads_zero() {
        let blueprint = build_controller_blueprint(&default_controller()).unwrap();
        let mut brain = BrainRuntime::new(blueprint);
        let sensors = empty_sensors();
        brain.update(1.0 / 60.0, &sensors);
        assert_eq!(brain.outputs()["height-sense"], 0.0);
    }

    #[test]
    fn sensor_applies_gain_and_offset() {
        let mut genome = default_controller();
        for node in &mut genome.nodes {
            if node.id == "height-sense" {
                if let NodeKind::Sensor { gain, offset, .. } = &mut node.kind {
                    *gain = 2.0;
                    *offset = 0.5;
                }
            }
        }
        let blueprint = build_controller_blueprint(&genome).unwrap();
        let mut brain = BrainRuntime::new(blueprint);
        brain.update(1.0 / 60.0, &sensors_with_torso(0.9));
        assert!((brain.outputs()["height-sense"] - (2.0 * 0.9 + 0.5)).abs() < 1e-6);
    }

    #[test]
    fn reset_restores_initial_state() {
        let blueprint = build_controller_blueprint(&default_controller()).unwrap();
        let mut brain = BrainRuntime::new(blueprint);
        let sensors = empty_sensors();
        for _ in 0..20 {
            brain.update(1.0 / 60.0, &sensors);
        }
        brain.reset();
        let mut fresh = BrainRuntime::new(build_controller_blueprint(&default_controller()).unwrap());
        let a = brain.update(1.0 / 60.0, &sensors);
        let b = fresh.update(1.0 / 60.0, &sensors);
        assert_eq!(a, b);
    }

    #[test]
    fn recurrent_edges_read_previous_outputs() {
        // constant(1) -> neuron with a self recurrent loop of weight 0.5:
        // outputs follow x_{n} = 1 + 0.5 * x_{n-1} with linear activation.
        let genome = ControllerGenome {
            version: CONTROLLER_SCHEMA_VERSION,
            nodes: vec![
                NodeGene {
                    id: "one".to_string(),
                    kind: NodeKind::Constant { value: 1.0 },
                },
                NodeGene {
                    id: "acc".to_string(),
                    kind: NodeKind::Neuron {
                        bias: 0.0,
                        activation: Activation::Linear,
                        leak: 0.0,
                        time_constant: 1.0,
                    },
                },
                NodeGene {
                    id: "out".to_string(),
                    kind: NodeKind::Actuator {
                        bias: 0.0,
                        activation: Activation::Linear,
                        gain: 1.0,
                        clamp: 100.0,
                        offset: 0.0,
                        target: Some(ActuatorTarget {
                            kind: TargetKind::Joint,
                            id: "j".to_string(),
                            channel: ActuatorChannel::Torque,
                        }),
                    },
                },
            ],
            connections: vec![
                ConnectionGene {
                    id: "c1".to_string(),
                    source: "one".to_string(),
                    target: "acc".to_string(),
                    weight: 1.0,
                    recurrent: false,
                },
                ConnectionGene {
                    id: "c2".to_string(),
                    source: "acc".to_string(),
                    target: "acc".to_string(),
                    weight: 0.5,
                    recurrent: true,
                },
                ConnectionGene {
                    id: "c3".to_string(),
                    source: "acc".to_string(),
                    target: "out".to_string(),
                    weight: 1.0,
                    recurrent: false,
                },
            ],
        };
        let blueprint = build_controller_blueprint(&genome).unwrap();
        let mut brain = BrainRuntime::new(blueprint);
        let sensors = empty_sensors();
        let dt = 1.0 / 60.0;
        brain.update(dt, &sensors);
        assert!((brain.outputs()["acc"] - 1.0).abs() < 1e-6);
        brain.update(dt, &sensors);
        assert!((brain.outputs()["acc"] - 1.5).abs() < 1e-6);
        brain.update(dt, &sensors);
        assert!((brain.outputs()["acc"] - 1.75).abs() < 1e-6);
    }

    #[test]
    fn actuator_clamp_bounds_the_command() {
        let mut genome = default_controller();
        for node in &mut genome.nodes {
            if node.id == "hip-drive" {
                if let NodeKind::Actuator { gain, clamp, .. } = &mut node.kind {
                    *gain = 50.0;
                    *clamp = 0.4;
                }
            }
        }
        // Drive the oscillator hard so the activation saturates.
        let blueprint = build_controller_blueprint(&genome).unwrap();
        let mut brain = BrainRuntime::new(blueprint);
        let sensors = sensors_with_torso(0.9);
        for _ in 0..30 {
            let commands = brain.update(1.0 / 60.0, &sensors);
            let hip = commands.iter().find(|c| c.actuator_id == "hip-drive").unwrap();
            assert!(hip.value.abs() <= 0.4 + 1e-6);
        }
    }

    #[test]
    fn actuator_without_target_emits_nothing() {
        let mut genome = default_controller();
        for node in &mut genome.nodes {
            if let NodeKind::Actuator { target, .. } = &mut node.kind {
                *target = None;
            }
        }
        let blueprint = build_controller_blueprint(&genome).unwrap();
        let mut brain = BrainRuntime::new(blueprint);
        let commands = brain.update(1.0 / 60.0, &empty_sensors());
        assert!(commands.is_empty());
    }
}
