use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const MORPH_SCHEMA_VERSION: u32 = 1;
pub const CONTROLLER_SCHEMA_VERSION: u32 = 1;

pub const MIN_DENSITY: f32 = 0.001;
pub const MIN_OSCILLATOR_AMPLITUDE: f32 = 0.001;
pub const MIN_OSCILLATOR_FREQUENCY: f32 = 0.001;
pub const MIN_TIME_CONSTANT: f32 = 0.001;
pub const MIN_ACTUATOR_CLAMP: f32 = 0.001;

// ---------------------------------------------------------------------------
// Morph genome
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialDef {
    #[serde(default = "default_friction")]
    pub friction: f32,
    #[serde(default)]
    pub restitution: f32,
    #[serde(default = "default_linear_damping")]
    pub linear_damping: f32,
    #[serde(default = "default_angular_damping")]
    pub angular_damping: f32,
    #[serde(default = "default_density")]
    pub density: f32,
}

impl Default for MaterialDef {
    fn default() -> Self {
        Self {
            friction: default_friction(),
            restitution: 0.0,
            linear_damping: default_linear_damping(),
            angular_damping: default_angular_damping(),
            density: default_density(),
        }
    }
}

fn default_friction() -> f32 {
    1.0
}

fn default_linear_damping() -> f32 {
    0.15
}

fn default_angular_damping() -> f32 {
    0.25
}

fn default_density() -> f32 {
    1.0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShapeKind {
    Cuboid,
    /// Unrecognized shape tokens survive deserialization so the validator
    /// can report them instead of hard-failing the parse.
    #[serde(other)]
    Unknown,
}

impl Default for ShapeKind {
    fn default() -> Self {
        ShapeKind::Cuboid
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JointKind {
    Fixed,
    Revolute,
    Spherical,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseGene {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
}

impl Default for PoseGene {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JointGene {
    pub parent_id: String,
    #[serde(rename = "type")]
    pub joint_type: JointKind,
    pub axis: [f32; 3],
    pub parent_anchor: [f32; 3],
    pub child_anchor: [f32; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<[f32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts_enabled: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyGene {
    pub id: String,
    #[serde(default)]
    pub shape: ShapeKind,
    pub half_extents: [f32; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub density: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(default)]
    pub pose: PoseGene,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joint: Option<JointGene>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MorphGenome {
    pub version: u32,
    #[serde(default)]
    pub materials: BTreeMap<String, MaterialDef>,
    pub bodies: Vec<BodyGene>,
}

// ---------------------------------------------------------------------------
// Controller genome
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Activation {
    Linear,
    Tanh,
    Relu,
    Sigmoid,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    Body,
    Joint,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorMetric {
    Height,
    VelocityX,
    VelocityY,
    VelocityZ,
    Speed,
    Contact,
    Angle,
    AngularVelocity,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetKind {
    Joint,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActuatorChannel {
    Torque,
    TargetAngle,
    Velocity,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSource {
    pub kind: SourceKind,
    pub id: String,
    pub metric: SensorMetric,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorTarget {
    pub kind: TargetKind,
    pub id: String,
    pub channel: ActuatorChannel,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeKind {
    Constant {
        value: f32,
    },
    Sensor {
        gain: f32,
        offset: f32,
        #[serde(default)]
        source: Option<SensorSource>,
    },
    Oscillator {
        amplitude: f32,
        frequency: f32,
        frequency_gain: f32,
        bias: f32,
        phase_offset: f32,
        offset: f32,
    },
    Neuron {
        bias: f32,
        activation: Activation,
        leak: f32,
        time_constant: f32,
    },
    Actuator {
        bias: f32,
        activation: Activation,
        gain: f32,
        clamp: f32,
        offset: f32,
        #[serde(default)]
        target: Option<ActuatorTarget>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGene {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionGene {
    pub id: String,
    pub source: String,
    pub target: String,
    pub weight: f32,
    #[serde(default)]
    pub recurrent: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerGenome {
    pub version: u32,
    pub nodes: Vec<NodeGene>,
    pub connections: Vec<ConnectionGene>,
}

// ---------------------------------------------------------------------------
// Individual
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lineage {
    pub parent_id: String,
    pub operations: Vec<String>,
}

/// A member of the population. Evaluation results (fitness, metrics) live in
/// transient wrappers and never persist on the individual itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Individual {
    pub id: String,
    pub morph: MorphGenome,
    pub controller: ControllerGenome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Two-segment hopper: a torso with a hinged leg and a foot. Small enough to
/// simulate fast, articulated enough that the default controller can hop.
pub fn default_morph() -> MorphGenome {
    MorphGenome {
        version: MORPH_SCHEMA_VERSION,
        materials: BTreeMap::new(),
        bodies: vec![
            BodyGene {
                id: "torso".to_string(),
                shape: ShapeKind::Cuboid,
                half_extents: [0.3, 0.2, 0.25],
                density: None,
                material: None,
                pose: PoseGene {
                    position: [0.0, 0.9, 0.0],
                    rotation: [0.0, 0.0, 0.0, 1.0],
                },
                joint: None,
            },
            BodyGene {
                id: "leg".to_string(),
                shape: ShapeKind::Cuboid,
                half_extents: [0.08, 0.22, 0.08],
                density: None,
                material: None,
                pose: PoseGene {
                    position: [0.0, -0.42, 0.0],
                    rotation: [0.0, 0.0, 0.0, 1.0],
                },
                joint: Some(JointGene {
                    parent_id: "torso".to_string(),
                    joint_type: JointKind::Revolute,
                    axis: [1.0, 0.0, 0.0],
                    parent_anchor: [0.0, -0.2, 0.0],
                    child_anchor: [0.0, 0.22, 0.0],
                    limits: Some([-0.9, 0.9]),
                    contacts_enabled: Some(false),
                }),
            },
            BodyGene {
                id: "foot".to_string(),
                shape: ShapeKind::Cuboid,
                half_extents: [0.12, 0.06, 0.12],
                density: None,
                material: None,
                pose: PoseGene {
                    position: [0.0, -0.28, 0.0],
                    rotation: [0.0, 0.0, 0.0, 1.0],
                },
                joint: Some(JointGene {
                    parent_id: "leg".to_string(),
                    joint_type: JointKind::Revolute,
                    axis: [1.0, 0.0, 0.0],
                    parent_anchor: [0.0, -0.22, 0.0],
                    child_anchor: [0.0, 0.06, 0.0],
                    limits: Some([-0.7, 0.7]),
                    contacts_enabled: Some(false),
                }),
            },
        ],
    }
}

/// Oscillator-driven controller matched to [`default_morph`]: one oscillator
/// drives both joints in antiphase, with a height sensor nudging the hip.
pub fn default_controller() -> ControllerGenome {
    ControllerGenome {
        version: CONTROLLER_SCHEMA_VERSION,
        nodes: vec![
            NodeGene {
                id: "osc".to_string(),
                kind: NodeKind::Oscillator {
                    amplitude: 1.0,
                    frequency: 1.4,
                    frequency_gain: 0.0,
                    bias: 0.0,
                    phase_offset: 0.0,
                    offset: 0.0,
                },
            },
            NodeGene {
                id: "height-sense".to_string(),
                kind: NodeKind::Sensor {
                    gain: 1.0,
                    offset: 0.0,
                    source: Some(SensorSource {
                        kind: SourceKind::Body,
                        id: "torso".to_string(),
                        metric: SensorMetric::Height,
                    }),
                },
            },
            NodeGene {
                id: "hip-drive".to_string(),
                kind: NodeKind::Actuator {
                    bias: 0.0,
                    activation: Activation::Tanh,
                    gain: 1.0,
                    clamp: 1.0,
                    offset: 0.0,
                    target: Some(ActuatorTarget {
                        kind: TargetKind::Joint,
                        id: "torso__leg".to_string(),
                        channel: ActuatorChannel::Torque,
                    }),
                },
            },
            NodeGene {
                id: "knee-drive".to_string(),
                kind: NodeKind::Actuator {
                    bias: 0.0,
                    activation: Activation::Tanh,
                    gain: 1.0,
                    clamp: 1.0,
                    offset: 0.0,
                    target: Some(ActuatorTarget {
                        kind: TargetKind::Joint,
                        id: "leg__foot".to_string(),
                        channel: ActuatorChannel::Torque,
                    }),
                },
            },
        ],
        connections: vec![
            ConnectionGene {
                id: "c-osc-hip".to_string(),
                source: "osc".to_string(),
                target: "hip-drive".to_string(),
                weight: 1.0,
                recurrent: false,
            },
            ConnectionGene {
                id: "c-osc-knee".to_string(),
                source: "osc".to_string(),
                target: "knee-drive".to_string(),
                weight: -0.6,
                recurrent: false,
            },
            ConnectionGene {
                id: "c-height-hip".to_string(),
                source: "height-sense".to_string(),
                target: "hip-drive".to_string(),
                weight: 0.2,
                recurrent: false,
            },
        ],
    }
}

pub fn default_individual(id: &str) -> Individual {
    Individual {
        id: id.to_string(),
        morph: default_morph(),
        controller: default_controller(),
        lineage: None,
    }
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() { value } else { fallback }
}

fn sanitize_material(material: &mut MaterialDef) {
    material.friction = finite_or(material.friction, default_friction()).max(0.0);
    material.restitution = finite_or(material.restitution, 0.0).clamp(0.0, 1.0);
    material.linear_damping = finite_or(material.linear_damping, default_linear_damping()).max(0.0);
    material.angular_damping =
        finite_or(material.angular_damping, default_angular_damping()).max(0.0);
    material.density = finite_or(material.density, default_density()).max(MIN_DENSITY);
}

/// Coerce numeric fields into their legal ranges and renormalize rotations.
/// Structural problems (bad ids, broken joint graph) are left for the
/// validator to report.
pub fn sanitize_morph(genome: &mut MorphGenome) {
    for material in genome.materials.values_mut() {
        sanitize_material(material);
    }
    for body in &mut genome.bodies {
        if let Some(density) = body.density.as_mut() {
            *density = finite_or(*density, default_density()).max(MIN_DENSITY);
        }
        let rotation = &mut body.pose.rotation;
        let norm = rotation.iter().map(|c| c * c).sum::<f32>().sqrt();
        if norm.is_finite() && norm > 1e-6 {
            for component in rotation.iter_mut() {
                *component /= norm;
            }
        } else {
            *rotation = [0.0, 0.0, 0.0, 1.0];
        }
    }
}

pub fn sanitize_controller(genome: &mut ControllerGenome) {
    for node in &mut genome.nodes {
        match &mut node.kind {
            NodeKind::Constant { value } => {
                *value = finite_or(*value, 0.0);
            }
            NodeKind::Sensor { gain, offset, .. } => {
                *gain = finite_or(*gain, 1.0);
                *offset = finite_or(*offset, 0.0);
            }
            NodeKind::Oscillator {
                amplitude,
                frequency,
                frequency_gain,
                bias,
                phase_offset,
                offset,
            } => {
                *amplitude = finite_or(*amplitude, 1.0)
                    .abs()
                    .max(MIN_OSCILLATOR_AMPLITUDE);
                *frequency = finite_or(*frequency, 1.0)
                    .abs()
                    .max(MIN_OSCILLATOR_FREQUENCY);
                *frequency_gain = finite_or(*frequency_gain, 0.0);
                *bias = finite_or(*bias, 0.0);
                *phase_offset = finite_or(*phase_offset, 0.0);
                *offset = finite_or(*offset, 0.0);
            }
            NodeKind::Neuron {
                bias,
                leak,
                time_constant,
                ..
            } => {
                *bias = finite_or(*bias, 0.0);
                *leak = finite_or(*leak, 0.0).clamp(0.0, 1.0);
                *time_constant = finite_or(*time_constant, 1.0).max(MIN_TIME_CONSTANT);
            }
            NodeKind::Actuator {
                bias,
                gain,
                clamp,
                offset,
                ..
            } => {
                *bias = finite_or(*bias, 0.0);
                *gain = finite_or(*gain, 1.0);
                *clamp = finite_or(*clamp, 1.0).abs().max(MIN_ACTUATOR_CLAMP);
                *offset = finite_or(*offset, 0.0);
            }
        }
    }
    for connection in &mut genome.connections {
        connection.weight = finite_or(connection.weight, 0.0);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a morph genome, returning human-readable messages. An empty list
/// means the genome is valid.
pub fn validate_morph(genome: &MorphGenome) -> Vec<String> {
    let mut errors = Vec::new();

    if genome.version != MORPH_SCHEMA_VERSION {
        errors.push(format!(
            "unsupported morph schema version {} (expected {})",
            genome.version, MORPH_SCHEMA_VERSION
        ));
    }
    if genome.bodies.is_empty() {
        errors.push("morph must contain at least one body".to_string());
        return errors;
    }

    let mut seen_ids = HashSet::new();
    for body in &genome.bodies {
        if body.id.is_empty() {
            errors.push("body id must not be empty".to_string());
        } else if !seen_ids.insert(body.id.as_str()) {
            errors.push(format!("duplicate body id '{}'", body.id));
        }
        if body.shape != ShapeKind::Cuboid {
            errors.push(format!("body '{}': only cuboid shapes are supported", body.id));
        }
        for (axis, extent) in body.half_extents.iter().enumerate() {
            if !extent.is_finite() || *extent <= 0.0 {
                errors.push(format!(
                    "body '{}': half extent {} must be finite and positive (got {})",
                    body.id, axis, extent
                ));
            }
        }
        if !body.pose.position.iter().all(|c| c.is_finite()) {
            errors.push(format!("body '{}': pose position must be finite", body.id));
        }
        if !body.pose.rotation.iter().all(|c| c.is_finite()) {
            errors.push(format!("body '{}': pose rotation must be finite", body.id));
        }
        if let Some(material) = &body.material {
            if !genome.materials.contains_key(material) {
                errors.push(format!(
                    "body '{}': references unknown material '{}'",
                    body.id, material
                ));
            }
        }
    }

    let ids: HashSet<&str> = genome.bodies.iter().map(|b| b.id.as_str()).collect();
    for body in &genome.bodies {
        let Some(joint) = &body.joint else { continue };
        if !ids.contains(joint.parent_id.as_str()) {
            errors.push(format!(
                "body '{}': joint references missing parentId '{}'",
                body.id, joint.parent_id
            ));
        }
        if joint.parent_id == body.id {
            errors.push(format!("body '{}': joint cannot reference itself", body.id));
        }
        if joint.joint_type == JointKind::Unknown {
            errors.push(format!("body '{}': unknown joint type", body.id));
        }
        if !joint.axis.iter().all(|c| c.is_finite()) {
            errors.push(format!("body '{}': joint axis must be finite", body.id));
        }
        if !joint.parent_anchor.iter().all(|c| c.is_finite())
            || !joint.child_anchor.iter().all(|c| c.is_finite())
        {
            errors.push(format!("body '{}': joint anchors must be finite", body.id));
        }
        if let Some(limits) = joint.limits {
            if !limits.iter().all(|c| c.is_finite()) {
                errors.push(format!("body '{}': joint limits must be finite", body.id));
            } else if limits[0] >= limits[1] {
                errors.push(format!(
                    "body '{}': joint limits must satisfy min < max",
                    body.id
                ));
            }
        }
    }

    let roots: Vec<&str> = genome
        .bodies
        .iter()
        .filter(|b| b.joint.is_none())
        .map(|b| b.id.as_str())
        .collect();
    match roots.len() {
        0 => errors.push("morph has no root body (every body declares a joint)".to_string()),
        1 => {}
        _ => errors.push(format!("morph has multiple root bodies: {}", roots.join(", "))),
    }

    if roots.len() == 1 && errors.is_empty() {
        // Walk parent links from the single root; anything unreached is
        // orphaned or part of a parent cycle.
        let root = roots[0];
        let mut reached: HashSet<&str> = HashSet::new();
        reached.insert(root);
        let mut changed = true;
        while changed {
            changed = false;
            for body in &genome.bodies {
                if reached.contains(body.id.as_str()) {
                    continue;
                }
                if let Some(joint) = &body.joint {
                    if reached.contains(joint.parent_id.as_str()) {
                        reached.insert(body.id.as_str());
                        changed = true;
                    }
                }
            }
        }
        for body in &genome.bodies {
            if !reached.contains(body.id.as_str()) {
                errors.push(format!(
                    "body '{}' is not reachable from root '{}'",
                    body.id, root
                ));
            }
        }
    }

    errors
}

pub fn validate_controller(genome: &ControllerGenome) -> Vec<String> {
    let mut errors = Vec::new();

    if genome.version != CONTROLLER_SCHEMA_VERSION {
        errors.push(format!(
            "unsupported controller schema version {} (expected {})",
            genome.version, CONTROLLER_SCHEMA_VERSION
        ));
    }

    let mut seen_ids = HashSet::new();
    let mut actuator_count = 0usize;
    for node in &genome.nodes {
        if node.id.is_empty() {
            errors.push("node id must not be empty".to_string());
        } else if !seen_ids.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
        match &node.kind {
            NodeKind::Sensor { source, .. } => {
                if let Some(source) = source {
                    if source.kind == SourceKind::Unknown {
                        errors.push(format!("node '{}': unknown sensor source kind", node.id));
                    }
                    if source.metric == SensorMetric::Unknown {
                        errors.push(format!("node '{}': unknown sensor metric", node.id));
                    }
                }
            }
            NodeKind::Neuron { activation, .. } => {
                if *activation == Activation::Unknown {
                    errors.push(format!("node '{}': unknown activation", node.id));
                }
            }
            NodeKind::Actuator {
                activation, target, ..
            } => {
                actuator_count += 1;
                if *activation == Activation::Unknown {
                    errors.push(format!("node '{}': unknown activation", node.id));
                }
                if let Some(target) = target {
                    if target.kind == TargetKind::Unknown {
                        errors.push(format!("node '{}': unknown actuator target kind", node.id));
                    }
                    if target.channel == ActuatorChannel::Unknown {
                        errors.push(format!("node '{}': unknown actuator channel", node.id));
                    }
                }
            }
            NodeKind::Constant { .. } | NodeKind::Oscillator { .. } => {}
        }
    }
    if actuator_count == 0 {
        errors.push("controller must contain at least one actuator node".to_string());
    }

    let node_ids: HashSet<&str> = genome.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut connection_ids = HashSet::new();
    for connection in &genome.connections {
        if connection.id.is_empty() {
            errors.push("connection id must not be empty".to_string());
        } else if !connection_ids.insert(connection.id.as_str()) {
            errors.push(format!("duplicate connection id '{}'", connection.id));
        }
        if !node_ids.contains(connection.source.as_str()) {
            errors.push(format!(
                "connection '{}': unknown source node '{}'",
                connection.id, connection.source
            ));
        }
        if !node_ids.contains(connection.target.as_str()) {
            errors.push(format!(
                "connection '{}': unknown target node '{}'",
                connection.id, connection.target
            ));
        }
    }

    errors
}

// ---------------------------------------------------------------------------
// Serialization entry points
// ---------------------------------------------------------------------------

pub fn serialize_morph(genome: &MorphGenome) -> Result<String, EngineError> {
    serde_json::to_string(genome).map_err(|err| EngineError::Runtime(err.to_string()))
}

pub fn deserialize_morph(text: &str) -> Result<MorphGenome, EngineError> {
    let mut genome: MorphGenome =
        serde_json::from_str(text).map_err(|err| EngineError::Schema(vec![err.to_string()]))?;
    sanitize_morph(&mut genome);
    let errors = validate_morph(&genome);
    if errors.is_empty() {
        Ok(genome)
    } else {
        Err(EngineError::Schema(errors))
    }
}

pub fn serialize_controller(genome: &ControllerGenome) -> Result<String, EngineError> {
    serde_json::to_string(genome).map_err(|err| EngineError::Runtime(err.to_string()))
}

pub fn deserialize_controller(text: &str) -> Result<ControllerGenome, EngineError> {
    let mut genome: ControllerGenome =
        serde_json::from_str(text).map_err(|err| EngineError::Schema(vec![err.to_string()]))?;
    sanitize_controller(&mut genome);
    let errors = validate_controller(&genome);
    if errors.is_empty() {
        Ok(genome)
    } else {
        Err(EngineError::Schema(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_genomes_validate() {
        assert!(validate_morph(&default_morph()).is_empty());
        assert!(validate_controller(&default_controller()).is_empty());
    }

    #[test]
    fn morph_round_trips_through_json() {
        let genome = default_morph();
        let text = serialize_morph(&genome).unwrap();
        let back = deserialize_morph(&text).unwrap();
        assert_eq!(back, genome);
    }

    #[test]
    fn controller_round_trips_through_json() {
        let genome = default_controller();
        let text = serialize_controller(&genome).unwrap();
        let back = deserialize_controller(&text).unwrap();
        assert_eq!(back, genome);
    }

    #[test]
    fn missing_root_and_multiple_roots_fail_distinctly() {
        let mut genome = default_morph();
        // Give the torso a joint onto the leg: no root remains, and the
        // parent links now form a cycle.
        genome.bodies[0].joint = Some(JointGene {
            parent_id: "leg".to_string(),
            joint_type: JointKind::Fixed,
            axis: [0.0, 1.0, 0.0],
            parent_anchor: [0.0, 0.0, 0.0],
            child_anchor: [0.0, 0.0, 0.0],
            limits: None,
            contacts_enabled: None,
        });
        let errors = validate_morph(&genome);
        assert!(errors.iter().any(|e| e.contains("no root body")), "{errors:?}");

        let mut genome = default_morph();
        genome.bodies[1].joint = None;
        let errors = validate_morph(&genome);
        assert!(
            errors.iter().any(|e| e.contains("multiple root bodies")),
            "{errors:?}"
        );
    }

    #[test]
    fn orphaned_subtree_is_reported() {
        let mut genome = default_morph();
        // Re-point the leg at the foot: leg <-> foot form a parent cycle
        // detached from the torso.
        genome.bodies[1].joint.as_mut().unwrap().parent_id = "foot".to_string();
        let errors = validate_morph(&genome);
        assert!(errors.iter().any(|e| e.contains("not reachable")), "{errors:?}");
    }

    #[test]
    fn non_positive_half_extents_are_rejected() {
        let mut genome = default_morph();
        genome.bodies[0].half_extents = [0.3, 0.0, 0.25];
        assert!(!validate_morph(&genome).is_empty());
        genome.bodies[0].half_extents = [0.3, f32::NAN, 0.25];
        assert!(!validate_morph(&genome).is_empty());
    }

    #[test]
    fn unknown_enum_tokens_survive_parsing_and_are_reported() {
        let text = serialize_controller(&default_controller())
            .unwrap()
            .replace("\"tanh\"", "\"softmax\"");
        let err = deserialize_controller(&text).unwrap_err();
        match err {
            EngineError::Schema(messages) => {
                assert!(messages.iter().any(|m| m.contains("unknown activation")));
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn controller_requires_an_actuator() {
        let mut genome = default_controller();
        genome.nodes.retain(|n| !matches!(n.kind, NodeKind::Actuator { .. }));
        genome
            .connections
            .retain(|c| c.target != "hip-drive" && c.target != "knee-drive");
        let errors = validate_controller(&genome);
        assert!(errors.iter().any(|e| e.contains("at least one actuator")));
    }

    #[test]
    fn dangling_connection_endpoints_are_reported() {
        let mut genome = default_controller();
        genome.connections.push(ConnectionGene {
            id: "c-bad".to_string(),
            source: "ghost".to_string(),
            target: "hip-drive".to_string(),
            weight: 1.0,
            recurrent: false,
        });
        let errors = validate_controller(&genome);
        assert!(errors.iter().any(|e| e.contains("unknown source node 'ghost'")));
    }

    #[test]
    fn sanitize_clamps_oscillator_and_neuron_fields() {
        let mut genome = default_controller();
        genome.nodes.push(NodeGene {
            id: "n1".to_string(),
            kind: NodeKind::Neuron {
                bias: f32::NAN,
                activation: Activation::Tanh,
                leak: 4.0,
                time_constant: -1.0,
            },
        });
        if let NodeKind::Oscillator { amplitude, frequency, .. } = &mut genome.nodes[0].kind {
            *amplitude = 0.0;
            *frequency = -2.0;
        }
        sanitize_controller(&mut genome);
        match &genome.nodes[0].kind {
            NodeKind::Oscillator { amplitude, frequency, .. } => {
                assert!(*amplitude >= MIN_OSCILLATOR_AMPLITUDE);
                assert!(*frequency >= MIN_OSCILLATOR_FREQUENCY);
            }
            _ => unreachable!(),
        }
        match &genome.nodes.last().unwrap().kind {
            NodeKind::Neuron { bias, leak, time_constant, .. } => {
                assert_eq!(*bias, 0.0);
                assert_eq!(*leak, 1.0);
                assert!(*time_constant >= MIN_TIME_CONSTANT);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let mut genome = default_morph();
        genome.bodies[2].id = "leg".to_string();
        // Keep the foot's joint pointing at the (now duplicated) leg id.
        let errors = validate_morph(&genome);
        assert!(errors.iter().any(|e| e.contains("duplicate body id")));
    }
}
