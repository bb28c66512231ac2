use std::collections::{BTreeMap, HashMap};

use rapier3d::na::{Quaternion, UnitQuaternion, Vector3};

use crate::arena::{FLOOR_TOP_Y, GROUND_CLEARANCE_MARGIN};
use crate::error::EngineError;
use crate::genome::{
    self, ControllerGenome, JointKind, MaterialDef, MorphGenome, NodeGene, NodeKind,
};

// ---------------------------------------------------------------------------
// Morphology blueprint
// ---------------------------------------------------------------------------

/// A body resolved to world space with its material fully merged.
#[derive(Clone, Debug)]
pub struct ResolvedBody {
    pub id: String,
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub half_extents: [f32; 3],
    pub density: f32,
    pub material: MaterialDef,
}

#[derive(Clone, Debug)]
pub struct ResolvedJoint {
    pub id: String,
    pub joint_type: JointKind,
    pub parent_id: String,
    pub child_id: String,
    pub parent_anchor: Vector3<f32>,
    pub child_anchor: Vector3<f32>,
    pub axis: Vector3<f32>,
    pub limits: Option<[f32; 2]>,
    pub disable_contacts: bool,
}

/// World-space build plan for a creature, ready to be handed to the physics
/// layer without further genome interpretation.
#[derive(Clone, Debug)]
pub struct MorphologyBlueprint {
    pub bodies: Vec<ResolvedBody>,
    pub joints: Vec<ResolvedJoint>,
    pub materials: BTreeMap<String, MaterialDef>,
    pub root_id: String,
}

/// World pose of every body, resolved by chaining local poses down the joint
/// tree. Bodies are returned in traversal order (root first).
pub fn resolve_world_poses(
    genome: &MorphGenome,
) -> HashMap<String, (Vector3<f32>, UnitQuaternion<f32>)> {
    let by_id: HashMap<&str, &genome::BodyGene> =
        genome.bodies.iter().map(|b| (b.id.as_str(), b)).collect();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut root = None;
    for body in &genome.bodies {
        match &body.joint {
            Some(joint) => children
                .entry(joint.parent_id.as_str())
                .or_default()
                .push(body.id.as_str()),
            None => root = Some(body.id.as_str()),
        }
    }

    let mut poses = HashMap::new();
    let Some(root) = root else { return poses };
    let mut stack: Vec<(&str, Vector3<f32>, UnitQuaternion<f32>)> = vec![(
        root,
        Vector3::zeros(),
        UnitQuaternion::identity(),
    )];
    while let Some((id, parent_pos, parent_rot)) = stack.pop() {
        let Some(body) = by_id.get(id) else { continue };
        let local_pos = Vector3::from(body.pose.position);
        let [x, y, z, w] = body.pose.rotation;
        let local_rot = UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z));
        let world_rot = parent_rot * local_rot;
        let world_pos = parent_pos + parent_rot * local_pos;
        poses.insert(id.to_string(), (world_pos, world_rot));
        if let Some(kids) = children.get(id) {
            for kid in kids {
                stack.push((kid, world_pos, world_rot));
            }
        }
    }
    poses
}

/// Height of the world-aligned bounding box of a rotated cuboid, measured
/// from its center to its lowest point.
fn rotated_half_height(rotation: &UnitQuaternion<f32>, half_extents: &[f32; 3]) -> f32 {
    let matrix = rotation.to_rotation_matrix();
    let row = matrix.matrix().row(1);
    row.iter()
        .zip(half_extents.iter())
        .map(|(r, he)| r.abs() * he)
        .sum()
}

/// Vertical offset that lifts the whole creature so its lowest AABB point
/// clears the floor top by the clearance margin. Never pushes down.
pub fn compute_ground_clearance_offset(bodies: &[ResolvedBody]) -> f32 {
    let mut lowest = f32::INFINITY;
    for body in bodies {
        let bottom = body.position.y - rotated_half_height(&body.rotation, &body.half_extents);
        lowest = lowest.min(bottom);
    }
    if !lowest.is_finite() {
        return 0.0;
    }
    (FLOOR_TOP_Y + GROUND_CLEARANCE_MARGIN - lowest).max(0.0)
}

pub fn apply_ground_clearance(bodies: &mut [ResolvedBody]) -> f32 {
    let offset = compute_ground_clearance_offset(bodies);
    if offset > 0.0 {
        for body in bodies.iter_mut() {
            body.position.y += offset;
        }
    }
    offset
}

/// Validate and resolve a morph genome into a world-space blueprint.
pub fn build_morphology_blueprint(
    genome: &MorphGenome,
) -> Result<MorphologyBlueprint, EngineError> {
    let errors = genome::validate_morph(genome);
    if !errors.is_empty() {
        return Err(EngineError::Schema(errors));
    }

    let poses = resolve_world_poses(genome);
    let root_id = genome
        .bodies
        .iter()
        .find(|b| b.joint.is_none())
        .map(|b| b.id.clone())
        .ok_or_else(|| EngineError::Schema(vec!["morph has no root body".to_string()]))?;

    let mut bodies = Vec::with_capacity(genome.bodies.len());
    let mut joints = Vec::new();
    for body in &genome.bodies {
        let (position, rotation) = poses
            .get(&body.id)
            .copied()
            .ok_or_else(|| EngineError::Instantiation(format!("unresolved body '{}'", body.id)))?;
        let material = body
            .material
            .as_ref()
            .and_then(|name| genome.materials.get(name))
            .cloned()
            .unwrap_or_default();
        let density = body.density.unwrap_or(material.density);
        bodies.push(ResolvedBody {
            id: body.id.clone(),
            position,
            rotation,
            half_extents: body.half_extents,
            density,
            material,
        });
        if let Some(joint) = &body.joint {
            joints.push(ResolvedJoint {
                id: format!("{}__{}", joint.parent_id, body.id),
                joint_type: joint.joint_type,
                parent_id: joint.parent_id.clone(),
                child_id: body.id.clone(),
                parent_anchor: Vector3::from(joint.parent_anchor),
                child_anchor: Vector3::from(joint.child_anchor),
                axis: Vector3::from(joint.axis),
                limits: joint.limits,
                disable_contacts: !joint.contacts_enabled.unwrap_or(false),
            });
        }
    }

    apply_ground_clearance(&mut bodies);

    Ok(MorphologyBlueprint {
        bodies,
        joints,
        materials: genome.materials.clone(),
        root_id,
    })
}

// ---------------------------------------------------------------------------
// Controller blueprint
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct Edge {
    pub source: usize,
    pub weight: f32,
}

/// Flattened controller graph: nodes in declaration order, with per-node
/// inbound edge lists split into feedforward (current-step outputs) and
/// recurrent (previous-step outputs).
#[derive(Clone, Debug)]
pub struct ControllerBlueprint {
    pub nodes: Vec<NodeGene>,
    pub feedforward: Vec<Vec<Edge>>,
    pub recurrent: Vec<Vec<Edge>>,
    pub index_by_id: HashMap<String, usize>,
    pub sensor_indices: Vec<usize>,
    pub actuator_indices: Vec<usize>,
}

pub fn build_controller_blueprint(
    genome: &ControllerGenome,
) -> Result<ControllerBlueprint, EngineError> {
    let errors = genome::validate_controller(genome);
    if !errors.is_empty() {
        return Err(EngineError::Schema(errors));
    }

    let mut sanitized = genome.clone();
    genome::sanitize_controller(&mut sanitized);

    let index_by_id: HashMap<String, usize> = sanitized
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i))
        .collect();

    let mut feedforward = vec![Vec::new(); sanitized.nodes.len()];
    let mut recurrent = vec![Vec::new(); sanitized.nodes.len()];
    for connection in &sanitized.connections {
        let source = index_by_id[connection.source.as_str()];
        let target = index_by_id[connection.target.as_str()];
        let edge = Edge {
            source,
            weight: connection.weight,
        };
        // Self-loops and back-references are only stable through the
        // previous-step buffer, so treat them as recurrent regardless of
        // the declared flag.
        if connection.recurrent || source >= target {
            recurrent[target].push(edge);
        } else {
            feedforward[target].push(edge);
        }
    }

    let mut sensor_indices = Vec::new();
    let mut actuator_indices = Vec::new();
    for (i, node) in sanitized.nodes.iter().enumerate() {
        match node.kind {
            NodeKind::Sensor { .. } => sensor_indices.push(i),
            NodeKind::Actuator { .. } => actuator_indices.push(i),
            _ => {}
        }
    }

    Ok(ControllerBlueprint {
        nodes: sanitized.nodes,
        feedforward,
        recurrent,
        index_by_id,
        sensor_indices,
        actuator_indices,
    })
}
