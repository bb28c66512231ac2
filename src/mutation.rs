use rapier3d::na::{UnitQuaternion, Vector3};

use crate::blueprint::resolve_world_poses;
use crate::config::MutationConfig;
use crate::error::EngineError;
use crate::genome::{
    self, ActuatorTarget, BodyGene, ConnectionGene, ControllerGenome, Individual, JointGene,
    JointKind, Lineage, MorphGenome, NodeKind, PoseGene, ShapeKind, TargetKind,
};
use crate::rng::SimRng;

const LIMB_SCALE_MIN: f64 = 0.45;
const LIMB_SCALE_MAX: f64 = 0.85;
const LIMB_MIN_HALF_EXTENT: f32 = 0.12;
const LIMB_OVERLAP_MARGIN: f32 = 0.01;
const LIMB_PARENT_OVERLAP_MARGIN: f32 = 0.0025;
const LIMB_DEFAULT_LIMITS: [f32; 2] = [-0.9, 0.9];

const RESIZE_FACTOR_MIN: f64 = 0.75;
const RESIZE_FACTOR_MAX: f64 = 1.2;
const RESIZE_MIN_HALF_EXTENT: f32 = 0.1;

const LIMIT_JITTER: f64 = 0.3;
const LIMIT_MIN_BOUND: f32 = -1.6;
const LIMIT_MAX_BOUND: f32 = 1.6;

const WEIGHT_JITTER: f64 = 0.35;
const WEIGHT_BOUND: f32 = 5.0;

/// World-aligned half extents of a rotated cuboid.
fn world_aabb_half_extents(rotation: &UnitQuaternion<f32>, half_extents: &[f32; 3]) -> [f32; 3] {
    let matrix = rotation.to_rotation_matrix();
    let m = matrix.matrix();
    let mut out = [0.0f32; 3];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = (0..3).map(|j| m[(i, j)].abs() * half_extents[j]).sum();
    }
    out
}

/// Depth of AABB interpenetration; non-positive when the boxes are apart.
fn aabb_overlap_depth(
    center_a: &Vector3<f32>,
    half_a: &[f32; 3],
    center_b: &Vector3<f32>,
    half_b: &[f32; 3],
) -> f32 {
    let mut depth = f32::INFINITY;
    for axis in 0..3 {
        let gap = half_a[axis] + half_b[axis] - (center_a[axis] - center_b[axis]).abs();
        depth = depth.min(gap);
    }
    depth
}

fn unique_id(existing: impl Fn(&str) -> bool, prefix: &str) -> String {
    let mut n = 1usize;
    loop {
        let candidate = format!("{prefix}-{n}");
        if !existing(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Grow a new cuboid limb off a random body, choosing the first axis-aligned
/// attachment direction whose bounding box does not collide with the rest of
/// the creature.
pub fn add_limb(morph: &mut MorphGenome, rng: &mut SimRng) -> bool {
    if morph.bodies.is_empty() {
        return false;
    }
    let parent_index = rng.int(morph.bodies.len());
    let parent_id = morph.bodies[parent_index].id.clone();
    let parent_he = morph.bodies[parent_index].half_extents;

    let mut new_he = [0.0f32; 3];
    for (slot, he) in new_he.iter_mut().zip(parent_he.iter()) {
        *slot = (he * rng.rangef(LIMB_SCALE_MIN as f32, LIMB_SCALE_MAX as f32))
            .max(LIMB_MIN_HALF_EXTENT);
    }

    let poses = resolve_world_poses(morph);
    let Some(&(parent_pos, parent_rot)) = poses.get(&parent_id) else {
        return false;
    };

    let mut directions: Vec<(usize, f32)> = vec![
        (0, 1.0),
        (0, -1.0),
        (1, 1.0),
        (1, -1.0),
        (2, 1.0),
        (2, -1.0),
    ];
    // Fisher-Yates driven by the run's own stream.
    for i in (1..directions.len()).rev() {
        let j = rng.int(i + 1);
        directions.swap(i, j);
    }

    for (axis, sign) in directions {
        let mut local_pos = Vector3::zeros();
        local_pos[axis] = sign * (parent_he[axis] + new_he[axis]);
        let world_pos = parent_pos + parent_rot * local_pos;
        let world_half = world_aabb_half_extents(&parent_rot, &new_he);

        let mut blocked = false;
        for body in &morph.bodies {
            let Some(&(other_pos, other_rot)) = poses.get(&body.id) else {
                continue;
            };
            let other_half = world_aabb_half_extents(&other_rot, &body.half_extents);
            let margin = if body.id == parent_id {
                // The new limb necessarily touches its parent at the anchor
                // face; only reject real interpenetration.
                LIMB_PARENT_OVERLAP_MARGIN
            } else {
                LIMB_OVERLAP_MARGIN
            };
            if aabb_overlap_depth(&world_pos, &world_half, &other_pos, &other_half) > margin {
                blocked = true;
                break;
            }
        }
        if blocked {
            continue;
        }

        let mut parent_anchor = [0.0f32; 3];
        parent_anchor[axis] = sign * parent_he[axis];
        let mut child_anchor = [0.0f32; 3];
        child_anchor[axis] = -sign * new_he[axis];

        let mut joint_axis = [0.0f32; 3];
        joint_axis[rng.int(3)] = 1.0;

        let id = unique_id(|c| morph.bodies.iter().any(|b| b.id == c), "limb");
        morph.bodies.push(BodyGene {
            id,
            shape: ShapeKind::Cuboid,
            half_extents: new_he,
            density: None,
            material: None,
            pose: PoseGene {
                position: [local_pos.x, local_pos.y, local_pos.z],
                rotation: [0.0, 0.0, 0.0, 1.0],
            },
            joint: Some(JointGene {
                parent_id: parent_id.clone(),
                joint_type: JointKind::Revolute,
                axis: joint_axis,
                parent_anchor,
                child_anchor,
                limits: Some(LIMB_DEFAULT_LIMITS),
                contacts_enabled: None,
            }),
        });
        return true;
    }
    false
}

/// Scale a random body, cascading the factor through its own joint anchor
/// and its children's attachment geometry so the tree stays connected.
pub fn resize_body(morph: &mut MorphGenome, rng: &mut SimRng) -> bool {
    if morph.bodies.is_empty() {
        return false;
    }
    let index = rng.int(morph.bodies.len());
    let factor = rng.rangef(RESIZE_FACTOR_MIN as f32, RESIZE_FACTOR_MAX as f32);
    let id = morph.bodies[index].id.clone();

    {
        let body = &mut morph.bodies[index];
        for he in body.half_extents.iter_mut() {
            *he = (*he * factor).max(RESIZE_MIN_HALF_EXTENT);
        }
        for c in body.pose.position.iter_mut() {
            *c *= factor;
        }
        if let Some(joint) = body.joint.as_mut() {
            for c in joint.child_anchor.iter_mut() {
                *c *= factor;
            }
        }
    }

    for body in &mut morph.bodies {
        let Some(joint) = body.joint.as_mut() else { continue };
        if joint.parent_id != id {
            continue;
        }
        for c in joint.parent_anchor.iter_mut() {
            *c *= factor;
        }
        for c in body.pose.position.iter_mut() {
            *c *= factor;
        }
    }
    true
}

/// Nudge both ends of a random limited joint's angular range.
pub fn joint_limits(morph: &mut MorphGenome, rng: &mut SimRng) -> bool {
    let candidates: Vec<usize> = morph
        .bodies
        .iter()
        .enumerate()
        .filter(|(_, b)| b.joint.as_ref().is_some_and(|j| j.limits.is_some()))
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return false;
    }
    let index = candidates[rng.int(candidates.len())];
    let Some(joint) = morph.bodies[index].joint.as_mut() else {
        return false;
    };
    let Some([mut min, mut max]) = joint.limits else {
        return false;
    };
    min = (min + rng.rangef(-(LIMIT_JITTER as f32), LIMIT_JITTER as f32))
        .clamp(LIMIT_MIN_BOUND, 0.0);
    max = (max + rng.rangef(-(LIMIT_JITTER as f32), LIMIT_JITTER as f32))
        .clamp(0.0, LIMIT_MAX_BOUND);
    if min >= max {
        min = (max - 0.05).clamp(LIMIT_MIN_BOUND, 0.0);
    }
    joint.limits = Some([min, max]);
    true
}

/// Jitter one connection weight.
pub fn weight_jitter(controller: &mut ControllerGenome, rng: &mut SimRng) -> bool {
    if controller.connections.is_empty() {
        return false;
    }
    let index = rng.int(controller.connections.len());
    let connection = &mut controller.connections[index];
    connection.weight = (connection.weight
        + rng.rangef(-(WEIGHT_JITTER as f32), WEIGHT_JITTER as f32))
    .clamp(-WEIGHT_BOUND, WEIGHT_BOUND);
    true
}

/// Retune one oscillator's amplitude, frequency and phase.
pub fn oscillator_tune(controller: &mut ControllerGenome, rng: &mut SimRng) -> bool {
    let candidates: Vec<usize> = controller
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| matches!(n.kind, NodeKind::Oscillator { .. }))
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return false;
    }
    let index = candidates[rng.int(candidates.len())];
    if let NodeKind::Oscillator {
        amplitude,
        frequency,
        phase_offset,
        offset,
        ..
    } = &mut controller.nodes[index].kind
    {
        *amplitude = (*amplitude * rng.rangef(0.75, 1.25)).max(0.05);
        *frequency = (*frequency * rng.rangef(0.8, 1.2)).max(0.05);
        *offset += rng.rangef(-0.2, 0.2);
        *phase_offset += rng.rangef(-0.2, 0.2);
    }
    true
}

/// Wire a random unconnected sensor into a random actuator.
pub fn add_connection(controller: &mut ControllerGenome, rng: &mut SimRng) -> bool {
    let sensors: Vec<&str> = controller
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Sensor { .. }))
        .map(|n| n.id.as_str())
        .collect();
    let actuators: Vec<&str> = controller
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Actuator { .. }))
        .map(|n| n.id.as_str())
        .collect();

    let mut open_pairs = Vec::new();
    for sensor in &sensors {
        for actuator in &actuators {
            let connected = controller
                .connections
                .iter()
                .any(|c| c.source == *sensor && c.target == *actuator);
            if !connected {
                open_pairs.push((sensor.to_string(), actuator.to_string()));
            }
        }
    }
    if open_pairs.is_empty() {
        return false;
    }
    let (source, target) = open_pairs[rng.int(open_pairs.len())].clone();
    let id = unique_id(
        |c| controller.connections.iter().any(|conn| conn.id == c),
        "conn",
    );
    let weight = rng.rangef(-1.0, 1.0);
    controller.connections.push(ConnectionGene {
        id,
        source,
        target,
        weight,
        recurrent: false,
    });
    true
}

/// New-limb actuators would be inert without a driver, so every added limb
/// also gets an oscillator-fed actuator wired to its joint.
fn wire_new_limbs(morph: &MorphGenome, controller: &mut ControllerGenome, rng: &mut SimRng) {
    let driven: Vec<String> = controller
        .nodes
        .iter()
        .filter_map(|n| match &n.kind {
            NodeKind::Actuator {
                target: Some(ActuatorTarget { id, .. }),
                ..
            } => Some(id.clone()),
            _ => None,
        })
        .collect();
    let oscillator = controller.nodes.iter().find_map(|n| {
        matches!(n.kind, NodeKind::Oscillator { .. }).then(|| n.id.clone())
    });

    for body in &morph.bodies {
        let Some(joint) = &body.joint else { continue };
        if joint.joint_type == JointKind::Fixed {
            continue;
        }
        let joint_id = format!("{}__{}", joint.parent_id, body.id);
        if driven.contains(&joint_id) {
            continue;
        }
        let actuator_id = unique_id(|c| controller.nodes.iter().any(|n| n.id == c), "drive");
        controller.nodes.push(genome::NodeGene {
            id: actuator_id.clone(),
            kind: NodeKind::Actuator {
                bias: 0.0,
                activation: genome::Activation::Tanh,
                gain: 1.0,
                clamp: 1.0,
                offset: 0.0,
                target: Some(ActuatorTarget {
                    kind: TargetKind::Joint,
                    id: joint_id,
                    channel: genome::ActuatorChannel::Torque,
                }),
            },
        });
        if let Some(oscillator) = &oscillator {
            let id = unique_id(
                |c| controller.connections.iter().any(|conn| conn.id == c),
                "conn",
            );
            controller.connections.push(ConnectionGene {
                id,
                source: oscillator.clone(),
                target: actuator_id,
                weight: rng.rangef(-1.0, 1.0),
                recurrent: false,
            });
        }
    }
}

/// Produce a mutated child of `parent`. At least one operator always fires;
/// the result is re-sanitized and re-validated before it is returned.
pub fn mutate_individual(
    parent: &Individual,
    mut rng: SimRng,
    config: &MutationConfig,
) -> Result<Individual, EngineError> {
    let mut morph = parent.morph.clone();
    let mut controller = parent.controller.clone();
    let mut operations = Vec::new();

    if rng.chance(config.add_limb_chance) && add_limb(&mut morph, &mut rng) {
        operations.push("addLimb".to_string());
    }
    if rng.chance(config.resize_body_chance) && resize_body(&mut morph, &mut rng) {
        operations.push("resizeBody".to_string());
    }
    if rng.chance(config.joint_limits_chance) && joint_limits(&mut morph, &mut rng) {
        operations.push("jointLimits".to_string());
    }
    if rng.chance(config.weight_jitter_chance) && weight_jitter(&mut controller, &mut rng) {
        operations.push("weightJitter".to_string());
    }
    if rng.chance(config.oscillator_tune_chance) && oscillator_tune(&mut controller, &mut rng) {
        operations.push("oscillatorTune".to_string());
    }
    if rng.chance(config.add_connection_chance) && add_connection(&mut controller, &mut rng) {
        operations.push("addConnection".to_string());
    }

    if operations.is_empty() {
        if weight_jitter(&mut controller, &mut rng) {
            operations.push("weightJitter".to_string());
        } else if oscillator_tune(&mut controller, &mut rng) {
            operations.push("oscillatorTune".to_string());
        } else if resize_body(&mut morph, &mut rng) {
            operations.push("resizeBody".to_string());
        }
    }

    if operations.iter().any(|op| op == "addLimb") {
        wire_new_limbs(&morph, &mut controller, &mut rng);
    }

    genome::sanitize_morph(&mut morph);
    genome::sanitize_controller(&mut controller);
    let mut errors = genome::validate_morph(&morph);
    errors.extend(genome::validate_controller(&controller));
    if !errors.is_empty() {
        return Err(EngineError::Schema(errors));
    }

    let id = format!("ind-{:08x}", (rng.next() * 4_294_967_296.0) as u32);
    Ok(Individual {
        id,
        morph,
        controller,
        lineage: Some(Lineage {
            parent_id: parent.id.clone(),
            operations,
        }),
    })
}
