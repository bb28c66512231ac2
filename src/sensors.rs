use std::collections::BTreeMap;

use rapier3d::na::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::arena;
use crate::physics::{CreatureInstance, PhysicsWorld};

/// Vertical gap below which a body is considered touching the floor.
const CONTACT_THRESHOLD_Y: f32 = -0.48;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyReading {
    pub translation: [f32; 3],
    pub linvel: [f32; 3],
    pub angvel: [f32; 3],
    pub speed: f32,
    pub contact: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JointReading {
    pub angle: f32,
    pub angular_velocity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<[f32; 2]>,
}

/// Aggregate readings the render layer and simple controllers use without
/// naming individual bodies.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSummary {
    pub root_height: f32,
    pub root_vertical_velocity: f32,
    pub root_speed: f32,
    pub foot_contact: bool,
    pub primary_joint_angle: f32,
    pub primary_joint_velocity: f32,
    pub root_position: [f32; 3],
    pub objective_distance: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReadings {
    pub bodies: BTreeMap<String, BodyReading>,
    pub joints: BTreeMap<String, JointReading>,
    pub summary: SensorSummary,
}

impl SensorReadings {
    pub fn body(&self, id: &str) -> Option<&BodyReading> {
        self.bodies.get(id)
    }

    pub fn joint(&self, id: &str) -> Option<&JointReading> {
        self.joints.get(id)
    }
}

/// Twist of `child` relative to `parent` about the joint's local axis,
/// wrapped to `(-pi, pi]`.
pub fn joint_twist_angle(
    parent_rot: &UnitQuaternion<f32>,
    child_rot: &UnitQuaternion<f32>,
    local_axis: &Vector3<f32>,
) -> f32 {
    let norm = local_axis.norm();
    if norm < 1e-6 {
        return 0.0;
    }
    let axis = local_axis / norm;
    let rel = parent_rot.inverse() * child_rot;
    let proj = rel.i * axis.x + rel.j * axis.y + rel.k * axis.z;
    let angle = 2.0 * proj.atan2(rel.w);
    wrap_angle(angle)
}

fn wrap_angle(angle: f32) -> f32 {
    let tau = std::f32::consts::TAU;
    let mut wrapped = angle % tau;
    if wrapped > std::f32::consts::PI {
        wrapped -= tau;
    } else if wrapped <= -std::f32::consts::PI {
        wrapped += tau;
    }
    wrapped
}

/// Sample every body and joint of the creature in one pass.
pub fn read_sensors(world: &PhysicsWorld, creature: &CreatureInstance) -> SensorReadings {
    let mut bodies = BTreeMap::new();
    for (id, handle) in creature.handle_by_id.iter() {
        let Some(body) = world.body(*handle) else { continue };
        let translation = body.translation();
        let linvel = body.linvel();
        let angvel = body.angvel();
        let half_y = creature
            .half_extents
            .get(id)
            .map(|he| he[1])
            .unwrap_or(0.0);
        bodies.insert(
            id.clone(),
            BodyReading {
                translation: [translation.x, translation.y, translation.z],
                linvel: [linvel.x, linvel.y, linvel.z],
                angvel: [angvel.x, angvel.y, angvel.z],
                speed: linvel.norm(),
                contact: translation.y - half_y <= CONTACT_THRESHOLD_Y,
            },
        );
    }

    let mut joints = BTreeMap::new();
    for joint in &creature.joints {
        let (Some(parent), Some(child)) = (world.body(joint.parent), world.body(joint.child))
        else {
            continue;
        };
        let angle = joint_twist_angle(parent.rotation(), child.rotation(), &joint.axis);
        let world_axis = {
            let norm = joint.axis.norm();
            if norm < 1e-6 {
                Vector3::zeros()
            } else {
                parent.rotation() * (joint.axis / norm)
            }
        };
        let angular_velocity = (child.angvel() - parent.angvel()).dot(&world_axis);
        joints.insert(
            joint.id.clone(),
            JointReading {
                angle,
                angular_velocity,
                limits: joint.limits,
            },
        );
    }

    let summary = {
        let root = creature
            .handle_by_id
            .get(&creature.root_id)
            .and_then(|h| world.body(*h));
        let (root_position, root_linvel) = match root {
            Some(body) => (*body.translation(), *body.linvel()),
            None => (Vector3::zeros(), Vector3::zeros()),
        };
        let foot_contact = creature
            .body_ids
            .iter()
            .filter(|id| **id != creature.root_id)
            .filter_map(|id| bodies.get(id))
            .next()
            .map(|reading| reading.contact)
            .unwrap_or(false);
        let primary = creature.joints.first().map(|j| &j.id);
        let (primary_joint_angle, primary_joint_velocity) = primary
            .and_then(|id| joints.get(id))
            .map(|j| (j.angle, j.angular_velocity))
            .unwrap_or((0.0, 0.0));
        SensorSummary {
            root_height: root_position.y,
            root_vertical_velocity: root_linvel.y,
            root_speed: root_linvel.norm(),
            foot_contact,
            primary_joint_angle,
            primary_joint_velocity,
            root_position: [root_position.x, root_position.y, root_position.z],
            objective_distance: arena::horizontal_distance_to_objective(&root_position),
        }
    };

    SensorReadings {
        bodies,
        joints,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{stage_by_id, STAGE_DASH};
    use crate::blueprint::build_morphology_blueprint;
    use crate::genome::default_morph;
    use rapier3d::na as nalgebra;
    use rapier3d::na::vector;

    #[test]
    fn twist_angle_matches_axis_rotation() {
        let axis = vector![1.0, 0.0, 0.0];
        let parent = UnitQuaternion::identity();
        for angle in [-1.2f32, -0.3, 0.0, 0.4, 1.5] {
            let child = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), angle);
            let measured = joint_twist_angle(&parent, &child, &axis);
            assert!((measured - angle).abs() < 1e-4, "{angle} -> {measured}");
        }
    }

    #[test]
    fn twist_angle_is_relative_to_the_parent() {
        let axis = vector![0.0, 0.0, 1.0];
        let parent = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.5);
        let child = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.9);
        let measured = joint_twist_angle(&parent, &child, &axis);
        assert!((measured - 0.4).abs() < 1e-4);
    }

    #[test]
    fn wrap_keeps_angles_in_range() {
        assert!((wrap_angle(std::f32::consts::TAU + 0.1) - 0.1).abs() < 1e-5);
        assert!((wrap_angle(-std::f32::consts::TAU - 0.1) + 0.1).abs() < 1e-5);
    }

    #[test]
    fn readings_cover_every_body_and_joint() {
        let mut world = PhysicsWorld::new(1.0 / 60.0);
        world.add_arena(&stage_by_id(STAGE_DASH).unwrap());
        let blueprint = build_morphology_blueprint(&default_morph()).unwrap();
        let creature = world.spawn_creature(&blueprint).unwrap();
        let readings = read_sensors(&world, &creature);
        assert_eq!(readings.bodies.len(), 3);
        assert_eq!(readings.joints.len(), 2);
        assert!(readings.summary.root_height > 0.0);
        assert!(readings.summary.objective_distance > 0.0);
        assert!(readings.body("torso").is_some());
        assert!(readings.joint("torso__leg").is_some());
    }
}
