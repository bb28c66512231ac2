use rapier3d::na::Vector3;

use crate::brain::ActuatorCommand;
use crate::physics::{CreatureInstance, PhysicsWorld};

/// Peak angular impulse rate applied per unit of joint inertia. Commands are
/// normalized to `[-1, 1]` before scaling so actuator gain cannot bypass it.
pub const MAX_JOINT_ANGULAR_DELTA: f32 = 15.0;

/// Inertia of a body about a world axis, derived from the solver's
/// effective inverse inertia. Infinite (locked) axes return `None`.
fn inertia_about_axis(world: &PhysicsWorld, creature_body: rapier3d::prelude::RigidBodyHandle, axis: &Vector3<f32>) -> Option<f32> {
    let body = world.body(creature_body)?;
    let inv_sqrt = body.mass_properties().effective_world_inv_inertia_sqrt;
    let projected = inv_sqrt * *axis;
    let inv = projected.norm_squared();
    if inv <= 1e-9 || !inv.is_finite() {
        return None;
    }
    Some(1.0 / inv)
}

/// Apply actuator commands as equal and opposite torque impulses across each
/// targeted joint. All channels share the torque path; the command value is
/// treated as a normalized effort level.
pub fn apply_commands(
    world: &mut PhysicsWorld,
    creature: &CreatureInstance,
    commands: &[ActuatorCommand],
) {
    for command in commands {
        let Some(joint) = creature.joint_by_id(&command.target_id) else {
            continue;
        };
        let world_axis = {
            let Some(parent) = world.body(joint.parent) else { continue };
            let axis = parent.rotation() * joint.axis;
            let norm = axis.norm();
            if norm < 1e-6 {
                continue;
            }
            axis / norm
        };

        // Impulse scale comes from the weaker side of the joint.
        let parent_inertia = inertia_about_axis(world, joint.parent, &world_axis);
        let child_inertia = inertia_about_axis(world, joint.child, &world_axis);
        let base = match (parent_inertia, child_inertia) {
            (Some(p), Some(c)) => p.min(c),
            (Some(p), None) => p,
            (None, Some(c)) => c,
            (None, None) => continue,
        };

        let effort = command.value.clamp(-1.0, 1.0);
        let impulse = world_axis * (effort * base * MAX_JOINT_ANGULAR_DELTA);

        if let Some(child) = world.body_mut(joint.child) {
            child.apply_torque_impulse(impulse, true);
        }
        if let Some(parent) = world.body_mut(joint.parent) {
            parent.apply_torque_impulse(-impulse, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{stage_by_id, STAGE_DASH};
    use crate::blueprint::build_morphology_blueprint;
    use crate::brain::ActuatorCommand;
    use crate::genome::{default_morph, ActuatorChannel};

    fn spawn() -> (PhysicsWorld, CreatureInstance) {
        let mut world = PhysicsWorld::new(1.0 / 60.0);
        world.add_arena(&stage_by_id(STAGE_DASH).unwrap());
        let blueprint = build_morphology_blueprint(&default_morph()).unwrap();
        let creature = world.spawn_creature(&blueprint).unwrap();
        (world, creature)
    }

    fn hip_command(value: f32) -> ActuatorCommand {
        ActuatorCommand {
            actuator_id: "hip-drive".to_string(),
            target_id: "torso__leg".to_string(),
            channel: ActuatorChannel::Torque,
            value,
        }
    }

    #[test]
    fn torque_is_applied_in_opposition() {
        let (mut world, creature) = spawn();
        apply_commands(&mut world, &creature, &[hip_command(1.0)]);
        let joint = creature.joint_by_id("torso__leg").unwrap();
        let parent_w = *world.body(joint.parent).unwrap().angvel();
        let child_w = *world.body(joint.child).unwrap().angvel();
        assert!(child_w.norm() > 0.0);
        assert!(parent_w.norm() > 0.0);
        // Impulses are opposite along the joint axis (x for the hip).
        assert!(child_w.x * parent_w.x < 0.0, "{child_w:?} vs {parent_w:?}");
    }

    #[test]
    fn full_effort_delta_matches_the_angular_cap() {
        let (mut world, creature) = spawn();
        apply_commands(&mut world, &creature, &[hip_command(1.0)]);
        let joint = creature.joint_by_id("torso__leg").unwrap();
        // The lighter side of the joint sets the inertia scale, so the leg
        // picks up the full per-step angular delta about the hip axis.
        let child_w = world.body(joint.child).unwrap().angvel();
        assert!(
            (child_w.x.abs() - MAX_JOINT_ANGULAR_DELTA).abs() < 0.05,
            "{child_w:?}"
        );
    }

    #[test]
    fn effort_is_clamped_to_unit_range() {
        let (mut world_a, creature_a) = spawn();
        apply_commands(&mut world_a, &creature_a, &[hip_command(1.0)]);
        let (mut world_b, creature_b) = spawn();
        apply_commands(&mut world_b, &creature_b, &[hip_command(100.0)]);
        let wa = world_a
            .body(creature_a.joint_by_id("torso__leg").unwrap().child)
            .unwrap()
            .angvel()
            .norm();
        let wb = world_b
            .body(creature_b.joint_by_id("torso__leg").unwrap().child)
            .unwrap()
            .angvel()
            .norm();
        assert!((wa - wb).abs() < 1e-6);
    }

    #[test]
    fn unknown_target_is_ignored() {
        let (mut world, creature) = spawn();
        let command = ActuatorCommand {
            actuator_id: "ghost".to_string(),
            target_id: "no-such-joint".to_string(),
            channel: ActuatorChannel::Torque,
            value: 1.0,
        };
        apply_commands(&mut world, &creature, &[command]);
        let root = world.body(creature.root).unwrap();
        assert_eq!(root.angvel().norm(), 0.0);
    }
}
