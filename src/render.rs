use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::brain::ActuatorCommand;
use crate::physics::{CreatureInstance, PhysicsWorld};
use crate::sensors::SensorReadings;

/// Translation (3) plus quaternion (4) per body in the shared layout.
pub const FLOATS_PER_BODY: usize = 7;
pub const META_VERSION_INDEX: usize = 0;
pub const META_WRITE_LOCK_INDEX: usize = 1;
pub const META_LENGTH: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vec3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quatf {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyPose {
    pub id: String,
    pub translation: Vec3f,
    pub rotation: Quatf,
}

/// One displayable frame: poses plus whatever diagnostics the viewer asked
/// for.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub bodies: Vec<BodyPose>,
    pub sensors: crate::sensors::SensorSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<ActuatorCommand>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_outputs: Option<BTreeMap<String, f32>>,
}

pub fn capture_frame(
    world: &PhysicsWorld,
    creature: &CreatureInstance,
    sensors: &SensorReadings,
    commands: Option<&[ActuatorCommand]>,
    controller_outputs: Option<BTreeMap<String, f32>>,
) -> FramePayload {
    let mut bodies = Vec::with_capacity(creature.body_ids.len());
    for (id, handle) in creature.body_ids.iter().zip(creature.handles.iter()) {
        let Some(body) = world.body(*handle) else { continue };
        let p = body.translation();
        let q = body.rotation();
        bodies.push(BodyPose {
            id: id.clone(),
            translation: Vec3f {
                x: p.x,
                y: p.y,
                z: p.z,
            },
            rotation: Quatf {
                x: q.i,
                y: q.j,
                z: q.k,
                w: q.w,
            },
        });
    }
    FramePayload {
        bodies,
        sensors: sensors.summary,
        commands: commands.map(|c| c.to_vec()),
        controller_outputs,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaIndices {
    pub version: usize,
    pub write_lock: usize,
}

/// Layout descriptor sent to a shared-memory reader so it can decode the
/// flat float array without further negotiation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedPoseLayout {
    pub meta_length: usize,
    pub floats_per_body: usize,
    pub body_count: usize,
    pub body_ids: Vec<String>,
    pub meta_indices: MetaIndices,
}

impl SharedPoseLayout {
    pub fn for_creature(creature: &CreatureInstance) -> Self {
        Self {
            meta_length: META_LENGTH,
            floats_per_body: FLOATS_PER_BODY,
            body_count: creature.body_ids.len(),
            body_ids: creature.body_ids.clone(),
            meta_indices: MetaIndices {
                version: META_VERSION_INDEX,
                write_lock: META_WRITE_LOCK_INDEX,
            },
        }
    }

    pub fn data_length(&self) -> usize {
        self.body_count * self.floats_per_body
    }
}

/// Double-ended pose handoff between the simulation thread and a reader.
///
/// The version counter bumps after every completed write; a reader that sees
/// the same version twice knows no new frame arrived. The write lock guards
/// against a reader snapshotting a half-written frame.
pub struct SharedPoseBuffer {
    version: AtomicU32,
    write_lock: AtomicU32,
    data: Mutex<Vec<f32>>,
}

impl SharedPoseBuffer {
    pub fn new(layout: &SharedPoseLayout) -> Self {
        Self {
            version: AtomicU32::new(0),
            write_lock: AtomicU32::new(0),
            data: Mutex::new(vec![0.0; layout.data_length()]),
        }
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Publish the creature's current poses. Returns the new version.
    pub fn write_frame(&self, world: &PhysicsWorld, creature: &CreatureInstance) -> u32 {
        while self
            .write_lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        {
            let mut data = match self.data.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (slot, handle) in creature.handles.iter().enumerate() {
                let base = slot * FLOATS_PER_BODY;
                if base + FLOATS_PER_BODY > data.len() {
                    break;
                }
                let Some(body) = world.body(*handle) else { continue };
                let p = body.translation();
                let q = body.rotation();
                data[base] = p.x;
                data[base + 1] = p.y;
                data[base + 2] = p.z;
                data[base + 3] = q.i;
                data[base + 4] = q.j;
                data[base + 5] = q.k;
                data[base + 6] = q.w;
            }
        }
        self.write_lock.store(0, Ordering::Release);
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Copy out the latest frame with the version it belongs to.
    pub fn snapshot(&self) -> (u32, Vec<f32>) {
        let data = match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (self.version.load(Ordering::Acquire), data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{stage_by_id, STAGE_DASH};
    use crate::blueprint::build_morphology_blueprint;
    use crate::genome::default_morph;
    use crate::sensors::read_sensors;

    fn spawn() -> (PhysicsWorld, CreatureInstance) {
        let mut world = PhysicsWorld::new(1.0 / 60.0);
        world.add_arena(&stage_by_id(STAGE_DASH).unwrap());
        let blueprint = build_morphology_blueprint(&default_morph()).unwrap();
        let creature = world.spawn_creature(&blueprint).unwrap();
        (world, creature)
    }

    #[test]
    fn frame_capture_lists_every_body_in_order() {
        let (world, creature) = spawn();
        let sensors = read_sensors(&world, &creature);
        let frame = capture_frame(&world, &creature, &sensors, None, None);
        let ids: Vec<&str> = frame.bodies.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["torso", "leg", "foot"]);
        assert!(frame.commands.is_none());
        let torso = &frame.bodies[0];
        assert!((torso.rotation.w - 1.0).abs() < 1e-5);
    }

    #[test]
    fn layout_matches_the_buffer_dimensions() {
        let (_, creature) = spawn();
        let layout = SharedPoseLayout::for_creature(&creature);
        assert_eq!(layout.body_count, 3);
        assert_eq!(layout.data_length(), 21);
        let buffer = SharedPoseBuffer::new(&layout);
        let (version, data) = buffer.snapshot();
        assert_eq!(version, 0);
        assert_eq!(data.len(), 21);
    }

    #[test]
    fn write_bumps_the_version_and_publishes_poses() {
        let (mut world, creature) = spawn();
        let layout = SharedPoseLayout::for_creature(&creature);
        let buffer = SharedPoseBuffer::new(&layout);
        let v1 = buffer.write_frame(&world, &creature);
        assert_eq!(v1, 1);
        world.step();
        let v2 = buffer.write_frame(&world, &creature);
        assert_eq!(v2, 2);
        let (version, data) = buffer.snapshot();
        assert_eq!(version, 2);
        let torso_y = data[1];
        let live = world.body(creature.root).unwrap().translation().y;
        assert!((torso_y - live).abs() < 1e-6);
    }
}
