use std::collections::HashMap;
use std::num::NonZeroUsize;

use rapier3d::na::{Isometry3, Translation3, UnitVector3, Vector3};
use rapier3d::prelude::*;

use crate::arena::{
    self, Stage, ARENA_HALF_EXTENTS, FLOOR_CENTER_Y, OBJECTIVE_HALF_EXTENT, OBJECTIVE_POSITION,
};
use crate::blueprint::MorphologyBlueprint;
use crate::error::EngineError;
use crate::genome::JointKind;

const SOLVER_ITERATIONS: usize = 16;
const INTERNAL_PGS_ITERATIONS: usize = 4;
const STABILIZATION_ITERATIONS: usize = 6;
const MAX_CCD_SUBSTEPS: usize = 4;

const CREATURE_MEMBERSHIP: u32 = 0b01;
const ENVIRONMENT_MEMBERSHIP: u32 = 0b10;

/// Creatures collide with the environment but never with themselves or each
/// other; per-joint contact pairs are additionally disabled on the joints.
pub fn creature_groups() -> InteractionGroups {
    InteractionGroups::new(
        Group::from_bits_truncate(CREATURE_MEMBERSHIP),
        Group::from_bits_truncate(!CREATURE_MEMBERSHIP),
    )
}

pub fn environment_groups() -> InteractionGroups {
    InteractionGroups::new(Group::from_bits_truncate(ENVIRONMENT_MEMBERSHIP), Group::ALL)
}

/// Owns the full rapier state for one rollout.
pub struct PhysicsWorld {
    pipeline: PhysicsPipeline,
    gravity: Vector3<f32>,
    pub integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    pub bodies: RigidBodySet,
    pub colliders: ColliderSet,
    pub impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
}

impl PhysicsWorld {
    pub fn new(timestep: f32) -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = timestep;
        integration_parameters.max_ccd_substeps = MAX_CCD_SUBSTEPS;
        if let Some(iterations) = NonZeroUsize::new(SOLVER_ITERATIONS) {
            integration_parameters.num_solver_iterations = iterations;
        }
        integration_parameters.num_internal_pgs_iterations = INTERNAL_PGS_ITERATIONS;
        integration_parameters.num_internal_stabilization_iterations = STABILIZATION_ITERATIONS;
        integration_parameters.normalized_allowed_linear_error = 0.001;
        integration_parameters.normalized_prediction_distance = 0.002;

        Self {
            pipeline: PhysicsPipeline::new(),
            gravity: vector![0.0, -9.81, 0.0],
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
        }
    }

    pub fn timestep(&self) -> f32 {
        self.integration_parameters.dt
    }

    pub fn step(&mut self) {
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &(),
            &(),
        );
    }

    /// Insert the static floor, the objective marker, and the stage's
    /// obstacle set.
    pub fn add_arena(&mut self, stage: &Stage) {
        let floor = self.bodies.insert(RigidBodyBuilder::fixed().build());
        let floor_collider = ColliderBuilder::cuboid(
            ARENA_HALF_EXTENTS[0],
            ARENA_HALF_EXTENTS[1],
            ARENA_HALF_EXTENTS[2],
        )
        .translation(vector![0.0, FLOOR_CENTER_Y, 0.0])
        .friction(1.0)
        .restitution(0.0)
        .collision_groups(environment_groups())
        .build();
        self.colliders
            .insert_with_parent(floor_collider, floor, &mut self.bodies);

        let objective = self.bodies.insert(RigidBodyBuilder::fixed().build());
        let objective_collider = ColliderBuilder::cuboid(
            OBJECTIVE_HALF_EXTENT,
            OBJECTIVE_HALF_EXTENT,
            OBJECTIVE_HALF_EXTENT,
        )
        .translation(Vector3::from(OBJECTIVE_POSITION))
        .collision_groups(environment_groups())
        .build();
        self.colliders
            .insert_with_parent(objective_collider, objective, &mut self.bodies);

        for obstacle in &stage.obstacles {
            let body = self.bodies.insert(RigidBodyBuilder::fixed().build());
            let collider = ColliderBuilder::cuboid(
                obstacle.half_extents[0],
                obstacle.half_extents[1],
                obstacle.half_extents[2],
            )
            .translation(Vector3::from(obstacle.position))
            .friction(1.0)
            .collision_groups(environment_groups())
            .build();
            self.colliders
                .insert_with_parent(collider, body, &mut self.bodies);
        }
    }

    /// Instantiate a resolved blueprint as rigid bodies plus impulse joints.
    pub fn spawn_creature(
        &mut self,
        blueprint: &MorphologyBlueprint,
    ) -> Result<CreatureInstance, EngineError> {
        let mut body_ids = Vec::with_capacity(blueprint.bodies.len());
        let mut handles = Vec::with_capacity(blueprint.bodies.len());
        let mut handle_by_id = HashMap::new();
        let mut half_extents = HashMap::new();

        for body in &blueprint.bodies {
            let rigid_body = RigidBodyBuilder::dynamic()
                .position(Isometry3::from_parts(
                    Translation3::from(body.position),
                    body.rotation,
                ))
                .linear_damping(body.material.linear_damping)
                .angular_damping(body.material.angular_damping)
                .ccd_enabled(true)
                .build();
            let handle = self.bodies.insert(rigid_body);
            let collider = ColliderBuilder::cuboid(
                body.half_extents[0],
                body.half_extents[1],
                body.half_extents[2],
            )
            .density(body.density)
            .friction(body.material.friction)
            .restitution(body.material.restitution)
            .collision_groups(creature_groups())
            .build();
            self.colliders
                .insert_with_parent(collider, handle, &mut self.bodies);
            body_ids.push(body.id.clone());
            handles.push(handle);
            handle_by_id.insert(body.id.clone(), handle);
            half_extents.insert(body.id.clone(), body.half_extents);
        }

        let mut joints = Vec::with_capacity(blueprint.joints.len());
        let mut joint_index_by_id = HashMap::new();
        for joint in &blueprint.joints {
            let parent = *handle_by_id.get(&joint.parent_id).ok_or_else(|| {
                EngineError::Instantiation(format!(
                    "joint '{}': parent body '{}' was not spawned",
                    joint.id, joint.parent_id
                ))
            })?;
            let child = *handle_by_id.get(&joint.child_id).ok_or_else(|| {
                EngineError::Instantiation(format!(
                    "joint '{}': child body '{}' was not spawned",
                    joint.id, joint.child_id
                ))
            })?;

            let parent_anchor = point![
                joint.parent_anchor.x,
                joint.parent_anchor.y,
                joint.parent_anchor.z
            ];
            let child_anchor = point![
                joint.child_anchor.x,
                joint.child_anchor.y,
                joint.child_anchor.z
            ];

            let generic: GenericJoint = match joint.joint_type {
                JointKind::Fixed => FixedJointBuilder::new()
                    .local_anchor1(parent_anchor)
                    .local_anchor2(child_anchor)
                    .contacts_enabled(!joint.disable_contacts)
                    .build()
                    .into(),
                JointKind::Revolute => {
                    if joint.axis.norm() < 1e-6 {
                        return Err(EngineError::Instantiation(format!(
                            "joint '{}': degenerate axis",
                            joint.id
                        )));
                    }
                    let axis = UnitVector3::new_normalize(joint.axis);
                    let mut builder = RevoluteJointBuilder::new(axis)
                        .local_anchor1(parent_anchor)
                        .local_anchor2(child_anchor)
                        .contacts_enabled(!joint.disable_contacts);
                    if let Some(limits) = joint.limits {
                        builder = builder.limits(limits);
                    }
                    builder.build().into()
                }
                JointKind::Spherical => {
                    let mut builder = SphericalJointBuilder::new()
                        .local_anchor1(parent_anchor)
                        .local_anchor2(child_anchor)
                        .contacts_enabled(!joint.disable_contacts);
                    if let Some(limits) = joint.limits {
                        // One swing/twist range shared by all three axes.
                        builder = builder
                            .limits(JointAxis::AngX, limits)
                            .limits(JointAxis::AngY, limits)
                            .limits(JointAxis::AngZ, limits);
                    }
                    builder.build().into()
                }
                JointKind::Unknown => {
                    return Err(EngineError::Instantiation(format!(
                        "joint '{}': unknown joint type",
                        joint.id
                    )));
                }
            };

            let handle = self.impulse_joints.insert(parent, child, generic, true);
            joint_index_by_id.insert(joint.id.clone(), joints.len());
            joints.push(CreatureJoint {
                id: joint.id.clone(),
                parent_id: joint.parent_id.clone(),
                child_id: joint.child_id.clone(),
                parent,
                child,
                axis: joint.axis,
                handle,
                limits: joint.limits,
            });
        }

        let root = *handle_by_id.get(&blueprint.root_id).ok_or_else(|| {
            EngineError::Instantiation(format!("root body '{}' was not spawned", blueprint.root_id))
        })?;

        Ok(CreatureInstance {
            body_ids,
            handles,
            handle_by_id,
            half_extents,
            joints,
            joint_index_by_id,
            root_id: blueprint.root_id.clone(),
            root,
        })
    }

    pub fn body(&self, handle: RigidBodyHandle) -> Option<&RigidBody> {
        self.bodies.get(handle)
    }

    pub fn body_mut(&mut self, handle: RigidBodyHandle) -> Option<&mut RigidBody> {
        self.bodies.get_mut(handle)
    }
}

/// Handle map for one spawned creature, in blueprint declaration order.
#[derive(Debug)]
pub struct CreatureInstance {
    pub body_ids: Vec<String>,
    pub handles: Vec<RigidBodyHandle>,
    pub handle_by_id: HashMap<String, RigidBodyHandle>,
    pub half_extents: HashMap<String, [f32; 3]>,
    pub joints: Vec<CreatureJoint>,
    pub joint_index_by_id: HashMap<String, usize>,
    pub root_id: String,
    pub root: RigidBodyHandle,
}

#[derive(Debug)]
pub struct CreatureJoint {
    pub id: String,
    pub parent_id: String,
    pub child_id: String,
    pub parent: RigidBodyHandle,
    pub child: RigidBodyHandle,
    pub axis: Vector3<f32>,
    pub handle: ImpulseJointHandle,
    pub limits: Option<[f32; 2]>,
}

impl CreatureInstance {
    pub fn joint_by_id(&self, id: &str) -> Option<&CreatureJoint> {
        self.joint_index_by_id.get(id).map(|&i| &self.joints[i])
    }
}
