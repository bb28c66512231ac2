use rapier3d::na::Vector3;
use serde::{Deserialize, Serialize};

/// Fixed arena geometry. The floor is a thin slab whose top face sits at
/// `FLOOR_TOP_Y`; creatures are spawned above it after ground clearance.
pub const ARENA_HALF_EXTENTS: [f32; 3] = [12.0, 0.1, 9.0];
pub const FLOOR_TOP_Y: f32 = -0.5;
pub const FLOOR_CENTER_Y: f32 = -0.6;
pub const GROUND_CLEARANCE_MARGIN: f32 = 0.02;

pub const OBJECTIVE_HALF_EXTENT: f32 = 0.4;
pub const OBJECTIVE_POSITION: [f32; 3] = [8.0, FLOOR_TOP_Y + OBJECTIVE_HALF_EXTENT, 0.0];

pub const STAGE_DASH: &str = "dash";
pub const STAGE_OBSTACLE: &str = "obstacle";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Obstacle {
    pub position: [f32; 3],
    pub half_extents: [f32; 3],
}

/// A named obstacle set layered on top of the fixed floor and objective.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub obstacles: Vec<Obstacle>,
}

pub fn stage_ids() -> Vec<&'static str> {
    vec![STAGE_DASH, STAGE_OBSTACLE]
}

pub fn stage_by_id(id: &str) -> Option<Stage> {
    match id {
        STAGE_DASH => Some(Stage {
            id: STAGE_DASH.to_string(),
            obstacles: Vec::new(),
        }),
        STAGE_OBSTACLE => Some(Stage {
            id: STAGE_OBSTACLE.to_string(),
            obstacles: vec![Obstacle {
                position: [-4.0, FLOOR_TOP_Y + 0.25, 0.0],
                half_extents: [0.5, 0.25, 3.0],
            }],
        }),
        _ => None,
    }
}

/// Distance from a point to the objective in the ground plane.
pub fn horizontal_distance_to_objective(position: &Vector3<f32>) -> f32 {
    horizontal_distance_to(position, &OBJECTIVE_POSITION)
}

pub fn horizontal_distance_to(position: &Vector3<f32>, target: &[f32; 3]) -> f32 {
    let dx = position.x - target[0];
    let dz = position.z - target[2];
    (dx * dx + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapier3d::na as nalgebra;
    use rapier3d::na::vector;

    #[test]
    fn floor_top_matches_center_and_half_extent() {
        assert!((FLOOR_CENTER_Y + ARENA_HALF_EXTENTS[1] - FLOOR_TOP_Y).abs() < 1e-6);
    }

    #[test]
    fn known_stages_resolve() {
        assert!(stage_by_id(STAGE_DASH).unwrap().obstacles.is_empty());
        assert_eq!(stage_by_id(STAGE_OBSTACLE).unwrap().obstacles.len(), 1);
        assert!(stage_by_id("does-not-exist").is_none());
    }

    #[test]
    fn objective_distance_ignores_height() {
        let at_objective = vector![OBJECTIVE_POSITION[0], 3.0, OBJECTIVE_POSITION[2]];
        assert!(horizontal_distance_to_objective(&at_objective) < 1e-6);
        let off = vector![OBJECTIVE_POSITION[0] - 3.0, 0.0, OBJECTIVE_POSITION[2] + 4.0];
        assert!((horizontal_distance_to_objective(&off) - 5.0).abs() < 1e-5);
    }
}
