use serde::{Deserialize, Serialize};

use crate::arena::horizontal_distance_to;
use crate::config::{FitnessConfig, SelectionWeights};
use crate::simulator::{Disqualification, TraceSample};

/// Fitness scale applied when a rollout was disqualified; partial credit
/// keeps the gradient alive instead of zeroing the whole lineage.
pub const DISQUALIFICATION_SCALE: f32 = 0.5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitnessBreakdown {
    pub displacement: f32,
    pub runtime: f32,
    pub average_speed: f32,
    pub average_height: f32,
    pub fall_fraction: f32,
    pub fall_threshold: f32,
    pub objective_start_distance: f32,
    pub objective_end_distance: f32,
    pub objective_best_distance: f32,
    pub objective_improvement: f32,
    pub objective_reward: f32,
    pub fitness: f32,
    pub disqualified: bool,
}

impl FitnessBreakdown {
    fn zero() -> Self {
        Self {
            displacement: 0.0,
            runtime: 0.0,
            average_speed: 0.0,
            average_height: 0.0,
            fall_fraction: 0.0,
            fall_threshold: 0.0,
            objective_start_distance: 0.0,
            objective_end_distance: 0.0,
            objective_best_distance: 0.0,
            objective_improvement: 0.0,
            objective_reward: 0.0,
            fitness: 0.0,
            disqualified: false,
        }
    }
}

/// Linear-interpolated quantile over a copy of `values`.
fn quantile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let clamped = p.clamp(0.0, 1.0);
    let position = clamped * (sorted.len() - 1) as f32;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = position - lower as f32;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

fn horizontal_distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dz = a[2] - b[2];
    (dx * dx + dz * dz).sqrt()
}

/// Reduce a rollout trace to its fitness breakdown.
///
/// The fall threshold adapts to the creature's own stature: a tall walker is
/// held to a higher standard than a low crawler, with `fall_height` as the
/// absolute floor.
pub fn analyze_trace(
    trace: &[TraceSample],
    disqualification: Option<&Disqualification>,
    config: &FitnessConfig,
) -> FitnessBreakdown {
    let disqualified = disqualification.is_some();
    if trace.len() < 2 {
        let mut breakdown = FitnessBreakdown::zero();
        breakdown.disqualified = disqualified;
        if let Some(sample) = trace.first() {
            let distance =
                horizontal_distance_from_vec(&sample.center_of_mass, &config.objective_position);
            breakdown.average_height = sample.root_height;
            breakdown.objective_start_distance = distance;
            breakdown.objective_end_distance = distance;
            breakdown.objective_best_distance = distance;
        }
        return breakdown;
    }

    let first = &trace[0];
    let last = &trace[trace.len() - 1];
    let runtime = last.t - first.t;

    let displacement = horizontal_distance(&last.center_of_mass, &first.center_of_mass);

    let mut speed_sum = 0.0f32;
    let mut height_time_sum = 0.0f32;
    let mut segment_time_sum = 0.0f32;
    for pair in trace.windows(2) {
        let dt = pair[1].t - pair[0].t;
        if dt <= 0.0 {
            continue;
        }
        let segment = horizontal_distance(&pair[1].center_of_mass, &pair[0].center_of_mass);
        speed_sum += segment / dt;
        height_time_sum += pair[1].root_height * dt;
        segment_time_sum += dt;
    }
    let average_speed = speed_sum / trace.len() as f32;
    let average_height = if segment_time_sum > 0.0 {
        height_time_sum / segment_time_sum
    } else {
        first.root_height
    };

    let heights: Vec<f32> = trace.iter().map(|s| s.root_height).collect();
    let fall_threshold = config
        .fall_height
        .max(quantile(&heights, config.upright_percentile) * config.fall_height_ratio);

    let mut fall_time = 0.0f32;
    for pair in trace.windows(2) {
        let dt = pair[1].t - pair[0].t;
        if dt > 0.0 && pair[1].root_height < fall_threshold {
            fall_time += dt;
        }
    }
    let fall_fraction = if segment_time_sum > 0.0 {
        (fall_time / segment_time_sum).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let objective_start_distance =
        horizontal_distance_from_vec(&first.center_of_mass, &config.objective_position);
    let objective_end_distance =
        horizontal_distance_from_vec(&last.center_of_mass, &config.objective_position);
    let objective_best_distance = trace
        .iter()
        .map(|s| horizontal_distance_from_vec(&s.center_of_mass, &config.objective_position))
        .fold(f32::INFINITY, f32::min);
    let objective_improvement = (objective_start_distance - objective_best_distance).max(0.0);
    let objective_reward =
        config.objective_weight * config.objective_reward_multiplier * objective_improvement;

    let raw = displacement
        + config.height_weight * average_height
        + config.velocity_weight * average_speed
        + objective_reward
        - config.fall_penalty * fall_fraction;
    let mut fitness = raw.max(0.0);
    if disqualified {
        fitness *= DISQUALIFICATION_SCALE;
    }

    FitnessBreakdown {
        displacement,
        runtime,
        average_speed,
        average_height,
        fall_fraction,
        fall_threshold,
        objective_start_distance,
        objective_end_distance,
        objective_best_distance,
        objective_improvement,
        objective_reward,
        fitness,
        disqualified,
    }
}

fn horizontal_distance_from_vec(position: &[f32; 3], target: &[f32; 3]) -> f32 {
    horizontal_distance_to(
        &rapier3d::na::Vector3::new(position[0], position[1], position[2]),
        target,
    )
}

/// Composite rank used by tournament selection: fitness plus weighted bonuses
/// for raw locomotion and for staying upright.
pub fn selection_score(breakdown: &FitnessBreakdown, weights: &SelectionWeights) -> f32 {
    let upright = (1.0 - breakdown.fall_fraction).max(0.0);
    let score = breakdown.fitness
        + weights.distance * breakdown.displacement
        + weights.speed * breakdown.average_speed
        + weights.upright * upright * breakdown.fitness;
    score.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::DisqualificationReason;

    fn sample(t: f32, x: f32, height: f32) -> TraceSample {
        TraceSample {
            t,
            center_of_mass: [x, height, 0.0],
            root_height: height,
            objective_distance: 0.0,
        }
    }

    fn walk_trace(x_end: f32, height: f32, steps: usize) -> Vec<TraceSample> {
        (0..=steps)
            .map(|i| {
                let f = i as f32 / steps as f32;
                sample(f, x_end * f, height)
            })
            .collect()
    }

    #[test]
    fn quantile_interpolates() {
        let values = [0.35, 0.4, 0.5, 0.76, 0.78, 0.8];
        assert!((quantile(&values, 0.0) - 0.35).abs() < 1e-6);
        assert!((quantile(&values, 1.0) - 0.8).abs() < 1e-6);
        assert!((quantile(&values, 0.6) - 0.76).abs() < 1e-6);
    }

    #[test]
    fn stationary_trace_scores_on_height_only() {
        let trace = vec![sample(0.0, 0.0, 0.8), sample(1.0, 0.0, 0.8)];
        let breakdown = analyze_trace(&trace, None, &FitnessConfig::default());
        assert_eq!(breakdown.displacement, 0.0);
        assert_eq!(breakdown.average_speed, 0.0);
        assert!((breakdown.average_height - 0.8).abs() < 1e-6);
        assert_eq!(breakdown.fall_fraction, 0.0);
        assert!(breakdown.fitness > 0.0);
    }

    #[test]
    fn fall_fraction_counts_segments_below_threshold() {
        let heights = [0.8, 0.78, 0.76, 0.5, 0.4, 0.35];
        let trace: Vec<TraceSample> = heights
            .iter()
            .enumerate()
            .map(|(i, h)| sample(i as f32 * 0.5, 0.0, *h))
            .collect();
        let breakdown = analyze_trace(&trace, None, &FitnessConfig::default());
        // Threshold adapts to the 60th-percentile height (0.76 * 0.6).
        assert!((breakdown.fall_threshold - 0.456).abs() < 1e-3);
        assert!((breakdown.fall_fraction - 0.4).abs() < 1e-6);
    }

    #[test]
    fn moving_toward_the_objective_beats_moving_away() {
        let steps = 20;
        let toward = walk_trace(9.5, 0.8, steps);
        let away = walk_trace(-9.5, 0.8, steps);
        let config = FitnessConfig::default();
        let toward_breakdown = analyze_trace(&toward, None, &config);
        let away_breakdown = analyze_trace(&away, None, &config);
        assert!((toward_breakdown.displacement - away_breakdown.displacement).abs() < 1e-4);
        assert!(toward_breakdown.objective_improvement > 0.0);
        assert_eq!(away_breakdown.objective_improvement, 0.0);
        assert!(toward_breakdown.fitness > away_breakdown.fitness);
    }

    #[test]
    fn disqualification_halves_the_fitness() {
        let trace = walk_trace(3.0, 0.8, 10);
        let config = FitnessConfig::default();
        let clean = analyze_trace(&trace, None, &config);
        let disqualification = Disqualification {
            reason: DisqualificationReason::AccelerationLimit,
            limit: 300.0,
            value: 500.0,
            timestamp: 0.5,
        };
        let penalized = analyze_trace(&trace, Some(&disqualification), &config);
        assert!(penalized.disqualified);
        assert!((penalized.fitness - clean.fitness * DISQUALIFICATION_SCALE).abs() < 1e-5);
    }

    #[test]
    fn degenerate_traces_yield_zero() {
        let config = FitnessConfig::default();
        let empty = analyze_trace(&[], None, &config);
        assert_eq!(empty.fitness, 0.0);
        let single = analyze_trace(&[sample(0.0, 1.0, 0.7)], None, &config);
        assert_eq!(single.fitness, 0.0);
        assert!((single.average_height - 0.7).abs() < 1e-6);
        assert!(single.objective_start_distance > 0.0);
    }

    #[test]
    fn fitness_never_goes_negative() {
        // All-fallen trace with no displacement: penalty dominates.
        let trace = vec![
            sample(0.0, 0.0, 0.05),
            sample(0.5, 0.0, 0.05),
            sample(1.0, 0.0, 0.05),
        ];
        let mut config = FitnessConfig::default();
        config.fall_penalty = 10.0;
        let breakdown = analyze_trace(&trace, None, &config);
        assert_eq!(breakdown.fitness, 0.0);
    }

    #[test]
    fn selection_score_rewards_upright_runs() {
        let upright = analyze_trace(&walk_trace(3.0, 0.9, 10), None, &FitnessConfig::default());
        let mut fallen = upright.clone();
        fallen.fall_fraction = 1.0;
        let weights = SelectionWeights::default();
        assert!(selection_score(&upright, &weights) > selection_score(&fallen, &weights));
    }
}
