use evoarena::arena::{FLOOR_TOP_Y, GROUND_CLEARANCE_MARGIN};
use evoarena::config::{EngineConfig, FitnessConfig, MutationConfig, SelectionWeights};
use evoarena::error::CancelToken;
use evoarena::evolution::{
    run_evolution, EvalContext, Evaluation, EvolutionHooks, EvolutionOptions,
};
use evoarena::fitness::{analyze_trace, selection_score};
use evoarena::genome::{
    default_controller, default_individual, default_morph, deserialize_morph,
};
use evoarena::mutation::mutate_individual;
use evoarena::replay::{decode_replay, encode_replay};
use evoarena::rng::SimRng;
use evoarena::simulator::{run_rollout, RolloutOptions};

fn short_rollout(duration: f32) -> RolloutOptions {
    RolloutOptions {
        duration,
        ..RolloutOptions::default()
    }
}

#[test]
fn hopper_rollout_analyzes_end_to_end() {
    let outcome = run_rollout(
        &default_morph(),
        &default_controller(),
        &short_rollout(1.2),
        &CancelToken::new(),
    )
    .unwrap();
    assert!(outcome.trace.len() >= 3);
    assert_eq!(outcome.trace[0].t, 0.0);
    assert!((outcome.runtime - outcome.trace.last().unwrap().t).abs() < 1e-6);

    let breakdown = analyze_trace(
        &outcome.trace,
        outcome.disqualification.as_ref(),
        &FitnessConfig::default(),
    );
    assert!(breakdown.runtime > 0.0);
    assert!(breakdown.average_height.is_finite());
    assert!(breakdown.fitness >= 0.0);
    let score = selection_score(&breakdown, &SelectionWeights::default());
    assert!(score >= breakdown.fitness);
}

#[test]
fn rollouts_are_deterministic_for_identical_inputs() {
    let run = || {
        run_rollout(
            &default_morph(),
            &default_controller(),
            &short_rollout(0.8),
            &CancelToken::new(),
        )
        .unwrap()
    };
    let a = run();
    let b = run();
    assert_eq!(a.trace.len(), b.trace.len());
    for (sa, sb) in a.trace.iter().zip(b.trace.iter()) {
        assert_eq!(sa.t, sb.t);
        assert_eq!(sa.center_of_mass, sb.center_of_mass);
        assert_eq!(sa.root_height, sb.root_height);
    }
}

#[test]
fn genome_spawned_below_the_floor_is_lifted_clear() {
    let mut morph = default_morph();
    morph.bodies[0].pose.position = [0.0, -3.0, 0.0];
    let outcome = run_rollout(
        &morph,
        &default_controller(),
        &short_rollout(0.2),
        &CancelToken::new(),
    )
    .unwrap();
    // The first sample is taken before any physics step.
    let spawn_height = outcome.trace[0].root_height;
    assert!(
        spawn_height > FLOOR_TOP_Y + GROUND_CLEARANCE_MARGIN - 1e-4,
        "root spawned at {spawn_height}"
    );
    assert!(outcome.disqualification.is_none());
}

#[test]
fn raw_json_genome_drives_a_rollout() {
    let text = serde_json::to_string(&default_morph()).unwrap();
    let morph = deserialize_morph(&text).unwrap();
    let outcome = run_rollout(
        &morph,
        &default_controller(),
        &short_rollout(0.3),
        &CancelToken::new(),
    )
    .unwrap();
    assert!(!outcome.trace.is_empty());
}

#[test]
fn captured_replay_survives_encoding() {
    let outcome = run_rollout(
        &default_morph(),
        &default_controller(),
        &short_rollout(0.3).with_replay(),
        &CancelToken::new(),
    )
    .unwrap();
    let replay = outcome.replay.unwrap();
    let text = encode_replay(&replay).unwrap();
    let decoded = decode_replay(&text).unwrap();
    assert_eq!(decoded.metadata.frame_count, replay.metadata.frame_count);
    assert_eq!(decoded.frames.len(), replay.frames.len());
    for (a, b) in decoded.frames.iter().zip(replay.frames.iter()) {
        assert_eq!(a.commands.len(), b.commands.len());
        for (ca, cb) in a.commands.iter().zip(b.commands.iter()) {
            assert_eq!(ca.target_id, cb.target_id);
            assert!((ca.value - cb.value).abs() < 1e-6);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn evolution_runs_end_to_end_with_real_physics() {
    let config = EngineConfig {
        population_size: 4,
        generations: 2,
        elitism: 1,
        tournament_size: 2,
        seed: 42,
        ..EngineConfig::default()
    }
    .sanitized();

    let mut rng = SimRng::new(config.seed);
    let base = default_individual("seed-0");
    let mut population = vec![base.clone()];
    for slot in 1..config.population_size {
        let stream = rng.split(&format!("seed-{slot}"));
        population.push(
            mutate_individual(&base, stream, &config.mutation)
                .unwrap_or_else(|_| default_individual(&format!("seed-{slot}"))),
        );
    }

    let rollout = short_rollout(0.3);
    let fitness_config = config.fitness.clone();
    let selection = config.selection;
    let options = EvolutionOptions {
        generations: config.generations,
        elitism: config.elitism,
        tournament_size: config.tournament_size,
        mutation: config.mutation,
    };

    let mut generations_seen = 0usize;
    let outcome = {
        let mut hooks = EvolutionHooks {
            on_generation: Some(Box::new(|_event| {
                generations_seen += 1;
            })),
            on_snapshot: None,
        };
        run_evolution(
            population,
            |individual, _ctx: EvalContext| {
                let rollout = rollout.clone();
                let fitness_config = fitness_config.clone();
                async move {
                    let outcome = tokio::task::spawn_blocking(move || {
                        run_rollout(
                            &individual.morph,
                            &individual.controller,
                            &rollout,
                            &CancelToken::new(),
                        )
                    })
                    .await
                    .expect("rollout task panicked")?;
                    let breakdown = analyze_trace(
                        &outcome.trace,
                        outcome.disqualification.as_ref(),
                        &fitness_config,
                    );
                    let score = selection_score(&breakdown, &selection);
                    Ok(Evaluation {
                        fitness: breakdown.fitness,
                        selection_score: Some(score),
                        metrics: Some(breakdown),
                    })
                }
            },
            |parent, stream, mutation| mutate_individual(parent, stream, mutation),
            &mut rng,
            &options,
            None,
            &mut hooks,
            &CancelToken::new(),
        )
        .await
        .unwrap()
    };

    assert_eq!(generations_seen, 2);
    assert_eq!(outcome.history.len(), 2);
    assert_eq!(outcome.population.len(), 4);
    let best = outcome.best.unwrap();
    assert!(best.fitness >= 0.0);
    assert!(best.metrics.is_some());
    // Children carry their lineage through evaluation.
    let has_lineage = outcome
        .population
        .iter()
        .any(|individual| individual.lineage.is_some());
    assert!(has_lineage);
}

#[test]
fn mutation_chain_preserves_viability() {
    let config = MutationConfig::default();
    let mut current = default_individual("root");
    let mut rng = SimRng::new(1234);
    for step in 0..12 {
        let stream = rng.split(&format!("chain-{step}"));
        current = mutate_individual(&current, stream, &config).unwrap();
        let outcome = run_rollout(
            &current.morph,
            &current.controller,
            &short_rollout(0.1),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(!outcome.trace.is_empty(), "step {step} produced no trace");
    }
    // Twelve rounds of mutation should leave a paper trail.
    let lineage = current.lineage.unwrap();
    assert!(!lineage.operations.is_empty());
}
