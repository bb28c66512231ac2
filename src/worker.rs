use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{CancelToken, EngineError};
use crate::evolution::{
    run_evolution, EvalContext, Evaluation, EvolutionHooks, EvolutionOptions, EvolutionOutcome,
    GenerationEvent, GenerationRecord,
};
use crate::fitness::{analyze_trace, selection_score};
use crate::genome::{default_individual, Individual};
use crate::mutation::mutate_individual;
use crate::rng::SimRng;
use crate::simulator::{run_rollout, RolloutOptions};

/// Inbound worker messages, tagged the way the websocket layer frames them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    Start { id: String, payload: EngineConfig },
    Abort { id: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    pub message: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl From<&EngineError> for SerializedError {
    fn from(err: &EngineError) -> Self {
        Self {
            message: err.to_string(),
            name: err.name().to_string(),
            stack: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortedPayload {
    pub generation: usize,
    pub history: Vec<GenerationRecord>,
}

/// Outbound worker messages. Every message names the run it belongs to so a
/// client can discard stragglers from a superseded run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerResponse {
    Generation {
        id: String,
        payload: GenerationEvent,
    },
    Snapshot {
        id: String,
        payload: crate::evolution::EvolutionSnapshot,
    },
    Complete {
        id: String,
        payload: EvolutionOutcome,
    },
    Aborted {
        id: String,
        payload: AbortedPayload,
    },
    Error {
        id: String,
        payload: SerializedError,
    },
}

struct ActiveRun {
    id: String,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// Seed the starting population: slot 0 is the stock hopper, the rest are
/// mutated variants so generation zero already has diversity to select from.
pub fn seed_population(rng: &mut SimRng, config: &EngineConfig) -> Vec<Individual> {
    let base = default_individual("seed-0");
    let mut population = Vec::with_capacity(config.population_size);
    population.push(base.clone());
    for slot in 1..config.population_size {
        let stream = rng.split(&format!("seed-{slot}"));
        match mutate_individual(&base, stream, &config.mutation) {
            Ok(child) => population.push(child),
            Err(err) => {
                warn!(slot, %err, "seed mutation failed, falling back to the stock genome");
                population.push(default_individual(&format!("seed-{slot}")));
            }
        }
    }
    population
}

async fn execute_run(
    run_id: String,
    config: EngineConfig,
    cancel: CancelToken,
    responses: UnboundedSender<WorkerResponse>,
) {
    info!(run = %run_id, seed = config.seed, "starting evolution run");
    let mut rng = SimRng::new(config.seed);
    let population = seed_population(&mut rng, &config);

    let rollout_options = RolloutOptions::from_simulation(&config.simulation);
    let fitness_config = config.fitness.clone();
    let selection = config.selection;
    let evolution_options = EvolutionOptions {
        generations: config.generations,
        elitism: config.elitism,
        tournament_size: config.tournament_size,
        mutation: config.mutation,
    };

    // Mirror of the stream state so an abort can report what was completed.
    let history_mirror: Arc<Mutex<Vec<GenerationRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let generation_mirror: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));

    let eval_cancel = cancel.clone();
    let evaluate = move |individual: Individual, _ctx: EvalContext| {
        let options = rollout_options.clone();
        let fitness_config = fitness_config.clone();
        let cancel = eval_cancel.clone();
        async move {
            let breakdown = tokio::task::spawn_blocking(move || {
                let outcome =
                    run_rollout(&individual.morph, &individual.controller, &options, &cancel)?;
                Ok::<_, EngineError>(analyze_trace(
                    &outcome.trace,
                    outcome.disqualification.as_ref(),
                    &fitness_config,
                ))
            })
            .await
            .map_err(|err| EngineError::Runtime(err.to_string()))??;
            let score = selection_score(&breakdown, &selection);
            Ok(Evaluation {
                fitness: breakdown.fitness,
                selection_score: Some(score),
                metrics: Some(breakdown),
            })
        }
    };

    let generation_sender = responses.clone();
    let snapshot_sender = responses.clone();
    let hook_history = history_mirror.clone();
    let hook_generation = generation_mirror.clone();
    let generation_id = run_id.clone();
    let snapshot_id = run_id.clone();
    let mut hooks = EvolutionHooks {
        on_generation: Some(Box::new(move |event: &GenerationEvent| {
            if let Ok(mut history) = hook_history.lock() {
                history.push(event.record.clone());
            }
            let _ = generation_sender.send(WorkerResponse::Generation {
                id: generation_id.clone(),
                payload: event.clone(),
            });
        })),
        on_snapshot: Some(Box::new(move |snapshot| {
            if let Ok(mut generation) = hook_generation.lock() {
                *generation = snapshot.generation;
            }
            let _ = snapshot_sender.send(WorkerResponse::Snapshot {
                id: snapshot_id.clone(),
                payload: snapshot.clone(),
            });
        })),
    };

    let result = run_evolution(
        population,
        evaluate,
        |parent, stream, mutation| mutate_individual(parent, stream, mutation),
        &mut rng,
        &evolution_options,
        None,
        &mut hooks,
        &cancel,
    )
    .await;
    drop(hooks);

    match result {
        Ok(outcome) => {
            info!(run = %run_id, generations = outcome.history.len(), "run complete");
            let _ = responses.send(WorkerResponse::Complete {
                id: run_id,
                payload: outcome,
            });
        }
        Err(err) if err.is_cancelled() => {
            let history = history_mirror.lock().map(|h| h.clone()).unwrap_or_default();
            let generation = generation_mirror.lock().map(|g| *g).unwrap_or(0);
            info!(run = %run_id, generation, "run aborted");
            let _ = responses.send(WorkerResponse::Aborted {
                id: run_id,
                payload: AbortedPayload {
                    generation,
                    history,
                },
            });
        }
        Err(err) => {
            warn!(run = %run_id, %err, "run failed");
            let _ = responses.send(WorkerResponse::Error {
                id: run_id,
                payload: SerializedError::from(&err),
            });
        }
    }
}

/// Serve the worker protocol over a request/response channel pair. One run
/// at a time; a second start while busy is answered with an error message
/// for the new id and the active run is left untouched.
pub async fn run_worker(
    mut requests: UnboundedReceiver<WorkerRequest>,
    responses: UnboundedSender<WorkerResponse>,
) {
    let mut active: Option<ActiveRun> = None;
    while let Some(request) = requests.recv().await {
        match request {
            WorkerRequest::Start { id, payload } => {
                let busy = active
                    .as_ref()
                    .map(|run| !run.handle.is_finished())
                    .unwrap_or(false);
                if busy {
                    let _ = responses.send(WorkerResponse::Error {
                        id,
                        payload: SerializedError {
                            message: "a run is already in progress".to_string(),
                            name: "RuntimeError".to_string(),
                            stack: None,
                        },
                    });
                    continue;
                }
                let cancel = CancelToken::new();
                let handle = tokio::spawn(execute_run(
                    id.clone(),
                    payload.sanitized(),
                    cancel.clone(),
                    responses.clone(),
                ));
                active = Some(ActiveRun { id, cancel, handle });
            }
            WorkerRequest::Abort { id } => {
                if let Some(run) = &active {
                    if run.id == id {
                        run.cancel.cancel();
                    }
                }
            }
        }
    }
    // Request channel closed: the client is gone, stop any active run.
    if let Some(run) = active.take() {
        run.cancel.cancel();
        let _ = run.handle.await;
    }
}
