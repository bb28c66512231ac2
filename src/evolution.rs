use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::MutationConfig;
use crate::error::{CancelToken, EngineError};
use crate::fitness::FitnessBreakdown;
use crate::genome::Individual;
use crate::rng::SimRng;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub fitness: f32,
    /// Composite weighted score. Only tournament selection looks at it;
    /// records and sorting always use `fitness`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<FitnessBreakdown>,
}

#[derive(Clone, Debug)]
pub struct EvaluatedIndividual {
    pub individual: Individual,
    pub evaluation: Evaluation,
}

/// Context handed to the evaluation callback: which slot is being scored and
/// the deterministic stream dedicated to it.
pub struct EvalContext {
    pub generation: usize,
    pub index: usize,
    pub rng: SimRng,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    pub generation: usize,
    pub best_fitness: f32,
    pub mean_fitness: f32,
    pub best_individual: Individual,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_metrics: Option<FitnessBreakdown>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndividualSummary {
    pub id: String,
    pub fitness: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<String>,
}

/// Per-generation stream event: the record plus a ranked roster.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationEvent {
    pub record: GenerationRecord,
    pub individuals: Vec<IndividualSummary>,
}

/// Resumable state emitted before and after each generation's work.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionSnapshot {
    pub generation: usize,
    pub population: Vec<Individual>,
    pub rng_state: u32,
    pub history: Vec<GenerationRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BestIndividual {
    pub individual: Individual,
    pub fitness: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<FitnessBreakdown>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionOutcome {
    pub history: Vec<GenerationRecord>,
    pub population: Vec<Individual>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<BestIndividual>,
    pub rng_state: u32,
}

#[derive(Clone, Debug)]
pub struct EvolutionOptions {
    pub generations: usize,
    pub elitism: usize,
    pub tournament_size: usize,
    pub mutation: MutationConfig,
}

#[derive(Clone, Debug, Default)]
pub struct ResumeState {
    pub start_generation: usize,
    pub history: Vec<GenerationRecord>,
}

type GenerationHook<'a> = Box<dyn FnMut(&GenerationEvent) + Send + 'a>;
type SnapshotHook<'a> = Box<dyn FnMut(&EvolutionSnapshot) + Send + 'a>;

#[derive(Default)]
pub struct EvolutionHooks<'a> {
    pub on_generation: Option<GenerationHook<'a>>,
    pub on_snapshot: Option<SnapshotHook<'a>>,
}

impl<'a> EvolutionHooks<'a> {
    fn emit_generation(&mut self, event: &GenerationEvent) {
        if let Some(hook) = self.on_generation.as_mut() {
            hook(event);
        }
    }

    fn emit_snapshot(&mut self, snapshot: &EvolutionSnapshot) {
        if let Some(hook) = self.on_snapshot.as_mut() {
            hook(snapshot);
        }
    }
}

fn selection_rank(evaluation: &Evaluation) -> f32 {
    evaluation.selection_score.unwrap_or(evaluation.fitness)
}

/// Pick a parent by tournament: sample with replacement, keep the strictly
/// best by composite selection score (plain fitness when none was attached).
/// Ties go to the earliest sample, which preserves rank order.
pub fn tournament_select<'a>(
    evaluated: &'a [EvaluatedIndividual],
    rng: &mut SimRng,
    tournament_size: usize,
) -> &'a EvaluatedIndividual {
    let k = tournament_size.max(1).min(evaluated.len());
    let mut winner = &evaluated[rng.int(evaluated.len())];
    for _ in 1..k {
        let challenger = &evaluated[rng.int(evaluated.len())];
        if selection_rank(&challenger.evaluation) > selection_rank(&winner.evaluation) {
            winner = challenger;
        }
    }
    winner
}

fn sort_by_fitness(evaluated: &mut [EvaluatedIndividual]) {
    // Stable descending sort; NaN sinks to the back.
    evaluated.sort_by(|a, b| {
        b.evaluation
            .fitness
            .partial_cmp(&a.evaluation.fitness)
            .unwrap_or_else(|| {
                if a.evaluation.fitness.is_nan() && !b.evaluation.fitness.is_nan() {
                    std::cmp::Ordering::Greater
                } else if !a.evaluation.fitness.is_nan() && b.evaluation.fitness.is_nan() {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
    });
}

fn best_from_history(history: &[GenerationRecord]) -> Option<BestIndividual> {
    history
        .iter()
        .max_by(|a, b| {
            a.best_fitness
                .partial_cmp(&b.best_fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|record| BestIndividual {
            individual: record.best_individual.clone(),
            fitness: record.best_fitness,
            metrics: record.best_metrics.clone(),
        })
}

/// Drive the full evolutionary loop.
///
/// Evaluation and mutation are injected so callers choose the execution
/// strategy; each slot receives a stream split from the run RNG by a stable
/// tag, which makes results independent of evaluation scheduling.
#[allow(clippy::too_many_arguments)]
pub async fn run_evolution<E, Fut, M>(
    initial_population: Vec<Individual>,
    mut evaluate: E,
    mut mutate: M,
    rng: &mut SimRng,
    options: &EvolutionOptions,
    resume: Option<ResumeState>,
    hooks: &mut EvolutionHooks<'_>,
    cancel: &CancelToken,
) -> Result<EvolutionOutcome, EngineError>
where
    E: FnMut(Individual, EvalContext) -> Fut,
    Fut: Future<Output = Result<Evaluation, EngineError>>,
    M: FnMut(&Individual, SimRng, &MutationConfig) -> Result<Individual, EngineError>,
{
    if initial_population.is_empty() {
        return Err(EngineError::Runtime("population is empty".to_string()));
    }

    let resume = resume.unwrap_or_default();
    let start_generation = resume.start_generation;
    let mut history = resume.history;
    let mut best = best_from_history(&history);
    let mut population = initial_population;
    let population_size = population.len();
    let elitism = options.elitism.min(population_size);

    for generation in start_generation..options.generations {
        cancel.check()?;
        hooks.emit_snapshot(&EvolutionSnapshot {
            generation,
            population: population.clone(),
            rng_state: rng.state(),
            history: history.clone(),
        });

        let mut evaluated = Vec::with_capacity(population_size);
        for (index, individual) in std::mem::take(&mut population).into_iter().enumerate() {
            cancel.check()?;
            let context = EvalContext {
                generation,
                index,
                rng: rng.split(&format!("{generation}-{index}")),
            };
            let evaluation = evaluate(individual.clone(), context).await?;
            evaluated.push(EvaluatedIndividual {
                individual,
                evaluation,
            });
        }
        sort_by_fitness(&mut evaluated);

        let best_of_generation = &evaluated[0];
        let mean_fitness = evaluated
            .iter()
            .map(|e| e.evaluation.fitness)
            .filter(|f| f.is_finite())
            .sum::<f32>()
            / evaluated.len() as f32;
        let record = GenerationRecord {
            generation,
            best_fitness: best_of_generation.evaluation.fitness,
            mean_fitness,
            best_individual: best_of_generation.individual.clone(),
            best_metrics: best_of_generation.evaluation.metrics.clone(),
        };
        info!(
            generation,
            best = record.best_fitness,
            mean = record.mean_fitness,
            "generation complete"
        );
        history.push(record.clone());
        let improved = best
            .as_ref()
            .map(|b| record.best_fitness > b.fitness)
            .unwrap_or(true);
        if improved {
            best = Some(BestIndividual {
                individual: record.best_individual.clone(),
                fitness: record.best_fitness,
                metrics: record.best_metrics.clone(),
            });
        }

        let individuals = evaluated
            .iter()
            .map(|e| IndividualSummary {
                id: e.individual.id.clone(),
                fitness: e.evaluation.fitness,
                parent_id: e.individual.lineage.as_ref().map(|l| l.parent_id.clone()),
                operations: e
                    .individual
                    .lineage
                    .as_ref()
                    .map(|l| l.operations.clone())
                    .unwrap_or_default(),
            })
            .collect();
        hooks.emit_generation(&GenerationEvent {
            record,
            individuals,
        });

        cancel.check()?;
        let mut next = Vec::with_capacity(population_size);
        for elite in evaluated.iter().take(elitism) {
            next.push(elite.individual.clone());
        }
        for slot in elitism..population_size {
            let parent = tournament_select(&evaluated, rng, options.tournament_size);
            let child_rng = rng.split(&format!("mut-{generation}-{slot}"));
            let child = mutate(&parent.individual, child_rng, &options.mutation)?;
            next.push(child);
        }
        population = next;
        hooks.emit_snapshot(&EvolutionSnapshot {
            generation: generation + 1,
            population: population.clone(),
            rng_state: rng.state(),
            history: history.clone(),
        });
    }

    Ok(EvolutionOutcome {
        history,
        population,
        best,
        rng_state: rng.state(),
    })
}
