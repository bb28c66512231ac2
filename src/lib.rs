//! Headless evolution engine for articulated virtual creatures.
//!
//! A creature is a pair of genomes: a morphology (a tree of cuboid bodies
//! linked by joints) and a controller (a small recurrent network of sensors,
//! oscillators, neurons and actuators). The simulator instantiates the pair
//! in a rapier world, rolls it out under its controller, and the analyzer
//! scores the resulting trajectory. The evolution loop breeds populations of
//! such pairs with tournament selection and structural mutation, emitting
//! streamable progress events and resumable snapshots along the way.

pub mod actuation;
pub mod arena;
pub mod blueprint;
pub mod brain;
pub mod config;
pub mod error;
pub mod evolution;
pub mod fitness;
pub mod genome;
pub mod mutation;
pub mod physics;
pub mod render;
pub mod replay;
pub mod rng;
pub mod sensors;
pub mod simulator;
pub mod worker;

pub use config::EngineConfig;
pub use error::{CancelToken, EngineError};
pub use evolution::{run_evolution, EvolutionOutcome};
pub use fitness::{analyze_trace, selection_score, FitnessBreakdown};
pub use genome::{default_controller, default_morph, Individual};
pub use rng::SimRng;
pub use simulator::{run_rollout, RolloutOptions, RolloutOutcome};
pub use worker::{run_worker, WorkerRequest, WorkerResponse};
