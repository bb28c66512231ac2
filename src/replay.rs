use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::evolution::GenerationRecord;
use crate::genome::Individual;

pub const REPLAY_VERSION: u32 = 1;
pub const RUN_STATE_VERSION: u32 = 1;

pub const DEFAULT_CHECKPOINT_DIR: &str = "data/checkpoints";

// ---------------------------------------------------------------------------
// Replay records
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayCommand {
    /// Tolerated as missing in older captures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actuator_id: Option<String>,
    pub target_id: String,
    pub value: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFrame {
    pub t: f32,
    pub commands: Vec<ReplayCommand>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayMetadata {
    pub joints: Vec<String>,
    pub actuators: Vec<String>,
    pub timestep: f32,
    pub frame_count: usize,
    pub duration: f32,
}

/// Actuator command stream for one rollout, replayable against the same
/// morph to reproduce the motion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRecord {
    pub version: u32,
    pub metadata: ReplayMetadata,
    pub frames: Vec<ReplayFrame>,
}

pub fn encode_replay(record: &ReplayRecord) -> Result<String, EngineError> {
    serde_json::to_string(record).map_err(|err| EngineError::Runtime(err.to_string()))
}

pub fn decode_replay(text: &str) -> Result<ReplayRecord, EngineError> {
    let record: ReplayRecord =
        serde_json::from_str(text).map_err(|err| EngineError::Runtime(err.to_string()))?;
    if record.version != REPLAY_VERSION {
        return Err(EngineError::Runtime(format!(
            "unsupported replay version {} (expected {})",
            record.version, REPLAY_VERSION
        )));
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// Run state and saved models
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Running,
    Aborted,
    Completed,
}

/// Everything needed to resume or inspect a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStateRecord {
    pub version: u32,
    pub status: RunStatus,
    pub config: EngineConfig,
    pub generation: usize,
    pub total_generations: usize,
    pub history: Vec<GenerationRecord>,
    pub population: Vec<Individual>,
    pub rng_state: u32,
}

/// A named individual kept outside any run, with the config it was bred
/// under.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: String,
    pub name: String,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
    pub individual: Individual,
    pub config: EngineConfig,
}

// ---------------------------------------------------------------------------
// Checkpoint files
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointFile {
    version: u32,
    id: String,
    created_at_unix_ms: u64,
    state: RunStateRecord,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub id: String,
    pub created_at_unix_ms: u64,
    pub generation: usize,
    pub status: RunStatus,
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn sanitize_checkpoint_name(name: &str) -> String {
    let mut cleaned = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            cleaned.push(ch);
        } else if ch.is_ascii_whitespace() {
            cleaned.push('-');
        }
    }
    cleaned.trim_matches('-').to_string()
}

fn write_checkpoint_file(path: &Path, checkpoint: &CheckpointFile) -> Result<(), EngineError> {
    let payload = serde_json::to_vec_pretty(checkpoint)
        .map_err(|err| EngineError::Runtime(format!("failed serializing checkpoint: {err}")))?;
    fs::write(path, payload).map_err(|err| {
        EngineError::Runtime(format!(
            "failed writing checkpoint '{}': {err}",
            path.display()
        ))
    })
}

fn read_checkpoint_file(path: &Path) -> Result<CheckpointFile, EngineError> {
    let payload = fs::read(path).map_err(|err| {
        EngineError::Runtime(format!(
            "failed reading checkpoint '{}': {err}",
            path.display()
        ))
    })?;
    serde_json::from_slice(&payload).map_err(|err| {
        EngineError::Runtime(format!(
            "failed parsing checkpoint '{}': {err}",
            path.display()
        ))
    })
}

/// Directory-backed checkpoint storage. Each save writes an id-named file
/// and refreshes `latest.json` so a resume without an id picks up the most
/// recent state.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_location() -> Self {
        Self::new(DEFAULT_CHECKPOINT_DIR)
    }

    fn ensure_dir(&self) -> Result<(), EngineError> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            EngineError::Runtime(format!(
                "failed creating checkpoint directory '{}': {err}",
                self.dir.display()
            ))
        })
    }

    fn file_for_id(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn save(&self, state: &RunStateRecord, name: Option<&str>) -> Result<String, EngineError> {
        self.ensure_dir()?;
        let timestamp = now_unix_ms();
        let name_suffix = name
            .map(sanitize_checkpoint_name)
            .filter(|value| !value.is_empty())
            .map(|value| format!("-{value}"))
            .unwrap_or_default();
        let id = format!("ckpt-{timestamp}{name_suffix}");
        let checkpoint = CheckpointFile {
            version: RUN_STATE_VERSION,
            id: id.clone(),
            created_at_unix_ms: timestamp,
            state: state.clone(),
        };
        write_checkpoint_file(&self.file_for_id(&id), &checkpoint)?;
        write_checkpoint_file(&self.dir.join("latest.json"), &checkpoint)?;
        info!(id = %id, generation = state.generation, "checkpoint saved");
        Ok(id)
    }

    pub fn load(&self, id: Option<&str>) -> Result<(String, RunStateRecord), EngineError> {
        let path = match id {
            Some(requested) => self.file_for_id(requested),
            None => self.dir.join("latest.json"),
        };
        if !path.exists() {
            return Err(EngineError::Runtime(format!(
                "checkpoint file '{}' not found",
                path.display()
            )));
        }
        let checkpoint = read_checkpoint_file(&path)?;
        if checkpoint.version != RUN_STATE_VERSION {
            return Err(EngineError::Runtime(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }
        Ok((checkpoint.id, checkpoint.state))
    }

    pub fn list(&self) -> Result<Vec<CheckpointSummary>, EngineError> {
        self.ensure_dir()?;
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            EngineError::Runtime(format!(
                "failed listing checkpoints in '{}': {err}",
                self.dir.display()
            ))
        })?;
        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                EngineError::Runtime(format!("failed reading checkpoint entry: {err}"))
            })?;
            let path = entry.path();
            let is_json = path
                .extension()
                .and_then(|value| value.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            if !is_json {
                continue;
            }
            if path.file_name().and_then(|v| v.to_str()) == Some("latest.json") {
                continue;
            }
            if let Ok(file) = read_checkpoint_file(&path) {
                summaries.push(CheckpointSummary {
                    id: file.id,
                    created_at_unix_ms: file.created_at_unix_ms,
                    generation: file.state.generation,
                    status: file.state.status,
                });
            }
        }
        summaries.sort_by(|a, b| b.created_at_unix_ms.cmp(&a.created_at_unix_ms));
        Ok(summaries)
    }
}
