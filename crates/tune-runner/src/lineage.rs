use crate::plan::{RunPlan, TuningMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tune_core::{TuneError, TuneResult};

pub const LINEAGE_SCHEMA: &str = "lineage_v1";

/// Artifact paths of one iteration, named `{prefix}.{iteration}.{suffix}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationArtifacts {
    pub iteration: u32,
    /// Weights the config stage consumed.
    pub weights_input: PathBuf,
    pub weights: PathBuf,
    pub weights_learn: PathBuf,
    pub kbest: PathBuf,
    pub oracle: PathBuf,
    pub config: PathBuf,
    pub eval: PathBuf,
    /// False for iterations recorded from a previous run on resume.
    pub executed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub weights_sha256: Option<String>,
}

impl IterationArtifacts {
    pub fn planned(plan: &RunPlan, iteration: u32, weights_input: PathBuf) -> Self {
        Self {
            iteration,
            weights_input,
            weights: plan.artifact(iteration, "weights"),
            weights_learn: plan.artifact(iteration, "weights.learn"),
            kbest: plan.artifact(iteration, "kbest"),
            oracle: plan.artifact(iteration, "kbest.oracle"),
            config: plan.artifact(iteration, "config"),
            eval: plan.artifact(iteration, "eval"),
            executed: false,
            completed_at: None,
            weights_sha256: None,
        }
    }

    pub fn log_for(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".log");
        PathBuf::from(name)
    }
}

/// Append-only record of every iteration's artifacts; the only cross-iteration state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub initial_weights: PathBuf,
    pub iterations: Vec<IterationArtifacts>,
}

impl Lineage {
    pub fn new(initial_weights: PathBuf) -> Self {
        Self {
            initial_weights,
            iterations: Vec::new(),
        }
    }

    pub fn push(&mut self, artifacts: IterationArtifacts) {
        self.iterations.push(artifacts);
    }

    pub fn last(&self) -> Option<&IterationArtifacts> {
        self.iterations.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut IterationArtifacts> {
        self.iterations.last_mut()
    }

    pub fn get(&self, iteration: u32) -> Option<&IterationArtifacts> {
        self.iterations.iter().find(|a| a.iteration == iteration)
    }

    pub fn next_weights_input(&self) -> PathBuf {
        self.last()
            .map(|a| a.weights.clone())
            .unwrap_or_else(|| self.initial_weights.clone())
    }

    pub fn kbests(&self) -> Vec<PathBuf> {
        self.iterations.iter().map(|a| a.kbest.clone()).collect()
    }

    pub fn weights(&self) -> Vec<PathBuf> {
        self.iterations.iter().map(|a| a.weights.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageManifest {
    pub schema_version: String,
    pub mode: TuningMode,
    pub prefix: String,
    pub updated_at: DateTime<Utc>,
    pub lineage: Lineage,
}

impl LineageManifest {
    pub fn new(mode: TuningMode, prefix: &str, lineage: &Lineage) -> Self {
        Self {
            schema_version: LINEAGE_SCHEMA.to_string(),
            mode,
            prefix: prefix.to_string(),
            updated_at: Utc::now(),
            lineage: lineage.clone(),
        }
    }

    pub fn load(path: &Path) -> TuneResult<Self> {
        let bytes =
            fs::read(path).map_err(|e| TuneError::io(format!("reading {}", path.display()), e))?;
        let manifest: LineageManifest = serde_json::from_slice(&bytes)?;
        if manifest.schema_version != LINEAGE_SCHEMA {
            return Err(TuneError::Configuration(format!(
                "unsupported lineage schema_version: {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    pub fn write(&self, path: &Path) -> TuneResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_write_bytes(path, &bytes)
    }
}

pub fn sha256_file(path: &Path) -> TuneResult<String> {
    let bytes =
        fs::read(path).map_err(|e| TuneError::io(format!("hashing {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> TuneResult<()> {
    let ctx = |what: &str| format!("{} {}", what, path.display());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| TuneError::io(ctx("creating parent of"), e))?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp).map_err(|e| TuneError::io(ctx("staging"), e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| TuneError::io(ctx("staging"), e))?;
    fs::rename(&tmp, path).map_err(|e| TuneError::io(ctx("replacing"), e))?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
