//! Learner discovery.
//!
//! The threaded and distributed learners advertise their algorithms as
//! `--learn-<name>` options in `--help`; the pipeline picks whichever variant
//! supports the requested algorithm.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::{Command, Stdio};
use tune_core::{Toolkit, TuneError, TuneResult};

pub const THREADED_LEARNER: &str = "cicada_learn_kbest";
pub const DISTRIBUTED_LEARNER: &str = "cicada_learn_kbest_mpi";

pub fn parse_learn_algorithms(help: &str) -> BTreeSet<String> {
    help.split_whitespace()
        .filter_map(|token| token.strip_prefix("--learn-"))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn probe_help(program: &Path) -> TuneResult<String> {
    let output = Command::new(program)
        .arg("--help")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| TuneError::io(format!("probing {}", program.display()), e))?;
    if !output.status.success() {
        return Err(TuneError::Resolution(format!(
            "{} --help exited with {}",
            program.display(),
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnerChoice {
    Threaded,
    Distributed,
}

impl LearnerChoice {
    pub fn program(&self) -> &'static str {
        match self {
            LearnerChoice::Threaded => THREADED_LEARNER,
            LearnerChoice::Distributed => DISTRIBUTED_LEARNER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearnerCapabilities {
    pub threaded: BTreeSet<String>,
    pub distributed: BTreeSet<String>,
}

impl LearnerCapabilities {
    pub fn probe(toolkit: &Toolkit) -> TuneResult<Self> {
        let threaded = parse_learn_algorithms(&probe_help(toolkit.program(THREADED_LEARNER)?)?);
        let distributed =
            parse_learn_algorithms(&probe_help(toolkit.program(DISTRIBUTED_LEARNER)?)?);
        tracing::debug!(?threaded, ?distributed, "learner capabilities");
        Ok(Self {
            threaded,
            distributed,
        })
    }

    /// Prefers the distributed learner when an MPI group is available.
    pub fn select(&self, algorithm: &str, mpi: bool) -> TuneResult<LearnerChoice> {
        if mpi && self.distributed.contains(algorithm) {
            return Ok(LearnerChoice::Distributed);
        }
        if self.threaded.contains(algorithm) {
            return Ok(LearnerChoice::Threaded);
        }
        Err(TuneError::Configuration(format!(
            "{} is not supported by {} or {}",
            algorithm, THREADED_LEARNER, DISTRIBUTED_LEARNER
        )))
    }
}
