use super::{ExecutionBackend, Launch};
use crate::job::{Job, JobOutcome};
use std::path::PathBuf;
use std::process::Command;
use tune_core::{TuneError, TuneResult};

#[derive(Debug, Clone)]
pub struct DirectBackend {
    shell: PathBuf,
}

impl DirectBackend {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }

    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn run_line(&self, line: &str) -> TuneResult<JobOutcome> {
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(line)
            .status()
            .map_err(|e| TuneError::io(format!("subprocess failed: {}", line), e))?;
        Ok(JobOutcome::from_status(status))
    }
}

impl Default for DirectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn supports_distributed(&self) -> bool {
        true
    }

    fn submit(&mut self, job: &Job, launch: Launch<'_>) -> TuneResult<JobOutcome> {
        let line = match launch {
            Launch::Local => job.shell_line(),
            Launch::Distributed(group) => {
                format!("{}{}", group.wrap(&job.rendered()), job.stderr_suffix())
            }
        };
        self.run_line(&line)
    }
}
