use std::path::{Path, PathBuf};
use tune_core::{quote, Command};

/// Resource hints attached to a job. Memory is in gigabytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceRequest {
    pub memory_gb: f64,
    pub threads: u32,
    /// Number of distributed processes; 0 when the job is not distributed.
    pub processes: u32,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            memory_gb: 0.0,
            threads: 1,
            processes: 0,
        }
    }
}

impl ResourceRequest {
    pub fn new(memory_gb: f64, threads: u32) -> Self {
        Self {
            memory_gb: memory_gb.max(0.0),
            threads: threads.max(1),
            processes: 0,
        }
    }

    pub fn with_processes(mut self, processes: u32) -> Self {
        self.processes = processes;
        self
    }

    /// Batch-queue memory clause (`mem=8gb`, `mem=500mb`, `mem=20kb`) or
    /// `None` when the request is below one kilobyte.
    pub fn memory_clause(&self) -> Option<String> {
        let m = self.memory_gb;
        if m >= 1.0 {
            Some(format!("mem={}gb", m.trunc() as i64))
        } else if m >= 0.001 {
            Some(format!("mem={}mb", (m * 1000.0).trunc() as i64))
        } else if m >= 0.000001 {
            Some(format!("mem={}kb", (m * 1000.0 * 1000.0).trunc() as i64))
        } else {
            None
        }
    }

    pub fn select_clause(&self, chunks: u32) -> String {
        let mut clause = format!(
            "select={}:ncpus={}:mpiprocs=1",
            chunks.max(1),
            self.threads.max(1)
        );
        if let Some(mem) = self.memory_clause() {
            clause.push(':');
            clause.push_str(&mem);
        }
        clause
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub command: Command,
    pub resources: ResourceRequest,
    pub logfile: Option<PathBuf>,
}

impl Job {
    pub fn new(name: impl Into<String>, command: Command) -> Self {
        Self {
            name: name.into(),
            command,
            resources: ResourceRequest::default(),
            logfile: None,
        }
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_logfile(mut self, logfile: impl AsRef<Path>) -> Self {
        self.logfile = Some(logfile.as_ref().to_path_buf());
        self
    }

    pub fn rendered(&self) -> String {
        self.command.render()
    }

    pub fn stderr_suffix(&self) -> String {
        match &self.logfile {
            Some(log) => format!(" 2> {}", quote(&log.display().to_string())),
            None => String::new(),
        }
    }

    pub fn shell_line(&self) -> String {
        format!("{}{}", self.rendered(), self.stderr_suffix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Accepted but not yet finished; the terminal state is only observable
    /// at drain (multiplexers) or through the queue (non-blocking submission).
    Deferred { submission: Option<String> },
    Failed { code: Option<i32> },
}

impl JobOutcome {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if status.success() {
            JobOutcome::Succeeded
        } else {
            JobOutcome::Failed {
                code: status.code(),
            }
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobOutcome::Failed { .. })
    }
}
