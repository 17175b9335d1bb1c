use super::{ExecutionBackend, Launch};
use crate::job::{Job, JobOutcome};
use crate::mpi::MpiGroup;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use tune_core::{EnvPropagation, TuneError, TuneResult};

/// PBS rejects job names longer than this.
pub const PBS_NAME_LIMIT: usize = 15;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSettings {
    #[serde(default)]
    pub queue: Option<String>,
    /// Return once the job is admitted instead of when it finishes.
    #[serde(default)]
    pub non_blocking: bool,
    /// Queue identifier this submission must start after.
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
}

pub fn render_submission_script(
    job: &Job,
    settings: &QueueSettings,
    env: &EnvPropagation,
    mpi: Option<&MpiGroup>,
) -> String {
    let name: String = job.name.chars().take(PBS_NAME_LIMIT).collect();
    let mut lines = vec![
        "#!/bin/sh".to_string(),
        "#PBS -S /bin/sh".to_string(),
        format!("#PBS -N {}", name),
    ];
    if !settings.non_blocking {
        lines.push("#PBS -W block=true".to_string());
    }
    lines.push("#PBS -e localhost:/dev/null".to_string());
    lines.push("#PBS -o localhost:/dev/null".to_string());
    if let Some(after) = settings.after.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("#PBS -W depend=after:{}", after));
    }
    if let Some(before) = settings.before.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("#PBS -W depend=before:{}", before));
    }
    if let Some(queue) = settings.queue.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("#PBS -q {}", queue));
    }
    let chunks = match mpi {
        Some(_) if job.resources.processes > 0 => job.resources.processes,
        Some(group) => group.processes(),
        None => 1,
    };
    lines.push(format!("#PBS -l {}", job.resources.select_clause(chunks)));
    lines.extend(env.export_lines());
    lines.push("if test \"$PBS_O_WORKDIR\" != \"\"; then".to_string());
    lines.push("  cd $PBS_O_WORKDIR".to_string());
    lines.push("fi".to_string());

    let body = match mpi {
        Some(group) => group.wrap_queued(&job.rendered()),
        None => job.rendered(),
    };
    lines.push(format!("{}{}", body, job.stderr_suffix()));

    let mut script = lines.join("\n");
    script.push('\n');
    script
}

struct Submission {
    name: String,
    child: Child,
    stdout: Option<JoinHandle<String>>,
    /// qsub stopped reading before the whole script was written.
    truncated: bool,
}

impl Submission {
    fn wait(mut self) -> TuneResult<(JobOutcome, String)> {
        let id = self
            .stdout
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let status = self
            .child
            .wait()
            .map_err(|e| TuneError::io(format!("waiting for qsub ({})", self.name), e))?;
        let outcome = match JobOutcome::from_status(status) {
            JobOutcome::Succeeded if self.truncated => JobOutcome::Failed { code: None },
            outcome => outcome,
        };
        Ok((outcome, id.trim().to_string()))
    }
}

pub struct ClusterQueue {
    qsub: PathBuf,
    settings: QueueSettings,
    env: EnvPropagation,
    concurrent: bool,
    in_flight: Vec<Submission>,
}

impl ClusterQueue {
    pub fn new(qsub: impl Into<PathBuf>, settings: QueueSettings, env: EnvPropagation) -> Self {
        Self {
            qsub: qsub.into(),
            settings,
            env,
            concurrent: false,
            in_flight: Vec::new(),
        }
    }

    /// Keep blocking submissions running in the background until `drain`.
    pub fn with_concurrent_submissions(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn start(&self, name: &str, script: &str) -> TuneResult<Submission> {
        let mut child = Command::new(&self.qsub)
            .arg("-S")
            .arg("/bin/sh")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| TuneError::io(format!("spawning {}", self.qsub.display()), e))?;

        // qsub prints the job identifier; keep reading so it never blocks on a full pipe.
        let stdout = child.stdout.take().map(|mut out| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf);
                buf
            })
        });
        let stdin = child.stdin.take();
        let mut submission = Submission {
            name: name.to_string(),
            child,
            stdout,
            truncated: false,
        };
        if let Some(mut stdin) = stdin {
            match stdin.write_all(script.as_bytes()) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    tracing::warn!(job = %name, "qsub closed its input early");
                    submission.truncated = true;
                }
                Err(e) => {
                    drop(stdin);
                    let _ = submission.wait();
                    return Err(TuneError::io("writing submission script", e));
                }
            }
        }
        Ok(submission)
    }
}

impl ExecutionBackend for ClusterQueue {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn supports_distributed(&self) -> bool {
        true
    }

    fn submit(&mut self, job: &Job, launch: Launch<'_>) -> TuneResult<JobOutcome> {
        let mpi = match launch {
            Launch::Local => None,
            Launch::Distributed(group) => Some(group),
        };
        let script = render_submission_script(job, &self.settings, &self.env, mpi);
        let submission = self.start(&job.name, &script)?;

        if self.concurrent && !self.settings.non_blocking {
            self.in_flight.push(submission);
            return Ok(JobOutcome::Deferred { submission: None });
        }

        let (outcome, id) = submission.wait()?;
        if !id.is_empty() {
            tracing::info!(job = %job.name, queue_id = %id, "submitted");
        }
        match outcome {
            JobOutcome::Succeeded if self.settings.non_blocking => Ok(JobOutcome::Deferred {
                submission: Some(id).filter(|s| !s.is_empty()),
            }),
            other => Ok(other),
        }
    }

    fn drain(&mut self) -> TuneResult<JobOutcome> {
        let mut result = JobOutcome::Succeeded;
        for submission in self.in_flight.drain(..) {
            let name = submission.name.clone();
            let (outcome, id) = submission.wait()?;
            tracing::debug!(job = %name, queue_id = %id, ?outcome, "submission finished");
            if outcome.is_failure() && !result.is_failure() {
                result = outcome;
            }
        }
        Ok(result)
    }
}

impl Drop for ClusterQueue {
    fn drop(&mut self) {
        for submission in self.in_flight.drain(..) {
            let _ = submission.wait();
        }
    }
}
