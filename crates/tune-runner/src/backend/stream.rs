use super::{ExecutionBackend, Launch};
use crate::job::{Job, JobOutcome};
use crate::mpi::MpiGroup;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use tune_core::{TuneError, TuneResult};

/// Feeds command lines to one persistent worker process.
///
/// The worker decides how lines are spread over its threads or ranks and in
/// which order they finish. The only completion signal is the worker's exit
/// status after the input stream is closed in [`ExecutionBackend::drain`].
pub struct LineStreamBackend {
    label: &'static str,
    child: Child,
    stdin: Option<ChildStdin>,
    queued: usize,
    finished: Option<JobOutcome>,
}

impl LineStreamBackend {
    pub fn spawn(label: &'static str, mut command: Command) -> TuneResult<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| TuneError::io(format!("spawning {} worker", label), e))?;
        let stdin = child.stdin.take();
        tracing::debug!(worker = label, pid = child.id(), "line worker started");
        Ok(Self {
            label,
            child,
            stdin,
            queued: 0,
            finished: None,
        })
    }

    pub fn threads(worker: &Path, threads: u32) -> TuneResult<Self> {
        let mut cmd = Command::new(worker);
        cmd.arg("--threads")
            .arg(threads.max(1).to_string())
            .arg("--debug");
        Self::spawn("threads", cmd)
    }

    /// `<launcher ...> mpish --debug`, started through the shell.
    pub fn distributed(group: &MpiGroup, worker: &Path) -> TuneResult<Self> {
        let line = group
            .launch_prefix()
            .word(worker.display().to_string())
            .flag("--debug")
            .render();
        tracing::info!(command = %line, "starting distributed line worker");
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(line);
        Self::spawn("mpi", cmd)
    }

    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Closes the input and waits for the worker once; later calls repeat the result.
    fn reap(&mut self) -> TuneResult<JobOutcome> {
        if let Some(done) = &self.finished {
            return Ok(done.clone());
        }
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| TuneError::io(format!("waiting for {} worker", self.label), e))?;
        let outcome = JobOutcome::from_status(status);
        tracing::debug!(worker = self.label, queued = self.queued, ?outcome, "line worker exited");
        self.finished = Some(outcome.clone());
        Ok(outcome)
    }
}

impl ExecutionBackend for LineStreamBackend {
    fn name(&self) -> &'static str {
        self.label
    }

    fn submit(&mut self, job: &Job, launch: Launch<'_>) -> TuneResult<JobOutcome> {
        if let Launch::Distributed(_) = launch {
            return Err(TuneError::Configuration(format!(
                "{} worker cannot host a distributed launch",
                self.label
            )));
        }
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            TuneError::Configuration(format!("{} worker input already closed", self.label))
        })?;
        let line = job.shell_line();
        match writeln!(stdin, "{}", line).and_then(|_| stdin.flush()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                // The worker is gone; its exit status is the verdict and this line is lost.
                let outcome = self.reap()?;
                tracing::error!(worker = self.label, ?outcome, "line worker exited early");
                return Ok(if outcome.is_failure() {
                    outcome
                } else {
                    JobOutcome::Failed { code: None }
                });
            }
            Err(e) => return Err(TuneError::io(format!("writing to {} worker", self.label), e)),
        }
        self.queued += 1;
        Ok(JobOutcome::Deferred { submission: None })
    }

    fn drain(&mut self) -> TuneResult<JobOutcome> {
        self.reap()
    }
}

impl Drop for LineStreamBackend {
    fn drop(&mut self) {
        let _ = self.reap();
    }
}
