use crate::backend::{ExecutionBackend, Launch};
use crate::job::{Job, JobOutcome};
use crate::mpi::MpiGroup;
use std::io::{self, Write};
use tune_core::{TuneError, TuneResult};

/// Submits jobs through the configured backend, echoing each command line
/// before it runs and turning failed outcomes into [`TuneError::JobFailure`].
pub struct JobSupervisor {
    backend: Box<dyn ExecutionBackend>,
    mpi: Option<MpiGroup>,
    echo: Box<dyn Write + Send>,
    dispatched: usize,
}

impl JobSupervisor {
    pub fn new(backend: Box<dyn ExecutionBackend>, mpi: Option<MpiGroup>) -> Self {
        Self {
            backend,
            mpi,
            echo: Box::new(io::stderr()),
            dispatched: 0,
        }
    }

    pub fn with_echo(mut self, echo: Box<dyn Write + Send>) -> Self {
        self.echo = echo;
        self
    }

    pub fn has_mpi(&self) -> bool {
        self.mpi.is_some()
    }

    pub fn mpi(&self) -> Option<&MpiGroup> {
        self.mpi.as_ref()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn submit(&mut self, job: &Job) -> TuneResult<JobOutcome> {
        self.dispatch(job, false)
    }

    /// Submits through the MPI group; fails before spawning anything when no
    /// group is configured or the backend cannot host one.
    pub fn submit_distributed(&mut self, job: &Job) -> TuneResult<JobOutcome> {
        self.dispatch(job, true)
    }

    fn dispatch(&mut self, job: &Job, distributed: bool) -> TuneResult<JobOutcome> {
        let launch = if distributed {
            let group = self
                .mpi
                .as_ref()
                .ok_or_else(|| TuneError::Configuration("no mpi?".to_string()))?;
            if !self.backend.supports_distributed() {
                return Err(TuneError::Configuration(format!(
                    "backend '{}' cannot launch '{}' through mpi",
                    self.backend.name(),
                    job.name
                )));
            }
            Launch::Distributed(group)
        } else {
            Launch::Local
        };

        let line = job.shell_line();
        writeln!(self.echo, "{}", line)
            .and_then(|_| self.echo.flush())
            .map_err(|e| TuneError::io("echoing command", e))?;
        tracing::debug!(
            job = %job.name,
            backend = self.backend.name(),
            distributed,
            "dispatching"
        );

        self.dispatched += 1;
        match self.backend.submit(job, launch)? {
            JobOutcome::Failed { code } => {
                tracing::error!(job = %job.name, ?code, "job failed");
                Err(TuneError::JobFailure {
                    name: job.name.clone(),
                    code,
                })
            }
            outcome => Ok(outcome),
        }
    }

    /// Waits for deferred work; a failure here is attributed to the backend.
    pub fn drain(&mut self) -> TuneResult<JobOutcome> {
        match self.backend.drain()? {
            JobOutcome::Failed { code } => Err(TuneError::JobFailure {
                name: self.backend.name().to_string(),
                code,
            }),
            outcome => Ok(outcome),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{RecordingBackend, SharedBuf};
    use super::*;
    use crate::backend::DirectBackend;
    use crate::mpi::HostSpec;
    use tune_core::{Command, EnvPropagation};

    fn group() -> MpiGroup {
        MpiGroup::new("mpirun", 4, HostSpec::Any, "", EnvPropagation::none())
    }

    #[test]
    fn echoes_command_and_logfile_before_dispatch() {
        let echo = SharedBuf::default();
        let backend = RecordingBackend::default();
        let mut supervisor =
            JobSupervisor::new(Box::new(backend.clone()), None).with_echo(Box::new(echo.clone()));
        let job = Job::new("oracle", Command::new("cicada_oracle_kbest").flag("--debug"))
            .with_logfile("o.log");
        assert_eq!(supervisor.submit(&job).expect("submit"), JobOutcome::Succeeded);
        assert_eq!(echo.contents(), "cicada_oracle_kbest --debug 2> \"o.log\"\n");
        assert_eq!(backend.names(), vec!["oracle"]);
        assert_eq!(supervisor.dispatched(), 1);
    }

    #[test]
    fn distributed_without_group_fails_before_dispatch() {
        let backend = RecordingBackend::default();
        let mut supervisor = JobSupervisor::new(Box::new(backend.clone()), None)
            .with_echo(Box::new(io::sink()));
        let job = Job::new("learn", Command::new("cicada_learn_kbest_mpi"));
        let err = supervisor.submit_distributed(&job).expect_err("no mpi");
        assert!(matches!(err, TuneError::Configuration(_)));
        assert!(backend.recorded().is_empty());
        assert_eq!(supervisor.dispatched(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn line_worker_cannot_host_mpi() {
        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c").arg("cat > /dev/null");
        let worker = crate::backend::LineStreamBackend::spawn("threads", cmd).expect("worker");
        let mut supervisor =
            JobSupervisor::new(Box::new(worker), Some(group())).with_echo(Box::new(io::sink()));
        let err = supervisor
            .submit_distributed(&Job::new("oracle", Command::new("x")))
            .expect_err("unsupported");
        assert!(matches!(err, TuneError::Configuration(_)));
        assert_eq!(supervisor.drain().expect("drain"), JobOutcome::Succeeded);
    }

    #[test]
    fn failed_outcome_becomes_job_failure() {
        let backend = RecordingBackend::failing_on("moses", 9);
        let mut supervisor = JobSupervisor::new(Box::new(backend), Some(group()))
            .with_echo(Box::new(io::sink()));
        let err = supervisor
            .submit_distributed(&Job::new("moses", Command::new("moses")))
            .expect_err("fails");
        match err {
            TuneError::JobFailure { name, code } => {
                assert_eq!(name, "moses");
                assert_eq!(code, Some(9));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn direct_backend_failure_propagates_exit_code() {
        let mut supervisor = JobSupervisor::new(Box::new(DirectBackend::new()), None)
            .with_echo(Box::new(io::sink()));
        let err = supervisor
            .submit(&Job::new("evaluate", Command::new("exit").word("5")))
            .expect_err("non-zero exit");
        assert_eq!(err.exit_code(), 5);
    }
}
