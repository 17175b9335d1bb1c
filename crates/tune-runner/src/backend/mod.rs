//! Execution backends.
//!
//! Every dispatch goes through [`ExecutionBackend::submit`]; [`ExecutionBackend::drain`]
//! is the barrier that observes work a backend accepted without finishing.
//! None of the backends can cancel or time out a job once it is submitted.

mod direct;
mod queue;
mod stream;

pub use direct::DirectBackend;
pub use queue::{render_submission_script, ClusterQueue, QueueSettings, PBS_NAME_LIMIT};
pub use stream::LineStreamBackend;

use crate::job::{Job, JobOutcome};
use crate::mpi::MpiGroup;
use tune_core::{EnvPropagation, ExecutableResolver, Toolkit, TuneError, TuneResult};

pub const THREAD_WORKER: &str = "thrsh";
pub const MPI_WORKER: &str = "mpish";

#[derive(Debug, Clone, Copy)]
pub enum Launch<'a> {
    Local,
    Distributed(&'a MpiGroup),
}

pub trait ExecutionBackend: Send {
    fn name(&self) -> &'static str;

    fn supports_distributed(&self) -> bool {
        false
    }

    fn submit(&mut self, job: &Job, launch: Launch<'_>) -> TuneResult<JobOutcome>;

    /// Waits for everything accepted so far. Backends that finish each job
    /// inside `submit` report success immediately.
    fn drain(&mut self) -> TuneResult<JobOutcome> {
        Ok(JobOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Direct,
    ThreadPool { threads: u32 },
    /// Persistent distributed line worker started through the MPI group.
    DistributedPool,
    ClusterQueue(QueueSettings),
}

impl BackendConfig {
    pub fn label(&self) -> &'static str {
        match self {
            BackendConfig::Direct => "direct",
            BackendConfig::ThreadPool { .. } => "threads",
            BackendConfig::DistributedPool => "mpi",
            BackendConfig::ClusterQueue(_) => "pbs",
        }
    }

    /// Instantiates the backend. `concurrent_submissions` lets blocking
    /// queue submissions run side by side until `drain`.
    pub fn build(
        &self,
        toolkit: Option<&Toolkit>,
        mpi: Option<&MpiGroup>,
        env: &EnvPropagation,
        concurrent_submissions: bool,
    ) -> TuneResult<Box<dyn ExecutionBackend>> {
        match self {
            BackendConfig::Direct => Ok(Box::new(DirectBackend::new())),
            BackendConfig::ThreadPool { threads } => {
                let toolkit = toolkit.ok_or_else(|| {
                    TuneError::Configuration("thread pool requires the toolkit".to_string())
                })?;
                let worker = toolkit.program(THREAD_WORKER)?;
                Ok(Box::new(LineStreamBackend::threads(worker, *threads)?))
            }
            BackendConfig::DistributedPool => {
                let toolkit = toolkit.ok_or_else(|| {
                    TuneError::Configuration("mpi pool requires the toolkit".to_string())
                })?;
                let group = mpi.ok_or_else(|| TuneError::Configuration("no mpi?".to_string()))?;
                let worker = toolkit.program(MPI_WORKER)?;
                Ok(Box::new(LineStreamBackend::distributed(group, worker)?))
            }
            BackendConfig::ClusterQueue(settings) => {
                let qsub = ExecutableResolver::new(Vec::new())
                    .find("qsub")
                    .ok_or_else(|| {
                        TuneError::Resolution("no qsub in your executable path?".to_string())
                    })?;
                Ok(Box::new(
                    ClusterQueue::new(qsub, settings.clone(), env.clone())
                        .with_concurrent_submissions(concurrent_submissions),
                ))
            }
        }
    }
}
