//! Line multiplexer: runs newline-separated shell commands from a reader
//! through a queue, an MPI line worker or a thread line worker.

use crate::backend::{BackendConfig, QueueSettings, MPI_WORKER, THREAD_WORKER};
use crate::job::{Job, JobOutcome, ResourceRequest};
use crate::mpi::MpiGroup;
use crate::plan::MpiSettings;
use crate::supervisor::JobSupervisor;
use std::io::BufRead;
use std::path::PathBuf;
use tune_core::{Command, EnvPropagation, Toolkit, TuneError, TuneResult};

#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub threads: u32,
    pub max_malloc: f64,
    pub cicada_dir: Option<PathBuf>,
    pub mpi: Option<MpiSettings>,
    pub pbs: Option<QueueSettings>,
    /// Queue job name shared by every submitted line.
    pub pbs_name: String,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            threads: 1,
            max_malloc: 4.0,
            cicada_dir: None,
            mpi: None,
            pbs: None,
            pbs_name: "cicada-sh".to_string(),
        }
    }
}

impl ShellSettings {
    pub fn mpi(&self) -> Option<&MpiSettings> {
        self.mpi.as_ref().filter(|m| m.is_configured())
    }

    /// Queue first, then an MPI line worker, then a thread line worker.
    pub fn backend(&self) -> BackendConfig {
        match (&self.pbs, self.mpi()) {
            (Some(settings), _) => BackendConfig::ClusterQueue(settings.clone()),
            (None, Some(_)) => BackendConfig::DistributedPool,
            (None, None) => BackendConfig::ThreadPool {
                threads: self.threads,
            },
        }
    }

    pub fn required_programs(&self) -> &'static [&'static str] {
        match self.backend() {
            BackendConfig::ThreadPool { .. } => &[THREAD_WORKER],
            BackendConfig::DistributedPool => &[MPI_WORKER],
            _ => &[],
        }
    }
}

pub struct LineDispatcher {
    supervisor: JobSupervisor,
    name: String,
    resources: ResourceRequest,
    distributed: bool,
    submissions: Vec<String>,
}

impl LineDispatcher {
    /// Resolves the worker programs and launcher, then starts the backend.
    pub fn start(settings: &ShellSettings, env: EnvPropagation) -> TuneResult<Self> {
        if settings.threads == 0 {
            return Err(TuneError::Configuration("threads must be at least 1".to_string()));
        }
        let required = settings.required_programs();
        let toolkit = if required.is_empty() {
            None
        } else {
            Some(Toolkit::locate(settings.cicada_dir.as_deref(), required)?)
        };
        let mpi = match settings.mpi() {
            Some(m) => Some(MpiGroup::locate(
                m.dir.as_deref(),
                m.processes,
                m.host_spec(),
                m.options.clone(),
                env.clone(),
            )?),
            None => None,
        };
        let config = settings.backend();
        tracing::info!(backend = config.label(), "starting line dispatch");
        let backend = config.build(toolkit.as_ref(), mpi.as_ref(), &env, true)?;

        // Inside a queue the MPI group wraps each line; otherwise it already launched the worker.
        let distributed = settings.pbs.is_some() && mpi.is_some();
        let mut resources = ResourceRequest::new(settings.max_malloc, settings.threads);
        if let Some(group) = mpi.as_ref().filter(|_| distributed) {
            resources = resources.with_processes(group.processes());
        }
        Ok(Self::new(
            JobSupervisor::new(backend, mpi),
            settings.pbs_name.clone(),
            resources,
            distributed,
        ))
    }

    pub fn new(
        supervisor: JobSupervisor,
        name: impl Into<String>,
        resources: ResourceRequest,
        distributed: bool,
    ) -> Self {
        Self {
            supervisor,
            name: name.into(),
            resources,
            distributed,
            submissions: Vec::new(),
        }
    }

    pub fn run<R: BufRead>(&mut self, input: R) -> TuneResult<usize> {
        let mut count = 0;
        for line in input.lines() {
            let line = line.map_err(|e| TuneError::io("reading command lines", e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let job = Job::new(self.name.clone(), Command::default().word(line))
                .with_resources(self.resources);
            let outcome = if self.distributed {
                self.supervisor.submit_distributed(&job)?
            } else {
                self.supervisor.submit(&job)?
            };
            if let JobOutcome::Deferred {
                submission: Some(id),
            } = outcome
            {
                self.submissions.push(id);
            }
            count += 1;
        }
        Ok(count)
    }

    pub fn submissions(&self) -> &[String] {
        &self.submissions
    }

    pub fn finish(&mut self) -> TuneResult<JobOutcome> {
        self.supervisor.drain()
    }
}
