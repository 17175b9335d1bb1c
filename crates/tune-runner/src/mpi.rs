//! Distributed launch wrapper.
//!
//! An [`MpiGroup`] never runs anything on its own: it prefixes an inner
//! command with the launcher invocation. The same prefix is used for direct
//! launches, inside batch submission scripts, and to start the persistent
//! distributed line worker.

use std::path::{Path, PathBuf};
use tune_core::{Command, EnvPropagation, ExecutableResolver, FlagValue, TuneError, TuneResult};

pub const LAUNCHERS: [&str; 2] = ["openmpirun", "mpirun"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSpec {
    Any,
    List(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct MpiGroup {
    launcher: PathBuf,
    processes: u32,
    hosts: HostSpec,
    options: String,
    env: EnvPropagation,
}

impl MpiGroup {
    pub fn new(
        launcher: impl Into<PathBuf>,
        processes: u32,
        hosts: HostSpec,
        options: impl Into<String>,
        env: EnvPropagation,
    ) -> Self {
        Self {
            launcher: launcher.into(),
            processes,
            hosts,
            options: options.into(),
            env,
        }
    }

    /// Finds the launcher under `mpi_dir` (its `bin` first) or on `PATH`,
    /// and canonicalizes the host file.
    pub fn locate(
        mpi_dir: Option<&Path>,
        processes: u32,
        hosts: HostSpec,
        options: impl Into<String>,
        env: EnvPropagation,
    ) -> TuneResult<Self> {
        let mut dirs = Vec::new();
        if let Some(dir) = mpi_dir {
            let dir = dir
                .canonicalize()
                .map_err(|_| TuneError::Resolution(format!("{} does not exist", dir.display())))?;
            dirs.push(dir.join("bin"));
            dirs.push(dir);
        }
        let hosts = match hosts {
            HostSpec::File(file) => HostSpec::File(file.canonicalize().map_err(|_| {
                TuneError::Resolution(format!("{} does not exist", file.display()))
            })?),
            other => other,
        };
        let launcher = ExecutableResolver::new(dirs).require_any(&LAUNCHERS)?;
        Ok(Self::new(launcher, processes, hosts, options, env))
    }

    pub fn processes(&self) -> u32 {
        self.processes
    }

    pub fn launcher(&self) -> &Path {
        &self.launcher
    }

    pub fn launch_prefix(&self) -> Command {
        let mut cmd = Command::new(&self.launcher);
        if self.processes > 0 {
            cmd = cmd.int("--np", i64::from(self.processes));
        }
        cmd = match &self.hosts {
            HostSpec::Any => cmd,
            HostSpec::List(hosts) => cmd.text("--host", hosts.clone()),
            HostSpec::File(file) => cmd.path("--hostfile", file),
        };
        self.with_env_and_options(cmd)
    }

    /// Prefix used inside a batch submission, where the scheduler has
    /// already placed the processes.
    pub fn queue_prefix(&self) -> Command {
        self.with_env_and_options(Command::new(&self.launcher))
    }

    fn with_env_and_options(&self, mut cmd: Command) -> Command {
        for name in self.env.names() {
            cmd = cmd.flag_value("-x", FlagValue::Text(name.to_string()));
        }
        cmd.word(self.options.clone())
    }

    pub fn wrap(&self, inner: &str) -> String {
        self.launch_prefix().word(inner).render()
    }

    pub fn wrap_queued(&self, inner: &str) -> String {
        self.queue_prefix().word(inner).render()
    }
}
