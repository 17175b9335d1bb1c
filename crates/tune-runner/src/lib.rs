pub mod backend;
pub mod job;
pub mod learner;
pub mod lineage;
pub mod mpi;
pub mod pipeline;
pub mod plan;
pub mod shell;
pub mod supervisor;

pub use backend::{BackendConfig, ExecutionBackend, Launch, QueueSettings};
pub use job::{Job, JobOutcome, ResourceRequest};
pub use learner::{LearnerCapabilities, LearnerChoice};
pub use lineage::{IterationArtifacts, Lineage, LineageManifest};
pub use mpi::{HostSpec, MpiGroup};
pub use pipeline::{describe, IterationPipeline, PlanSummary};
pub use plan::{RunPlan, TuningMode, PLAN_TEMPLATE};
pub use shell::{LineDispatcher, ShellSettings};
pub use supervisor::JobSupervisor;

use std::path::Path;
use tune_core::{EnvPropagation, Toolkit, TuneResult};

/// Loads and checks a plan, resolves every external program and builds the
/// pipeline. Nothing is dispatched before this returns.
pub fn prepare_pipeline(plan_path: &Path) -> TuneResult<IterationPipeline> {
    let plan = RunPlan::load(plan_path)?;
    plan.validate()?;
    plan.check_inputs()?;

    let toolkit = Toolkit::locate(
        plan.toolkit.cicada_dir.as_deref(),
        plan.mode.required_programs(),
    )?;
    let env = EnvPropagation::from_env();
    let mpi = pipeline::mpi_group(&plan, env.clone())?;
    let learners = match plan.mode {
        TuningMode::Learn => LearnerCapabilities::probe(&toolkit)?,
        TuningMode::Mert => LearnerCapabilities::default(),
    };
    let config = plan.backend.pipeline_backend();
    tracing::info!(
        mode = plan.mode.as_str(),
        prefix = plan.prefix(),
        backend = config.label(),
        mpi = mpi.is_some(),
        "prepared run"
    );
    let backend = config.build(Some(&toolkit), mpi.as_ref(), &env, false)?;
    IterationPipeline::new(plan, toolkit, JobSupervisor::new(backend, mpi), &learners)
}

pub fn describe_plan(plan_path: &Path) -> TuneResult<PlanSummary> {
    let plan = RunPlan::load(plan_path)?;
    plan.validate()?;
    Ok(describe(&plan))
}
