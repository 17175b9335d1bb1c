//! The iteration loop.
//!
//! Each iteration runs its stages strictly in order through the supervisor:
//! config, decode, evaluate, then either oracle + learn (with optional
//! interpolation or postprocessing) or a single MERT stage. Iteration `i`
//! always reads the weights written by iteration `i - 1`.

use crate::job::{Job, ResourceRequest};
use crate::learner::{LearnerCapabilities, LearnerChoice};
use crate::lineage::{sha256_file, IterationArtifacts, Lineage, LineageManifest};
use crate::mpi::MpiGroup;
use crate::plan::{RunPlan, TuningMode};
use crate::supervisor::JobSupervisor;
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tune_core::{format_g, Command, Toolkit, TuneError, TuneResult};

const FILTER_CONFIG: &str = "cicada_filter_config_moses";
const FILTER_KBEST: &str = "cicada_filter_kbest_moses";
const FILTER_WEIGHTS: &str = "cicada_filter_weights";
const EVAL: &str = "cicada_eval";

pub fn initial_weights_path(plan: &RunPlan) -> PathBuf {
    plan.inputs
        .weights
        .clone()
        .unwrap_or_else(|| plan.artifact(0, "weights"))
}

pub fn manifest_path(plan: &RunPlan) -> PathBuf {
    plan.output
        .root_dir
        .join(format!("{}.lineage.json", plan.prefix()))
}

fn scaled(path: &Path, scale: f64) -> String {
    format!("{}:scale={}", path.display(), format_g(scale, 6))
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub mode: TuningMode,
    pub prefix: String,
    pub first: u32,
    pub last: u32,
    pub backend: &'static str,
    pub mpi_processes: Option<u32>,
    pub manifest: PathBuf,
    pub lineage: Lineage,
}

pub fn describe(plan: &RunPlan) -> PlanSummary {
    let mut lineage = Lineage::new(initial_weights_path(plan));
    for i in 1..=plan.last() {
        let mut artifacts = IterationArtifacts::planned(plan, i, lineage.next_weights_input());
        artifacts.executed = i >= plan.first();
        lineage.push(artifacts);
    }
    PlanSummary {
        mode: plan.mode,
        prefix: plan.prefix().to_string(),
        first: plan.first(),
        last: plan.last(),
        backend: plan.backend.pipeline_backend().label(),
        mpi_processes: plan.backend.mpi().map(|m| m.processes),
        manifest: manifest_path(plan),
        lineage,
    }
}

pub struct IterationPipeline {
    plan: RunPlan,
    toolkit: Toolkit,
    supervisor: JobSupervisor,
    learner: Option<LearnerChoice>,
    lineage: Lineage,
}

impl IterationPipeline {
    /// Validates the plan and picks the learner before anything is dispatched.
    pub fn new(
        plan: RunPlan,
        toolkit: Toolkit,
        supervisor: JobSupervisor,
        learners: &LearnerCapabilities,
    ) -> TuneResult<Self> {
        plan.validate()?;
        for name in plan.mode.required_programs() {
            toolkit.program(name)?;
        }
        let learner = match plan.mode {
            TuningMode::Learn => {
                Some(learners.select(&plan.learn.algorithm, supervisor.has_mpi())?)
            }
            TuningMode::Mert => None,
        };
        let lineage = Lineage::new(initial_weights_path(&plan));
        Ok(Self {
            plan,
            toolkit,
            supervisor,
            learner,
            lineage,
        })
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    pub fn learner(&self) -> Option<LearnerChoice> {
        self.learner
    }

    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    pub fn supervisor(&self) -> &JobSupervisor {
        &self.supervisor
    }

    /// Runs iterations `first..=last`; the first failing job aborts the run.
    pub fn run(&mut self) -> TuneResult<&Lineage> {
        let root = &self.plan.output.root_dir;
        if !root.as_os_str().is_empty() {
            fs::create_dir_all(root)
                .map_err(|e| TuneError::io(format!("creating {}", root.display()), e))?;
        }
        self.prepare_initial_weights()?;

        let first = self.plan.first();
        for i in 1..first {
            let skipped = IterationArtifacts::planned(&self.plan, i, self.lineage.next_weights_input());
            self.lineage.push(skipped);
        }
        for i in first..=self.plan.last() {
            tracing::info!(iteration = i, "iteration");
            self.run_iteration(i)?;
            LineageManifest::new(self.plan.mode, self.plan.prefix(), &self.lineage)
                .write(&manifest_path(&self.plan))?;
        }
        self.supervisor.drain()?;
        Ok(&self.lineage)
    }

    fn prepare_initial_weights(&mut self) -> TuneResult<()> {
        if self.plan.inputs.weights.is_some() {
            return Ok(());
        }
        let target = self.lineage.initial_weights.clone();
        if self.plan.inputs.weights_default {
            let cmd = Command::new(self.toolkit.program(FILTER_CONFIG)?)
                .path("--input", &self.plan.inputs.config)
                .path("--output", &target);
            return self.dispatch(0, Job::new("config", cmd), false, &target);
        }
        fs::File::create(&target)
            .map(|_| ())
            .map_err(|e| TuneError::io(format!("creating {}", target.display()), e))
    }

    fn run_iteration(&mut self, i: u32) -> TuneResult<()> {
        let previous = self.lineage.last().map(|a| a.weights.clone());
        let artifacts = IterationArtifacts::planned(&self.plan, i, self.lineage.next_weights_input());
        self.lineage.push(artifacts.clone());

        let job = self.config_job(&artifacts)?;
        self.dispatch(i, job, false, &artifacts.config)?;
        let job = self.decode_job(&artifacts)?;
        self.dispatch(i, job, false, &artifacts.kbest)?;
        let job = self.eval_job(&artifacts)?;
        self.dispatch(i, job, false, &artifacts.eval)?;

        match self.plan.mode {
            TuningMode::Learn => {
                let distributed = self.supervisor.has_mpi();
                let job = self.oracle_job(&artifacts, distributed)?;
                self.dispatch(i, job, distributed, &artifacts.oracle)?;

                let finalize = self.finalize_job(&artifacts, previous.as_deref())?;
                let learner = self.learner.unwrap_or(LearnerChoice::Threaded);
                let job = self.learn_job(&artifacts, previous.as_deref(), learner, finalize.is_some())?;
                let distributed = learner == LearnerChoice::Distributed;
                let output = if finalize.is_some() {
                    &artifacts.weights_learn
                } else {
                    &artifacts.weights
                };
                self.dispatch(i, job, distributed, output)?;
                if let Some(job) = finalize {
                    self.dispatch(i, job, false, &artifacts.weights)?;
                }
            }
            TuningMode::Mert => {
                let distributed = self.supervisor.has_mpi();
                let job = self.mert_job(&artifacts, distributed)?;
                self.dispatch(i, job, distributed, &artifacts.weights)?;
            }
        }

        let weights_sha256 = if artifacts.weights.is_file() {
            Some(sha256_file(&artifacts.weights)?)
        } else {
            None
        };
        if let Some(done) = self.lineage.last_mut() {
            done.executed = true;
            done.completed_at = Some(Utc::now());
            done.weights_sha256 = weights_sha256;
        }
        Ok(())
    }

    fn dispatch(&mut self, iteration: u32, job: Job, distributed: bool, output: &Path) -> TuneResult<()> {
        tracing::info!(
            iteration,
            stage = %job.name,
            output = %output.display(),
            "stage"
        );
        if distributed {
            self.supervisor.submit_distributed(&job)?;
        } else {
            self.supervisor.submit(&job)?;
        }
        Ok(())
    }

    fn heavy(&self, distributed: bool) -> ResourceRequest {
        let resources = ResourceRequest::new(self.plan.backend.max_malloc, self.plan.backend.threads);
        match self.supervisor.mpi().filter(|_| distributed) {
            Some(group) => resources.with_processes(group.processes()),
            None => resources,
        }
    }

    fn config_job(&self, a: &IterationArtifacts) -> TuneResult<Job> {
        let mut cmd = Command::new(self.toolkit.program(FILTER_CONFIG)?).path("--weights", &a.weights_input);
        if let Some(bias) = self.plan.decoder.bias_features.as_deref().filter(|b| !b.is_empty()) {
            cmd = cmd
                .text("--bias-features", bias)
                .float("--bias-weight", self.plan.decoder.bias_weight);
        }
        let cmd = cmd
            .path("--input", &self.plan.inputs.config)
            .path("--output", &a.config);
        Ok(Job::new("config", cmd))
    }

    fn decode_job(&self, a: &IterationArtifacts) -> TuneResult<Job> {
        let decoder = &self.plan.decoder;
        let kbest = if decoder.kbest_distinct {
            format!("- {} distinct", decoder.kbest)
        } else {
            format!("- {}", decoder.kbest)
        };
        let mut cmd = Command::new("(")
            .word(self.plan.inputs.moses.display().to_string())
            .path("-input-file", &self.plan.inputs.srcset)
            .path("-config", &a.config)
            .word(self.plan.inputs.options.clone())
            .text("-n-best-list", kbest)
            .int("-threads", i64::from(self.plan.backend.threads))
            .pipe()
            .word(self.toolkit.program(FILTER_KBEST)?.display().to_string())
            .path("--output", &a.kbest)
            .flag("--directory");
        if let Some(bias) = decoder.bias_features.as_deref().filter(|b| !b.is_empty()) {
            cmd = cmd.text("--erase-features", bias);
        }
        Ok(Job::new("moses", cmd.word(")"))
            .with_resources(self.heavy(false))
            .with_logfile(IterationArtifacts::log_for(&a.kbest)))
    }

    fn eval_job(&self, a: &IterationArtifacts) -> TuneResult<Job> {
        let cmd = Command::new(self.toolkit.program(EVAL)?)
            .path("--refset", &self.plan.inputs.refset)
            .path("--tstset", &a.kbest)
            .path("--output", &a.eval)
            .text("--scorer", self.plan.scorer.clone());
        Ok(Job::new("evaluate", cmd))
    }

    fn oracle_job(&self, a: &IterationArtifacts, distributed: bool) -> TuneResult<Job> {
        let program = if distributed {
            "cicada_oracle_kbest_mpi"
        } else {
            "cicada_oracle_kbest"
        };
        let mut cmd = Command::new(self.toolkit.program(program)?).path("--refset", &self.plan.inputs.refset);
        cmd = if self.plan.learn.merge {
            cmd.paths("--tstset", &self.lineage.kbests())
        } else {
            cmd.path("--tstset", &a.kbest)
        };
        cmd = cmd
            .path("--output", &a.oracle)
            .text("--scorer", self.plan.scorer.clone())
            .flag("--directory");
        if !distributed {
            cmd = cmd.int("--threads", i64::from(self.plan.backend.threads));
        }
        Ok(Job::new("oracle", cmd.flag("--debug"))
            .with_resources(self.heavy(distributed))
            .with_logfile(IterationArtifacts::log_for(&a.oracle)))
    }

    fn learn_job(
        &self,
        a: &IterationArtifacts,
        previous: Option<&Path>,
        learner: LearnerChoice,
        finalized: bool,
    ) -> TuneResult<Job> {
        let learn = &self.plan.learn;
        let mut cmd = Command::new(self.toolkit.program(learner.program())?);
        cmd = if learn.merge {
            cmd.paths("--input", &self.lineage.kbests())
        } else {
            cmd.path("--input", &a.kbest)
        };
        cmd = cmd
            .path("--oracle", &a.oracle)
            .path("--refset", &self.plan.inputs.refset)
            .text("--scorer", self.plan.scorer.clone());
        if learn.merge {
            cmd = cmd.flag("--unite");
        }
        cmd = cmd.path(
            "--output",
            if finalized { &a.weights_learn } else { &a.weights },
        );
        if let Some(prev) = previous {
            cmd = cmd.path("--weights", prev);
        }
        cmd = cmd
            .flag(format!("--learn-{}", learn.algorithm))
            .word(learn.options.clone());
        for (flag, value) in learn.regularize.active() {
            cmd = cmd.float(flag, value);
        }
        let distributed = learner == LearnerChoice::Distributed;
        if !distributed {
            cmd = cmd.int("--threads", i64::from(self.plan.backend.threads));
        }
        Ok(Job::new("learn", cmd.int("--debug", 2))
            .with_resources(self.heavy(distributed))
            .with_logfile(IterationArtifacts::log_for(&a.weights)))
    }

    /// Interpolation and/or postprocessing turning the learner output into
    /// the iteration's weights; `None` when the learner writes them directly.
    fn finalize_job(&self, a: &IterationArtifacts, previous: Option<&Path>) -> TuneResult<Option<Job>> {
        let blend = self
            .plan
            .learn
            .interpolation()
            .and_then(|alpha| previous.map(|prev| (prev, alpha)));
        let job = match (blend, self.plan.learn.postprocess()) {
            (Some((prev, alpha)), Some(post)) => {
                let cmd = Command::new(self.toolkit.program(FILTER_WEIGHTS)?)
                    .word(scaled(prev, 1.0 - alpha))
                    .word(scaled(&a.weights_learn, alpha))
                    .pipe()
                    .word(post)
                    .redirect(&a.weights);
                Some(Job::new("interpolate", cmd))
            }
            (None, Some(post)) => {
                let cmd = Command::new("cat")
                    .quoted(&a.weights_learn)
                    .pipe()
                    .word(post)
                    .redirect(&a.weights);
                Some(Job::new("postprocess", cmd))
            }
            (Some((prev, alpha)), None) => {
                let cmd = Command::new(self.toolkit.program(FILTER_WEIGHTS)?)
                    .path("--output", &a.weights)
                    .word(scaled(prev, 1.0 - alpha))
                    .word(scaled(&a.weights_learn, alpha));
                Some(Job::new("interpolate", cmd))
            }
            (None, None) => None,
        };
        Ok(job)
    }

    fn mert_job(&self, a: &IterationArtifacts, distributed: bool) -> TuneResult<Job> {
        let mert = &self.plan.mert;
        let program = if distributed {
            "cicada_mert_kbest_mpi"
        } else {
            "cicada_mert_kbest"
        };
        let weights = self.lineage.weights();
        let history = &weights[..weights.len().saturating_sub(1)];

        let mut cmd = Command::new(self.toolkit.program(program)?).paths("--tstset", &self.lineage.kbests());
        if !history.is_empty() {
            cmd = cmd.paths("--feature-weights", history);
        }
        cmd = cmd
            .path("--refset", &self.plan.inputs.refset)
            .path("--scorer", &self.plan.scorer)
            .path("--output", &a.weights)
            .int("--samples-directions", mert.directions)
            .int("--samples-restarts", mert.restarts)
            .float("--value-lower", mert.value_lower)
            .float("--value-upper", mert.value_upper);
        if let Some(lower) = &mert.bound_lower {
            cmd = cmd.path("--bound-lower", lower);
        }
        if let Some(upper) = &mert.bound_upper {
            cmd = cmd.path("--bound-upper", upper);
        }
        if mert.iterative {
            cmd = cmd.flag("--iterative");
        }
        cmd = cmd
            .flag("--normalize-l1")
            .flag("--initial-average")
            .word(mert.options.clone());
        if !distributed {
            cmd = cmd.int("--threads", i64::from(self.plan.backend.threads));
        }
        Ok(Job::new("mert", cmd.int("--debug", 2))
            .with_resources(self.heavy(distributed))
            .with_logfile(IterationArtifacts::log_for(&a.weights)))
    }
}

pub fn mpi_group(plan: &RunPlan, env: tune_core::EnvPropagation) -> TuneResult<Option<MpiGroup>> {
    match plan.backend.mpi() {
        Some(mpi) => Ok(Some(MpiGroup::locate(
            mpi.dir.as_deref(),
            mpi.processes,
            mpi.host_spec(),
            mpi.options.clone(),
            env,
        )?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpi::HostSpec;
    use crate::supervisor::testing::RecordingBackend;
    use std::io;
    use tune_core::EnvPropagation;

    struct Fixture {
        root: PathBuf,
    }

    impl Fixture {
        fn new(tag: &str) -> Self {
            let root = std::env::temp_dir().join(format!(
                "tune_pipeline_{}_{}_{}",
                tag,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            Self { root }
        }

        fn plan(&self, first: u32, last: u32, extra: &str) -> RunPlan {
            let raw = format!(
                "output: {{ root_dir: '{}' }}\n\
                 iterations: {{ first: {}, last: {} }}\n\
                 inputs: {{ srcset: dev.src, refset: dev.ref, moses: /opt/moses, config: moses.ini }}\n\
                 {}",
                self.root.display(),
                first,
                last,
                extra
            );
            RunPlan::from_yaml(&raw).expect("plan")
        }

        fn path(&self, name: &str) -> String {
            self.root.join(name).display().to_string()
        }

        fn q(&self, name: &str) -> String {
            format!("\"{}\"", self.path(name))
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    fn toolkit(mode: TuningMode) -> Toolkit {
        Toolkit::from_programs(
            mode.required_programs()
                .iter()
                .map(|n| (*n, PathBuf::from(format!("/tk/{}", n)))),
        )
    }

    fn caps() -> LearnerCapabilities {
        LearnerCapabilities {
            threaded: ["xbleu".to_string()].into_iter().collect(),
            distributed: ["xbleu".to_string()].into_iter().collect(),
        }
    }

    fn pipeline(plan: RunPlan, backend: &RecordingBackend, mpi: Option<MpiGroup>) -> TuneResult<IterationPipeline> {
        let supervisor = JobSupervisor::new(Box::new(backend.clone()), mpi).with_echo(Box::new(io::sink()));
        let mode = plan.mode;
        IterationPipeline::new(plan, toolkit(mode), supervisor, &caps())
    }

    fn line<'a>(recorded: &'a [(String, bool, String)], name: &str, nth: usize) -> &'a str {
        recorded
            .iter()
            .filter(|(n, _, _)| n == name)
            .nth(nth)
            .map(|(_, _, l)| l.as_str())
            .unwrap_or_else(|| panic!("no {} #{}", name, nth))
    }

    #[test]
    fn three_iterations_chain_weights_without_accumulation() {
        let fx = Fixture::new("chain");
        let backend = RecordingBackend::default();
        let mut pipe = pipeline(fx.plan(1, 3, ""), &backend, None).expect("pipeline");
        let lineage = pipe.run().expect("run").clone();

        let stages = ["config", "moses", "evaluate", "oracle", "learn"];
        let expected: Vec<String> = (0..3).flat_map(|_| stages.iter().map(|s| s.to_string())).collect();
        assert_eq!(backend.names(), expected);

        assert_eq!(lineage.iterations.len(), 3);
        assert_eq!(lineage.iterations[0].weights_input, fx.root.join("learn.0.weights"));
        for pair in lineage.iterations.windows(2) {
            assert_eq!(pair[1].weights_input, pair[0].weights);
        }
        assert!(lineage.iterations.iter().all(|a| a.executed && a.completed_at.is_some()));
        assert_eq!(fs::read_to_string(fx.root.join("learn.0.weights")).expect("placeholder"), "");

        let recorded = backend.recorded();
        let config2 = line(&recorded, "config", 1);
        assert!(config2.contains(&format!("--weights {}", fx.q("learn.1.weights"))));

        let learn2 = line(&recorded, "learn", 1);
        assert_eq!(
            learn2,
            format!(
                "/tk/cicada_learn_kbest --input {} --oracle {} --refset \"dev.ref\" \
                 --scorer bleu:order=4,exact=true --output {} --weights {} --learn-xbleu \
                 --threads 1 --debug 2 2> {}",
                fx.q("learn.2.kbest"),
                fx.q("learn.2.kbest.oracle"),
                fx.q("learn.2.weights"),
                fx.q("learn.1.weights"),
                fx.q("learn.2.weights.log"),
            )
        );
        assert!(!line(&recorded, "learn", 0).contains("--weights"));
        assert!(!line(&recorded, "oracle", 2).contains(&fx.path("learn.1.kbest")));

        let manifest = LineageManifest::load(&fx.root.join("learn.lineage.json")).expect("manifest");
        assert_eq!(manifest.lineage, lineage);
    }

    #[test]
    fn decode_and_eval_command_lines() {
        let fx = Fixture::new("decode");
        let backend = RecordingBackend::default();
        let raw = format!(
            "output: {{ root_dir: '{}' }}\niterations: {{ first: 1, last: 1 }}\n\
             inputs: {{ srcset: dev.src, refset: dev.ref, moses: /opt/moses, config: moses.ini, options: '-beam-threshold 0' }}\n\
             decoder: {{ kbest: 50, kbest_distinct: true, bias_features: Bias }}\nbackend: {{ threads: 4 }}\n",
            fx.root.display()
        );
        let plan = RunPlan::from_yaml(&raw).expect("plan");
        pipeline(plan, &backend, None).expect("pipeline").run().expect("run");
        let recorded = backend.recorded();

        assert_eq!(
            line(&recorded, "config", 0),
            format!(
                "/tk/cicada_filter_config_moses --weights {} --bias-features Bias --bias-weight -1 \
                 --input \"moses.ini\" --output {}",
                fx.q("learn.0.weights"),
                fx.q("learn.1.config")
            )
        );
        assert_eq!(
            line(&recorded, "moses", 0),
            format!(
                "( /opt/moses -input-file \"dev.src\" -config {} -beam-threshold 0 \
                 -n-best-list - 50 distinct -threads 4 | /tk/cicada_filter_kbest_moses \
                 --output {} --directory --erase-features Bias ) 2> {}",
                fx.q("learn.1.config"),
                fx.q("learn.1.kbest"),
                fx.q("learn.1.kbest.log")
            )
        );
        assert_eq!(
            line(&recorded, "evaluate", 0),
            format!(
                "/tk/cicada_eval --refset \"dev.ref\" --tstset {} --output {} --scorer bleu:order=4,exact=true",
                fx.q("learn.1.kbest"),
                fx.q("learn.1.eval")
            )
        );
    }

    #[test]
    fn merge_accumulates_kbests_and_unites() {
        let fx = Fixture::new("merge");
        let backend = RecordingBackend::default();
        pipeline(fx.plan(1, 3, "learn: { merge: true }\n"), &backend, None)
            .expect("pipeline")
            .run()
            .expect("run");
        let recorded = backend.recorded();
        let all = format!(
            "{} {} {}",
            fx.q("learn.1.kbest"),
            fx.q("learn.2.kbest"),
            fx.q("learn.3.kbest")
        );
        assert!(line(&recorded, "oracle", 2).contains(&format!("--tstset {} --output", all)));
        let learn3 = line(&recorded, "learn", 2);
        assert!(learn3.contains(&format!("--input {} --oracle {} ", all, fx.q("learn.3.kbest.oracle"))));
        assert!(learn3.contains(" --unite "));
    }

    #[test]
    fn interpolation_blends_with_previous_weights() {
        let fx = Fixture::new("interp");
        let backend = RecordingBackend::default();
        pipeline(
            fx.plan(1, 2, "learn: { interpolate: 0.5 }\n"),
            &backend,
            None,
        )
        .expect("pipeline")
        .run()
        .expect("run");
        let recorded = backend.recorded();

        // Nothing to blend with in the first iteration.
        assert!(line(&recorded, "learn", 0).contains(&format!("--output {}", fx.q("learn.1.weights"))));
        assert!(line(&recorded, "learn", 1).contains(&format!("--output {}", fx.q("learn.2.weights.learn"))));
        assert_eq!(backend.names().iter().filter(|n| *n == "interpolate").count(), 1);
        assert_eq!(
            line(&recorded, "interpolate", 0),
            format!(
                "/tk/cicada_filter_weights --output {} {}:scale=0.5 {}:scale=0.5",
                fx.q("learn.2.weights"),
                fx.path("learn.1.weights"),
                fx.path("learn.2.weights.learn")
            )
        );
    }

    #[test]
    fn postprocess_filters_learner_output() {
        let fx = Fixture::new("post");
        let backend = RecordingBackend::default();
        pipeline(
            fx.plan(1, 1, "learn: { postprocess: 'sort -u' }\n"),
            &backend,
            None,
        )
        .expect("pipeline")
        .run()
        .expect("run");
        assert_eq!(
            backend.names().last().map(String::as_str),
            Some("postprocess")
        );
        assert_eq!(
            line(&backend.recorded(), "postprocess", 0),
            format!(
                "cat {} | sort -u > {}",
                fx.q("learn.1.weights.learn"),
                fx.q("learn.1.weights")
            )
        );
    }

    #[test]
    fn interpolation_then_postprocess_pipes_the_blend() {
        let fx = Fixture::new("both");
        let backend = RecordingBackend::default();
        pipeline(
            fx.plan(1, 2, "learn: { interpolate: 0.25, postprocess: clip }\n"),
            &backend,
            None,
        )
        .expect("pipeline")
        .run()
        .expect("run");
        let recorded = backend.recorded();
        assert_eq!(line(&recorded, "postprocess", 0), format!(
            "cat {} | clip > {}",
            fx.q("learn.1.weights.learn"),
            fx.q("learn.1.weights")
        ));
        assert_eq!(
            line(&recorded, "interpolate", 0),
            format!(
                "/tk/cicada_filter_weights {}:scale=0.75 {}:scale=0.25 | clip > {}",
                fx.path("learn.1.weights"),
                fx.path("learn.2.weights.learn"),
                fx.q("learn.2.weights")
            )
        );
    }

    #[test]
    fn failure_stops_everything_after_the_failing_stage() {
        let fx = Fixture::new("fail");
        let backend = RecordingBackend::failing_on("evaluate", 3);
        let err = pipeline(fx.plan(1, 3, ""), &backend, None)
            .expect("pipeline")
            .run()
            .expect_err("evaluate fails");
        assert_eq!(backend.names(), vec!["config", "moses", "evaluate"]);
        assert_eq!(err.exit_code(), 3);
        assert!(!fx.root.join("learn.lineage.json").exists());
    }

    #[test]
    fn resume_chains_from_the_previous_run() {
        let fx = Fixture::new("resume");
        let backend = RecordingBackend::default();
        let mut pipe = pipeline(fx.plan(3, 3, ""), &backend, None)
            .expect("pipeline");
        let lineage = pipe.run().expect("run").clone();
        assert_eq!(lineage.iterations.len(), 3);
        assert!(!lineage.iterations[0].executed && !lineage.iterations[1].executed);
        assert_eq!(lineage.iterations[2].weights_input, fx.root.join("learn.2.weights"));
        let recorded = backend.recorded();
        assert_eq!(recorded.len(), 5);
        assert!(line(&recorded, "learn", 0).contains(&format!("--weights {}", fx.q("learn.2.weights"))));
    }

    #[test]
    fn mert_mode_passes_history() {
        let fx = Fixture::new("mert");
        let backend = RecordingBackend::default();
        pipeline(
            fx.plan(1, 2, "mode: mert\nmert: { iterative: true }\n"),
            &backend,
            None,
        )
        .expect("pipeline")
        .run()
        .expect("run");
        assert!(!backend.names().iter().any(|n| n == "oracle" || n == "learn"));
        assert_eq!(
            line(&backend.recorded(), "mert", 1),
            format!(
                "/tk/cicada_mert_kbest --tstset {} {} --feature-weights {} --refset \"dev.ref\" \
                 --scorer \"bleu:order=4,exact=true\" --output {} --samples-directions 8 \
                 --samples-restarts 2 --value-lower -1 --value-upper 1 --iterative --normalize-l1 \
                 --initial-average --threads 1 --debug 2 2> {}",
                fx.q("mert.1.kbest"),
                fx.q("mert.2.kbest"),
                fx.q("mert.1.weights"),
                fx.q("mert.2.weights"),
                fx.q("mert.2.weights.log")
            )
        );
    }

    #[test]
    fn mpi_group_distributes_oracle_and_learn() {
        let fx = Fixture::new("mpi");
        let backend = RecordingBackend::default();
        let group = MpiGroup::new("mpirun", 8, HostSpec::Any, "", EnvPropagation::none());
        let mut pipe = pipeline(fx.plan(1, 1, ""), &backend, Some(group))
            .expect("pipeline");
        assert_eq!(pipe.learner(), Some(LearnerChoice::Distributed));
        pipe.run().expect("run");
        let distributed: Vec<(String, bool)> = backend
            .recorded()
            .into_iter()
            .map(|(n, d, _)| (n, d))
            .collect();
        assert_eq!(
            distributed,
            vec![
                ("config".to_string(), false),
                ("moses".to_string(), false),
                ("evaluate".to_string(), false),
                ("oracle".to_string(), true),
                ("learn".to_string(), true),
            ]
        );
        let recorded = backend.recorded();
        assert!(line(&recorded, "oracle", 0).starts_with("/tk/cicada_oracle_kbest_mpi "));
        assert!(!line(&recorded, "learn", 0).contains("--threads"));
    }

    #[test]
    fn default_weights_come_from_the_decoder_config() {
        let fx = Fixture::new("default");
        let backend = RecordingBackend::default();
        let plan = RunPlan::from_yaml(&format!(
            "output: {{ root_dir: '{}' }}\niterations: {{ first: 1, last: 1 }}\n\
             inputs: {{ srcset: a, refset: b, moses: m, config: moses.ini, weights_default: true }}\n",
            fx.root.display()
        ))
        .expect("plan");
        pipeline(plan, &backend, None).expect("pipeline").run().expect("run");
        assert_eq!(
            line(&backend.recorded(), "config", 0),
            format!(
                "/tk/cicada_filter_config_moses --input \"moses.ini\" --output {}",
                fx.q("learn.0.weights")
            )
        );
        assert_eq!(backend.names().len(), 6);
    }

    #[test]
    fn unsupported_algorithm_fails_before_dispatch() {
        let fx = Fixture::new("alg");
        let backend = RecordingBackend::default();
        let result = pipeline(fx.plan(1, 3, "learn: { algorithm: pegasos }\n"), &backend, None);
        assert!(matches!(result, Err(TuneError::Configuration(_))));
        assert!(backend.recorded().is_empty());
    }

    #[test]
    fn describe_lists_every_iteration() {
        let fx = Fixture::new("describe");
        let summary = describe(&fx.plan(2, 3, ""));
        assert_eq!(summary.backend, "direct");
        assert_eq!(summary.lineage.iterations.len(), 3);
        assert!(!summary.lineage.iterations[0].executed);
        assert_eq!(summary.lineage.iterations[2].weights_input, fx.root.join("learn.2.weights"));
    }
}
