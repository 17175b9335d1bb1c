//! Run plan: the single configuration record for a tuning run.
//!
//! Loaded once from YAML, validated once, then only read.

use crate::backend::{BackendConfig, QueueSettings};
use crate::mpi::HostSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tune_core::{TuneError, TuneResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TuningMode {
    #[default]
    Learn,
    Mert,
}

impl TuningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TuningMode::Learn => "learn",
            TuningMode::Mert => "mert",
        }
    }

    /// Toolkit programs that must resolve before anything is dispatched.
    pub fn required_programs(&self) -> &'static [&'static str] {
        match self {
            TuningMode::Learn => &[
                "cicada_learn_kbest",
                "cicada_learn_kbest_mpi",
                "cicada_oracle_kbest",
                "cicada_oracle_kbest_mpi",
                "cicada_eval",
                "cicada_filter_config_moses",
                "cicada_filter_kbest_moses",
                "cicada_filter_weights",
            ],
            TuningMode::Mert => &[
                "cicada_mert_kbest",
                "cicada_mert_kbest_mpi",
                "cicada_eval",
                "cicada_filter_config_moses",
                "cicada_filter_kbest_moses",
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunPlan {
    #[serde(default)]
    pub mode: TuningMode,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub iterations: IterationRange,
    pub inputs: Inputs,
    #[serde(default)]
    pub decoder: DecoderSettings,
    #[serde(default = "default_scorer")]
    pub scorer: String,
    #[serde(default)]
    pub learn: LearnSettings,
    #[serde(default)]
    pub mert: MertSettings,
    #[serde(default)]
    pub toolkit: ToolkitSettings,
    #[serde(default)]
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    #[serde(default)]
    pub root_dir: PathBuf,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IterationRange {
    #[serde(default = "default_first")]
    pub first: i64,
    #[serde(default = "default_last")]
    pub last: i64,
}

impl Default for IterationRange {
    fn default() -> Self {
        Self {
            first: default_first(),
            last: default_last(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inputs {
    pub srcset: PathBuf,
    pub refset: PathBuf,
    pub moses: PathBuf,
    pub config: PathBuf,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub weights: Option<PathBuf>,
    /// Derive the initial weights from the decoder config.
    #[serde(default)]
    pub weights_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderSettings {
    #[serde(default = "default_kbest")]
    pub kbest: i64,
    #[serde(default)]
    pub kbest_distinct: bool,
    #[serde(default)]
    pub bias_features: Option<String>,
    #[serde(default = "default_bias_weight")]
    pub bias_weight: f64,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            kbest: default_kbest(),
            kbest_distinct: false,
            bias_features: None,
            bias_weight: default_bias_weight(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Regularizers {
    #[serde(default)]
    pub l1: f64,
    #[serde(default)]
    pub l2: f64,
    #[serde(default)]
    pub lambda: f64,
    #[serde(default)]
    pub oscar: f64,
}

impl Regularizers {
    /// `(flag, value)` for every strictly positive regularizer.
    pub fn active(&self) -> Vec<(&'static str, f64)> {
        [
            ("--regularize-l1", self.l1),
            ("--regularize-l2", self.l2),
            ("--regularize-lambda", self.lambda),
            ("--regularize-oscar", self.oscar),
        ]
        .into_iter()
        .filter(|(_, v)| *v > 0.0)
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LearnSettings {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub merge: bool,
    #[serde(default)]
    pub interpolate: f64,
    /// Filter applied as `cat learned | postprocess > weights`.
    #[serde(default)]
    pub postprocess: Option<String>,
    #[serde(default)]
    pub regularize: Regularizers,
}

impl Default for LearnSettings {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            options: String::new(),
            merge: false,
            interpolate: 0.0,
            postprocess: None,
            regularize: Regularizers::default(),
        }
    }
}

impl LearnSettings {
    pub fn interpolation(&self) -> Option<f64> {
        (self.interpolate > 0.0 && self.interpolate < 1.0).then_some(self.interpolate)
    }

    pub fn postprocess(&self) -> Option<&str> {
        self.postprocess
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MertSettings {
    #[serde(default = "default_directions")]
    pub directions: i64,
    #[serde(default = "default_restarts")]
    pub restarts: i64,
    #[serde(default = "default_value_lower")]
    pub value_lower: f64,
    #[serde(default = "default_value_upper")]
    pub value_upper: f64,
    #[serde(default)]
    pub bound_lower: Option<PathBuf>,
    #[serde(default)]
    pub bound_upper: Option<PathBuf>,
    #[serde(default)]
    pub iterative: bool,
    #[serde(default)]
    pub options: String,
}

impl Default for MertSettings {
    fn default() -> Self {
        Self {
            directions: default_directions(),
            restarts: default_restarts(),
            value_lower: default_value_lower(),
            value_upper: default_value_upper(),
            bound_lower: None,
            bound_upper: None,
            iterative: false,
            options: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolkitSettings {
    #[serde(default)]
    pub cicada_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MpiSettings {
    #[serde(default)]
    pub processes: u32,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub host_file: Option<PathBuf>,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl MpiSettings {
    /// An MPI group is configured when any placement option is set.
    pub fn is_configured(&self) -> bool {
        self.processes > 0
            || self.host.as_deref().is_some_and(|h| !h.is_empty())
            || self.host_file.is_some()
    }

    pub fn host_spec(&self) -> HostSpec {
        match (&self.host, &self.host_file) {
            (Some(h), _) if !h.is_empty() => HostSpec::List(h.clone()),
            (_, Some(f)) => HostSpec::File(f.clone()),
            _ => HostSpec::Any,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default = "default_max_malloc")]
    pub max_malloc: f64,
    #[serde(default)]
    pub pbs: Option<QueueSettings>,
    #[serde(default)]
    pub mpi: Option<MpiSettings>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            max_malloc: default_max_malloc(),
            pbs: None,
            mpi: None,
        }
    }
}

impl BackendSettings {
    pub fn mpi(&self) -> Option<&MpiSettings> {
        self.mpi.as_ref().filter(|m| m.is_configured())
    }

    /// Pipeline stages run one after another, so only direct execution or
    /// blocking queue submission qualify.
    pub fn pipeline_backend(&self) -> BackendConfig {
        match &self.pbs {
            Some(settings) => BackendConfig::ClusterQueue(settings.clone()),
            None => BackendConfig::Direct,
        }
    }
}

fn default_first() -> i64 {
    1
}
fn default_last() -> i64 {
    10
}
fn default_kbest() -> i64 {
    100
}
fn default_bias_weight() -> f64 {
    -1.0
}
fn default_scorer() -> String {
    "bleu:order=4,exact=true".to_string()
}
fn default_algorithm() -> String {
    "xbleu".to_string()
}
fn default_directions() -> i64 {
    8
}
fn default_restarts() -> i64 {
    2
}
fn default_value_lower() -> f64 {
    -1.0
}
fn default_value_upper() -> f64 {
    1.0
}
fn default_threads() -> u32 {
    1
}
fn default_max_malloc() -> f64 {
    8.0
}

impl RunPlan {
    pub fn load(path: &Path) -> TuneResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| TuneError::io(format!("reading plan {}", path.display()), e))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> TuneResult<Self> {
        let mut plan: RunPlan = serde_yaml::from_str(raw)?;
        if plan.iterations.first <= 0 {
            plan.iterations.first = 1;
        }
        Ok(plan)
    }

    pub fn prefix(&self) -> &str {
        self.output
            .prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(self.mode.as_str())
    }

    pub fn first(&self) -> u32 {
        u32::try_from(self.iterations.first.max(1)).unwrap_or(u32::MAX)
    }

    pub fn last(&self) -> u32 {
        u32::try_from(self.iterations.last.max(0)).unwrap_or(u32::MAX)
    }

    pub fn validate(&self) -> TuneResult<()> {
        let conf = |msg: String| Err(TuneError::Configuration(msg));
        if self.inputs.weights.is_some() && self.inputs.weights_default {
            return conf("both weights and weights_default?".to_string());
        }
        for (name, value) in [
            ("first", self.iterations.first),
            ("last", self.iterations.last),
        ] {
            if u32::try_from(value).is_err() && value > 0 {
                return conf(format!("iteration {} out of range: {}", name, value));
            }
        }
        if self.iterations.first.max(1) > self.iterations.last {
            return conf(format!(
                "invalid iterations: first {} > last {}",
                self.iterations.first, self.iterations.last
            ));
        }
        if self.decoder.kbest <= 0 {
            return conf(format!("invalid kbest: {}", self.decoder.kbest));
        }
        if self.backend.threads == 0 {
            return conf("threads must be at least 1".to_string());
        }
        if self.backend.max_malloc < 0.0 {
            return conf("max_malloc must not be negative".to_string());
        }
        for (name, value) in [
            ("L1 regularization", self.learn.regularize.l1),
            ("L2 regularization", self.learn.regularize.l2),
            ("regularization constant", self.learn.regularize.lambda),
            ("OSCAR regularization", self.learn.regularize.oscar),
        ] {
            if value < 0.0 {
                return conf(format!("{} must be positive", name));
            }
        }
        if !(0.0..1.0).contains(&self.learn.interpolate) {
            return conf(format!(
                "interpolate must be in [0, 1): {}",
                self.learn.interpolate
            ));
        }
        if self.mode == TuningMode::Mert && self.mert.value_lower > self.mert.value_upper {
            return conf("value_lower exceeds value_upper".to_string());
        }
        if self.backend.pbs.as_ref().is_some_and(|p| p.non_blocking) {
            return conf(
                "non-blocking submission cannot drive the pipeline: later stages need earlier outputs"
                    .to_string(),
            );
        }
        Ok(())
    }

    /// Input files and directories that must exist before the first dispatch.
    pub fn check_inputs(&self) -> TuneResult<()> {
        fn require(what: &str, path: &Path) -> TuneResult<()> {
            if path.exists() {
                Ok(())
            } else {
                Err(TuneError::missing_path(what, path))
            }
        }
        require("moses", &self.inputs.moses)?;
        require("development file", &self.inputs.srcset)?;
        require("reference translation file", &self.inputs.refset)?;
        require("config file", &self.inputs.config)?;
        if let Some(w) = &self.inputs.weights {
            require("initial weights", w)?;
        }
        if self.mode == TuningMode::Mert {
            if let Some(b) = &self.mert.bound_lower {
                require("lower-bound file", b)?;
            }
            if let Some(b) = &self.mert.bound_upper {
                require("upper-bound file", b)?;
            }
        }
        if let Some(dir) = &self.toolkit.cicada_dir {
            require("cicada directory", dir)?;
        }
        if let Some(mpi) = self.backend.mpi() {
            if let Some(dir) = &mpi.dir {
                require("MPI directory", dir)?;
            }
            if let Some(file) = &mpi.host_file {
                require("MPI host file", file)?;
            }
        }
        Ok(())
    }

    pub fn artifact(&self, iteration: u32, suffix: &str) -> PathBuf {
        self.output
            .root_dir
            .join(format!("{}.{}.{}", self.prefix(), iteration, suffix))
    }
}

pub const PLAN_TEMPLATE: &str = "\
mode: learn                          # learn | mert
output:
  root_dir: work
  prefix: learn
iterations:
  first: 1
  last: 10
inputs:
  srcset: ''                         # REQUIRED: development source
  refset: ''                         # REQUIRED: reference translations
  moses: ''                          # REQUIRED: moses binary
  config: ''                         # REQUIRED: moses.ini
  options: '-beam-threshold 0 -translation-option-threshold 0 -early-discarding-threshold 0'
  weights_default: false
decoder:
  kbest: 100
  kbest_distinct: false
scorer: bleu:order=4,exact=true
learn:
  algorithm: xbleu
  merge: false
  interpolate: 0.0
  regularize: { l1: 0.0, l2: 0.0, lambda: 0.0, oscar: 0.0 }
mert:
  directions: 8
  restarts: 2
  value_lower: -1.0
  value_upper: 1.0
backend:
  threads: 1
  max_malloc: 8
#  pbs: { queue: '' }
#  mpi: { processes: 8, host_file: hosts.txt }
";

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        "inputs: { srcset: dev.src, refset: dev.ref, moses: moses, config: moses.ini }\n"
    }

    #[test]
    fn defaults_follow_the_driver_conventions() {
        let plan = RunPlan::from_yaml(minimal()).expect("parse");
        assert_eq!(plan.mode, TuningMode::Learn);
        assert_eq!(plan.prefix(), "learn");
        assert_eq!((plan.first(), plan.last()), (1, 10));
        assert_eq!(plan.decoder.kbest, 100);
        assert_eq!(plan.scorer, "bleu:order=4,exact=true");
        assert_eq!(plan.learn.algorithm, "xbleu");
        assert_eq!(plan.backend.max_malloc, 8.0);
        assert_eq!(plan.mert.directions, 8);
        assert!(plan.backend.mpi().is_none());
        assert_eq!(plan.backend.pipeline_backend(), BackendConfig::Direct);
        plan.validate().expect("valid");
        assert_eq!(plan.artifact(3, "kbest.oracle"), PathBuf::from("learn.3.kbest.oracle"));
    }

    #[test]
    fn non_positive_first_iteration_is_clamped() {
        let plan = RunPlan::from_yaml(&format!("{}iterations: {{ first: 0, last: 2 }}\n", minimal()))
            .expect("parse");
        assert_eq!(plan.first(), 1);
    }

    #[test]
    fn conflicting_initial_weights_are_rejected() {
        let raw = "inputs: { srcset: a, refset: b, moses: c, config: d, weights: w, weights_default: true }\n";
        let err = RunPlan::from_yaml(raw).expect("parse").validate().expect_err("conflict");
        assert!(matches!(err, TuneError::Configuration(_)));
    }

    #[test]
    fn eager_option_checks() {
        let cases = [
            "iterations: { first: 4, last: 3 }\n",
            "iterations: { first: 1, last: 4294967296 }\n",
            "decoder: { kbest: 0 }\n",
            "learn: { regularize: { l2: -0.5 } }\n",
            "learn: { interpolate: 1.0 }\n",
            "backend: { threads: 0 }\n",
            "backend: { pbs: { non_blocking: true } }\n",
        ];
        for extra in cases {
            let plan = RunPlan::from_yaml(&format!("{}{}", minimal(), extra)).expect("parse");
            assert!(
                matches!(plan.validate(), Err(TuneError::Configuration(_))),
                "expected rejection for {}",
                extra
            );
        }
    }

    #[test]
    fn unknown_fields_are_parse_errors() {
        let err = RunPlan::from_yaml(&format!("{}bogus: 1\n", minimal())).expect_err("unknown");
        assert!(matches!(err, TuneError::Yaml(_)));
    }

    #[test]
    fn mpi_is_configured_by_any_placement_option() {
        let raw = format!("{}backend: {{ mpi: {{ host: 'n1,n2' }} }}\n", minimal());
        let plan = RunPlan::from_yaml(&raw).expect("parse");
        let mpi = plan.backend.mpi().expect("configured");
        assert_eq!(mpi.host_spec(), HostSpec::List("n1,n2".to_string()));

        let idle = format!("{}backend: {{ mpi: {{ options: '--tag' }} }}\n", minimal());
        assert!(RunPlan::from_yaml(&idle).expect("parse").backend.mpi().is_none());
    }

    #[test]
    fn missing_inputs_are_resolution_errors() {
        let plan = RunPlan::from_yaml(
            "inputs: { srcset: /nonexistent/dev.src, refset: b, moses: /bin/sh, config: d }\n",
        )
        .expect("parse");
        let err = plan.check_inputs().expect_err("missing");
        assert!(matches!(err, TuneError::Resolution(_)));
        assert!(err.to_string().contains("development file"));
    }

    #[test]
    fn regularizers_only_positive_values() {
        let regs = Regularizers {
            l1: 0.0,
            l2: 0.25,
            lambda: 0.0,
            oscar: 1.0,
        };
        assert_eq!(
            regs.active(),
            vec![("--regularize-l2", 0.25), ("--regularize-oscar", 1.0)]
        );
    }

    #[test]
    fn template_parses_after_filling_required_inputs() {
        let filled = PLAN_TEMPLATE
            .replace("srcset: ''", "srcset: dev.src")
            .replace("refset: ''", "refset: dev.ref")
            .replace("moses: ''", "moses: moses")
            .replace("config: ''", "config: moses.ini");
        let plan = RunPlan::from_yaml(&filled).expect("template");
        plan.validate().expect("valid template");
        assert_eq!(plan.output.root_dir, PathBuf::from("work"));
    }
}
