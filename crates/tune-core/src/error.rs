use std::path::PathBuf;
use thiserror::Error;

pub type TuneResult<T> = std::result::Result<T, TuneError>;

/// Failures surfaced by the tuning driver.
///
/// `Resolution` and `Configuration` are raised before anything is dispatched.
/// `JobFailure` is raised after a dispatched process exits unsuccessfully and
/// aborts the enclosing run.
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("resolution error: {0}")]
    Resolution(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("job '{name}' failed with {}", describe_code(*code))]
    JobFailure { name: String, code: Option<i32> },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TuneError {
    pub fn missing_path(what: &str, path: &std::path::Path) -> Self {
        TuneError::Resolution(format!("no {}: {}", what, path.display()))
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TuneError::Io {
            context: context.into(),
            source,
        }
    }

    /// Exit status the driver process should report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            TuneError::JobFailure { code: Some(c), .. } if *c != 0 => *c,
            _ => 1,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TuneError::Resolution(_) => "resolution_error",
            TuneError::Configuration(_) => "configuration_error",
            TuneError::JobFailure { .. } => "job_failure",
            TuneError::Io { .. } => "io_error",
            TuneError::Yaml(_) => "plan_parse_error",
            TuneError::Json(_) => "json_error",
        }
    }
}

impl From<std::io::Error> for TuneError {
    fn from(source: std::io::Error) -> Self {
        TuneError::Io {
            context: "io".to_string(),
            source,
        }
    }
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit status {}", c),
        None => "termination by signal".to_string(),
    }
}

pub(crate) fn not_found(path: PathBuf) -> TuneError {
    TuneError::Resolution(format!("{} does not exist", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_failure_exit_code_follows_process_status() {
        let err = TuneError::JobFailure {
            name: "moses".to_string(),
            code: Some(3),
        };
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.to_string(), "job 'moses' failed with exit status 3");

        let killed = TuneError::JobFailure {
            name: "learn".to_string(),
            code: None,
        };
        assert_eq!(killed.exit_code(), 1);
        assert!(killed.to_string().contains("signal"));
    }

    #[test]
    fn configuration_errors_exit_with_one() {
        let err = TuneError::Configuration("both --weights and --weights-default?".to_string());
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.code(), "configuration_error");
    }
}
