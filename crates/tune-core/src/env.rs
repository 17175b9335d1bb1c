use std::env;

/// Variables forwarded into batch scripts and distributed launches.
pub const PROPAGATED_VARIABLES: [&str; 3] = ["TMPDIR_SPEC", "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH"];

/// The subset of the allow-list present in the driver's environment,
/// captured once at startup and handed to whichever backend needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvPropagation {
    vars: Vec<(String, String)>,
}

impl EnvPropagation {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = PROPAGATED_VARIABLES
            .iter()
            .filter_map(|name| lookup(name).map(|v| (name.to_string(), v)))
            .collect();
        Self { vars }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(n, _)| n.as_str())
    }

    pub fn export_lines(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(n, v)| format!("export {}={}", n, v))
            .collect()
    }
}
