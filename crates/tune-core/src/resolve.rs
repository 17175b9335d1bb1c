use crate::error::{not_found, TuneError, TuneResult};
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Locates external programs in a prioritized list of directories followed
/// by the inherited `PATH`.
#[derive(Debug, Clone, Default)]
pub struct ExecutableResolver {
    dirs: Vec<PathBuf>,
    search_path: Option<OsString>,
}

impl ExecutableResolver {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            search_path: env::var_os("PATH"),
        }
    }

    /// Replaces the inherited search path; `None` disables the fallback.
    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let name = with_exe_suffix(name);
        let direct = Path::new(&name);
        if direct.components().count() > 1 && is_executable(direct) {
            return Some(direct.to_path_buf());
        }
        let inherited = self
            .search_path
            .as_ref()
            .map(|p| env::split_paths(p).collect::<Vec<_>>())
            .unwrap_or_default();
        self.dirs
            .iter()
            .chain(inherited.iter())
            .map(|dir| dir.join(&name))
            .find(|candidate| is_executable(candidate))
    }

    pub fn require(&self, name: &str) -> TuneResult<PathBuf> {
        self.find(name)
            .ok_or_else(|| TuneError::Resolution(format!("{} does not exist", name)))
    }

    /// First program of `names` that resolves, in order of preference.
    pub fn require_any(&self, names: &[&str]) -> TuneResult<PathBuf> {
        names
            .iter()
            .find_map(|n| self.find(n))
            .ok_or_else(|| TuneError::Resolution(format!("no {}?", names.join(" nor "))))
    }
}

fn with_exe_suffix(name: &str) -> String {
    let suffix = env::consts::EXE_SUFFIX;
    if suffix.is_empty() || name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{}{}", name, suffix)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[derive(Debug, Clone)]
pub struct Toolkit {
    resolver: ExecutableResolver,
    programs: BTreeMap<String, PathBuf>,
}

impl Toolkit {
    /// Search directories for a toolkit installation: the root itself and
    /// its `bin`, `progs` and `scripts` subdirectories when present. Without
    /// an explicit root the driver's own directory and its parent are used.
    pub fn search_dirs(root: Option<&Path>) -> TuneResult<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let base = match root {
            Some(root) => {
                let root = root
                    .canonicalize()
                    .map_err(|_| not_found(root.to_path_buf()))?;
                dirs.push(root.clone());
                root
            }
            None => {
                let exe = env::current_exe()
                    .map_err(|e| TuneError::io("locating driver executable", e))?;
                let own = exe
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                dirs.push(own.clone());
                own.parent().map(Path::to_path_buf).unwrap_or(own)
            }
        };
        for sub in ["bin", "progs", "scripts"] {
            let dir = base.join(sub);
            if dir.is_dir() {
                dirs.push(dir);
            }
        }
        Ok(dirs)
    }

    pub fn locate(root: Option<&Path>, programs: &[&str]) -> TuneResult<Self> {
        let resolver = ExecutableResolver::new(Self::search_dirs(root)?);
        Self::with_resolver(resolver, programs)
    }

    pub fn with_resolver(resolver: ExecutableResolver, programs: &[&str]) -> TuneResult<Self> {
        let mut resolved = BTreeMap::new();
        for name in programs {
            resolved.insert(name.to_string(), resolver.require(name)?);
        }
        Ok(Self {
            resolver,
            programs: resolved,
        })
    }

    pub fn from_programs<I, S, P>(programs: I) -> Self
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            resolver: ExecutableResolver::default(),
            programs: programs
                .into_iter()
                .map(|(n, p)| (n.into(), p.into()))
                .collect(),
        }
    }

    pub fn program(&self, name: &str) -> TuneResult<&Path> {
        self.programs
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| TuneError::Resolution(format!("{} does not exist", name)))
    }

    pub fn resolver(&self) -> &ExecutableResolver {
        &self.resolver
    }
}
