//! Execution environment of a shell
//!
//! Holds what every pipeline run consumes:
//! - working directory (mirrored into `$PWD`)
//! - exported variables, passed verbatim to child processes
//! - the interactive flag
//! - the default redirects merged under every run
//!
//! Also hosts argument globbing and the completion hints of the front end.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use crate::config::EnvironmentConfig;
use crate::error::ShellError;
use crate::plumbing::RedirectSet;

#[derive(Debug, Clone)]
pub struct Environment {
    cwd: PathBuf,
    exports: BTreeMap<String, String>,
    interactive: bool,
    redirects: RedirectSet,
}

impl Environment {
    /// Environment rooted at `cwd` with no exported variables.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        let mut env = Self {
            cwd: PathBuf::new(),
            exports: BTreeMap::new(),
            interactive: false,
            redirects: RedirectSet::new(),
        };
        env.set_cwd(cwd.into());
        env
    }

    /// Environment inheriting the process cwd and variables.
    pub fn from_process() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let mut env = Self::new(cwd);
        for (name, value) in std::env::vars() {
            if name != "PWD" {
                env.exports.insert(name, value);
            }
        }
        env
    }

    pub fn from_config(config: &EnvironmentConfig) -> Result<Self, ShellError> {
        let mut env = if config.inherit_env {
            Self::from_process()
        } else {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            Self::new(cwd)
        };
        if let Some(cwd) = &config.cwd {
            env.cd(cwd)?;
        }
        for (name, value) in &config.exports {
            env.set_var(name, value);
        }
        env.interactive = config.interactive;
        Ok(env)
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Set the working directory without checks. Keeps `$PWD` in sync.
    pub fn set_cwd(&mut self, cwd: PathBuf) {
        self.exports
            .insert("PWD".into(), cwd.to_string_lossy().into_owned());
        self.cwd = cwd;
    }

    /// Change directory, relative to the current one. `~` is expanded and
    /// the target must be an existing directory.
    pub fn cd(&mut self, dir: impl AsRef<Path>) -> Result<(), ShellError> {
        let dir = self.expand_tilde(&dir.as_ref().to_string_lossy());
        let target = self.cwd.join(dir);
        let canonical = std::fs::canonicalize(&target)
            .map_err(|e| ShellError::invalid_path(format!("{}: {e}", target.display())))?;
        if !canonical.is_dir() {
            return Err(ShellError::invalid_path(format!(
                "{}: not a directory",
                target.display()
            )));
        }
        self.set_cwd(canonical);
        Ok(())
    }

    /// Copy of this environment, for a sub-shell or a single run.
    pub fn derive(&self) -> Environment {
        self.clone()
    }

    pub fn with_cwd(mut self, dir: impl AsRef<Path>) -> Result<Self, ShellError> {
        self.cd(dir)?;
        Ok(self)
    }

    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.set_var(name, value);
        self
    }

    pub fn exports(&self) -> &BTreeMap<String, String> {
        &self.exports
    }

    pub fn get_var(&self, name: &str) -> Option<&str> {
        self.exports.get(name).map(String::as_str)
    }

    /// Export a variable. Setting `PWD` to an existing absolute directory
    /// changes the working directory.
    pub fn set_var(&mut self, name: &str, value: &str) {
        if name == "PWD" {
            let dir = Path::new(value);
            if dir.is_absolute() {
                if let Ok(canonical) = std::fs::canonicalize(dir) {
                    self.set_cwd(canonical);
                    return;
                }
            }
        }
        self.exports.insert(name.to_string(), value.to_string());
    }

    pub fn unset_var(&mut self, name: &str) {
        self.exports.remove(name);
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    pub fn set_interactive(&mut self, interactive: bool) {
        self.interactive = interactive;
    }

    /// Redirects every run starts from.
    pub fn redirects(&self) -> &RedirectSet {
        &self.redirects
    }

    pub fn set_redirects(&mut self, redirects: RedirectSet) {
        self.redirects = redirects;
    }

    pub fn home_dir(&self) -> Option<PathBuf> {
        self.get_var("HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(PathBuf::from))
    }

    fn expand_tilde(&self, arg: &str) -> String {
        let rest = match arg.strip_prefix('~') {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return arg.to_string(),
        };
        match self.home_dir() {
            Some(home) => format!("{}{rest}", home.display()),
            None => arg.to_string(),
        }
    }

    /// Expand one command argument: `~` first, then glob patterns relative
    /// to the working directory. Matches keep the form of the pattern
    /// (relative stays relative); no match keeps the literal argument.
    /// A malformed pattern is an error.
    pub fn expand_argument(&self, arg: &str) -> Result<Vec<String>, ShellError> {
        let arg = self.expand_tilde(arg);
        if !arg.contains(['*', '?', '[']) {
            return Ok(vec![arg]);
        }

        let absolute = Path::new(&arg).is_absolute();
        let pattern = if absolute {
            arg.clone()
        } else {
            let dir = glob::Pattern::escape(&self.cwd.to_string_lossy());
            format!("{}/{arg}", dir.trim_end_matches('/'))
        };
        let paths = glob::glob(&pattern).map_err(|e| ShellError::glob(format!("{arg}: {e}")))?;

        let mut matches: Vec<String> = paths
            .flatten()
            .map(|path| {
                if absolute {
                    path.to_string_lossy().into_owned()
                } else {
                    path.strip_prefix(&self.cwd)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .into_owned()
                }
            })
            .collect();
        if matches.is_empty() {
            return Ok(vec![arg]);
        }
        matches.sort();
        Ok(matches)
    }

    /// Resolve a program name against this environment's `PATH`.
    pub fn resolve_program(&self, program: &str) -> Option<PathBuf> {
        crate::which::resolve_program(program, self.get_var("PATH"), &self.cwd)
    }

    /// Executable names on `PATH`, for command completion.
    pub fn executables(&self) -> Vec<String> {
        self.get_var("PATH")
            .map(|path_env| crate::which::executables(path_env, &self.cwd))
            .unwrap_or_default()
    }

    /// Entries completing `prefix` as a path relative to the working
    /// directory. Directories end with `/`.
    pub fn list_dir(&self, prefix: &str) -> Vec<String> {
        let expanded = self.expand_tilde(prefix);
        let (dir_part, name_part) = match expanded.rfind('/') {
            Some(pos) => (&expanded[..=pos], &expanded[pos + 1..]),
            None => ("", expanded.as_str()),
        };
        let dir = self.cwd.join(if dir_part.is_empty() { "." } else { dir_part });
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with(name_part) || (name.starts_with('.') && !name_part.starts_with('.')) {
                    return None;
                }
                let suffix = if entry.path().is_dir() { "/" } else { "" };
                Some(format!("{dir_part}{name}{suffix}"))
            })
            .collect();
        names.sort();
        names
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::from_process()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.cwd.display())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShellErrorCode;

    fn scratch() -> (tempfile::TempDir, Environment) {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        for name in ["a.txt", "b.txt", "c.log", ".hidden"] {
            std::fs::write(root.join(name), name).unwrap();
        }
        std::fs::create_dir(root.join("sub")).unwrap();
        (dir, Environment::new(root))
    }

    #[test]
    fn test_pwd_follows_cwd() {
        let (_dir, mut env) = scratch();
        env.cd("sub").unwrap();
        assert!(env.cwd().ends_with("sub"));
        assert_eq!(env.get_var("PWD"), Some(env.cwd().to_str().unwrap()));
    }

    #[test]
    fn test_cd_rejects_missing_and_files() {
        let (_dir, mut env) = scratch();
        assert!(env.cd("missing").is_err());
        assert!(env.cd("a.txt").is_err());
    }

    #[test]
    fn test_set_pwd_changes_cwd() {
        let (dir, mut env) = scratch();
        let sub = std::fs::canonicalize(dir.path().join("sub")).unwrap();
        env.set_var("PWD", sub.to_str().unwrap());
        assert_eq!(env.cwd(), sub.as_path());
    }

    #[test]
    fn test_glob_expansion_relative() {
        let (_dir, env) = scratch();
        assert_eq!(env.expand_argument("*.txt").unwrap(), vec!["a.txt", "b.txt"]);
        assert_eq!(env.expand_argument("*.none").unwrap(), vec!["*.none"]);
        assert_eq!(env.expand_argument("plain").unwrap(), vec!["plain"]);
    }

    #[test]
    fn test_malformed_glob_is_an_error() {
        let (_dir, env) = scratch();
        let err = env.expand_argument("a[").unwrap_err();
        assert_eq!(err.code(), ShellErrorCode::Glob);
        assert!(err.to_string().contains("a["));
    }

    #[test]
    fn test_tilde_expansion() {
        let env = Environment::new("/").with_var("HOME", "/home/someone");
        assert_eq!(env.expand_argument("~/x").unwrap(), vec!["/home/someone/x"]);
        assert_eq!(env.expand_argument("~user").unwrap(), vec!["~user"]);
    }

    #[test]
    fn test_derive_is_independent() {
        let (_dir, env) = scratch();
        let mut child = env.derive();
        child.set_var("ONLY_CHILD", "1");
        assert!(env.get_var("ONLY_CHILD").is_none());
    }

    #[test]
    fn test_list_dir_completion() {
        let (_dir, env) = scratch();
        assert_eq!(env.list_dir("a"), vec!["a.txt"]);
        assert_eq!(env.list_dir("s"), vec!["sub/"]);
        assert_eq!(env.list_dir("."), vec![".hidden"]);
        assert!(env.list_dir("zzz").is_empty());
    }
}
