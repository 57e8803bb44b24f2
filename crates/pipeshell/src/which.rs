//! PATH resolution utilities
//!
//! Resolves program names against the `PATH` of an `Environment` (not the
//! process environment) and lists executables for completion providers.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use nix::unistd::access;
use nix::unistd::AccessFlags;

/// Resolve `program` against `path_env`, relative names against `cwd`.
///
/// Returns `None` if nothing executable matches; the caller then hands the
/// bare name to `exec`, which fails in the child with the exec-failed code.
pub fn resolve_program(program: &str, path_env: Option<&str>, cwd: &Path) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = cwd.join(program);
        return is_runnable(&path).then_some(path);
    }
    let path_env = path_env?;
    which::which_in(program, Some(path_env), cwd).ok()
}

/// Names of every file on `path_env` this process may execute, sorted and
/// deduplicated. Relative entries are taken from `cwd`, as `exec` would.
pub fn executables(path_env: &str, cwd: &Path) -> Vec<String> {
    let mut names = BTreeSet::new();
    for dir in std::env::split_paths(path_env) {
        let Ok(entries) = std::fs::read_dir(cwd.join(dir)) else {
            continue;
        };
        for entry in entries.flatten() {
            if is_runnable(&entry.path()) {
                names.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    names.into_iter().collect()
}

/// Regular file that `access(2)` lets us execute.
fn is_runnable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn scratch_bin() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("mytool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        dir
    }

    #[test]
    fn test_resolve_on_custom_path() {
        let dir = scratch_bin();
        let path_env = dir.path().to_string_lossy().into_owned();
        let found = resolve_program("mytool", Some(&path_env), Path::new("/"));
        assert_eq!(found, Some(dir.path().join("mytool")));
        assert!(resolve_program("notes.txt", Some(&path_env), Path::new("/")).is_none());
    }

    #[test]
    fn test_resolve_not_found() {
        let result = resolve_program("nonexistent_command_12345", Some("/usr/bin:/bin"), Path::new("/"));
        assert!(result.is_none());
        assert!(resolve_program("sh", None, Path::new("/")).is_none());
    }

    #[test]
    fn test_relative_path_uses_cwd() {
        let dir = scratch_bin();
        let found = resolve_program("./mytool", None, dir.path());
        assert_eq!(found, Some(dir.path().join("./mytool")));
    }

    #[test]
    fn test_executables_listing() {
        let dir = scratch_bin();
        let names = executables(&dir.path().to_string_lossy(), Path::new("/"));
        assert_eq!(names, vec!["mytool".to_string()]);
    }

    #[test]
    fn test_relative_path_entries_use_cwd() {
        let dir = scratch_bin();
        let parent = dir.path().parent().unwrap();
        let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        let names = executables(&format!("{name}:/nonexistent"), parent);
        assert_eq!(names, vec!["mytool".to_string()]);
        assert!(executables(&name, Path::new("/nonexistent")).is_empty());
    }
}
