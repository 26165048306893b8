use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Environment variables of a shell or a command, kept sorted by name so
/// that children see a deterministic environment.
pub type Vars = BTreeMap<String, String>;

/// Carries an encoded function invocation into a re-executed child.
pub const ENV_INVOCATION: &str = "PROCSHELL_INVOCATION";
/// Tells a child to exit once its parent has gone away.
pub const ENV_WATCH_PARENT: &str = "PROCSHELL_WATCH_PARENT";
/// Tells a child to exit after the given number of milliseconds.
pub const ENV_EXIT_AFTER: &str = "PROCSHELL_EXIT_AFTER";
/// Default for [`crate::ShellOpts::child_output_dir`].
pub const ENV_CHILD_OUTPUT_DIR: &str = "PROCSHELL_CHILD_OUTPUT_DIR";

const RESERVED: [&str; 3] = [ENV_INVOCATION, ENV_WATCH_PARENT, ENV_EXIT_AFTER];

/// Returns the environment of this process, minus the variables that only
/// make sense between a shell and the children it spawned. Variables that
/// are not valid unicode are skipped.
pub fn inherited_vars() -> Vars {
    let mut env = Vars::new();
    for (k, v) in std::env::vars_os() {
        let (Some(k), Some(v)) = (k.to_str(), v.to_str()) else {
            continue;
        };
        if !RESERVED.contains(&k) {
            env.insert(k.to_string(), v.to_string());
        }
    }
    env
}

/// Merges the given maps, later maps winning.
pub fn merge_vars<'a>(maps: impl IntoIterator<Item = &'a Vars>) -> Vars {
    let mut res = Vars::new();
    for m in maps {
        for (k, v) in m {
            res.insert(k.clone(), v.clone());
        }
    }
    res
}

/// Resolves `name` to an executable the way a shell would. Names containing
/// a slash are returned as they are; bare names are searched for in the
/// `PATH` entry of `vars`.
pub fn look_path(vars: &Vars, name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        return Ok(PathBuf::from(name));
    }
    let path = vars.get("PATH").map(String::as_str).unwrap_or_default();
    for dir in path.split(':') {
        // An empty entry means the current directory.
        let dir = if dir.is_empty() { "." } else { dir };
        let candidate = Path::new(dir).join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::ExecutableNotFound(name.to_string()))
}

fn is_executable(path: &Path) -> bool {
    match path.metadata() {
        Ok(md) => md.is_file() && md.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn later_maps_win() {
        let a = vars(&[("A", "1"), ("B", "1")]);
        let b = vars(&[("B", "2"), ("C", "2")]);
        assert_eq!(
            merge_vars([&a, &b]),
            vars(&[("A", "1"), ("B", "2"), ("C", "2")])
        );
    }

    #[test]
    fn inherited_vars_drop_reserved_keys() {
        let env = inherited_vars();
        for key in RESERVED {
            assert!(!env.contains_key(key));
        }
    }

    #[test]
    fn look_path_searches_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("frob");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let not_exe = dir.path().join("plain");
        std::fs::write(&not_exe, "").unwrap();

        let path = format!("/nonexistent:{}", dir.path().display());
        let v = vars(&[("PATH", path.as_str())]);
        assert_eq!(look_path(&v, "frob").unwrap(), exe);
        assert!(matches!(
            look_path(&v, "plain"),
            Err(Error::ExecutableNotFound(_))
        ));
        assert_eq!(
            look_path(&Vars::new(), "./x/y").unwrap(),
            PathBuf::from("./x/y")
        );
    }
}
