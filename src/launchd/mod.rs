//! Service manager adapter
//!
//! Wraps launchd: lists and queries loaded jobs, and loads/unloads jobs from
//! descriptor files, in either the system-wide or the per-user context.

mod descriptor;
mod parser;

pub use descriptor::{DaemonDescriptor, KeepAlive};
pub use parser::{parse_job, parse_list, ListEntry, ParseError};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::geteuid;

use crate::auth::{AuthError, Rights, RIGHT_EXECUTE};
use crate::process::{CommandSpec, Privilege, ProcessRunner, RunError};

pub const LAUNCHCTL: &str = "/bin/launchctl";

/// Which launchd context a job lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The root context, shared by all users
    System,
    /// The invoking user's context
    User,
}

impl Scope {
    pub fn for_all_users(all_users: bool) -> Self {
        if all_users {
            Self::System
        } else {
            Self::User
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job currently loaded in launchd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedUnit {
    pub descriptor: DaemonDescriptor,
    pub pid: Option<u32>,
    pub last_exit_status: Option<i64>,
}

impl LoadedUnit {
    pub fn label(&self) -> &str {
        &self.descriptor.label
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchdError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Cannot parse launchctl output for {label}: {source}")]
    Parse {
        label: String,
        #[source]
        source: ParseError,
    },

    #[error("Cannot read descriptor {}: {reason}", .path.display())]
    Descriptor { path: PathBuf, reason: String },
}

impl LaunchdError {
    pub fn auth_error(&self) -> Option<&AuthError> {
        match self {
            Self::Auth(e) | Self::Run(RunError::Auth(e)) => Some(e),
            _ => None,
        }
    }
}

/// Operations on the OS service manager
pub trait ServiceManager: Send + Sync {
    /// Rights a credential needs for system-scope operations
    fn rights(&self) -> Rights;

    /// Labels of loaded jobs matching a glob pattern
    fn list_units(&self, pattern: &str, scope: Scope, privilege: Privilege<'_>) -> Result<Vec<String>, LaunchdError>;

    fn get_unit(&self, name: &str, scope: Scope, privilege: Privilege<'_>) -> Result<Option<LoadedUnit>, LaunchdError>;

    /// Load a descriptor file and start the job
    fn load_unit(&self, file: &Path, scope: Scope, privilege: Privilege<'_>) -> Result<(), LaunchdError>;

    /// Remove a job. Succeeds silently if it is not loaded.
    fn unload_unit(&self, name: &str, scope: Scope, privilege: Privilege<'_>) -> Result<(), LaunchdError>;
}

/// `ServiceManager` driving the `launchctl` CLI through a `ProcessRunner`
pub struct Launchctl {
    runner: Arc<dyn ProcessRunner>,
    launchctl: PathBuf,
}

impl Launchctl {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            launchctl: PathBuf::from(LAUNCHCTL),
        }
    }

    /// The system context is only reachable as root; the user context never
    /// runs elevated.
    fn privilege<'a>(scope: Scope, privilege: Privilege<'a>) -> Result<Privilege<'a>, LaunchdError> {
        match scope {
            Scope::System if privilege.is_root() || geteuid().is_root() => Ok(privilege),
            Scope::System => Err(LaunchdError::Auth(AuthError::Insufficient)),
            Scope::User => Ok(Privilege::Unprivileged),
        }
    }

    fn command<S: Into<String>>(&self, args: impl IntoIterator<Item = S>) -> CommandSpec {
        CommandSpec::executable(&self.launchctl, args)
    }
}

impl ServiceManager for Launchctl {
    fn rights(&self) -> Rights {
        Rights::with_right(RIGHT_EXECUTE).union(&self.runner.rights())
    }

    fn list_units(&self, pattern: &str, scope: Scope, privilege: Privilege<'_>) -> Result<Vec<String>, LaunchdError> {
        let privilege = Self::privilege(scope, privilege)?;
        let output = self.runner.run(&self.command(["list"]), privilege)?;
        let pattern = glob::Pattern::new(pattern).map_err(|e| LaunchdError::Parse {
            label: pattern.to_string(),
            source: ParseError::Unexpected(pattern.chars().nth(e.pos).unwrap_or('?')),
        })?;
        Ok(parse_list(&output)
            .into_iter()
            .map(|entry| entry.label)
            .filter(|label| pattern.matches(label))
            .collect())
    }

    fn get_unit(&self, name: &str, scope: Scope, privilege: Privilege<'_>) -> Result<Option<LoadedUnit>, LaunchdError> {
        let privilege = Self::privilege(scope, privilege)?;
        let output = match self.runner.run(&self.command(["list", name]), privilege) {
            Ok(output) => output,
            // launchctl exits non-zero when the label is not loaded
            Err(RunError::Failed { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let dict = parse_job(&output).map_err(|source| LaunchdError::Parse {
            label: name.to_string(),
            source,
        })?;
        let Some(descriptor) = DaemonDescriptor::from_dictionary(&dict) else {
            log::debug!("launchctl list {} returned no label", name);
            return Ok(None);
        };
        Ok(Some(LoadedUnit {
            pid: dict
                .get("PID")
                .and_then(|v| v.as_signed_integer())
                .and_then(|pid| u32::try_from(pid).ok()),
            last_exit_status: dict.get("LastExitStatus").and_then(|v| v.as_signed_integer()),
            descriptor,
        }))
    }

    fn load_unit(&self, file: &Path, scope: Scope, privilege: Privilege<'_>) -> Result<(), LaunchdError> {
        let privilege = Self::privilege(scope, privilege)?;
        let descriptor = DaemonDescriptor::from_file(file).map_err(|e| LaunchdError::Descriptor {
            path: file.to_path_buf(),
            reason: e.to_string(),
        })?;

        log::info!("Loading {} ({} scope)", descriptor.label, scope);
        let file_arg = file.to_string_lossy().into_owned();
        // launchctl load reports most failures on stdout with exit status 0
        self.runner
            .run_quiet(&self.command(["load".to_string(), "-F".to_string(), file_arg]), privilege)?;
        // Jobs without RunAtLoad only run when started explicitly
        self.runner
            .run_quiet(&self.command(["start".to_string(), descriptor.label.clone()]), privilege)?;
        Ok(())
    }

    fn unload_unit(&self, name: &str, scope: Scope, privilege: Privilege<'_>) -> Result<(), LaunchdError> {
        if self.get_unit(name, scope, privilege)?.is_none() {
            log::debug!("{} not loaded ({} scope), nothing to unload", name, scope);
            return Ok(());
        }
        let privilege = Self::privilege(scope, privilege)?;
        log::info!("Unloading {} ({} scope)", name, scope);
        self.runner.run_quiet(&self.command(["remove", name]), privilege)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessInfo;
    use std::sync::Mutex;

    /// Answers launchctl invocations from a script
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        loaded: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(loaded: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                loaded: Mutex::new(loaded.iter().map(|s| s.to_string()).collect()),
            })
        }
    }

    impl ProcessRunner for ScriptedRunner {
        fn run(&self, command: &CommandSpec, _privilege: Privilege<'_>) -> Result<String, RunError> {
            let line = command.to_string();
            self.calls.lock().unwrap().push(line.clone());
            let args: Vec<&str> = line.split(' ').skip(1).collect();
            let loaded = self.loaded.lock().unwrap();
            match args.as_slice() {
                ["list"] => Ok(loaded
                    .iter()
                    .map(|l| format!("-\t0\t{}\n", l))
                    .fold("PID\tStatus\tLabel\n".to_string(), |acc, l| acc + &l)),
                ["list", label] if loaded.iter().any(|l| l == label) => {
                    Ok(format!("{{\n\t\"Label\" = \"{}\";\n\t\"PID\" = 77;\n}};\n", label))
                }
                ["list", _] => Err(RunError::Failed {
                    command: line.clone(),
                    code: Some(113),
                    stderr: "Could not find service".into(),
                }),
                _ => Ok(String::new()),
            }
        }

        fn start(&self, _command: &CommandSpec, _privilege: Privilege<'_>) -> Result<(), RunError> {
            Ok(())
        }

        fn list_processes(&self, _pattern: &str) -> Result<Vec<ProcessInfo>, RunError> {
            Ok(Vec::new())
        }

        fn process(&self, _pid: u32) -> Result<Option<ProcessInfo>, RunError> {
            Ok(None)
        }

        fn kill(&self, _pid: u32, _privilege: Privilege<'_>) -> Result<(), RunError> {
            Ok(())
        }
    }

    #[test]
    fn test_list_units_filters_by_pattern() {
        let runner = ScriptedRunner::new(&["com.apple.foo", "org.postgresql.preferences.pg1"]);
        let launchctl = Launchctl::new(runner);
        let units = launchctl
            .list_units("org.postgresql.*", Scope::User, Privilege::Unprivileged)
            .unwrap();
        assert_eq!(units, vec!["org.postgresql.preferences.pg1".to_string()]);
    }

    #[test]
    fn test_get_unit() {
        let runner = ScriptedRunner::new(&["org.postgresql.preferences.pg1"]);
        let launchctl = Launchctl::new(runner);
        let unit = launchctl
            .get_unit("org.postgresql.preferences.pg1", Scope::User, Privilege::Unprivileged)
            .unwrap()
            .unwrap();
        assert_eq!(unit.pid, Some(77));
        assert_eq!(unit.label(), "org.postgresql.preferences.pg1");

        assert!(launchctl
            .get_unit("missing", Scope::User, Privilege::Unprivileged)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unload_absent_unit_is_silent() {
        let runner = ScriptedRunner::new(&[]);
        let launchctl = Launchctl::new(runner.clone());
        launchctl
            .unload_unit("org.postgresql.preferences.pg1", Scope::User, Privilege::Unprivileged)
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        assert!(!calls.iter().any(|c| c.contains("remove")));
    }

    #[test]
    fn test_unload_loaded_unit() {
        let runner = ScriptedRunner::new(&["org.postgresql.preferences.pg1"]);
        let launchctl = Launchctl::new(runner.clone());
        launchctl
            .unload_unit("org.postgresql.preferences.pg1", Scope::User, Privilege::Unprivileged)
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.last().unwrap(), "/bin/launchctl remove org.postgresql.preferences.pg1");
    }

    #[test]
    fn test_system_scope_needs_credential() {
        if geteuid().is_root() {
            return;
        }
        let launchctl = Launchctl::new(ScriptedRunner::new(&[]));
        let err = launchctl
            .list_units("*", Scope::System, Privilege::Unprivileged)
            .unwrap_err();
        assert_eq!(err.auth_error(), Some(&AuthError::Insufficient));
    }

    #[test]
    fn test_load_unit_starts_job() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("org.postgresql.preferences.pg1.plist");
        let descriptor = DaemonDescriptor {
            label: "org.postgresql.preferences.pg1".into(),
            program_arguments: vec!["/usr/local/bin/postgres".into()],
            ..Default::default()
        };
        std::fs::write(&file, descriptor.to_xml().unwrap()).unwrap();

        let runner = ScriptedRunner::new(&[]);
        let launchctl = Launchctl::new(runner.clone());
        launchctl.load_unit(&file, Scope::User, Privilege::Unprivileged).unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0], format!("/bin/launchctl load -F {}", file.display()));
        assert_eq!(calls[1], "/bin/launchctl start org.postgresql.preferences.pg1");
    }
}
