//! Process runner
//!
//! Runs external commands unprivileged or as root, and inspects the process
//! table. "run" calls block until the child exits and capture its stdout; "start"
//! calls return as soon as the child is spawned.

mod system;

pub use system::SystemRunner;

use std::fmt;
use std::path::PathBuf;

use crate::auth::{AuthError, Credential, Rights, RIGHT_EXECUTE};

/// What to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// A script for `/bin/sh -c`; arguments are already quoted
    Shell(String),
    /// An executable and its argument vector, no shell involved
    Executable { program: PathBuf, args: Vec<String> },
}

impl CommandSpec {
    /// Build a shell command, quoting each argument
    pub fn shell<S: AsRef<str>>(command: &str, args: &[S]) -> Result<Self, RunError> {
        let mut script = command.to_string();
        for arg in args {
            let quoted = shlex::try_quote(arg.as_ref()).map_err(|_| RunError::InvalidArgument {
                command: command.to_string(),
                arg: arg.as_ref().to_string(),
            })?;
            script.push(' ');
            script.push_str(&quoted);
        }
        Ok(Self::Shell(script))
    }

    pub fn executable<S: Into<String>>(program: impl Into<PathBuf>, args: impl IntoIterator<Item = S>) -> Self {
        Self::Executable {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(script) => f.write_str(script),
            Self::Executable { program, args } => {
                write!(f, "{}", program.display())?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
        }
    }
}

/// Who the command runs as
#[derive(Debug, Clone, Copy)]
pub enum Privilege<'a> {
    Unprivileged,
    Root(&'a Credential),
}

impl<'a> Privilege<'a> {
    /// Root when a credential is available, otherwise unprivileged
    pub fn from_credential(credential: Option<&'a Credential>) -> Self {
        match credential {
            Some(c) => Self::Root(c),
            None => Self::Unprivileged,
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root(_))
    }
}

/// A row of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub user: String,
    pub command: String,
}

impl ProcessInfo {
    /// Command line split into words
    pub fn argv(&self) -> Vec<String> {
        shlex::split(&self.command)
            .unwrap_or_else(|| self.command.split_whitespace().map(String::from).collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to run {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{command} failed (exit {code:?}): {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{command} produced unexpected output: {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("Cannot quote argument {arg:?} for {command}")]
    InvalidArgument { command: String, arg: String },

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl RunError {
    /// Combined diagnostic text, for matching against known failure messages
    pub fn output(&self) -> &str {
        match self {
            Self::Failed { stderr, .. } => stderr,
            Self::UnexpectedOutput { output, .. } => output,
            Self::Spawn { reason, .. } => reason,
            Self::InvalidArgument { arg, .. } => arg,
            Self::Auth(_) => "",
        }
    }
}

/// Runs commands and looks up processes
pub trait ProcessRunner: Send + Sync {
    /// Rights a credential needs for `Privilege::Root`
    fn rights(&self) -> Rights {
        Rights::with_right(RIGHT_EXECUTE)
    }

    /// Run to completion and return stdout. Non-zero exit is an error.
    fn run(&self, command: &CommandSpec, privilege: Privilege<'_>) -> Result<String, RunError>;

    /// Run to completion; any output at all is treated as an error
    fn run_quiet(&self, command: &CommandSpec, privilege: Privilege<'_>) -> Result<(), RunError> {
        let output = self.run(command, privilege)?;
        if output.trim().is_empty() {
            Ok(())
        } else {
            Err(RunError::UnexpectedOutput {
                command: command.to_string(),
                output: output.trim().to_string(),
            })
        }
    }

    /// Spawn and return without waiting
    fn start(&self, command: &CommandSpec, privilege: Privilege<'_>) -> Result<(), RunError>;

    /// Processes whose command line matches a glob pattern
    fn list_processes(&self, pattern: &str) -> Result<Vec<ProcessInfo>, RunError>;

    fn process(&self, pid: u32) -> Result<Option<ProcessInfo>, RunError>;

    /// Send SIGTERM
    fn kill(&self, pid: u32, privilege: Privilege<'_>) -> Result<(), RunError>;
}

/// Parse `ps -o pid=,ppid=,user=,command=` output
pub fn parse_ps(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut rest = line.trim_start();
            let mut fields = [""; 3];
            for field in fields.iter_mut() {
                let end = rest.find(char::is_whitespace)?;
                *field = &rest[..end];
                rest = rest[end..].trim_start();
            }
            if rest.is_empty() {
                return None;
            }
            Some(ProcessInfo {
                pid: fields[0].parse().ok()?,
                ppid: fields[1].parse().ok()?,
                user: fields[2].to_string(),
                command: rest.trim_end().to_string(),
            })
        })
        .collect()
}

/// Keep the processes whose command matches `pattern` (glob syntax)
pub fn filter_processes(processes: Vec<ProcessInfo>, pattern: &str) -> Vec<ProcessInfo> {
    match glob::Pattern::new(pattern) {
        Ok(p) => processes.into_iter().filter(|proc| p.matches(&proc.command)).collect(),
        Err(e) => {
            log::warn!("Invalid process pattern {:?}: {}", pattern, e);
            Vec::new()
        }
    }
}
