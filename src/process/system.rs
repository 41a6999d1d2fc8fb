//! Process runner backed by real subprocesses
//!
//! Root commands go through `sudo -n`, so they never prompt; an expired sudo
//! timestamp surfaces as `AuthError::Stale`.

use std::process::{Command, Stdio};

use nix::sys::signal::{self, Signal};
use nix::unistd::{geteuid, Pid};

use super::{filter_processes, parse_ps, CommandSpec, Privilege, ProcessInfo, ProcessRunner, RunError};
use crate::auth::AuthError;

const PS_FORMAT: &str = "pid=,ppid=,user=,command=";

/// Message sudo prints when `-n` is given and the timestamp has expired
const SUDO_PASSWORD_REQUIRED: &str = "a password is required";

#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn build(command: &CommandSpec, privilege: Privilege<'_>) -> Command {
        let elevate = privilege.is_root() && !geteuid().is_root();
        let (program, args): (String, Vec<String>) = match command {
            CommandSpec::Shell(script) => ("/bin/sh".into(), vec!["-c".into(), script.clone()]),
            CommandSpec::Executable { program, args } => {
                (program.to_string_lossy().into_owned(), args.clone())
            }
        };

        let mut cmd = if elevate {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg("--").arg(&program);
            cmd
        } else {
            Command::new(&program)
        };
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn check_auth(privilege: Privilege<'_>, stderr: &str) -> Result<(), RunError> {
        if privilege.is_root() && stderr.contains(SUDO_PASSWORD_REQUIRED) {
            return Err(RunError::Auth(AuthError::Stale));
        }
        Ok(())
    }
}

impl ProcessRunner for SystemRunner {
    fn run(&self, command: &CommandSpec, privilege: Privilege<'_>) -> Result<String, RunError> {
        log::debug!("run{}: {}", if privilege.is_root() { " (root)" } else { "" }, command);
        let output = Self::build(command, privilege)
            .output()
            .map_err(|e| RunError::Spawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            Self::check_auth(privilege, &stderr)?;
            return Err(RunError::Failed {
                command: command.to_string(),
                code: output.status.code(),
                stderr: if stderr.is_empty() { stdout.trim().to_string() } else { stderr },
            });
        }
        Ok(stdout)
    }

    fn start(&self, command: &CommandSpec, privilege: Privilege<'_>) -> Result<(), RunError> {
        log::debug!("start{}: {}", if privilege.is_root() { " (root)" } else { "" }, command);
        let mut child = Self::build(command, privilege)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RunError::Spawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        // Reap in the background so the child does not linger as a zombie
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }

    fn list_processes(&self, pattern: &str) -> Result<Vec<ProcessInfo>, RunError> {
        let ps = CommandSpec::executable("/bin/ps", ["-axww", "-o", PS_FORMAT]);
        let output = self.run(&ps, Privilege::Unprivileged)?;
        Ok(filter_processes(parse_ps(&output), pattern))
    }

    fn process(&self, pid: u32) -> Result<Option<ProcessInfo>, RunError> {
        let ps = CommandSpec::executable("/bin/ps", ["-ww", "-o", PS_FORMAT, "-p", pid.to_string().as_str()]);
        match self.run(&ps, Privilege::Unprivileged) {
            Ok(output) => Ok(parse_ps(&output).into_iter().find(|p| p.pid == pid)),
            // ps exits 1 when no process matched
            Err(RunError::Failed { code: Some(1), .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn kill(&self, pid: u32, privilege: Privilege<'_>) -> Result<(), RunError> {
        if privilege.is_root() {
            let cmd = CommandSpec::executable("/bin/kill", ["-TERM".to_string(), pid.to_string()]);
            return self.run_quiet(&cmd, privilege);
        }
        let raw = i32::try_from(pid).map_err(|_| RunError::InvalidArgument {
            command: "kill".into(),
            arg: pid.to_string(),
        })?;
        signal::kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|errno| RunError::Failed {
            command: format!("kill -TERM {}", pid),
            code: None,
            stderr: errno.desc().to_string(),
        })
    }
}
