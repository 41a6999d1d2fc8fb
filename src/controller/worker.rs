//! Blocking side of lifecycle actions
//!
//! Everything here runs on a `spawn_blocking` thread: launchctl and ps calls,
//! file writes, liveness polling and credential prompts. The worker only reads
//! a snapshot of the server and reports an `Outcome`; it never touches the
//! registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use super::convert::descriptor_from_server;
use super::ActionError;
use crate::auth::{AuthError, AuthReason, Credential, PrivilegeBroker, Rights};
use crate::config::Config;
use crate::files::{FileAccess, FileType};
use crate::launchd::{DaemonDescriptor, Scope, ServiceManager};
use crate::process::{Privilege, ProcessInfo, ProcessRunner};
use crate::server::{Server, ServerAction, ServerStatus, User};
use crate::store::ServerStore;

/// Lines of the server log attached to a failed start
const LOG_TAIL_LINES: usize = 10;

/// What an action observed, applied to the server by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: ServerStatus,
    pub pid: Option<u32>,
    /// Scope the unit is loaded in, when known
    pub loaded_for_all_users: Option<bool>,
    /// The server no longer exists
    pub removed: bool,
}

impl Outcome {
    fn status(status: ServerStatus) -> Self {
        Self {
            status,
            pid: None,
            loaded_for_all_users: None,
            removed: false,
        }
    }

    fn started(pid: u32, scope: Scope) -> Self {
        Self {
            pid: Some(pid),
            loaded_for_all_users: Some(scope == Scope::System),
            ..Self::status(ServerStatus::Started)
        }
    }
}

/// The OS-facing collaborators, shared between the controller and its workers
pub struct Backend {
    pub config: Config,
    pub broker: Arc<PrivilegeBroker>,
    pub runner: Arc<dyn ProcessRunner>,
    pub services: Arc<dyn ServiceManager>,
    pub files: FileAccess,
    pub store: Arc<dyn ServerStore>,
}

impl Backend {
    pub fn rights(&self) -> Rights {
        self.runner.rights().union(&self.services.rights())
    }

    fn current(&self) -> &User {
        &self.config.current_user
    }

    fn scope(&self, server: &Server) -> Scope {
        Scope::for_all_users(server.daemon_for_all_users(self.current()))
    }

    fn authorize(&self, server: &Server, action: ServerAction) -> Result<Credential, ActionError> {
        let reason = AuthReason::new(action.as_str(), server.name());
        Ok(self.broker.authorize(&self.rights(), &reason)?)
    }

    /// Prompt up front only when the server runs in the system context or as
    /// another user
    fn credential_for(&self, server: &Server, action: ServerAction) -> Result<Option<Credential>, ActionError> {
        if self.current().is_root_user {
            return Ok(None);
        }
        let needed = server.daemon_for_all_users(self.current())
            || server.settings().has_different_user(self.current());
        if !needed {
            return Ok(None);
        }
        self.authorize(server, action).map(Some)
    }

    /// Root for system locations, the current user for their own home
    fn privilege_for_path<'a>(&self, path: &Path, credential: Option<&'a Credential>) -> Privilege<'a> {
        if path.starts_with(&self.config.home_dir) {
            Privilege::Unprivileged
        } else {
            Privilege::from_credential(credential)
        }
    }

    pub fn run(&self, action: ServerAction, server: &Server) -> Result<Outcome, ActionError> {
        log::debug!("Running {} on {}", action, server.name());
        let server = &self.config.resolve_server(server);
        match action {
            ServerAction::CheckStatus => self.check_status(server),
            ServerAction::Start => self.start(server),
            ServerAction::Stop => self.stop(server),
            ServerAction::Delete => self.delete(server),
            ServerAction::Create => self.create(server),
        }
    }

    fn check_status(&self, server: &Server) -> Result<Outcome, ActionError> {
        let scope = self.scope(server);
        let credential = self.broker.credential();
        if scope == Scope::System && credential.is_none() && !self.current().is_root_user {
            return Err(AuthError::Insufficient.into());
        }
        let privilege = Privilege::from_credential(credential.as_ref());

        if let Some(unit) = self.services.get_unit(&server.daemon_name(), scope, privilege)? {
            if let Some(pid) = unit.pid {
                if self.runner.process(pid)?.is_some() {
                    return Ok(Outcome::started(pid, scope));
                }
            }
        }
        if let Some(process) = self.find_process(server)? {
            return Ok(Outcome {
                pid: Some(process.pid),
                ..Outcome::status(ServerStatus::Started)
            });
        }
        Ok(Outcome::status(ServerStatus::Stopped))
    }

    /// A `postgres` process running this server's binary on its data directory
    fn find_process(&self, server: &Server) -> Result<Option<ProcessInfo>, ActionError> {
        let settings = server.settings();
        if settings.data_directory.is_empty() {
            return Ok(None);
        }
        let binary = settings.binary().to_string_lossy().into_owned();
        let found = self.runner.list_processes("*postgres*")?.into_iter().find(|p| {
            let argv = p.argv();
            argv.first() == Some(&binary)
                && argv
                    .windows(2)
                    .any(|w| w[0] == "-D" && w[1] == settings.data_directory)
        });
        Ok(found)
    }

    fn start(&self, server: &Server) -> Result<Outcome, ActionError> {
        let credential = self.credential_for(server, ServerAction::Start)?;
        let privilege = Privilege::from_credential(credential.as_ref());
        let scope = self.scope(server);
        let label = server.daemon_name();

        let file = if server.is_editable() {
            self.install(server, credential.as_ref())?
        } else {
            server
                .descriptor_path()
                .map(Path::to_path_buf)
                .ok_or_else(|| ActionError::NotActionable(server.name().to_string()))?
        };

        self.services.unload_unit(&label, scope, privilege)?;
        self.services.load_unit(&file, scope, privilege)?;
        self.wait_for_start(server, scope, privilege)
    }

    fn wait_for_start(&self, server: &Server, scope: Scope, privilege: Privilege<'_>) -> Result<Outcome, ActionError> {
        let label = server.daemon_name();
        for attempt in 1..=self.config.start_poll_attempts {
            if let Some(unit) = self.services.get_unit(&label, scope, privilege)? {
                if let Some(pid) = unit.pid {
                    if self.runner.process(pid)?.is_some() {
                        log::info!("{} started with pid {}", server.name(), pid);
                        return Ok(Outcome::started(pid, scope));
                    }
                }
                if let Some(status) = unit.last_exit_status.filter(|s| *s != 0) {
                    log::debug!("{} exited with status {}", label, status);
                    break;
                }
            }
            log::debug!("Waiting for {} ({}/{})", label, attempt, self.config.start_poll_attempts);
            thread::sleep(self.config.start_poll_interval);
        }

        Err(ActionError::NotStarted {
            name: server.name().to_string(),
            log: self.log_tail(server),
        })
    }

    fn log_tail(&self, server: &Server) -> String {
        let log_file = &server.settings().log_file;
        match std::fs::read_to_string(log_file) {
            Ok(text) => {
                let lines: Vec<&str> = text.lines().collect();
                let start = lines.len().saturating_sub(LOG_TAIL_LINES);
                lines[start..].join("\n")
            }
            Err(e) => {
                log::debug!("Cannot read {}: {}", log_file, e);
                String::new()
            }
        }
    }

    fn stop(&self, server: &Server) -> Result<Outcome, ActionError> {
        let mut credential = self.credential_for(server, ServerAction::Stop)?;
        let scope = self.scope(server);
        let label = server.daemon_name();
        let mut pid = server.pid();

        let loaded = self
            .services
            .get_unit(&label, scope, Privilege::from_credential(credential.as_ref()))?;
        if loaded.is_some() {
            self.services
                .unload_unit(&label, scope, Privilege::from_credential(credential.as_ref()))?;
        } else if let Some(process) = self.live_process(server)? {
            // Running outside launchd
            if process.user != self.current().name && credential.is_none() && !self.current().is_root_user {
                credential = Some(self.authorize(server, ServerAction::Stop)?);
            }
            log::info!("Terminating {} (pid {})", server.name(), process.pid);
            pid = Some(process.pid);
            self.runner
                .kill(process.pid, Privilege::from_credential(credential.as_ref()))?;
        }
        self.wait_for_stop(server, pid, scope, Privilege::from_credential(credential.as_ref()))
    }

    fn live_process(&self, server: &Server) -> Result<Option<ProcessInfo>, ActionError> {
        match server.pid() {
            Some(pid) => Ok(self.runner.process(pid)?),
            None => self.find_process(server),
        }
    }

    fn wait_for_stop(
        &self,
        server: &Server,
        pid: Option<u32>,
        scope: Scope,
        privilege: Privilege<'_>,
    ) -> Result<Outcome, ActionError> {
        let label = server.daemon_name();
        for attempt in 1..=self.config.stop_poll_attempts.max(1) {
            let loaded = self.services.get_unit(&label, scope, privilege)?.is_some();
            let alive = match pid {
                Some(pid) => self.runner.process(pid)?.is_some(),
                None => false,
            };
            if !loaded && !alive {
                log::info!("{} stopped", server.name());
                return Ok(Outcome::status(ServerStatus::Stopped));
            }
            log::debug!("Waiting for {} to stop ({}/{})", label, attempt, self.config.stop_poll_attempts);
            thread::sleep(self.config.start_poll_interval);
        }
        Err(ActionError::NotStopped(server.name().to_string()))
    }

    fn delete(&self, server: &Server) -> Result<Outcome, ActionError> {
        self.stop(server)?;

        let mut credential = self.broker.credential();
        for path in self.config.daemon_files(server) {
            if self.files.type_of(&path) == FileType::None {
                continue;
            }
            if !path.starts_with(&self.config.home_dir) && credential.is_none() && !self.current().is_root_user {
                credential = Some(self.authorize(server, ServerAction::Delete)?);
            }
            log::info!("Removing {}", path.display());
            self.files
                .remove(&path, self.privilege_for_path(&path, credential.as_ref()))?;
        }

        self.store.remove(server.name())?;
        self.store.synchronize()?;
        Ok(Outcome {
            removed: true,
            ..Outcome::status(ServerStatus::Stopped)
        })
    }

    fn create(&self, server: &Server) -> Result<Outcome, ActionError> {
        let credential = self.credential_for(server, ServerAction::Create)?;
        self.install(server, credential.as_ref())?;
        Ok(Outcome::status(ServerStatus::Stopped))
    }

    /// Write the descriptor and log file if missing or out of date, and clear
    /// descriptors left at other locations. Returns the descriptor path.
    fn install(&self, server: &Server, credential: Option<&Credential>) -> Result<PathBuf, ActionError> {
        let path = self.config.daemon_file(server);
        let descriptor = descriptor_from_server(server);
        let privilege = self.privilege_for_path(&path, credential);

        let current = DaemonDescriptor::from_file(&path).ok();
        if current.as_ref() != Some(&descriptor) {
            log::info!("Writing {}", path.display());
            if let Some(dir) = path.parent() {
                self.files.create_dir(dir, None, privilege)?;
            }
            self.files.create_plist_file(&path, &descriptor, None, privilege)?;
        }

        self.install_log(server, credential)?;
        self.remove_stale_descriptors(server, &path, credential)?;
        Ok(path)
    }

    fn install_log(&self, server: &Server, credential: Option<&Credential>) -> Result<(), ActionError> {
        let settings = server.settings();
        let log_file = Path::new(&settings.log_file);
        let owner = User::from_name(&settings.username, self.current());
        let privilege = if settings.has_different_user(self.current()) {
            Privilege::from_credential(credential)
        } else {
            self.privilege_for_path(log_file, credential)
        };
        if let Some(dir) = log_file.parent() {
            self.files.create_dir(dir, owner.as_ref(), privilege)?;
        }
        self.files.touch(log_file, owner.as_ref(), privilege)?;
        Ok(())
    }

    fn remove_stale_descriptors(
        &self,
        server: &Server,
        keep: &Path,
        credential: Option<&Credential>,
    ) -> Result<(), ActionError> {
        for path in self.config.daemon_files(server) {
            if path == keep || self.files.type_of(&path) == FileType::None {
                continue;
            }
            let privilege = self.privilege_for_path(&path, credential);
            let scope = Scope::for_all_users(!path.starts_with(&self.config.home_dir));
            if let Err(e) = self.services.unload_unit(&server.daemon_name(), scope, privilege) {
                log::warn!("Cannot unload stale {}: {}", path.display(), e);
            }
            log::info!("Removing stale {}", path.display());
            self.files.remove(&path, privilege)?;
        }
        Ok(())
    }
}
