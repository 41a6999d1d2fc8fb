//! Discovery of PostgreSQL installations and running servers

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auth::Credential;
use crate::config::{descriptor_file_name, Config};
use crate::controller::convert::{server_from_descriptor, server_from_process};
use crate::files::{type_of, FileType};
use crate::launchd::{LaunchdError, Scope, ServiceManager};
use crate::process::{Privilege, ProcessRunner};
use crate::server::{Server, ServerSettings, Startup};

/// Where installers put the `postgres` binary
pub const INSTALL_PATTERNS: [&str; 5] = [
    "/Library/PostgreSQL/*/bin/postgres",
    "/usr/local/pgsql/bin/postgres",
    "/usr/local/opt/postgresql*/bin/postgres",
    "/opt/homebrew/opt/postgresql*/bin/postgres",
    "/Applications/Postgres.app/Contents/Versions/*/bin/postgres",
];

/// Label pattern for launchd jobs that may be PostgreSQL servers
const UNIT_PATTERN: &str = "*postgres*";

pub trait SearchDelegate: Send + Sync {
    fn did_find_more_servers(&self, servers: &[Server]);
    fn did_finish_search(&self) {}
}

pub struct Discovery {
    config: Config,
    services: Arc<dyn ServiceManager>,
    runner: Arc<dyn ProcessRunner>,
}

impl Discovery {
    pub fn new(config: Config, services: Arc<dyn ServiceManager>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            config,
            services,
            runner,
        }
    }

    /// Candidate servers for every installed `postgres` binary whose bin
    /// directory is not used by `known` yet.
    ///
    /// The search runs on a blocking thread; `delegate` hears about the
    /// results before this returns.
    pub async fn find_installed(&self, known: &[Server], delegate: Arc<dyn SearchDelegate>) -> Vec<Server> {
        let root = self.config.system_root.clone();
        let known_bins: HashSet<String> = known
            .iter()
            .map(|s| s.settings().bin_directory.clone())
            .collect();

        let binaries = tokio::task::spawn_blocking(move || glob_installed(&root))
            .await
            .unwrap_or_else(|e| {
                log::warn!("Installation search failed: {}", e);
                Vec::new()
            });

        let servers: Vec<Server> = binaries
            .iter()
            .filter_map(|binary| self.candidate(binary))
            .filter(|s| !known_bins.contains(&s.settings().bin_directory))
            .collect();
        log::info!("Found {} installed servers", servers.len());
        if !servers.is_empty() {
            delegate.did_find_more_servers(&servers);
        }
        delegate.did_finish_search();
        servers
    }

    fn candidate(&self, binary: &Path) -> Option<Server> {
        let bin_dir = binary.parent()?;
        let install_dir = bin_dir.parent()?;
        let name = install_dir
            .file_name()
            .map(|n| format!("PostgreSQL {}", n.to_string_lossy()))?;
        let mut server = Server::new(name, self.config.domain.clone());
        let settings = ServerSettings::new(
            self.config.current_user.name.clone(),
            bin_dir.to_string_lossy(),
            install_dir.join("data").to_string_lossy(),
            self.config.daemon_log(&server, false).to_string_lossy(),
            "5432",
            Startup::Manual,
        );
        server.set_settings(settings);
        server.revert();
        Some(server)
    }

    /// Servers loaded in launchd or running as processes that are not in
    /// `known`. Without a credential only the user context is searched.
    pub fn find_started(&self, known: &[Server], credential: Option<&Credential>) -> Result<Vec<Server>, LaunchdError> {
        let mut labels: HashSet<String> = known.iter().map(Server::daemon_name).collect();
        let mut data_dirs: HashSet<String> = known
            .iter()
            .map(|s| s.settings().data_directory.clone())
            .filter(|d| !d.is_empty())
            .collect();
        let mut found = Vec::new();

        let mut scopes = vec![(Scope::User, Privilege::Unprivileged)];
        if credential.is_some() || self.config.current_user.is_root_user {
            scopes.insert(0, (Scope::System, Privilege::from_credential(credential)));
        }

        for (scope, privilege) in scopes {
            for label in self.services.list_units(UNIT_PATTERN, scope, privilege)? {
                if labels.contains(&label) {
                    continue;
                }
                let Some(unit) = self.services.get_unit(&label, scope, privilege)? else {
                    continue;
                };
                let is_postgres = unit
                    .descriptor
                    .executable()
                    .is_some_and(|e| Path::new(e).file_name().is_some_and(|n| n == "postgres"));
                if !is_postgres {
                    continue;
                }
                let path = self.descriptor_path(&label, scope);
                let mut server = server_from_descriptor(&unit.descriptor, path.as_deref(), Some(scope), &self.config);
                server.set_pid(unit.pid);
                log::debug!("Found loaded server {}", label);
                labels.insert(label);
                data_dirs.insert(server.settings().data_directory.clone());
                found.push(server);
            }
        }

        for process in self.runner.list_processes(UNIT_PATTERN)? {
            let Some(server) = server_from_process(&process, &self.config.domain) else {
                continue;
            };
            if data_dirs.insert(server.settings().data_directory.clone()) {
                log::debug!("Found running server {} (pid {})", server.name(), process.pid);
                found.push(server);
            }
        }
        Ok(found)
    }

    /// Where a loaded job's descriptor lives, if it is in a standard location.
    /// System agents may show up in either context.
    fn descriptor_path(&self, label: &str, scope: Scope) -> Option<PathBuf> {
        let file = descriptor_file_name(label);
        let dirs = match scope {
            Scope::System => vec![
                self.config.daemon_dir_for_all_users_at_boot(),
                self.config.daemon_dir_for_all_users_at_login(),
            ],
            Scope::User => vec![
                self.config.daemon_dir_for_current_user(),
                self.config.daemon_dir_for_all_users_at_login(),
            ],
        };
        dirs.into_iter()
            .map(|d| d.join(&file))
            .find(|p| type_of(p) == FileType::File)
    }
}

fn glob_installed(root: &Path) -> Vec<PathBuf> {
    let mut binaries = Vec::new();
    for pattern in INSTALL_PATTERNS {
        let full = root.join(pattern.trim_start_matches('/'));
        let Some(full) = full.to_str() else {
            continue;
        };
        match glob::glob(full) {
            Ok(paths) => binaries.extend(paths.flatten().filter(|p| p.is_file())),
            Err(e) => log::warn!("Bad search pattern {}: {}", full, e),
        }
    }
    binaries
}
