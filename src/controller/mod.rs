//! Server lifecycle controller
//!
//! Owns the registry of servers and runs the five lifecycle actions against
//! them. Two execution contexts are involved:
//!
//! - the coordination context: whichever task holds the registry's write lock.
//!   All server mutation and every delegate notification happens there.
//! - a blocking worker (`spawn_blocking`) that does the OS work for one action
//!   against a snapshot of the server. Credential prompts block this thread only.
//!
//! At most one action runs per server; a second request while one is in flight
//! is rejected with `ActionError::Busy`.

pub mod convert;
mod validate;
mod worker;

pub use validate::validate_settings;
pub use worker::Outcome;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::auth::{AuthError, AuthReason, PrivilegeBroker, Rights};
use crate::config::Config;
use crate::discovery::Discovery;
use crate::files::{FileAccess, FileError};
use crate::launchd::{LaunchdError, ServiceManager};
use crate::process::{ProcessRunner, RunError};
use crate::server::{
    Server, ServerAction, ServerId, ServerSettings, ServerStatus, SettingField, SettingsValidity, Startup,
    DEFAULT_SERVER_NAME,
};
use crate::store::{ServerStore, StoreError};
use worker::Backend;

/// Receives lifecycle notifications, always from the coordination context.
///
/// For one action the order is `will_run_action`, then `did_run_action`, then
/// exactly one of `did_succeed_action` / `did_fail_action`. `did_change_status`
/// may be interleaved whenever the status changes.
pub trait ServerDelegate: Send + Sync {
    fn did_change_status(&self, _server: &Server) {}
    fn will_run_action(&self, _server: &Server, _action: ServerAction) {}
    fn did_run_action(&self, _server: &Server, _action: ServerAction) {}
    fn did_succeed_action(&self, _server: &Server, _action: ServerAction) {}
    fn did_fail_action(&self, _server: &Server, _action: ServerAction, _error: &ActionError) {}
}

/// Delegate that ignores everything
pub struct NullDelegate;

impl ServerDelegate for NullDelegate {}

/// Decides whether a failed start is worth one more attempt
pub type RetryPredicate = Arc<dyn Fn(&ActionError) -> bool + Send + Sync>;

/// Messages postgres logs when its port is still held by a previous instance
const PORT_CLASH_MESSAGES: [&str; 2] = ["Address already in use", "could not create any TCP/IP sockets"];

pub fn default_retry_predicate() -> RetryPredicate {
    Arc::new(|error: &ActionError| {
        let message = error.to_string();
        PORT_CLASH_MESSAGES.iter().any(|m| message.contains(m))
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("No server with id {0}")]
    NotFound(ServerId),

    #[error("{0} is busy")]
    Busy(String),

    #[error("Invalid {}: {reason}", .field.key())]
    Invalid { field: SettingField, reason: String },

    #[error("{0} has unsaved changes")]
    Dirty(String),

    #[error("{0} was not created here and cannot be changed")]
    External(String),

    #[error("{0} is managed here; delete it instead")]
    Managed(String),

    #[error("{0} cannot be started or stopped here")]
    NotActionable(String),

    #[error("A server named {0} already exists")]
    NameTaken(String),

    #[error("{name} did not start{}", log_suffix(.log))]
    NotStarted { name: String, log: String },

    #[error("{0} did not stop")]
    NotStopped(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Launchd(#[from] LaunchdError),

    #[error(transparent)]
    Files(#[from] FileError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Action worker failed: {0}")]
    Worker(String),
}

fn log_suffix(log: &str) -> String {
    if log.is_empty() {
        String::new()
    } else {
        format!(":\n{}", log)
    }
}

impl ActionError {
    /// Rejected before any OS work was attempted
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Invalid { .. } | Self::Dirty(_) | Self::External(_) | Self::NotActionable(_) | Self::NameTaken(_)
        )
    }

    pub fn auth_error(&self) -> Option<&AuthError> {
        match self {
            Self::Auth(e) | Self::Run(RunError::Auth(e)) => Some(e),
            Self::Launchd(e) => e.auth_error(),
            Self::Files(e) => e.auth_error(),
            _ => None,
        }
    }

    /// The broker's credential should be dropped
    pub fn is_auth_stale(&self) -> bool {
        self.auth_error().is_some_and(AuthError::invalidates_credential)
    }
}

#[derive(Default)]
struct Registry {
    servers: Vec<Server>,
    /// Servers with an action in flight, including CheckStatus
    busy: HashSet<ServerId>,
    /// Created here but never saved, so absent from the store
    unsaved: HashSet<ServerId>,
}

impl Registry {
    fn get(&self, id: ServerId) -> Result<&Server, ActionError> {
        self.servers
            .iter()
            .find(|s| s.id() == id)
            .ok_or(ActionError::NotFound(id))
    }

    fn get_mut(&mut self, id: ServerId) -> Result<&mut Server, ActionError> {
        self.servers
            .iter_mut()
            .find(|s| s.id() == id)
            .ok_or(ActionError::NotFound(id))
    }

    fn name_taken(&self, name: &str, except: Option<ServerId>) -> bool {
        self.servers
            .iter()
            .any(|s| s.name() == name && Some(s.id()) != except)
    }

    fn push_unsaved(&mut self, server: Server) -> ServerId {
        let id = server.id();
        self.unsaved.insert(id);
        self.servers.push(server);
        id
    }

    /// Forget unsaved markers of servers no longer in the registry
    fn prune_unsaved(&mut self) {
        let Registry { servers, unsaved, .. } = self;
        unsaved.retain(|id| servers.iter().any(|s| s.id() == *id));
    }

    /// `base`, or `base (n)` for the first free n
    fn unique_name(&self, base: &str) -> String {
        if !self.name_taken(base, None) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{} ({})", base, n))
            .find(|name| !self.name_taken(name, None))
            .unwrap_or_else(|| base.to_string())
    }
}

pub struct ServerController {
    backend: Arc<Backend>,
    delegate: Arc<dyn ServerDelegate>,
    retry: RetryPredicate,
    registry: RwLock<Registry>,
}

impl ServerController {
    pub fn new(
        config: Config,
        runner: Arc<dyn ProcessRunner>,
        services: Arc<dyn ServiceManager>,
        store: Arc<dyn ServerStore>,
        broker: Arc<PrivilegeBroker>,
        delegate: Arc<dyn ServerDelegate>,
    ) -> Self {
        let files = FileAccess::new(runner.clone(), config.current_user.clone());
        Self {
            backend: Arc::new(Backend {
                config,
                broker,
                runner,
                services,
                files,
                store,
            }),
            delegate,
            retry: default_retry_predicate(),
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn with_retry_predicate(mut self, retry: RetryPredicate) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.backend.config
    }

    /// Rights needed for every privileged operation, for pre-authorizing
    pub fn authorization_rights(&self) -> Rights {
        self.backend.rights()
    }

    /// Obtain a credential covering every action ahead of time. Blocks a worker
    /// thread while the delegate prompts.
    pub async fn preauthorize(&self, reason: AuthReason) -> Result<(), ActionError> {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.broker.authorize(&backend.rights(), &reason))
            .await
            .map_err(|e| ActionError::Worker(e.to_string()))??;
        Ok(())
    }

    pub fn discovery(&self) -> Discovery {
        Discovery::new(
            self.backend.config.clone(),
            self.backend.services.clone(),
            self.backend.runner.clone(),
        )
    }

    pub async fn servers(&self) -> Vec<Server> {
        self.registry.read().await.servers.clone()
    }

    pub async fn server(&self, id: ServerId) -> Option<Server> {
        self.registry.read().await.get(id).ok().cloned()
    }

    pub async fn server_named(&self, name: &str) -> Option<Server> {
        self.registry
            .read()
            .await
            .servers
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Replace the registry with the stored servers. Servers with an action in
    /// flight, and servers added but not saved yet, are kept as they are.
    pub async fn load_servers(&self) -> Result<(), ActionError> {
        let store = self.backend.store.clone();
        let stored = tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| ActionError::Worker(e.to_string()))??;
        let mut registry = self.registry.write().await;
        merge(&mut registry, stored, false);
        log::debug!("Loaded {} servers", registry.servers.len());
        Ok(())
    }

    /// Reload the store and add servers found running that are not known yet
    pub async fn refresh_servers(&self) -> Result<(), ActionError> {
        let store = self.backend.store.clone();
        let discovery = self.discovery();
        let credential = self.backend.broker.credential();
        let found = tokio::task::spawn_blocking(move || {
            let stored = store.load()?;
            let started = discovery.find_started(&stored, credential.as_ref())?;
            Ok::<_, ActionError>((stored, started))
        })
        .await
        .map_err(|e| ActionError::Worker(e.to_string()))?;
        let (mut servers, started) = found?;
        servers.extend(started);

        let mut registry = self.registry.write().await;
        merge(&mut registry, servers, true);
        Ok(())
    }

    pub async fn add_server(&self) -> ServerId {
        let mut registry = self.registry.write().await;
        let name = registry.unique_name(DEFAULT_SERVER_NAME);
        let mut server = Server::new(name, self.backend.config.domain.clone());
        let mut settings = ServerSettings {
            username: self.backend.config.current_user.name.clone(),
            port: "5432".to_string(),
            ..Default::default()
        };
        settings.log_file = self
            .backend
            .config
            .daemon_log(&server, false)
            .to_string_lossy()
            .into_owned();
        server.set_settings(settings);
        server.revert();
        log::info!("Added {}", server.name());
        registry.push_unsaved(server)
    }

    pub async fn add_server_with_settings(&self, name: &str, settings: ServerSettings) -> ServerId {
        let mut registry = self.registry.write().await;
        let name = registry.unique_name(name);
        let server = Server::with_settings(name, self.backend.config.domain.clone(), settings);
        registry.push_unsaved(server)
    }

    pub async fn duplicate_server(&self, id: ServerId) -> Result<ServerId, ActionError> {
        let mut registry = self.registry.write().await;
        let original = registry.get(id)?;
        let name = registry.unique_name(original.name());
        let copy = original.duplicate(name);
        Ok(registry.push_unsaved(copy))
    }

    /// Rename, moving the store record if the server was saved
    pub async fn rename_server(&self, id: ServerId, name: &str) -> Result<(), ActionError> {
        let name = name.trim();
        let mut registry = self.registry.write().await;
        if registry.get(id)?.name() == name {
            return Ok(());
        }
        if registry.name_taken(name, Some(id)) || self.backend.store.contains(name) {
            return Err(ActionError::NameTaken(name.to_string()));
        }
        if registry.busy.contains(&id) {
            return Err(ActionError::Busy(registry.get(id)?.name().to_string()));
        }
        let server = registry.get_mut(id)?;
        if !server.is_editable() {
            return Err(ActionError::External(server.name().to_string()));
        }
        let old = server.name().to_string();
        server.set_name(name);
        let saved = self.backend.store.contains(&old);
        if saved {
            self.backend.store.remove(&old)?;
            self.backend.store.save(server)?;
        }
        drop(registry);
        log::info!("Renamed {} to {}", old, name);
        if saved {
            self.synchronize_store().await?;
        }
        Ok(())
    }

    /// Drop every saved server from the store and the registry. No OS state
    /// is touched.
    pub async fn remove_all_servers(&self) -> Result<(), ActionError> {
        let mut registry = self.registry.write().await;
        let removable: Vec<String> = registry
            .servers
            .iter()
            .filter(|s| !s.is_external() && !registry.busy.contains(&s.id()))
            .map(|s| s.name().to_string())
            .collect();
        for name in &removable {
            self.backend.store.remove(name)?;
        }

        let Registry { servers, busy, .. } = &mut *registry;
        servers.retain(|s| s.is_external() || busy.contains(&s.id()));
        registry.prune_unsaved();
        drop(registry);
        log::info!("Removed {} servers", removable.len());
        self.synchronize_store().await
    }

    /// Drop an external server from the registry
    pub async fn forget(&self, id: ServerId) -> Result<(), ActionError> {
        let mut registry = self.registry.write().await;
        let server = registry.get(id)?;
        if !server.is_external() {
            return Err(ActionError::Managed(server.name().to_string()));
        }
        if registry.busy.contains(&id) {
            return Err(ActionError::Busy(server.name().to_string()));
        }
        registry.servers.retain(|s| s.id() != id);
        Ok(())
    }

    async fn edit<F>(&self, id: ServerId, f: F) -> Result<(), ActionError>
    where
        F: FnOnce(&mut Server),
    {
        let mut registry = self.registry.write().await;
        let server = registry.get_mut(id)?;
        if !server.is_editable() {
            return Err(ActionError::External(server.name().to_string()));
        }
        f(server);
        Ok(())
    }

    pub async fn set_dirty_setting(&self, id: ServerId, field: SettingField, value: &str) -> Result<(), ActionError> {
        self.edit(id, |s| s.set_dirty_setting(field, value)).await
    }

    pub async fn set_dirty_settings(&self, id: ServerId, settings: ServerSettings) -> Result<(), ActionError> {
        self.edit(id, |s| s.set_dirty_settings(settings)).await
    }

    pub async fn set_startup(&self, id: ServerId, startup: Startup) -> Result<(), ActionError> {
        self.edit(id, |s| s.set_dirty_startup(startup)).await
    }

    /// Mark each pending setting valid or invalid, and return the markers
    pub async fn validate_server_settings(&self, id: ServerId) -> Result<SettingsValidity, ActionError> {
        let mut registry = self.registry.write().await;
        let server = registry.get_mut(id)?;
        let validity = validate_settings(server.dirty_settings(), &self.backend.config);
        server.set_dirty_validity(validity.clone());
        Ok(validity)
    }

    /// Apply pending settings and persist them
    pub async fn set_settings(&self, id: ServerId) -> Result<(), ActionError> {
        let mut registry = self.registry.write().await;
        let server = registry.get_mut(id)?;
        if !server.is_saveable() {
            return Err(ActionError::External(server.name().to_string()));
        }
        let validity = validate_settings(server.dirty_settings(), &self.backend.config);
        server.set_dirty_validity(validity.clone());
        if let Some((field, reason)) = validity.first_invalid() {
            return Err(ActionError::Invalid {
                field,
                reason: reason.to_string(),
            });
        }
        server.apply();
        self.backend.store.save(server)?;
        log::info!("Saved settings of {}", server.name());
        registry.unsaved.remove(&id);
        drop(registry);
        self.synchronize_store().await
    }

    /// Flush the store on a blocking thread, outside the registry lock
    async fn synchronize_store(&self) -> Result<(), ActionError> {
        let store = self.backend.store.clone();
        tokio::task::spawn_blocking(move || store.synchronize())
            .await
            .map_err(|e| ActionError::Worker(e.to_string()))??;
        Ok(())
    }

    /// Discard pending settings
    pub async fn clean(&self, id: ServerId) -> Result<(), ActionError> {
        let mut registry = self.registry.write().await;
        registry.get_mut(id)?.revert();
        Ok(())
    }

    /// Whether CheckStatus can run without prompting for a credential
    pub async fn should_check_status(&self, id: ServerId) -> bool {
        let registry = self.registry.read().await;
        let Ok(server) = registry.get(id) else {
            return false;
        };
        if !server.is_actionable() || registry.busy.contains(&id) {
            return false;
        }
        let current = &self.backend.config.current_user;
        current.is_root_user
            || !server.daemon_for_all_users(current)
            || self.backend.broker.is_authorized(&self.backend.rights())
    }

    /// Run `action` on server `id` and wait for it to finish.
    ///
    /// The delegate sees the whole notification sequence unless the server is
    /// unknown or busy, in which case nothing is notified.
    pub async fn run_action(&self, action: ServerAction, id: ServerId) -> Result<(), ActionError> {
        let (snapshot, previous) = {
            let mut registry = self.registry.write().await;
            let busy = registry.busy.contains(&id);
            let server = registry.get_mut(id)?;
            if busy {
                log::debug!("Rejecting {} on {}: busy", action, server.name());
                return Err(ActionError::Busy(server.name().to_string()));
            }

            self.delegate.will_run_action(server, action);
            if let Err(e) = self.precheck(server, action) {
                log::warn!("Cannot {} {}: {}", action, server.name(), e);
                server.set_error(Some(e.to_string()));
                self.delegate.did_run_action(server, action);
                self.delegate.did_fail_action(server, action, &e);
                return Err(e);
            }

            let previous = server.status();
            if let Some(status) = action.processing_status() {
                server.set_processing(true);
                server.set_status(status);
                self.delegate.did_change_status(server);
            }
            let snapshot = server.clone();
            registry.busy.insert(id);
            (snapshot, previous)
        };

        let mut result = self.execute(action, snapshot.clone()).await;
        if action == ServerAction::Start {
            if let Err(e) = &result {
                if (self.retry)(e) {
                    log::warn!("Retrying start of {}: {}", snapshot.name(), e);
                    self.set_status(id, ServerStatus::Retrying).await;
                    result = self.execute(action, snapshot.clone()).await;
                }
            }
        }

        if let Err(e) = &result {
            if let Some(auth) = e.auth_error() {
                self.backend.broker.invalidate(auth);
            }
        }
        self.finish(action, id, previous, result).await
    }

    fn precheck(&self, server: &mut Server, action: ServerAction) -> Result<(), ActionError> {
        let name = || server.name().to_string();
        match action {
            ServerAction::CheckStatus => return Ok(()),
            ServerAction::Delete | ServerAction::Create if !server.is_editable() => {
                return Err(ActionError::External(name()));
            }
            ServerAction::Start | ServerAction::Stop if !server.is_actionable() => {
                return Err(ActionError::NotActionable(name()));
            }
            ServerAction::Stop | ServerAction::Delete => return Ok(()),
            _ => {}
        }
        if !server.is_editable() {
            return Ok(());
        }
        // Start and Create only ever use saved settings
        if server.is_dirty() {
            return Err(ActionError::Dirty(name()));
        }
        let validity = validate_settings(server.settings(), &self.backend.config);
        server.set_dirty_validity(validity.clone());
        match validity.first_invalid() {
            Some((field, reason)) => Err(ActionError::Invalid {
                field,
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn execute(&self, action: ServerAction, server: Server) -> Result<Outcome, ActionError> {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.run(action, &server))
            .await
            .map_err(|e| ActionError::Worker(e.to_string()))?
    }

    async fn set_status(&self, id: ServerId, status: ServerStatus) {
        let mut registry = self.registry.write().await;
        if let Ok(server) = registry.get_mut(id) {
            server.set_status(status);
            self.delegate.did_change_status(server);
        }
    }

    async fn finish(
        &self,
        action: ServerAction,
        id: ServerId,
        previous: ServerStatus,
        result: Result<Outcome, ActionError>,
    ) -> Result<(), ActionError> {
        let mut registry = self.registry.write().await;
        registry.busy.remove(&id);
        let server = registry.get_mut(id)?;
        server.set_processing(false);

        match result {
            Ok(outcome) => {
                log::info!("{} {}: {}", action, server.name(), outcome.status);
                server.set_status(outcome.status);
                server.set_pid(outcome.pid);
                server.set_error(None);
                if let Some(all_users) = outcome.loaded_for_all_users {
                    server.set_daemon_loaded_for_all_users(all_users);
                }
                self.delegate.did_change_status(server);
                self.delegate.did_run_action(server, action);
                self.delegate.did_succeed_action(server, action);
                if outcome.removed {
                    registry.servers.retain(|s| s.id() != id);
                    registry.unsaved.remove(&id);
                }
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to {} {}: {}", action, server.name(), e);
                server.set_status(failure_status(action, previous, &e));
                server.set_error(Some(e.to_string()));
                self.delegate.did_change_status(server);
                self.delegate.did_run_action(server, action);
                self.delegate.did_fail_action(server, action, &e);
                Err(e)
            }
        }
    }
}

/// Status after a failed action. A refused credential leaves the server as
/// it was.
fn failure_status(action: ServerAction, previous: ServerStatus, error: &ActionError) -> ServerStatus {
    match action {
        ServerAction::CheckStatus => ServerStatus::Unknown,
        _ if error.auth_error().is_some() => previous,
        ServerAction::Start => ServerStatus::Stopped,
        ServerAction::Stop => ServerStatus::Started,
        ServerAction::Delete | ServerAction::Create => previous,
    }
}

/// Bring the registry in line with `incoming`, keeping the identity and runtime
/// state of servers already present. Busy and unsaved servers are never dropped.
fn merge(registry: &mut Registry, incoming: Vec<Server>, keep_external: bool) {
    let mut servers = Vec::with_capacity(incoming.len());
    for server in incoming {
        let existing = registry
            .servers
            .iter()
            .position(|s| s.daemon_name() == server.daemon_name());
        match existing {
            Some(i) => {
                let mut current = registry.servers.swap_remove(i);
                registry.unsaved.remove(&current.id());
                if !current.is_dirty() && !server.is_external() && !registry.busy.contains(&current.id()) {
                    current.set_settings(server.settings().clone());
                    current.revert();
                    current.set_external(false);
                }
                servers.push(current);
            }
            None => {
                if keep_external || !server.is_external() {
                    servers.push(server);
                }
            }
        }
    }
    let Registry { servers: previous, busy, unsaved } = &mut *registry;
    servers.extend(
        previous
            .drain(..)
            .filter(|s| busy.contains(&s.id()) || unsaved.contains(&s.id())),
    );
    registry.servers = servers;
    registry.prune_unsaved();
}
