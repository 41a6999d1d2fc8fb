//! Server entity
//!
//! ```text
//!            check status (confirmed absent)
//!     ┌──────────┐  start   ┌──────────┐  ok   ┌─────────┐
//!     │ Stopped  │────────▶│ Starting │──────▶│ Started │
//!     └──────────┘          └────┬─────┘       └────┬────┘
//!          ▲                     │ port clash       │ stop
//!          │                ┌────▼─────┐       ┌────▼─────┐
//!          └────────────────│ Retrying │       │ Stopping │──▶ Stopped
//!                 fail      └──────────┘       └──────────┘
//! ```
//!
//! `Deleting` and `Updating` are transient states of the Delete and Create actions.
//! Every transition is made by the lifecycle controller; the setters here are
//! crate-private for that reason.

mod settings;
mod user;

pub use settings::{ServerSettings, SettingField, SettingsValidity, Startup};
pub use user::User;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default name for a newly added server
pub const DEFAULT_SERVER_NAME: &str = "New Server";

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local server identity, never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(u64);

impl ServerId {
    fn next() -> Self {
        Self(NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derived runtime status of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerStatus {
    #[default]
    Unknown,
    Starting,
    Started,
    Stopping,
    Stopped,
    Deleting,
    Retrying,
    Updating,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Retrying => "retrying",
            Self::Updating => "updating",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle actions run by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    CheckStatus,
    Start,
    Stop,
    Delete,
    Create,
}

impl ServerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckStatus => "check status",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
            Self::Create => "create",
        }
    }

    /// Status shown while the action runs (None for CheckStatus)
    pub fn processing_status(&self) -> Option<ServerStatus> {
        match self {
            Self::CheckStatus => None,
            Self::Start => Some(ServerStatus::Starting),
            Self::Stop => Some(ServerStatus::Stopping),
            Self::Delete => Some(ServerStatus::Deleting),
            Self::Create => Some(ServerStatus::Updating),
        }
    }
}

impl fmt::Display for ServerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A PostgreSQL server managed through the service manager
#[derive(Debug, Clone)]
pub struct Server {
    id: ServerId,
    name: String,
    domain: String,
    settings: ServerSettings,
    dirty_settings: ServerSettings,
    dirty: bool,
    status: ServerStatus,
    pid: Option<u32>,
    processing: bool,
    error: Option<String>,
    external: bool,
    daemon_loaded_for_all_users: bool,
    /// Descriptor file the server was reconstructed from, if any
    descriptor_path: Option<PathBuf>,
}

impl Server {
    /// Blank server, as created by "add server"
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self::with_settings(name, domain, ServerSettings::default())
    }

    pub fn with_settings(
        name: impl Into<String>,
        domain: impl Into<String>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            id: ServerId::next(),
            name: name.into(),
            domain: domain.into(),
            dirty_settings: settings.clone(),
            settings,
            dirty: false,
            status: ServerStatus::Unknown,
            pid: None,
            processing: false,
            error: None,
            external: false,
            daemon_loaded_for_all_users: false,
            descriptor_path: None,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn short_name(&self) -> &str {
        &self.name
    }

    /// Fully-qualified launchd label, `domain.name`
    pub fn daemon_name(&self) -> String {
        if self.domain.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.domain, self.name)
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn dirty_settings(&self) -> &ServerSettings {
        &self.dirty_settings
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    /// Started or retrying
    pub fn is_started(&self) -> bool {
        matches!(self.status, ServerStatus::Started | ServerStatus::Retrying)
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn daemon_loaded_for_all_users(&self) -> bool {
        self.daemon_loaded_for_all_users
    }

    pub fn descriptor_path(&self) -> Option<&Path> {
        self.descriptor_path.as_deref()
    }

    /// Whether the server belongs in the system-wide launchd context.
    ///
    /// Internal servers: a different username or startup at boot, judged on
    /// the active settings. Pending edits take effect only once applied.
    /// External servers: where the daemon was last seen loaded.
    pub fn daemon_for_all_users(&self, current: &User) -> bool {
        if self.external {
            return self.daemon_loaded_for_all_users;
        }
        self.settings.has_different_user(current) || self.settings.startup == Startup::AtBoot
    }

    pub fn is_editable(&self) -> bool {
        !self.external
    }

    /// External servers can only be started/stopped through their own descriptor
    pub fn is_actionable(&self) -> bool {
        !self.external || self.descriptor_path.is_some()
    }

    pub fn is_saveable(&self) -> bool {
        !self.external
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_settings(&mut self, settings: ServerSettings) {
        self.settings = settings;
        self.recompute_dirty();
    }

    pub(crate) fn set_dirty_settings(&mut self, settings: ServerSettings) {
        self.dirty_settings = settings;
        self.recompute_dirty();
    }

    pub(crate) fn set_dirty_setting(&mut self, field: SettingField, value: &str) {
        self.dirty_settings.set(field, value);
        self.recompute_dirty();
    }

    pub(crate) fn set_dirty_startup(&mut self, startup: Startup) {
        self.dirty_settings.startup = startup;
        self.recompute_dirty();
    }

    /// Validity markers do not take part in equality, so `dirty` is unaffected
    pub(crate) fn set_dirty_validity(&mut self, invalid: SettingsValidity) {
        self.dirty_settings.invalid = invalid;
    }

    /// dirty → active
    pub(crate) fn apply(&mut self) {
        self.settings = self.dirty_settings.clone();
        self.recompute_dirty();
    }

    /// active → dirty
    pub(crate) fn revert(&mut self) {
        self.dirty_settings = self.settings.clone();
        self.recompute_dirty();
    }

    pub(crate) fn set_status(&mut self, status: ServerStatus) {
        self.status = status;
    }

    pub(crate) fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }

    pub(crate) fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    pub(crate) fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub(crate) fn set_external(&mut self, external: bool) {
        self.external = external;
    }

    pub(crate) fn set_daemon_loaded_for_all_users(&mut self, all_users: bool) {
        self.daemon_loaded_for_all_users = all_users;
    }

    pub(crate) fn set_descriptor_path(&mut self, path: Option<PathBuf>) {
        self.descriptor_path = path;
    }

    /// Fresh copy with a new id, not external, same settings
    pub(crate) fn duplicate(&self, name: impl Into<String>) -> Self {
        Self::with_settings(name, self.domain.clone(), self.settings.clone())
    }

    fn recompute_dirty(&mut self) {
        self.dirty = self.settings != self.dirty_settings;
    }
}
