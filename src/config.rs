//! Runtime configuration
//!
//! Everything path-like is derived from `home_dir` and `system_root`, so a test
//! can relocate the whole tree under a temporary directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::server::{Server, ServerSettings, SettingField, User};

pub const DEFAULT_DOMAIN: &str = "org.postgresql.preferences";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot determine the home directory")]
    NoHome,

    #[error("Cannot determine the current user")]
    NoUser,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Label prefix of managed servers
    pub domain: String,
    pub home_dir: PathBuf,
    /// Prefix for system-wide paths (`/` outside tests)
    pub system_root: PathBuf,
    pub current_user: User,
    pub store_file: PathBuf,
    /// Liveness polls after loading a server
    pub start_poll_attempts: u32,
    pub start_poll_interval: Duration,
    /// Polls waiting for a stopped server to go away
    pub stop_poll_attempts: u32,
}

impl Config {
    pub fn new(home_dir: impl Into<PathBuf>, current_user: User) -> Self {
        let home_dir = home_dir.into();
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            store_file: home_dir
                .join("Library/Preferences")
                .join(format!("{}.plist", DEFAULT_DOMAIN)),
            home_dir,
            system_root: PathBuf::from("/"),
            current_user,
            start_poll_attempts: 10,
            start_poll_interval: Duration::from_millis(500),
            stop_poll_attempts: 10,
        }
    }

    /// Defaults for the real user, with `PGPREFS_STORE` and `PGPREFS_DOMAIN` overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
        let user = User::current().ok_or(ConfigError::NoUser)?;
        let mut config = Self::new(home, user);
        if let Some(store) = std::env::var_os("PGPREFS_STORE") {
            config.store_file = PathBuf::from(store);
        }
        if let Ok(domain) = std::env::var("PGPREFS_DOMAIN") {
            if !domain.trim().is_empty() {
                config.domain = domain.trim().to_string();
            }
        }
        log::debug!("Using store {} and domain {}", config.store_file.display(), config.domain);
        Ok(config)
    }

    fn system_path(&self, path: &str) -> PathBuf {
        self.system_root.join(path.trim_start_matches('/'))
    }

    pub fn daemon_dir_for_all_users_at_boot(&self) -> PathBuf {
        self.system_path("/Library/LaunchDaemons")
    }

    pub fn daemon_dir_for_all_users_at_login(&self) -> PathBuf {
        self.system_path("/Library/LaunchAgents")
    }

    pub fn daemon_dir_for_current_user(&self) -> PathBuf {
        self.home_dir.join("Library/LaunchAgents")
    }

    pub fn log_dir_for_all_users(&self) -> PathBuf {
        self.system_path("/Library/Logs/PostgreSQL")
    }

    pub fn log_dir_for_current_user(&self) -> PathBuf {
        self.home_dir.join("Library/Logs/PostgreSQL")
    }

    /// Every directory a descriptor may live in
    pub fn daemon_dirs(&self) -> [PathBuf; 3] {
        [
            self.daemon_dir_for_all_users_at_boot(),
            self.daemon_dir_for_all_users_at_login(),
            self.daemon_dir_for_current_user(),
        ]
    }

    /// Descriptor path implied by the server's active settings
    pub fn daemon_file(&self, server: &Server) -> PathBuf {
        let dir = if server.settings().startup == crate::server::Startup::AtBoot {
            self.daemon_dir_for_all_users_at_boot()
        } else if server.daemon_for_all_users(&self.current_user) {
            self.daemon_dir_for_all_users_at_login()
        } else {
            self.daemon_dir_for_current_user()
        };
        dir.join(descriptor_file_name(&server.daemon_name()))
    }

    /// Descriptor paths for every scope, whether or not they exist
    pub fn daemon_files(&self, server: &Server) -> Vec<PathBuf> {
        let name = descriptor_file_name(&server.daemon_name());
        self.daemon_dirs().iter().map(|d| d.join(&name)).collect()
    }

    pub fn daemon_log(&self, server: &Server, all_users: bool) -> PathBuf {
        let dir = if all_users {
            self.log_dir_for_all_users()
        } else {
            self.log_dir_for_current_user()
        };
        dir.join(format!("{}.log", server.name()))
    }

    /// Whether a descriptor path is in the boot-time daemon directory
    pub fn is_boot_daemon_path(&self, path: &Path) -> bool {
        path.parent() == Some(self.daemon_dir_for_all_users_at_boot().as_path())
    }

    pub fn is_current_user_path(&self, path: &Path) -> bool {
        path.parent() == Some(self.daemon_dir_for_current_user().as_path())
    }

    /// `~` and `~/...` resolve against `home_dir`; anything else is returned
    /// unchanged. `~user` is not supported.
    pub fn expand_path(&self, path: &str) -> String {
        match path.trim().strip_prefix('~') {
            Some("") => self.home_dir.to_string_lossy().into_owned(),
            Some(rest) if rest.starts_with('/') => self
                .home_dir
                .join(rest.trim_start_matches('/'))
                .to_string_lossy()
                .into_owned(),
            _ => path.to_string(),
        }
    }

    /// Copy of `settings` with every path expanded
    pub fn resolve_settings(&self, settings: &ServerSettings) -> ServerSettings {
        let mut resolved = settings.clone();
        for field in [SettingField::BinDirectory, SettingField::DataDirectory, SettingField::LogFile] {
            resolved.set(field, &self.expand_path(settings.get(field)));
        }
        resolved
    }

    /// Copy of `server` whose active settings have every path expanded. The
    /// registry and the store keep the paths as entered.
    pub fn resolve_server(&self, server: &Server) -> Server {
        let mut resolved = server.clone();
        resolved.set_settings(self.resolve_settings(server.settings()));
        resolved
    }
}

pub fn descriptor_file_name(label: &str) -> String {
    format!("{}.plist", label)
}
