//! Server configuration settings
//!
//! A `ServerSettings` is a plain value: cloning it yields an independent copy.
//! Validity markers are filled in by the controller's validation pass and never
//! take part in equality.

use super::user::User;

/// When the server is started by the service manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Startup {
    #[default]
    Manual,
    AtBoot,
    AtLogin,
}

impl Startup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "Manual",
            Self::AtBoot => "AtBoot",
            Self::AtLogin => "AtLogin",
        }
    }

    /// Case-insensitive; anything unrecognised is Manual
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "atboot" | "boot" => Self::AtBoot,
            "atlogin" | "login" => Self::AtLogin,
            _ => Self::Manual,
        }
    }

    pub fn from_index(i: i64) -> Self {
        match i {
            1 => Self::AtBoot,
            2 => Self::AtLogin,
            _ => Self::Manual,
        }
    }

    pub fn index(&self) -> i64 {
        match self {
            Self::Manual => 0,
            Self::AtBoot => 1,
            Self::AtLogin => 2,
        }
    }
}

/// An editable text field of `ServerSettings`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    Username,
    BinDirectory,
    DataDirectory,
    LogFile,
    Port,
}

impl SettingField {
    pub const ALL: [SettingField; 5] = [
        Self::Username,
        Self::BinDirectory,
        Self::DataDirectory,
        Self::LogFile,
        Self::Port,
    ];

    /// Key used in persisted records
    pub fn key(&self) -> &'static str {
        match self {
            Self::Username => "username",
            Self::BinDirectory => "binDirectory",
            Self::DataDirectory => "dataDirectory",
            Self::LogFile => "logFile",
            Self::Port => "port",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key().eq_ignore_ascii_case(s.trim()))
    }
}

/// Per-field invalid reasons (None = valid)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsValidity {
    pub username: Option<String>,
    pub bin_directory: Option<String>,
    pub data_directory: Option<String>,
    pub log_file: Option<String>,
    pub port: Option<String>,
}

impl SettingsValidity {
    pub fn get(&self, field: SettingField) -> Option<&str> {
        match field {
            SettingField::Username => self.username.as_deref(),
            SettingField::BinDirectory => self.bin_directory.as_deref(),
            SettingField::DataDirectory => self.data_directory.as_deref(),
            SettingField::LogFile => self.log_file.as_deref(),
            SettingField::Port => self.port.as_deref(),
        }
    }

    pub fn set(&mut self, field: SettingField, reason: Option<String>) {
        match field {
            SettingField::Username => self.username = reason,
            SettingField::BinDirectory => self.bin_directory = reason,
            SettingField::DataDirectory => self.data_directory = reason,
            SettingField::LogFile => self.log_file = reason,
            SettingField::Port => self.port = reason,
        }
    }

    pub fn is_valid(&self) -> bool {
        SettingField::ALL.iter().all(|f| self.get(*f).is_none())
    }

    /// First invalid field and its reason
    pub fn first_invalid(&self) -> Option<(SettingField, &str)> {
        SettingField::ALL
            .iter()
            .find_map(|f| self.get(*f).map(|reason| (*f, reason)))
    }
}

/// The bare configuration of a PostgreSQL server
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    pub username: String,
    pub bin_directory: String,
    pub data_directory: String,
    pub log_file: String,
    pub port: String,
    pub startup: Startup,
    pub invalid: SettingsValidity,
}

impl PartialEq for ServerSettings {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.bin_directory == other.bin_directory
            && self.data_directory == other.data_directory
            && self.log_file == other.log_file
            && self.port == other.port
            && self.startup == other.startup
    }
}

impl Eq for ServerSettings {}

impl ServerSettings {
    pub fn new(
        username: impl Into<String>,
        bin_directory: impl Into<String>,
        data_directory: impl Into<String>,
        log_file: impl Into<String>,
        port: impl Into<String>,
        startup: Startup,
    ) -> Self {
        let mut settings = Self {
            username: username.into(),
            log_file: log_file.into(),
            port: port.into(),
            startup,
            ..Default::default()
        };
        settings.set(SettingField::BinDirectory, &bin_directory.into());
        settings.set(SettingField::DataDirectory, &data_directory.into());
        settings
    }

    pub fn get(&self, field: SettingField) -> &str {
        match field {
            SettingField::Username => &self.username,
            SettingField::BinDirectory => &self.bin_directory,
            SettingField::DataDirectory => &self.data_directory,
            SettingField::LogFile => &self.log_file,
            SettingField::Port => &self.port,
        }
    }

    /// Stores the value trimmed. Directories lose any trailing `/`.
    pub fn set(&mut self, field: SettingField, value: &str) {
        let value = value.trim().to_string();
        match field {
            SettingField::Username => self.username = value,
            SettingField::BinDirectory => self.bin_directory = trim_dir(value),
            SettingField::DataDirectory => self.data_directory = trim_dir(value),
            SettingField::LogFile => self.log_file = value,
            SettingField::Port => self.port = value,
        }
    }

    /// True if the server would run as someone other than `current`
    pub fn has_different_user(&self, current: &User) -> bool {
        !self.username.is_empty() && self.username != current.name
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_valid()
    }

    pub fn set_valid(&mut self) {
        self.invalid = SettingsValidity::default();
    }

    /// The `postgres` executable inside the bin directory
    pub fn binary(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.bin_directory).join("postgres")
    }
}

/// `/usr/local/bin/` and `/usr/local/bin` name the same directory; keep the
/// latter so paths derived from it compare equal. `/` stays as it is.
fn trim_dir(dir: String) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() || trimmed.len() == dir.len() {
        return dir;
    }
    trimmed.to_string()
}
