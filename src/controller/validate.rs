//! Settings validation. Never fails; problems are reported per field.

use std::path::Path;

use crate::config::Config;
use crate::files::{type_of, FileType};
use crate::server::{ServerSettings, SettingField, SettingsValidity, User};

/// Paths are checked after `~` expansion
pub fn validate_settings(settings: &ServerSettings, config: &Config) -> SettingsValidity {
    let settings = config.resolve_settings(settings);
    let mut validity = SettingsValidity::default();
    validity.set(
        SettingField::Username,
        check_username(&settings.username, &config.current_user),
    );
    validity.set(SettingField::BinDirectory, check_dir(&settings.bin_directory));
    validity.set(SettingField::DataDirectory, check_dir(&settings.data_directory));
    validity.set(SettingField::LogFile, check_log_file(&settings.log_file));
    validity.set(SettingField::Port, check_port(&settings.port));
    validity
}

fn check_username(username: &str, current: &User) -> Option<String> {
    if username.trim().is_empty() {
        return Some("Username is required".into());
    }
    if User::from_name(username, current).is_none() {
        return Some(format!("No such user {:?}", username));
    }
    None
}

/// Nearest existing ancestor of `path`, itself included
fn existing_ancestor(path: &Path) -> Option<(&Path, FileType)> {
    path.ancestors()
        .map(|p| (p, type_of(p)))
        .find(|(_, kind)| *kind != FileType::None)
}

/// Absolute, and either an existing directory or creatable below one
fn check_dir(dir: &str) -> Option<String> {
    if dir.trim().is_empty() {
        return Some("Directory is required".into());
    }
    let path = Path::new(dir);
    if !path.is_absolute() {
        return Some(format!("{} is not an absolute path", dir));
    }
    match existing_ancestor(path) {
        Some((_, FileType::Dir)) => None,
        Some((p, _)) if p == path => Some(format!("{} is not a directory", dir)),
        Some((p, _)) => Some(format!("{} cannot be created: {} is a file", dir, p.display())),
        None => Some(format!("{} cannot be created", dir)),
    }
}

fn check_log_file(file: &str) -> Option<String> {
    if file.trim().is_empty() {
        return Some("Log file is required".into());
    }
    let path = Path::new(file);
    if !path.is_absolute() {
        return Some(format!("{} is not an absolute path", file));
    }
    match type_of(path) {
        FileType::File => None,
        FileType::Dir => Some(format!("{} is a directory", file)),
        FileType::None => path.parent().and_then(|parent| {
            check_dir(&parent.to_string_lossy()).map(|_| format!("{} cannot be created", file))
        }),
    }
}

fn check_port(port: &str) -> Option<String> {
    match port.trim().parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => None,
        Ok(p) => Some(format!("Port {} is out of range", p)),
        Err(_) => Some(format!("{:?} is not a port number", port)),
    }
}
