//! Add a server

use std::path::PathBuf;

use pgprefs::{ServerSettings, SettingField, Startup};

use super::controller;

pub struct AddOptions {
    pub name: String,
    pub username: Option<String>,
    pub bin: PathBuf,
    pub data: PathBuf,
    pub log: Option<PathBuf>,
    pub port: String,
    pub startup: Startup,
}

pub async fn add(options: AddOptions) -> Result<(), Box<dyn std::error::Error>> {
    let controller = controller().await?;
    let id = controller.add_server().await;
    controller.rename_server(id, &options.name).await?;

    let server = controller.server(id).await.ok_or("Server vanished")?;
    let mut settings = ServerSettings {
        startup: options.startup,
        ..server.dirty_settings().clone()
    };
    if let Some(username) = &options.username {
        settings.set(SettingField::Username, username);
    }
    settings.set(SettingField::BinDirectory, &options.bin.to_string_lossy());
    settings.set(SettingField::DataDirectory, &options.data.to_string_lossy());
    if let Some(log) = &options.log {
        settings.set(SettingField::LogFile, &log.to_string_lossy());
    }
    settings.set(SettingField::Port, &options.port);
    controller.set_dirty_settings(id, settings).await?;

    let validity = controller.validate_server_settings(id).await?;
    if !validity.is_valid() {
        for field in SettingField::ALL {
            if let Some(reason) = validity.get(field) {
                eprintln!("  {}: {}", field.key(), reason);
            }
        }
        return Err(format!("Invalid settings for {}", options.name).into());
    }

    controller.set_settings(id).await?;
    println!("Added {}", options.name);
    Ok(())
}
