//! Conversions between servers and their external representations:
//! launchd descriptors, persisted store records, and running processes.

use std::path::Path;

use crate::config::Config;
use crate::launchd::{DaemonDescriptor, KeepAlive, Scope};
use crate::process::ProcessInfo;
use crate::server::{Server, ServerSettings, ServerStatus, SettingField, Startup};

const KEY_NAME: &str = "name";
const KEY_DOMAIN: &str = "domain";
const KEY_STARTUP: &str = "startup";

/// Descriptor for the server's active settings
pub fn descriptor_from_server(server: &Server) -> DaemonDescriptor {
    let settings = server.settings();
    let mut args = vec![
        settings.binary().to_string_lossy().into_owned(),
        "-D".to_string(),
        settings.data_directory.clone(),
    ];
    if !settings.port.is_empty() {
        args.extend(["-p".to_string(), settings.port.clone()]);
    }
    let runs_at_load = settings.startup != Startup::Manual;
    let log_file = Some(settings.log_file.clone()).filter(|l| !l.is_empty());

    DaemonDescriptor {
        label: server.daemon_name(),
        program: None,
        program_arguments: args,
        user_name: Some(settings.username.clone()).filter(|u| !u.is_empty()),
        working_directory: Some(settings.data_directory.clone()).filter(|d| !d.is_empty()),
        run_at_load: runs_at_load,
        keep_alive: runs_at_load.then_some(KeepAlive::Conditions {
            successful_exit: Some(false),
        }),
        standard_out_path: log_file.clone(),
        standard_error_path: log_file,
    }
}

/// Split a label into (domain, name), preferring the configured domain
fn split_label<'a>(label: &'a str, domain: &str) -> (&'a str, &'a str) {
    if let Some(name) = label
        .strip_prefix(domain)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|name| !name.is_empty())
    {
        return (&label[..domain.len()], name);
    }
    label.rsplit_once('.').unwrap_or(("", label))
}

/// Rebuild a server from a descriptor.
///
/// `path` is where the descriptor was read from; `scope` is where it was found
/// loaded. Either tells boot-time daemons apart from login agents. The result
/// is always marked external; the controller clears that for known servers.
pub fn server_from_descriptor(
    descriptor: &DaemonDescriptor,
    path: Option<&Path>,
    scope: Option<Scope>,
    config: &Config,
) -> Server {
    let (domain, name) = split_label(&descriptor.label, &config.domain);
    let binary = descriptor.executable().map(Path::new);
    let bin_directory = binary
        .and_then(Path::parent)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let at_boot = match path {
        Some(path) => config.is_boot_daemon_path(path),
        None => scope == Some(Scope::System),
    };
    let startup = match (descriptor.run_at_load, at_boot) {
        (false, _) => Startup::Manual,
        (true, true) => Startup::AtBoot,
        (true, false) => Startup::AtLogin,
    };

    let settings = ServerSettings::new(
        descriptor.user_name.clone().unwrap_or_default(),
        bin_directory,
        descriptor
            .argument("-D")
            .or(descriptor.working_directory.as_deref())
            .unwrap_or_default(),
        descriptor
            .standard_out_path
            .as_deref()
            .or(descriptor.standard_error_path.as_deref())
            .unwrap_or_default(),
        descriptor.argument("-p").unwrap_or_default(),
        startup,
    );

    let mut server = Server::with_settings(name, domain, settings);
    server.set_external(true);
    server.set_descriptor_path(path.map(Path::to_path_buf));
    let all_users = match path {
        Some(path) => !config.is_current_user_path(path),
        None => scope == Some(Scope::System),
    };
    server.set_daemon_loaded_for_all_users(all_users);
    server
}

/// Flat record for the store
pub fn properties_from_server(server: &Server) -> plist::Dictionary {
    let settings = server.settings();
    let mut dict = plist::Dictionary::new();
    dict.insert(KEY_NAME.into(), server.name().into());
    dict.insert(KEY_DOMAIN.into(), server.domain().into());
    for field in SettingField::ALL {
        dict.insert(field.key().into(), settings.get(field).into());
    }
    dict.insert(KEY_STARTUP.into(), settings.startup.as_str().into());
    dict
}

fn has_all_keys(dict: &plist::Dictionary) -> bool {
    [KEY_NAME, KEY_DOMAIN, KEY_STARTUP]
        .into_iter()
        .chain(SettingField::ALL.iter().map(|f| f.key()))
        .all(|key| dict.contains_key(key))
}

/// Decode a store record; None if a key is missing or has the wrong type
pub fn server_from_properties(dict: &plist::Dictionary) -> Option<Server> {
    if !has_all_keys(dict) {
        return None;
    }
    let string = |key: &str| dict.get(key).and_then(|v| v.as_string()).map(str::to_string);

    let startup = match dict.get(KEY_STARTUP)? {
        plist::Value::String(s) => Startup::parse(s),
        plist::Value::Integer(i) => Startup::from_index(i.as_signed()?),
        _ => return None,
    };

    let mut settings = ServerSettings {
        startup,
        ..Default::default()
    };
    for field in SettingField::ALL {
        settings.set(field, &string(field.key())?);
    }
    Some(Server::with_settings(string(KEY_NAME)?, string(KEY_DOMAIN)?, settings))
}

/// Best-effort server for a running `postgres` process not known otherwise
pub fn server_from_process(process: &ProcessInfo, domain: &str) -> Option<Server> {
    let argv = process.argv();
    let binary = Path::new(argv.first()?);
    if binary.file_name()? != "postgres" {
        return None;
    }
    let argument = |flag: &str| {
        argv.iter()
            .position(|a| a == flag)
            .and_then(|i| argv.get(i + 1))
            .cloned()
    };
    let data_directory = argument("-D")?;
    let name = Path::new(&data_directory)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| data_directory.clone());

    let settings = ServerSettings::new(
        process.user.clone(),
        binary
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
        data_directory,
        "",
        argument("-p").unwrap_or_default(),
        Startup::Manual,
    );
    let mut server = Server::with_settings(name, domain, settings);
    server.set_external(true);
    server.set_status(ServerStatus::Started);
    server.set_pid(Some(process.pid));
    Some(server)
}
