mod action;
mod add;
mod list;
mod search;
mod status;

pub use action::{create, delete, start, stop};
pub use add::{add, AddOptions};
pub use list::list;
pub use search::search;
pub use status::status;

use std::sync::Arc;

use pgprefs::auth::sudo::SudoAuthorizer;
use pgprefs::auth::PrivilegeBroker;
use pgprefs::controller::ServerController;
use pgprefs::launchd::Launchctl;
use pgprefs::process::SystemRunner;
use pgprefs::store::PlistServerStore;
use pgprefs::{ActionError, Config, Server, ServerAction, ServerDelegate};

/// Prints progress of lifecycle actions
struct TerminalDelegate;

impl ServerDelegate for TerminalDelegate {
    fn did_change_status(&self, server: &Server) {
        log::debug!("{} is {}", server.name(), server.status());
    }

    fn did_fail_action(&self, server: &Server, action: ServerAction, error: &ActionError) {
        eprintln!("× could not {} {}: {}", action, server.name(), error);
    }
}

/// Controller wired to launchd, sudo and the preferences file
async fn controller() -> Result<ServerController, Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let runner = Arc::new(SystemRunner::new());
    let services = Arc::new(Launchctl::new(runner.clone()));
    let store = Arc::new(PlistServerStore::new(config.store_file.clone()));
    let broker = Arc::new(PrivilegeBroker::new(Arc::new(SudoAuthorizer)));

    let controller = ServerController::new(config, runner, services, store, broker, Arc::new(TerminalDelegate));
    controller.refresh_servers().await?;
    Ok(controller)
}

async fn find(controller: &ServerController, name: &str) -> Result<Server, Box<dyn std::error::Error>> {
    controller
        .server_named(name)
        .await
        .ok_or_else(|| format!("No server named {:?}", name).into())
}

fn status_symbol(server: &Server) -> &'static str {
    match server.status() {
        pgprefs::ServerStatus::Started => "●",
        pgprefs::ServerStatus::Stopped => "○",
        pgprefs::ServerStatus::Unknown => "?",
        _ => "◐",
    }
}
