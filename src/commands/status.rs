//! Check server status

use pgprefs::auth::AuthReason;
use pgprefs::ServerAction;

use super::{controller, find, status_symbol};

pub async fn status(name: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let controller = controller().await?;
    let servers = match name {
        Some(name) => vec![find(&controller, name).await?],
        None => controller.servers().await,
    };

    for server in servers {
        if server.is_actionable() && !controller.should_check_status(server.id()).await {
            let reason = AuthReason::new("check status of", server.name());
            if let Err(e) = controller.preauthorize(reason).await {
                log::warn!("Checking {} without authorization: {}", server.name(), e);
            }
        }
        // Errors are reported through the delegate; keep going
        let _ = controller.run_action(ServerAction::CheckStatus, server.id()).await;

        let Some(server) = controller.server(server.id()).await else {
            continue;
        };
        println!("{} {} - {}", status_symbol(&server), server.name(), server.status());
        println!("     Label: {}", server.daemon_name());
        if let Some(pid) = server.pid() {
            println!("       PID: {}", pid);
        }
        if let Some(error) = server.error() {
            println!("     Error: {}", error);
        }
    }
    Ok(())
}
