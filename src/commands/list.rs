//! List servers

use super::{controller, status_symbol};

pub async fn list() -> Result<(), Box<dyn std::error::Error>> {
    let controller = controller().await?;
    let servers = controller.servers().await;

    println!("  {:<24} {:<9} {:<7} {:<8} DATA", "NAME", "STARTUP", "PORT", "PID");
    for server in &servers {
        let settings = server.settings();
        println!(
            "{} {:<24} {:<9} {:<7} {:<8} {}{}",
            status_symbol(server),
            server.name(),
            settings.startup.as_str(),
            settings.port,
            server.pid().map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            settings.data_directory,
            if server.is_external() { " (external)" } else { "" },
        );
    }
    println!("\n{} servers", servers.len());
    Ok(())
}
