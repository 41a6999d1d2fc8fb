//! Search for installations and running servers

use std::sync::Arc;

use pgprefs::discovery::SearchDelegate;
use pgprefs::Server;

use super::controller;

struct PrintResults;

impl SearchDelegate for PrintResults {
    fn did_find_more_servers(&self, servers: &[Server]) {
        for server in servers {
            println!("  {:<24} {}", server.name(), server.settings().bin_directory);
        }
    }
}

pub async fn search() -> Result<(), Box<dyn std::error::Error>> {
    let controller = controller().await?;
    let discovery = controller.discovery();
    let known = controller.servers().await;

    println!("Installed:");
    let installed = discovery.find_installed(&known, Arc::new(PrintResults)).await;
    if installed.is_empty() {
        println!("  (none)");
    }

    println!("Running, not managed here:");
    for server in known.iter().filter(|s| s.is_external()) {
        println!(
            "  {:<24} {} (pid {})",
            server.name(),
            server.settings().data_directory,
            server.pid().map(|p| p.to_string()).unwrap_or_else(|| "-".into())
        );
    }
    Ok(())
}
