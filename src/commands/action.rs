//! Start, stop, create and delete

use pgprefs::ServerAction;

use super::{controller, find, status_symbol};

async fn run(action: ServerAction, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let controller = controller().await?;
    let server = find(&controller, name).await?;
    controller.run_action(action, server.id()).await?;

    match controller.server(server.id()).await {
        Some(server) => match server.pid() {
            Some(pid) => println!("{} {} - {} (PID {})", status_symbol(&server), name, server.status(), pid),
            None => println!("{} {} - {}", status_symbol(&server), name, server.status()),
        },
        None => println!("{} deleted", name),
    }
    Ok(())
}

pub async fn start(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    run(ServerAction::Start, name).await
}

pub async fn stop(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    run(ServerAction::Stop, name).await
}

pub async fn create(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    run(ServerAction::Create, name).await
}

pub async fn delete(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    run(ServerAction::Delete, name).await
}
