//! Walkthrough of member registration against the in-memory backend.
//!
//!   RUST_LOG=debug cargo run -p member-registry --example demo
//!
//! Registers this process under `/services/push`, lets a peer join and
//! leave, drops and restores the connection, then unregisters.

use member_registry::{
    ChangeHandlers, MemberRecord, MemoryBackend, RegistrationConfig, RegistrationManager,
    RegistrationPath,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend = Arc::new(MemoryBackend::new());

    // Print every member we learn about, whether from hydration or a watch
    let handlers = ChangeHandlers::new()
        .on_added(|ctx, event, path| {
            if !ctx.namespace().contains(path) {
                return Ok(());
            }
            let member = MemberRecord::from_bytes(event.payload().unwrap_or_default())?;
            println!("  + {} ({})", path, member.address());
            Ok(())
        })
        .on_removed(|_, _, path| {
            println!("  - {}", path);
            Ok(())
        });

    let manager = RegistrationManager::new(
        backend.clone(),
        MemberRecord::new("10.0.0.1", 7000).with_metadata("role", "push"),
        RegistrationPath::new("/services/push")?,
    )
    .with_handlers(handlers)
    .with_config(RegistrationConfig::from_env()?);

    let mut phases = manager.subscribe_connection();
    tokio::spawn(async move {
        while let Ok(phase) = phases.recv().await {
            println!("  connection: {}", phase);
        }
    });

    println!("Starting (hydration lists existing members):");
    manager.start().await?;
    println!("Registered at {:?}", manager.committed_path());

    println!("Peer joins:");
    backend.create_persistent(
        "/services/push/peer",
        MemberRecord::new("10.0.0.2", 7000).to_bytes()?,
    )?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("Connection blip:");
    backend.simulate_connection_loss();
    backend.simulate_reconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("Unregistering:");
    manager.unregister_app().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("Remaining members: {:?}", backend.children("/services/push"));
    println!("Stats: {:?}", manager.stats());

    manager.close().await;
    Ok(())
}
