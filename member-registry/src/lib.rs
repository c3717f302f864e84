//! Ephemeral service registration with change notifications.
//!
//! This crate provides:
//! - Registration of the local process as an ephemeral sequential node
//! - Exactly-once startup, even with concurrent `start()` callers
//! - Connection-state logging and broadcast (lost / reconnected)
//! - Subtree change dispatch through a per-kind handler table
//! - One-time hydration from a namespace snapshot at startup
//!
//! The coordination service itself (a ZooKeeper-style tree with ephemeral
//! nodes and watches) sits behind the [`CoordinationClient`] trait.
//! [`MemoryBackend`] implements it in-process.
//!
//! # Example
//!
//! ```rust,ignore
//! use member_registry::{
//!     ChangeHandlers, MemberRecord, MemoryBackend, RegistrationManager, RegistrationPath,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(MemoryBackend::new());
//!     let handlers = ChangeHandlers::new().on_added(|_, _, path| {
//!         println!("member up: {}", path);
//!         Ok(())
//!     });
//!
//!     let manager = RegistrationManager::new(
//!         backend,
//!         MemberRecord::new("10.0.0.1", 7000),
//!         RegistrationPath::new("/services/push")?,
//!     )
//!     .with_handlers(handlers);
//!
//!     // Registers, subscribes, then hydrates from the current snapshot
//!     manager.start().await?;
//!
//!     manager.unregister_app().await?;
//!     manager.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery
//!
//! Backend callbacks only enqueue into bounded channels; one task per
//! subscription drains them, so handler calls never overlap. Watch delivery
//! is at-least-once and events can be missed across a reconnection, so
//! handlers must treat `Added` as an idempotent upsert.

pub mod backend;
mod config;
mod dispatcher;
mod error;
mod event;
mod manager;
mod member;
mod memory;

pub use backend::{ChangeListener, ConnectionListener, CoordinationClient};
pub use config::{MissingNodePolicy, RegistrationConfig};
pub use dispatcher::{
    ChangeDispatcher, ChangeHandlers, DispatchContext, DispatchStats, HandlerError, HandlerResult,
};
pub use error::{Error, Result};
pub use event::{ChangeEvent, ChangeKind, ConnectionPhase, NodeData};
pub use manager::{ManagerStats, RegistrationManager};
pub use member::{MemberRecord, RegistrationPath};
pub use memory::MemoryBackend;
