//! pgprefs - manage local PostgreSQL servers as launchd jobs
//!
//! Turns a server definition (binary, data directory, port, user, startup
//! policy) into a launchd descriptor and drives it through the service manager.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 ServerController                     │
//! │   registry · actions · settings workflow · delegate  │
//! ├──────────────┬──────────────┬──────────────┬────────┤
//! │  Privilege   │  Service     │  File        │ Store  │
//! │  Broker      │  Manager     │  Access      │        │
//! ├──────────────┴──────┬───────┴──────────────┴────────┤
//! │               Process Runner (sudo)                  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod files;
pub mod launchd;
pub mod process;
pub mod server;
pub mod store;

pub use config::Config;
pub use controller::{ActionError, ServerController, ServerDelegate};
pub use server::{Server, ServerAction, ServerId, ServerSettings, ServerStatus, SettingField, Startup};
