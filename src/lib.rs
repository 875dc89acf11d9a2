//! Fleet Gateway - device connection and command dispatch service
//!
//! This library provides the core functionality for the fleet gateway:
//! - Device WebSocket connections with heartbeat-based liveness
//! - A durable command store with a guarded lifecycle
//! - A dispatch pipeline for single, broadcast, and scheduled commands
//! - A REST surface for producers to create and track commands
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Producers                         │
//! │        REST API (create / cancel / retry)            │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Fleet Gateway                        │
//! │  Registry  │  Dispatch Queue  │  Workers  │  Sched  │
//! └────────────────────┬────────────────────────────────┘
//!                      │ WebSocket
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Devices                           │
//! │    register  │  heartbeat  │  command results        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod wire;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use dispatch::{DispatchQueue, Dispatcher, Lane, Scheduler};
pub use error::{Error, Result};
pub use registry::ConnectionRegistry;
pub use wire::{DeviceMessage, GatewayMessage};
