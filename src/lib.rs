//! LoRaWAN Network Server core in Rust
//!
//! This crate implements the network side of LoRaWAN: it receives uplinks
//! from Gateway Servers, authenticates them against device sessions, runs
//! the MAC layer, handles joins through Join Servers, forwards application
//! data to Application Servers and schedules downlinks back through the
//! gateways.
//!
//! # Features
//! - Uplink matching, deduplication and metadata merging
//! - MAC command handling and ADR for LoRaWAN 1.0.x and 1.1
//! - OTAA joins through cluster or interoperability Join Servers
//! - Class A, B and C downlink scheduling across gateway peers
//! - Optimistic, field-versioned device registry
//! - In-memory stores for every component
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use lorawan_ns::{
//!     cluster::StaticCluster,
//!     events::TracingEventSink,
//!     Components, Config, NetworkServer,
//! };
//!
//! # async fn run() -> lorawan_ns::Result<()> {
//! let cluster = Arc::new(StaticCluster::default());
//! let components = Components::in_memory(cluster, Arc::new(TracingEventSink));
//! let server = NetworkServer::new(Config::default(), components)?;
//! server.start();
//! // Feed uplinks with `server.handle_uplink(..)`.
//! server.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Application Server uplink queue and forwarding
pub mod application;

/// Device class downlink windows (A, B, C)
pub mod class;

/// Cluster peers and remote clients
pub mod cluster;

/// Device and server configuration
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// Uplink deduplication
pub mod dedup;

/// End device records
pub mod device;

/// Downlink tasks and scheduling
pub mod downlink;

/// Errors
pub mod error;

/// Events
pub mod events;

/// Join handling
pub mod join;

/// LoRaWAN frame codecs and regional parameters
pub mod lorawan;

/// Transmission acknowledgment matching
pub mod matcher;

/// Messages exchanged with other cluster components
pub mod messages;

/// Device registry
pub mod registry;

/// Network server
pub mod server;

/// MAC state machine
pub mod state;

mod uplink;

pub use config::server::Config;
pub use error::{Error, Result};
pub use server::{Components, NetworkServer};
