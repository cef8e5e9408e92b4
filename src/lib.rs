//! Vita Key Management Core
//!
//! The control plane of the Vita IPsec/ESP gateway: negotiates ephemeral
//! Security Associations with remote gateways over the vita-ske1
//! protocol, tracks their lifecycle (rekeying, cutover, expiry) per
//! configured route, and publishes the active SA set as a versioned
//! database file consumed by the encrypt/decrypt worker processes.
//!
//! The data plane (ESP encap/decap, routing, dispatch, NIC drivers) lives
//! in separate processes; this crate only exchanges datagrams with the
//! dispatch app and files with the workers.

pub mod config;
pub mod exchange;
pub mod manager;
pub mod sa;
pub mod wire;

// Re-export config types
pub use config::{Config, ConfigError, RouteConfig};

// Re-export exchange types
pub use exchange::{
    EphemeralKeyPair, EphemeralKeys, Exchange, ExchangeError, KeyMessage, NonceMessage, State,
};

// Re-export manager types
pub use manager::{Counters, KeyManager, ManagerError, Route, RouteStatus};

// Re-export SA database types
pub use sa::{EspAead, SaDatabase, SaDatabaseError, SaPublisher, SecurityAssociation};

// Re-export wire types
pub use wire::{Payload, WireError};
