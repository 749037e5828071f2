//! WolfGate - MySQL Proxy Control Plane
//!
//! The part of a MySQL protocol-aware sharding proxy that decides where
//! queries may go: it tracks backend servers, health-checks them and
//! follows replication failovers, and holds the sharding metadata the
//! query router resolves tables against.
//!
//! # Architecture
//!
//! A [`context::ProxyContext`] owns the backend registry, the sharding
//! configuration and the object store. A single health monitor task
//! re-derives backend state from live probes, while admin commands (over
//! HTTP or any other front end) mutate the same registry. Backend state
//! changes are compare-and-swap; structural changes take the registry
//! lock; the sharding configuration is replaced as a whole snapshot.
//!
//! # Features
//!
//! - Backend registry with RW/RO types, UP/DOWN/MAINTAINING/... states
//! - Replication groups with one master and round-robin slaves
//! - Liveness, group replication topology and slave lag monitoring
//! - Range and hash sharding over INT, STR, DATE and DATETIME keys
//! - Settings persisted to a file or SQLite object store, with retry
//! - HTTP admin API

pub mod address;
pub mod admin;
pub mod api;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod retry;
pub mod sharding;
pub mod store;

pub use config::WolfGateConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admin::{AdminService, BackendSelector, Outcome, ResultSet};
    pub use crate::backend::{Backend, BackendRegistry, BackendState, BackendType};
    pub use crate::config::WolfGateConfig;
    pub use crate::context::ProxyContext;
    pub use crate::error::{Error, Result};
    pub use crate::monitor::{HealthMonitor, MonitorSettings, MySqlProber};
    pub use crate::sharding::{ShardingConfig, Vdb};
}
