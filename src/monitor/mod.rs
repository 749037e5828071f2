//! Health Monitor Module
//!
//! Background task that keeps backend state in line with reality:
//! - liveness: can a probe connection be opened?
//! - topology: who is the group replication primary, who are secondaries?
//! - lag: how far behind the master is each slave?

mod health;
mod probe;

pub use health::{HealthMonitor, MonitorSettings, MonitorStats, MonitorStatsSnapshot, CHECK_ALIVE_TIMES};
pub use probe::{MySqlProber, MySqlProbeConn, ProbeConn, Prober};
