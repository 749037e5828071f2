//! Backend Management Module
//!
//! Tracks the backend MySQL servers the proxy routes to, their
//! read-write/read-only type and health state, and their grouping
//! into replication groups.

mod group;
mod registry;

pub use group::{Group, GroupSummary, MAX_GROUP_SLAVES};
pub use registry::{BackendRegistry, MAX_WEIGHT, PARTITION_SUPER_GROUP};

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::Error;
use crate::pool::{ConnectionPool, PoolLimits};

/// Backend type (replication role)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BackendType {
    Unknown = 0,
    /// Read-write (master)
    Rw = 1,
    /// Read-only (slave)
    Ro = 2,
}

impl BackendType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BackendType::Rw,
            2 => BackendType::Ro,
            _ => BackendType::Unknown,
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Unknown => write!(f, "unknown"),
            BackendType::Rw => write!(f, "rw"),
            BackendType::Ro => write!(f, "ro"),
        }
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rw" => Ok(BackendType::Rw),
            "ro" => Ok(BackendType::Ro),
            "unknown" => Ok(BackendType::Unknown),
            other => Err(Error::InvalidParameter(format!("backend type '{}'", other))),
        }
    }
}

/// Backend health / administrative state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BackendState {
    Unknown = 0,
    Up = 1,
    Down = 2,
    Maintaining = 3,
    Deleted = 4,
    Offline = 5,
}

impl BackendState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BackendState::Up,
            2 => BackendState::Down,
            3 => BackendState::Maintaining,
            4 => BackendState::Deleted,
            5 => BackendState::Offline,
            _ => BackendState::Unknown,
        }
    }

    /// Usable for routing
    pub fn is_available(self) -> bool {
        matches!(self, BackendState::Up | BackendState::Unknown)
    }

    /// Taken out of service by an operator
    pub fn is_administratively_out(self) -> bool {
        matches!(self, BackendState::Maintaining | BackendState::Deleted)
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Unknown => write!(f, "unknown"),
            BackendState::Up => write!(f, "up"),
            BackendState::Down => write!(f, "down"),
            BackendState::Maintaining => write!(f, "maintaining"),
            BackendState::Deleted => write!(f, "deleted"),
            BackendState::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for BackendState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(BackendState::Up),
            "down" => Ok(BackendState::Down),
            "maintaining" => Ok(BackendState::Maintaining),
            "unknown" => Ok(BackendState::Unknown),
            "offline" => Ok(BackendState::Offline),
            "deleted" => Ok(BackendState::Deleted),
            other => Err(Error::InvalidParameter(format!("backend state '{}'", other))),
        }
    }
}

/// Idle server connections cached per backend
pub type ServerPool = ConnectionPool<tokio::net::TcpStream>;

/// One managed MySQL server
///
/// `state` is only ever changed with compare-and-swap; `type` is changed
/// under the registry write lock.
pub struct Backend {
    address: RwLock<Address>,
    alias: String,
    server_group: String,
    weight: u8,
    kind: AtomicU8,
    state: AtomicU8,
    /// Milliseconds since epoch of the last state change
    state_since: AtomicI64,
    slave_delay_ms: AtomicI64,
    connected_clients: AtomicUsize,
    pool: Mutex<ServerPool>,
}

impl Backend {
    pub(crate) fn new(
        address: Address,
        alias: String,
        server_group: String,
        weight: u8,
        kind: BackendType,
        state: BackendState,
        limits: PoolLimits,
    ) -> Self {
        Self {
            address: RwLock::new(address),
            alias,
            server_group,
            weight,
            kind: AtomicU8::new(kind as u8),
            state: AtomicU8::new(state as u8),
            state_since: AtomicI64::new(Utc::now().timestamp_millis()),
            slave_delay_ms: AtomicI64::new(0),
            connected_clients: AtomicUsize::new(0),
            pool: Mutex::new(ConnectionPool::new(limits)),
        }
    }

    /// Normalized "ip:port"
    pub fn name(&self) -> String {
        self.address.read().name().to_string()
    }

    pub fn address(&self) -> Address {
        self.address.read().clone()
    }

    /// Re-resolve the configured hostname; true if it changed
    pub async fn refresh_address(&self) -> crate::Result<bool> {
        let mut fresh = self.address();
        let changed = fresh.refresh().await?;
        if changed {
            *self.address.write() = fresh;
        }
        Ok(changed)
    }

    /// User-facing address without `@group` / `#weight` suffixes
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn server_group(&self) -> &str {
        &self.server_group
    }

    pub fn weight(&self) -> u8 {
        self.weight
    }

    pub fn backend_type(&self) -> BackendType {
        BackendType::from_u8(self.kind.load(Ordering::Acquire))
    }

    pub(crate) fn set_backend_type(&self, kind: BackendType) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    pub fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically move from `expected` to `new`
    pub(crate) fn compare_and_swap_state(&self, expected: BackendState, new: BackendState) -> bool {
        let swapped = self
            .state
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.state_since.store(Utc::now().timestamp_millis(), Ordering::Release);
        }
        swapped
    }

    pub fn state_since(&self) -> DateTime<Utc> {
        let ms = self.state_since.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    pub fn is_available(&self) -> bool {
        self.state().is_available()
    }

    pub fn slave_delay_ms(&self) -> i64 {
        self.slave_delay_ms.load(Ordering::Relaxed)
    }

    pub fn set_slave_delay_ms(&self, ms: i64) {
        self.slave_delay_ms.store(ms, Ordering::Relaxed);
    }

    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(Ordering::Relaxed)
    }

    /// A client session started using this backend
    pub fn client_attached(&self) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
    }

    /// A client session released this backend
    pub fn client_detached(&self) {
        let _ = self
            .connected_clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn pool(&self) -> MutexGuard<'_, ServerPool> {
        self.pool.lock()
    }

    pub fn idle_conns(&self) -> usize {
        self.pool.lock().total_idle()
    }

    /// Pooled plus in-use connections
    pub fn conns_count(&self) -> usize {
        self.idle_conns() + self.connected_clients()
    }

    /// Whether routing another session here stays within pool bounds
    pub fn has_capacity(&self) -> bool {
        let pool = self.pool.lock();
        let idle = pool.total_idle();
        let total = idle + self.connected_clients();
        idle > 0 || total <= pool.limits().max_idle
    }

    /// Address spec with group / weight suffixes, as persisted
    pub fn persisted_spec(&self) -> String {
        let mut spec = self.alias.clone();
        if self.weight > 0 {
            spec.push_str(&format!("#{}", self.weight));
        }
        if !self.server_group.is_empty() {
            spec.push('@');
            spec.push_str(&self.server_group);
        }
        spec
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.name())
            .field("group", &self.server_group)
            .field("type", &self.backend_type())
            .field("state", &self.state())
            .field("weight", &self.weight)
            .finish()
    }
}
