//! Health monitor loop
//!
//! One task runs every cycle in sequence, so cycles never overlap each
//! other; each only races with admin commands and client sessions, and
//! those races are settled by compare-and-swap on backend state. A failed
//! probe never ends the loop, the next tick simply tries again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};

use super::probe::{ProbeConn, Prober};
use crate::address::Address;
use crate::backend::{Backend, BackendRegistry, BackendState, BackendType};
use crate::config::WolfGateConfig;
use crate::error::{Error, Result};

/// Connection attempts per backend per liveness tick
pub const CHECK_ALIVE_TIMES: u32 = 2;

/// Lag reported when a slave has no heartbeat row at all
const MISSING_HEARTBEAT_LAG_SECS: f64 = i32::MAX as f64;

/// Monitor tuning
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub check_interval: Duration,
    pub delay_interval: Duration,
    pub group_replication: bool,
    pub check_slave_delay: bool,
    pub dns_recheck: bool,
    /// Seconds of lag above which a slave goes DOWN
    pub slave_delay_down: f64,
    /// Seconds of lag at or below which a slave comes back UP
    pub slave_delay_recover: f64,
    pub heartbeat_table: String,
    /// Pause between writing the heartbeat and reading it from slaves
    pub heartbeat_settle: Duration,
    /// Key of this process's heartbeat row
    pub instance_id: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            delay_interval: Duration::from_millis(300),
            group_replication: false,
            check_slave_delay: false,
            dns_recheck: false,
            slave_delay_down: 10.0,
            slave_delay_recover: 1.0,
            heartbeat_table: "proxy_heart_beat.tb_heartbeat".to_string(),
            heartbeat_settle: Duration::from_millis(50),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl MonitorSettings {
    pub fn from_config(config: &WolfGateConfig) -> Self {
        let m = &config.monitor;
        Self {
            check_interval: config.check_interval(),
            delay_interval: config.delay_interval(),
            group_replication: m.group_replication,
            check_slave_delay: m.check_slave_delay,
            dns_recheck: m.dns_recheck,
            slave_delay_down: m.slave_delay_down_secs,
            slave_delay_recover: m.slave_delay_recover_secs,
            heartbeat_table: m.heartbeat_table.clone(),
            ..Self::default()
        }
    }
}

/// Monitor counters
#[derive(Debug, Default)]
pub struct MonitorStats {
    ticks: AtomicU64,
    lag_ticks: AtomicU64,
    transitions: AtomicU64,
    failed_transitions: AtomicU64,
    inconsistent_topologies: AtomicU64,
    auto_registered: AtomicU64,
}

/// Point-in-time copy of [`MonitorStats`]
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MonitorStatsSnapshot {
    pub ticks: u64,
    pub lag_ticks: u64,
    pub transitions: u64,
    pub failed_transitions: u64,
    pub inconsistent_topologies: u64,
    pub auto_registered: u64,
}

impl MonitorStats {
    pub fn snapshot(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            lag_ticks: self.lag_ticks.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            failed_transitions: self.failed_transitions.load(Ordering::Relaxed),
            inconsistent_topologies: self.inconsistent_topologies.load(Ordering::Relaxed),
            auto_registered: self.auto_registered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Check {
    Alive,
    Topology,
    Heartbeat,
    Lag,
}

/// Backend health monitor
pub struct HealthMonitor<P: Prober> {
    registry: Arc<BackendRegistry>,
    prober: P,
    settings: MonitorSettings,
    /// Cached probe connections by backend address
    conns: Mutex<HashMap<String, P::Conn>>,
    /// Last outcome per check and backend slot, to log only on change
    last_results: Mutex<HashMap<(Check, usize), bool>>,
    stats: Arc<MonitorStats>,
    running: AtomicBool,
}

impl<P: Prober> HealthMonitor<P> {
    pub fn new(registry: Arc<BackendRegistry>, prober: P, settings: MonitorSettings) -> Self {
        Self {
            registry,
            prober,
            settings,
            conns: Mutex::new(HashMap::new()),
            last_results: Mutex::new(HashMap::new()),
            stats: Arc::new(MonitorStats::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn stats(&self) -> MonitorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters, readable after the monitor is moved into its task
    pub fn stats_handle(&self) -> Arc<MonitorStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the monitor loop
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::Release);
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    /// Ask the loop to exit at its next wakeup
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Monitor loop; returns once stopped
    pub async fn run(&self) {
        tracing::info!(
            "Health monitor started (check every {:?}, group replication: {}, slave delay: {})",
            self.settings.check_interval,
            self.settings.group_replication,
            self.settings.check_slave_delay
        );

        let mut check_ticker = interval(self.settings.check_interval);
        check_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut delay_ticker = interval(self.settings.delay_interval);
        delay_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let check_delay = self.settings.check_slave_delay;

        loop {
            tokio::select! {
                _ = check_ticker.tick() => {
                    if !self.is_running() {
                        break;
                    }
                    self.tick().await;
                }
                _ = delay_ticker.tick(), if check_delay => {
                    if !self.is_running() {
                        break;
                    }
                    self.run_lag_cycle().await;
                }
            }
        }

        self.conns.lock().clear();
        tracing::info!("Health monitor stopped");
    }

    /// One main tick: topology discovery, then liveness (unless lag
    /// measurement owns slave state)
    pub async fn tick(&self) {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        if self.settings.group_replication {
            self.run_topology_cycle().await;
        }
        if !self.settings.check_slave_delay {
            self.run_liveness_cycle().await;
        }
    }

    /// Record a probe outcome; true if it differs from the previous one
    fn changed(&self, check: Check, slot: usize, ok: bool) -> bool {
        self.last_results.lock().insert((check, slot), ok) != Some(ok)
    }

    /// Reuse a cached connection if it still answers, else open a new one
    async fn checkout(&self, address: &Address, tries: u32) -> Result<P::Conn> {
        let cached = self.conns.lock().remove(address.name());
        if let Some(mut conn) = cached {
            match conn.ping().await {
                Ok(()) => return Ok(conn),
                Err(e) => tracing::debug!("Dropping stale probe connection to {}: {}", address, e),
            }
        }

        let mut last_err = Error::Probe {
            address: address.name().to_string(),
            reason: "no connection attempt".into(),
        };
        for _ in 0..tries.max(1) {
            match self.prober.connect(address).await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn checkin(&self, address: &Address, conn: P::Conn) {
        self.conns.lock().insert(address.name().to_string(), conn);
    }

    /// Compare-and-swap a backend to `state`, counting the outcome
    fn set_state(&self, index: usize, backend: &Backend, state: BackendState, expected: BackendState) {
        self.change(index, backend, backend.backend_type(), state, expected);
    }

    fn change(&self, index: usize, backend: &Backend, kind: BackendType, state: BackendState, expected: BackendState) {
        match self.registry.modify(index, kind, state, Some(expected)) {
            Ok(true) => {
                self.stats.transitions.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Backend {} is set to {} ({})", backend.name(), state, kind);
            }
            Ok(false) => {}
            Err(e) => {
                // Someone else moved it first; look again next tick
                self.stats.failed_transitions.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Backend {} is set to {} failed: {}", backend.name(), state, e);
            }
        }
    }

    /// Probe every active backend and mark it UP or DOWN
    pub async fn run_liveness_cycle(&self) {
        for (index, backend) in self.registry.backends().into_iter().enumerate() {
            let state = backend.state();
            if matches!(
                state,
                BackendState::Deleted | BackendState::Maintaining | BackendState::Offline
            ) {
                continue;
            }

            let mut address = backend.address();
            let mut outcome = self.checkout(&address, CHECK_ALIVE_TIMES).await;

            if outcome.is_err() && self.settings.dns_recheck {
                match backend.refresh_address().await {
                    Ok(true) => {
                        address = backend.address();
                        outcome = self.checkout(&address, CHECK_ALIVE_TIMES).await;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::debug!("DNS recheck of {} failed: {}", address.spec(), e),
                }
            }

            match outcome {
                Ok(conn) => {
                    if self.changed(Check::Alive, index, true) {
                        tracing::info!("Backend {} is reachable", address);
                    }
                    if state != BackendState::Up {
                        self.set_state(index, &backend, BackendState::Up, state);
                    }
                    self.checkin(&address, conn);
                }
                Err(e) => {
                    let first = self.changed(Check::Alive, index, false);
                    if first {
                        tracing::error!("Could not connect to backend {}: {}", address, e);
                    }
                    if backend.backend_type() == BackendType::Rw {
                        // Only the topology cycle demotes a writer
                        if first {
                            tracing::error!("rw backend {} is unreachable, leaving its state to replication checks", address);
                        }
                        continue;
                    }
                    if state != BackendState::Down {
                        self.set_state(index, &backend, BackendState::Down, state);
                    }
                }
            }
        }
    }

    /// Write the heartbeat on masters, then read it back on slaves and
    /// move them DOWN or UP by their lag
    pub async fn run_lag_cycle(&self) {
        self.stats.lag_ticks.fetch_add(1, Ordering::Relaxed);
        let table = &self.settings.heartbeat_table;
        let instance = &self.settings.instance_id;
        let backends = self.registry.backends();

        for (index, backend) in backends.iter().enumerate() {
            let state = backend.state();
            if backend.backend_type() != BackendType::Rw || state.is_administratively_out() {
                continue;
            }
            let address = backend.address();
            let mut conn = match self.checkout(&address, 1).await {
                Ok(conn) => conn,
                Err(e) => {
                    if self.changed(Check::Heartbeat, index, false) {
                        tracing::error!("Could not connect to backend {}: {}", address, e);
                    }
                    continue;
                }
            };
            if state != BackendState::Up {
                self.set_state(index, backend, BackendState::Up, state);
            }

            let written = conn.write_heartbeat(table, instance, Utc::now()).await;
            match &written {
                Ok(()) if self.changed(Check::Heartbeat, index, true) => {
                    tracing::info!("Update heartbeat success. backend: {}", address)
                }
                Err(e) if self.changed(Check::Heartbeat, index, false) => {
                    tracing::error!("Update heartbeat error on {}: {}", address, e)
                }
                _ => {}
            }
            if written.is_ok() {
                self.checkin(&address, conn);
            }
        }

        tokio::time::sleep(self.settings.heartbeat_settle).await;

        for (index, backend) in backends.iter().enumerate() {
            let state = backend.state();
            if backend.backend_type() == BackendType::Rw || state.is_administratively_out() {
                continue;
            }
            let address = backend.address();
            let mut conn = match self.checkout(&address, 1).await {
                Ok(conn) => conn,
                Err(e) => {
                    if self.changed(Check::Lag, index, false) {
                        tracing::error!("Connection error when reading delay from {}: {}", address, e);
                    }
                    if state != BackendState::Down {
                        self.set_state(index, backend, BackendState::Down, state);
                    }
                    continue;
                }
            };

            let lag_secs = match conn.read_heartbeat(table, instance).await {
                Ok(Some(ts)) => {
                    let lag = Utc::now().signed_duration_since(ts);
                    lag.num_milliseconds() as f64 / 1000.0
                }
                Ok(None) => {
                    tracing::error!("Check slave delay: no heartbeat row on {}", address);
                    MISSING_HEARTBEAT_LAG_SECS
                }
                Err(e) => {
                    // The server answered, so a failed query leaves its state alone
                    if self.changed(Check::Lag, index, false) {
                        tracing::error!("Select heartbeat error on {}: {}", address, e);
                    }
                    continue;
                }
            };
            if self.changed(Check::Lag, index, true) {
                tracing::info!("Select heartbeat success. backend: {}", address);
            }
            self.checkin(&address, conn);

            backend.set_slave_delay_ms((lag_secs * 1000.0) as i64);
            if lag_secs > self.settings.slave_delay_down && state != BackendState::Down {
                tracing::error!("Slave {} delay {:.3} seconds, setting it DOWN", address, lag_secs);
                self.set_state(index, backend, BackendState::Down, state);
            } else if lag_secs <= self.settings.slave_delay_recover && state != BackendState::Up {
                tracing::info!("Slave {} delay {:.3} seconds, recovered", address, lag_secs);
                self.set_state(index, backend, BackendState::Up, state);
            }
        }
    }

    /// Reconcile backend types with what group replication reports
    pub async fn run_topology_cycle(&self) {
        let mut groups: Vec<String> = Vec::new();
        for backend in self.registry.backends() {
            if !groups.iter().any(|g| g == backend.server_group()) {
                groups.push(backend.server_group().to_string());
            }
        }

        for group in groups {
            if let Err(e) = self.reconcile_group(&group).await {
                tracing::warn!("Topology check of group '{}' skipped: {}", group, e);
            }
        }
    }

    async fn reconcile_group(&self, group: &str) -> Result<()> {
        let members: Vec<(usize, Arc<Backend>)> = self
            .registry
            .backends()
            .into_iter()
            .enumerate()
            .filter(|(_, b)| b.server_group() == group)
            .collect();

        // Every reachable member must name the same primary
        let mut primary: Option<String> = None;
        for (index, backend) in &members {
            if backend.state().is_administratively_out() {
                continue;
            }
            let address = backend.address();
            let Ok(mut conn) = self.checkout(&address, 1).await else {
                continue;
            };
            match conn.primary_member().await {
                Ok(Some(reported)) => {
                    let reported = normalize(&reported).await?;
                    match &primary {
                        Some(seen) if *seen != reported => {
                            self.stats.inconsistent_topologies.fetch_add(1, Ordering::Relaxed);
                            return Err(Error::Internal(format!(
                                "inconsistent primaries: {} and {}",
                                seen, reported
                            )));
                        }
                        Some(_) => {}
                        None => primary = Some(reported),
                    }
                    self.checkin(&address, conn);
                }
                Ok(None) => self.checkin(&address, conn),
                Err(e) => {
                    if self.changed(Check::Topology, *index, false) {
                        tracing::warn!("Group replication query failed on {}: {}", address, e);
                    }
                }
            }
        }
        let Some(primary) = primary else {
            return Ok(());
        };

        let primary_address = Address::lookup(&primary).await?;
        let mut conn = self.checkout(&primary_address, 1).await?;
        let reported = conn.secondary_members().await?;
        self.checkin(&primary_address, conn);
        let mut secondaries: HashSet<String> = HashSet::new();
        for member in &reported {
            match normalize(member).await {
                Ok(name) => {
                    secondaries.insert(name);
                }
                Err(e) => tracing::warn!("Ignoring secondary '{}' of group '{}': {}", member, group, e),
            }
        }

        // Demote first, so the group never holds two active writers
        for (index, backend) in &members {
            let name = backend.name();
            let state = backend.state();
            if state.is_administratively_out() || name == primary || secondaries.contains(&name) {
                continue;
            }
            if state != BackendState::Offline {
                let kind = match backend.backend_type() {
                    BackendType::Rw => BackendType::Unknown,
                    other => other,
                };
                self.change(*index, backend, kind, BackendState::Offline, state);
            }
        }

        let mut matched: HashSet<String> = HashSet::new();
        for (index, backend) in &members {
            let name = backend.name();
            if secondaries.contains(&name) {
                matched.insert(name);
                self.reactivate(*index, backend, BackendType::Ro);
            }
        }
        for (index, backend) in &members {
            let name = backend.name();
            if name == primary {
                matched.insert(name);
                self.reactivate(*index, backend, BackendType::Rw);
            }
        }

        if !matched.contains(&primary) {
            self.auto_register(&primary, group, BackendType::Rw).await;
        }
        let mut missing: Vec<&String> = secondaries.iter().filter(|s| !matched.contains(*s)).collect();
        missing.sort();
        for secondary in missing {
            self.auto_register(secondary, group, BackendType::Ro).await;
        }

        Ok(())
    }

    /// Give a backend its discovered role, bringing it back from OFFLINE
    fn reactivate(&self, index: usize, backend: &Backend, kind: BackendType) {
        let state = backend.state();
        if state.is_administratively_out() {
            return;
        }
        let target = if state == BackendState::Offline {
            BackendState::Up
        } else {
            state
        };
        if backend.backend_type() != kind || target != state {
            self.change(index, backend, kind, target, state);
        }
    }

    async fn auto_register(&self, name: &str, group: &str, kind: BackendType) {
        let spec = if group.is_empty() {
            name.to_string()
        } else {
            format!("{}@{}", name, group)
        };
        match self.registry.add_async(&spec, kind, BackendState::Up).await {
            Ok(index) => {
                self.stats.auto_registered.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Discovered {} backend {} registered at index {}", kind, spec, index);
            }
            Err(e) => tracing::warn!("Could not register discovered backend {}: {}", spec, e),
        }
    }
}

async fn normalize(reported: &str) -> Result<String> {
    Ok(Address::lookup(reported).await?.name().to_string())
}
