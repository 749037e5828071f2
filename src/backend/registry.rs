//! Backend Registry
//!
//! The process-wide set of backends. Indices are stable: backends are
//! only ever appended, and removal is a transition to DELETED.
//!
//! Concurrency:
//! - `state` is changed lock-free with compare-and-swap, from the monitor
//!   task, admin commands and client sessions alike
//! - `type` changes and appends happen under the registry write lock, so
//!   group slots are always rebuilt from a consistent member list

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use super::{Backend, BackendState, BackendType, Group, GroupSummary};
use crate::address::Address;
use crate::error::{Error, Result};
use crate::pool::PoolLimits;

/// Highest accepted `#weight` suffix
pub const MAX_WEIGHT: u8 = 9;

/// Name of the single group used in partition mode
pub const PARTITION_SUPER_GROUP: &str = "*partition*";

/// DOWN backends are retried after this long
const DOWN_WAKEUP_AFTER: Duration = Duration::from_secs(4);

#[derive(Default)]
struct Inner {
    backends: Vec<Arc<Backend>>,
    groups: Vec<Group>,
}

impl Inner {
    fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.name() == name)
    }

    fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name() == name)
    }
}

/// Registry of all known backends
pub struct BackendRegistry {
    inner: RwLock<Inner>,
    partition_mode: bool,
    priority_mode: AtomicBool,
    ro_count: AtomicUsize,
    read_cursor: AtomicUsize,
    need_refresh: AtomicBool,
    pool_limits: PoolLimits,
    last_check: Mutex<Option<Instant>>,
}

/// Split "addr[#weight][@group]" into its parts
fn parse_spec(raw: &str) -> Result<(String, Option<u8>, String)> {
    let raw = raw.trim();
    let (rest, group) = match raw.rsplit_once('@') {
        Some((rest, group)) => (rest, group.trim().to_string()),
        None => (raw, String::new()),
    };

    let (addr, weight) = match rest.rsplit_once('#') {
        Some((addr, w)) => {
            let w: u32 = w
                .trim()
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("weight in '{}'", raw)))?;
            (addr, Some(w.min(MAX_WEIGHT as u32) as u8))
        }
        None => (rest, None),
    };

    Ok((addr.trim().to_string(), weight, group))
}

impl BackendRegistry {
    pub fn new(partition_mode: bool, pool_limits: PoolLimits) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            partition_mode,
            priority_mode: AtomicBool::new(false),
            ro_count: AtomicUsize::new(0),
            read_cursor: AtomicUsize::new(0),
            need_refresh: AtomicBool::new(false),
            pool_limits,
            last_check: Mutex::new(None),
        }
    }

    pub fn is_partition_mode(&self) -> bool {
        self.partition_mode
    }

    pub fn priority_mode(&self) -> bool {
        self.priority_mode.load(Ordering::Relaxed)
    }

    pub fn set_priority_mode(&self, enabled: bool) {
        self.priority_mode.store(enabled, Ordering::Relaxed);
    }

    /// Group key a backend belongs to ("" = no group)
    fn group_key<'a>(&self, server_group: &'a str) -> &'a str {
        if self.partition_mode {
            PARTITION_SUPER_GROUP
        } else {
            server_group
        }
    }

    /// Add a backend from an "addr[#weight][@group]" spec, returning its index
    ///
    /// Fails with `AddressResolution` if the address cannot be resolved,
    /// `DuplicateBackend` if it is already known, and `SecondMaster` when
    /// adding an RW backend next to an active one.
    pub fn add(&self, raw: &str, kind: BackendType, state: BackendState) -> Result<usize> {
        let parsed = parse_spec(raw)?;
        let address = Address::resolve(&parsed.0)?;
        self.insert(raw, address, parsed, kind, state)
    }

    /// [`BackendRegistry::add`] for callers on the runtime: the name is
    /// resolved without blocking and the registry lock is only taken after
    pub async fn add_async(&self, raw: &str, kind: BackendType, state: BackendState) -> Result<usize> {
        let parsed = parse_spec(raw)?;
        let address = Address::lookup(&parsed.0).await?;
        self.insert(raw, address, parsed, kind, state)
    }

    fn insert(
        &self,
        raw: &str,
        address: Address,
        (addr_spec, weight, server_group): (String, Option<u8>, String),
        kind: BackendType,
        state: BackendState,
    ) -> Result<usize> {
        let mut inner = self.inner.write();

        if inner.backends.iter().any(|b| b.name() == address.name()) {
            tracing::error!("backend {} is already known!", raw);
            return Err(Error::DuplicateBackend(address.name().to_string()));
        }

        let key = self.group_key(&server_group).to_string();
        if kind == BackendType::Rw && Self::active_master_in(&inner, &key, None) {
            return Err(Error::SecondMaster(key));
        }

        if weight.is_some() {
            self.priority_mode.store(true, Ordering::Relaxed);
        }

        let backend = Arc::new(Backend::new(
            address,
            addr_spec,
            server_group,
            weight.unwrap_or(0),
            kind,
            state,
            self.pool_limits,
        ));

        inner.backends.push(Arc::clone(&backend));
        let index = inner.backends.len() - 1;
        if kind == BackendType::Ro {
            self.ro_count.fetch_add(1, Ordering::Relaxed);
        }

        if !key.is_empty() {
            if inner.group(&key).is_none() {
                inner.groups.push(Group::new(key.clone()));
            }
            if let Some(group) = inner.group_mut(&key) {
                group.add_member(backend);
            }
        }

        self.need_refresh.store(true, Ordering::Release);
        tracing::info!("added {} backend: {}, state: {}", kind, raw, state);
        Ok(index)
    }

    /// Whether an RW backend other than `exclude` is in service in `key`
    fn active_master_in(inner: &Inner, key: &str, exclude: Option<usize>) -> bool {
        let in_scope = |b: &Arc<Backend>| key.is_empty() || {
            let group = b.server_group();
            group == key || key == PARTITION_SUPER_GROUP
        };
        inner
            .backends
            .iter()
            .enumerate()
            .filter(|(i, b)| Some(*i) != exclude && in_scope(*b))
            .any(|(_, b)| b.backend_type() == BackendType::Rw && !b.state().is_administratively_out())
    }

    /// Whether `group` (or the whole registry, for "") already has an RW
    /// backend that is neither maintaining nor deleted
    pub fn has_active_master(&self, group: &str) -> bool {
        let inner = self.inner.read();
        Self::active_master_in(&inner, self.group_key(group), None)
    }

    /// Change type and/or state of backend `index`
    ///
    /// The state change is a compare-and-swap against `expected` (or the
    /// currently observed state when `None`); losing the race returns
    /// `StateConflict` and leaves the backend untouched. A change that
    /// would leave a second RW backend in service in the same group fails
    /// with `SecondMaster`. Returns whether anything changed.
    pub fn modify(
        &self,
        index: usize,
        kind: BackendType,
        state: BackendState,
        expected: Option<BackendState>,
    ) -> Result<bool> {
        let backend = self
            .get(index)
            .ok_or_else(|| Error::BackendNotFound(format!("index {}", index)))?;

        // Writer checks and type changes hold the write lock through the swap
        let becomes_master = kind == BackendType::Rw && !state.is_administratively_out();
        let mut inner = (becomes_master || backend.backend_type() != kind).then(|| self.inner.write());

        let old_kind = backend.backend_type();
        let old_state = backend.state();
        let key = self.group_key(backend.server_group()).to_string();
        let mut changed = false;

        if becomes_master
            && (old_state != state || old_kind != kind)
            && inner
                .as_deref()
                .is_some_and(|inner| Self::active_master_in(inner, &key, Some(index)))
        {
            tracing::error!("refusing to make {} a second active master of '{}'", backend.name(), key);
            return Err(Error::SecondMaster(key));
        }

        if old_state != state {
            let expected = expected.unwrap_or(old_state);
            if !backend.compare_and_swap_state(expected, state) {
                tracing::debug!("there might be conflict, modify of {} failed", backend.name());
                return Err(Error::StateConflict(backend.name()));
            }
            if state.is_available() {
                self.need_refresh.store(true, Ordering::Release);
            }
            if matches!(state, BackendState::Offline | BackendState::Deleted) {
                let closed = backend.pool().clear();
                if closed > 0 {
                    tracing::debug!("closed {} idle connections of {}", closed, backend.name());
                }
            }
            changed = true;
        }

        if old_kind != kind {
            let inner = inner.get_or_insert_with(|| self.inner.write());
            backend.set_backend_type(kind);
            if kind == BackendType::Ro {
                self.ro_count.fetch_add(1, Ordering::Relaxed);
            } else if old_kind == BackendType::Ro {
                let _ = self
                    .ro_count
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            }
            if let Some(group) = inner.group_mut(&key) {
                group.rebuild();
            }
            changed = true;
        }

        if changed {
            tracing::info!(
                "change backend: {} from type: {}, state: {} to type: {}, state: {}",
                backend.name(),
                old_kind,
                old_state,
                kind,
                state
            );
        }

        Ok(changed)
    }

    /// Change only the state, keeping the type
    pub fn set_state(&self, index: usize, state: BackendState, expected: Option<BackendState>) -> Result<bool> {
        let kind = self
            .get(index)
            .map(|b| b.backend_type())
            .ok_or_else(|| Error::BackendNotFound(format!("index {}", index)))?;
        self.modify(index, kind, state, expected)
    }

    /// Soft-delete: the slot stays so indices remain stable
    pub fn remove(&self, index: usize) -> Result<bool> {
        self.modify(index, BackendType::Unknown, BackendState::Deleted, None)
    }

    pub fn get(&self, index: usize) -> Option<Arc<Backend>> {
        self.inner.read().backends.get(index).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.read().backends.len()
    }

    /// Snapshot of all backends, in index order
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.inner.read().backends.clone()
    }

    /// Index of the backend with this "ip:port" (or configured alias)
    pub fn find_by_address(&self, addr: &str) -> Option<usize> {
        let addr = addr.trim();
        self.inner
            .read()
            .backends
            .iter()
            .position(|b| b.name() == addr || b.alias() == addr)
    }

    /// Number of backends of type RO
    pub fn ro_count(&self) -> usize {
        self.ro_count.load(Ordering::Relaxed)
    }

    /// First RW backend that is UP or UNKNOWN
    pub fn pick_rw(&self) -> Option<usize> {
        self.inner
            .read()
            .backends
            .iter()
            .position(|b| b.backend_type() == BackendType::Rw && b.is_available())
    }

    /// Round-robin over usable RO backends; in priority mode only those
    /// with the highest weight among them are candidates
    pub fn pick_ro(&self) -> Option<usize> {
        let inner = self.inner.read();
        let active: Vec<(usize, u8)> = inner
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.backend_type() == BackendType::Ro && b.is_available())
            .map(|(i, b)| (i, b.weight()))
            .collect();

        let candidates: Vec<usize> = if self.priority_mode() {
            let max_weight = active.iter().map(|(_, w)| *w).max().unwrap_or(0);
            active
                .iter()
                .filter(|(_, w)| *w == max_weight)
                .map(|(i, _)| *i)
                .collect()
        } else {
            active.iter().map(|(i, _)| *i).collect()
        };

        if candidates.is_empty() {
            return None;
        }
        let cursor = self.read_cursor.fetch_add(1, Ordering::Relaxed);
        Some(candidates[cursor % candidates.len()])
    }

    /// Round-robin slave of a named group
    pub fn pick_slave(&self, group: &str) -> Option<Arc<Backend>> {
        let inner = self.inner.read();
        inner.group(self.group_key(group))?.pick_slave()
    }

    /// Current master of a named group
    pub fn group_master(&self, group: &str) -> Option<Arc<Backend>> {
        let inner = self.inner.read();
        inner.group(self.group_key(group))?.master().cloned()
    }

    pub fn group_count(&self) -> usize {
        self.inner.read().groups.len()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.inner.read().groups.iter().map(|g| g.name().to_string()).collect()
    }

    pub fn groups(&self) -> Vec<GroupSummary> {
        self.inner.read().groups.iter().map(Group::summary).collect()
    }

    /// Backends (with indices) whose group key is `group`
    pub fn group_members(&self, group: &str) -> Vec<(usize, Arc<Backend>)> {
        let key = self.group_key(group);
        self.inner
            .read()
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| self.group_key(b.server_group()) == key)
            .map(|(i, b)| (i, Arc::clone(b)))
            .collect()
    }

    /// Idle pooled connections across all backends
    pub fn idle_connection_total(&self) -> usize {
        self.inner.read().backends.iter().map(|b| b.idle_conns()).sum()
    }

    /// Connections currently in use by client sessions
    pub fn used_connection_total(&self) -> usize {
        self.inner.read().backends.iter().map(|b| b.connected_clients()).sum()
    }

    /// Consume the "connections need refresh" flag
    pub fn take_need_refresh(&self) -> bool {
        self.need_refresh.swap(false, Ordering::AcqRel)
    }

    /// Move backends that have been DOWN for a while back to UNKNOWN so
    /// they get tried again. Runs at most once per second; returns the
    /// number of backends woken up.
    pub fn wake_down_backends(&self) -> usize {
        {
            let mut last = self.last_check.lock();
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < Duration::from_secs(1) {
                    return 0;
                }
            }
            *last = Some(now);
        }

        let now = Utc::now();
        let mut woken = 0;
        for backend in self.backends() {
            if backend.state() != BackendState::Down {
                continue;
            }
            let down_for = now.signed_duration_since(backend.state_since());
            if down_for.num_milliseconds() > DOWN_WAKEUP_AFTER.as_millis() as i64
                && backend.compare_and_swap_state(BackendState::Down, BackendState::Unknown)
            {
                tracing::debug!("backend {} was down for more than 4 secs, waking it up", backend.name());
                woken += 1;
            }
        }
        woken
    }

    /// Persisted specs of live backends, split into (rw, ro)
    pub fn persisted_specs(&self) -> (Vec<String>, Vec<String>) {
        let mut rw = Vec::new();
        let mut ro = Vec::new();
        for backend in self.backends() {
            if backend.state() == BackendState::Deleted {
                continue;
            }
            match backend.backend_type() {
                BackendType::Rw => rw.push(backend.persisted_spec()),
                BackendType::Ro => ro.push(backend.persisted_spec()),
                BackendType::Unknown => {}
            }
        }
        (rw, ro)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(false, PoolLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn registry() -> BackendRegistry {
        BackendRegistry::default()
    }

    #[test]
    fn test_parse_spec() {
        assert_eq!(
            parse_spec("10.0.0.1:3306#12@g1").unwrap(),
            ("10.0.0.1:3306".to_string(), Some(MAX_WEIGHT), "g1".to_string())
        );
        assert_eq!(
            parse_spec("10.0.0.1:3306").unwrap(),
            ("10.0.0.1:3306".to_string(), None, String::new())
        );
        assert!(parse_spec("10.0.0.1:3306#x").is_err());
    }

    #[test]
    fn test_duplicate_add() {
        let reg = registry();
        reg.add("10.0.0.1:3306", BackendType::Ro, BackendState::Up).unwrap();
        let err = reg.add("10.0.0.1:3306", BackendType::Ro, BackendState::Up).unwrap_err();
        assert!(matches!(err, Error::DuplicateBackend(_)));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn test_unresolvable_address_is_network_error() {
        let reg = registry();
        let err = reg.add("10.0.0.1:99999", BackendType::Ro, BackendState::Up).unwrap_err();
        assert!(matches!(err, Error::AddressResolution(_)));
        assert_eq!(reg.count(), 0);
    }

    #[tokio::test]
    async fn test_add_async_resolves_hostname() {
        let reg = registry();
        let index = reg
            .add_async("localhost:3306@g1", BackendType::Rw, BackendState::Up)
            .await
            .unwrap();
        let backend = reg.get(index).unwrap();
        assert_eq!(backend.alias(), "localhost:3306");
        assert_eq!(backend.server_group(), "g1");

        // Same checks as the blocking path
        let err = reg
            .add_async(&backend.name(), BackendType::Ro, BackendState::Up)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateBackend(_)));
        assert!(reg
            .add_async("10.0.0.2:3306@g1", BackendType::Rw, BackendState::Up)
            .await
            .is_err());
    }

    #[test]
    fn test_second_master_in_group() {
        let reg = registry();
        reg.add("10.0.0.1:3306@g1", BackendType::Rw, BackendState::Up).unwrap();
        let err = reg.add("10.0.0.2:3306@g1", BackendType::Rw, BackendState::Up).unwrap_err();
        assert!(matches!(err, Error::SecondMaster(_)));
        assert_eq!(reg.group_master("g1").unwrap().name(), "10.0.0.1:3306");

        // Another group may have its own master
        reg.add("10.0.0.3:3306@g2", BackendType::Rw, BackendState::Up).unwrap();
        assert_eq!(reg.group_count(), 2);
    }

    #[test]
    fn test_second_master_without_groups() {
        let reg = registry();
        reg.add("10.0.0.1:3306", BackendType::Rw, BackendState::Up).unwrap();
        assert!(reg.add("10.0.0.2:3306", BackendType::Rw, BackendState::Up).is_err());

        // A master in maintenance does not block a new one
        reg.set_state(0, BackendState::Maintaining, None).unwrap();
        reg.add("10.0.0.2:3306", BackendType::Rw, BackendState::Up).unwrap();
    }

    #[test]
    fn test_reactivating_old_master_refused() {
        let reg = registry();
        reg.add("10.0.0.1:3306@g1", BackendType::Rw, BackendState::Up).unwrap();
        reg.add("10.0.0.2:3306@g1", BackendType::Ro, BackendState::Up).unwrap();

        reg.set_state(0, BackendState::Maintaining, None).unwrap();
        assert!(!reg.has_active_master("g1"));
        reg.modify(1, BackendType::Rw, BackendState::Up, None).unwrap();
        assert!(reg.has_active_master("g1"));

        for state in [BackendState::Up, BackendState::Unknown, BackendState::Down, BackendState::Offline] {
            let err = reg.set_state(0, state, None).unwrap_err();
            assert!(matches!(err, Error::SecondMaster(_)));
        }
        assert_eq!(reg.get(0).unwrap().state(), BackendState::Maintaining);

        // Back as a slave is fine, and the new master may still change state
        reg.modify(0, BackendType::Ro, BackendState::Up, None).unwrap();
        assert!(reg.set_state(1, BackendState::Down, None).unwrap());
        let active = reg
            .backends()
            .iter()
            .filter(|b| b.backend_type() == BackendType::Rw && !b.state().is_administratively_out())
            .count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn test_offline_clears_idle_pool() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = tokio::net::TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();

        let reg = registry();
        reg.add("10.0.0.2:3306", BackendType::Ro, BackendState::Up).unwrap();
        assert!(reg.get(0).unwrap().pool().add("app", conn).is_none());
        assert_eq!(reg.idle_connection_total(), 1);

        reg.set_state(0, BackendState::Offline, None).unwrap();
        assert_eq!(reg.idle_connection_total(), 0);
    }

    #[test]
    fn test_indices_stable_across_remove() {
        let reg = registry();
        let a = reg.add("10.0.0.1:3306", BackendType::Ro, BackendState::Up).unwrap();
        let b = reg.add("10.0.0.2:3306", BackendType::Ro, BackendState::Up).unwrap();
        reg.remove(a).unwrap();
        let c = reg.add("10.0.0.3:3306", BackendType::Ro, BackendState::Up).unwrap();

        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(reg.get(a).unwrap().state(), BackendState::Deleted);
        assert_eq!(reg.get(b).unwrap().name(), "10.0.0.2:3306");
        assert_eq!(reg.ro_count(), 2);
    }

    #[test]
    fn test_modify_conflict() {
        let reg = registry();
        reg.add("10.0.0.1:3306", BackendType::Ro, BackendState::Up).unwrap();

        let err = reg
            .modify(0, BackendType::Ro, BackendState::Down, Some(BackendState::Unknown))
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)));
        assert_eq!(reg.get(0).unwrap().state(), BackendState::Up);

        assert!(reg.modify(0, BackendType::Ro, BackendState::Down, Some(BackendState::Up)).unwrap());
        assert!(!reg.modify(0, BackendType::Ro, BackendState::Down, None).unwrap());
        assert!(reg.modify(9, BackendType::Ro, BackendState::Down, None).is_err());
    }

    #[test]
    fn test_concurrent_cas_single_winner() {
        let reg = Arc::new(registry());
        reg.add("10.0.0.1:3306", BackendType::Ro, BackendState::Up).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    reg.modify(0, BackendType::Ro, BackendState::Down, Some(BackendState::Up)).is_ok()
                })
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();

        // Losers either conflict or observe the state already changed
        assert!(winners >= 1);
        assert_eq!(reg.get(0).unwrap().state(), BackendState::Down);
    }

    #[test]
    fn test_type_change_rebuilds_group() {
        let reg = registry();
        reg.add("10.0.0.1:3306@g1", BackendType::Rw, BackendState::Up).unwrap();
        reg.add("10.0.0.2:3306@g1", BackendType::Ro, BackendState::Up).unwrap();

        reg.modify(0, BackendType::Ro, BackendState::Up, None).unwrap();
        reg.modify(1, BackendType::Rw, BackendState::Up, None).unwrap();

        let groups = reg.groups();
        assert_eq!(groups[0].master.as_deref(), Some("10.0.0.2:3306"));
        assert_eq!(groups[0].slaves, vec!["10.0.0.1:3306".to_string()]);
        assert_eq!(reg.ro_count(), 1);
    }

    #[test]
    fn test_pick_rw_and_ro() {
        let reg = registry();
        reg.add("10.0.0.1:3306", BackendType::Rw, BackendState::Down).unwrap();
        reg.add("10.0.0.2:3306", BackendType::Ro, BackendState::Up).unwrap();
        reg.add("10.0.0.3:3306", BackendType::Ro, BackendState::Unknown).unwrap();
        reg.add("10.0.0.4:3306", BackendType::Ro, BackendState::Down).unwrap();

        assert_eq!(reg.pick_rw(), None);
        reg.set_state(0, BackendState::Up, None).unwrap();
        assert_eq!(reg.pick_rw(), Some(0));

        let picks: HashSet<usize> = (0..6).filter_map(|_| reg.pick_ro()).collect();
        assert_eq!(picks, HashSet::from([1, 2]));
    }

    #[test]
    fn test_pick_ro_priority_mode() {
        let reg = registry();
        reg.add("10.0.0.1:3306#2", BackendType::Ro, BackendState::Up).unwrap();
        reg.add("10.0.0.2:3306#5", BackendType::Ro, BackendState::Up).unwrap();
        reg.add("10.0.0.3:3306#5", BackendType::Ro, BackendState::Up).unwrap();
        assert!(reg.priority_mode());

        let picks: HashSet<usize> = (0..10).filter_map(|_| reg.pick_ro()).collect();
        assert_eq!(picks, HashSet::from([1, 2]));

        // Highest weight gone: the next weight level takes over
        reg.set_state(1, BackendState::Down, None).unwrap();
        reg.set_state(2, BackendState::Down, None).unwrap();
        assert_eq!(reg.pick_ro(), Some(0));

        reg.set_state(1, BackendState::Up, None).unwrap();
        reg.set_priority_mode(false);
        let picks: HashSet<usize> = (0..10).filter_map(|_| reg.pick_ro()).collect();
        assert_eq!(picks, HashSet::from([0, 1]));
    }

    #[test]
    fn test_partition_mode_single_group() {
        let reg = BackendRegistry::new(true, PoolLimits::default());
        reg.add("10.0.0.1:3306@g1", BackendType::Rw, BackendState::Up).unwrap();
        reg.add("10.0.0.2:3306@g2", BackendType::Ro, BackendState::Up).unwrap();
        assert_eq!(reg.group_names(), vec![PARTITION_SUPER_GROUP.to_string()]);
        assert!(reg.add("10.0.0.3:3306@g3", BackendType::Rw, BackendState::Up).is_err());
    }

    #[test]
    fn test_need_refresh_flag() {
        let reg = registry();
        assert!(!reg.take_need_refresh());
        reg.add("10.0.0.1:3306", BackendType::Ro, BackendState::Down).unwrap();
        assert!(reg.take_need_refresh());
        reg.set_state(0, BackendState::Up, None).unwrap();
        assert!(reg.take_need_refresh());
        assert!(!reg.take_need_refresh());
    }

    #[test]
    fn test_find_and_persisted_specs() {
        let reg = registry();
        reg.add("10.0.0.1:3306@g1", BackendType::Rw, BackendState::Up).unwrap();
        reg.add("10.0.0.2:3306#3@g1", BackendType::Ro, BackendState::Up).unwrap();
        reg.add("10.0.0.3:3306@g1", BackendType::Ro, BackendState::Up).unwrap();
        reg.remove(2).unwrap();

        assert_eq!(reg.find_by_address("10.0.0.2:3306"), Some(1));
        assert_eq!(reg.find_by_address("10.9.9.9:3306"), None);

        let (rw, ro) = reg.persisted_specs();
        assert_eq!(rw, vec!["10.0.0.1:3306@g1".to_string()]);
        assert_eq!(ro, vec!["10.0.0.2:3306#3@g1".to_string()]);
    }

    #[test]
    fn test_connection_totals() {
        let reg = registry();
        reg.add("10.0.0.1:3306", BackendType::Ro, BackendState::Up).unwrap();
        reg.add("10.0.0.2:3306", BackendType::Ro, BackendState::Up).unwrap();
        reg.get(0).unwrap().client_attached();
        reg.get(1).unwrap().client_attached();
        assert_eq!(reg.used_connection_total(), 2);
        assert_eq!(reg.idle_connection_total(), 0);
    }
}
