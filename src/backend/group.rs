//! Replication Group Topology
//!
//! A group is one master plus up to [`MAX_GROUP_SLAVES`] slaves (and the
//! same number of members of unknown type). The member list is the source
//! of truth; the master/slave/unknown slots are re-derived from it by
//! [`Group::rebuild`] whenever any member changes type.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::{Backend, BackendType};

/// Maximum slaves (and unknown members) tracked per group
pub const MAX_GROUP_SLAVES: usize = 4;

/// One replication group
#[derive(Debug)]
pub struct Group {
    name: String,
    members: Vec<Arc<Backend>>,
    master: Option<Arc<Backend>>,
    slaves: Vec<Arc<Backend>>,
    unknown: Vec<Arc<Backend>>,
    slave_cursor: AtomicUsize,
}

/// Group row for admin listing
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupSummary {
    pub name: String,
    pub master: Option<String>,
    pub slaves: Vec<String>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            master: None,
            slaves: Vec::new(),
            unknown: Vec::new(),
            slave_cursor: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> Option<&Arc<Backend>> {
        self.master.as_ref()
    }

    pub fn slaves(&self) -> &[Arc<Backend>] {
        &self.slaves
    }

    pub fn unknown(&self) -> &[Arc<Backend>] {
        &self.unknown
    }

    pub fn members(&self) -> &[Arc<Backend>] {
        &self.members
    }

    /// Register a member and slot it by its current type
    pub fn add_member(&mut self, backend: Arc<Backend>) {
        if !self.members.iter().any(|m| Arc::ptr_eq(m, &backend)) {
            self.members.push(Arc::clone(&backend));
        }
        self.place(backend);
    }

    fn place(&mut self, backend: Arc<Backend>) {
        match backend.backend_type() {
            BackendType::Rw => {
                if let Some(master) = &self.master {
                    // The earlier master keeps the slot
                    tracing::error!(
                        "group {}: only one master each group, keeping {} and ignoring {}",
                        self.name,
                        master.name(),
                        backend.name()
                    );
                    return;
                }
                self.master = Some(backend);
            }
            BackendType::Ro => Self::place_bounded(&self.name, "slaves", &mut self.slaves, backend),
            BackendType::Unknown => {
                Self::place_bounded(&self.name, "unknown", &mut self.unknown, backend)
            }
        }
    }

    fn place_bounded(group: &str, what: &str, list: &mut Vec<Arc<Backend>>, backend: Arc<Backend>) {
        let name = backend.name();
        if list.iter().any(|b| b.name() == name) {
            return;
        }
        if list.len() >= MAX_GROUP_SLAVES {
            tracing::error!("group {}: too many {} for group, dropping {}", group, what, name);
            return;
        }
        list.push(backend);
    }

    /// Re-derive master/slaves/unknown from the member list
    pub fn rebuild(&mut self) {
        self.master = None;
        self.slaves.clear();
        self.unknown.clear();

        let members = self.members.clone();
        for backend in members {
            self.place(backend);
        }
    }

    /// Round-robin over slaves, skipping any not UP/UNKNOWN. A slave with
    /// spare pool capacity is preferred; otherwise the first usable one
    /// seen is returned.
    pub fn pick_slave(&self) -> Option<Arc<Backend>> {
        let n = self.slaves.len();
        let mut fallback: Option<&Arc<Backend>> = None;

        for _ in 0..n {
            let index = self.slave_cursor.fetch_add(1, Ordering::Relaxed) % n;
            let backend = &self.slaves[index];
            if !backend.is_available() {
                tracing::debug!("group {}: skip dead slave {}", self.name, backend.name());
                continue;
            }
            if backend.has_capacity() {
                return Some(Arc::clone(backend));
            }
            fallback.get_or_insert(backend);
        }

        fallback.cloned()
    }

    /// Addresses of the slaves, in slot order
    pub fn slave_names(&self) -> Vec<String> {
        self.slaves.iter().map(|b| b.name()).collect()
    }

    pub fn summary(&self) -> GroupSummary {
        GroupSummary {
            name: self.name.clone(),
            master: self.master.as_ref().map(|m| m.name()),
            slaves: self.slave_names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::backend::BackendState;
    use crate::pool::PoolLimits;

    fn member(addr: &str, kind: BackendType, state: BackendState) -> Arc<Backend> {
        Arc::new(Backend::new(
            Address::resolve(addr).unwrap(),
            addr.to_string(),
            "g1".into(),
            0,
            kind,
            state,
            PoolLimits { max_idle: 2, mid_idle: 1, min_idle: 1 },
        ))
    }

    #[test]
    fn test_classification() {
        let mut g = Group::new("g1");
        g.add_member(member("10.0.0.1:3306", BackendType::Rw, BackendState::Up));
        g.add_member(member("10.0.0.2:3306", BackendType::Ro, BackendState::Up));
        g.add_member(member("10.0.0.3:3306", BackendType::Unknown, BackendState::Unknown));

        assert_eq!(g.master().unwrap().name(), "10.0.0.1:3306");
        assert_eq!(g.slave_names(), vec!["10.0.0.2:3306"]);
        assert_eq!(g.unknown().len(), 1);
    }

    #[test]
    fn test_second_master_keeps_earlier() {
        let mut g = Group::new("g1");
        g.add_member(member("10.0.0.1:3306", BackendType::Rw, BackendState::Up));
        g.add_member(member("10.0.0.2:3306", BackendType::Rw, BackendState::Up));

        assert_eq!(g.master().unwrap().name(), "10.0.0.1:3306");
        // The ignored claim stays a member and is reconsidered on rebuild
        assert_eq!(g.members().len(), 2);
    }

    #[test]
    fn test_rebuild_after_type_change() {
        let mut g = Group::new("g1");
        let old_master = member("10.0.0.1:3306", BackendType::Rw, BackendState::Up);
        let slave = member("10.0.0.2:3306", BackendType::Ro, BackendState::Up);
        g.add_member(Arc::clone(&old_master));
        g.add_member(Arc::clone(&slave));

        old_master.set_backend_type(BackendType::Ro);
        slave.set_backend_type(BackendType::Rw);
        g.rebuild();

        assert_eq!(g.master().unwrap().name(), "10.0.0.2:3306");
        assert_eq!(g.slave_names(), vec!["10.0.0.1:3306"]);
    }

    #[test]
    fn test_slave_bound() {
        let mut g = Group::new("g1");
        for i in 1..=MAX_GROUP_SLAVES + 1 {
            g.add_member(member(&format!("10.0.1.{}:3306", i), BackendType::Ro, BackendState::Up));
        }
        assert_eq!(g.slaves().len(), MAX_GROUP_SLAVES);
    }

    #[test]
    fn test_pick_slave_round_robin_skips_down() {
        let mut g = Group::new("g1");
        g.add_member(member("10.0.0.2:3306", BackendType::Ro, BackendState::Up));
        g.add_member(member("10.0.0.3:3306", BackendType::Ro, BackendState::Down));
        g.add_member(member("10.0.0.4:3306", BackendType::Ro, BackendState::Unknown));

        let picks: Vec<String> = (0..4).map(|_| g.pick_slave().unwrap().name()).collect();
        assert!(!picks.contains(&"10.0.0.3:3306".to_string()));
        assert!(picks.contains(&"10.0.0.2:3306".to_string()));
        assert!(picks.contains(&"10.0.0.4:3306".to_string()));
    }

    #[test]
    fn test_pick_slave_prefers_capacity() {
        let mut g = Group::new("g1");
        let busy = member("10.0.0.2:3306", BackendType::Ro, BackendState::Up);
        let free = member("10.0.0.3:3306", BackendType::Ro, BackendState::Up);
        for _ in 0..5 {
            busy.client_attached();
        }
        g.add_member(Arc::clone(&busy));
        g.add_member(Arc::clone(&free));

        for _ in 0..4 {
            assert_eq!(g.pick_slave().unwrap().name(), "10.0.0.3:3306");
        }

        // Saturated slaves are still returned when nothing better exists
        for _ in 0..5 {
            free.client_attached();
        }
        assert!(g.pick_slave().is_some());
    }

    #[test]
    fn test_pick_slave_none_when_all_down() {
        let mut g = Group::new("g1");
        g.add_member(member("10.0.0.2:3306", BackendType::Ro, BackendState::Down));
        assert!(g.pick_slave().is_none());
        assert!(Group::new("empty").pick_slave().is_none());
    }
}
