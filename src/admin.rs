//! Admin Service
//!
//! Operations behind the admin interface, with arguments already parsed.
//! Each one returns either a [`ResultSet`] to show as a table or an
//! [`Outcome`] with the number of affected rows.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::{BackendState, BackendType};
use crate::context::{ProxyContext, BACKENDS_OBJECT};
use crate::error::{Error, Result};
use crate::retry::retry_until;
use crate::sharding::{ShardedTable, Vdb};

/// Tabular admin reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<Option<String>>) {
        self.rows.push(row);
    }
}

/// Reply of a mutating admin command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub affected_rows: u64,
}

impl Outcome {
    fn rows(n: u64) -> Self {
        Self { affected_rows: n }
    }
}

/// Pool usage totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub idle_connections: usize,
    pub used_connections: usize,
}

/// How an admin command names a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackendSelector {
    /// 1-based `backend_ndx`
    Index(usize),
    /// "ip:port" or the configured alias
    Address(String),
}

impl FromStr for BackendSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidParameter("empty backend selector".into()));
        }
        Ok(match s.parse::<usize>() {
            Ok(n) => BackendSelector::Index(n),
            Err(_) => BackendSelector::Address(s.to_string()),
        })
    }
}

impl fmt::Display for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSelector::Index(n) => write!(f, "backend_ndx {}", n),
            BackendSelector::Address(a) => write!(f, "{}", a),
        }
    }
}

/// Admin operations over a [`ProxyContext`]
#[derive(Clone)]
pub struct AdminService {
    ctx: Arc<ProxyContext>,
}

impl AdminService {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// 0-based registry index of a live backend
    fn resolve(&self, selector: &BackendSelector) -> Result<usize> {
        let registry = self.ctx.registry();
        let index = match selector {
            BackendSelector::Index(n) if *n >= 1 => Some(n - 1),
            BackendSelector::Index(_) => None,
            BackendSelector::Address(addr) => registry.find_by_address(addr),
        };
        index
            .filter(|&i| {
                registry
                    .get(i)
                    .is_some_and(|b| b.state() != BackendState::Deleted)
            })
            .ok_or_else(|| Error::BackendNotFound(selector.to_string()))
    }

    pub fn select_all_backends(&self) -> ResultSet {
        let mut rs = ResultSet::new(&[
            "backend_ndx",
            "address",
            "state",
            "type",
            "slave delay",
            "idle_conns",
            "used_conns",
            "total_conns",
            "group",
        ]);

        for (index, backend) in self.ctx.registry().backends().iter().enumerate() {
            if backend.state() == BackendState::Deleted {
                continue;
            }
            let kind = backend.backend_type();
            let delay = (kind == BackendType::Ro).then(|| backend.slave_delay_ms().to_string());
            let group = backend.server_group();
            rs.push(vec![
                Some((index + 1).to_string()),
                Some(backend.alias().to_string()),
                Some(backend.state().to_string()),
                Some(kind.to_string()),
                delay,
                Some(backend.idle_conns().to_string()),
                Some(backend.connected_clients().to_string()),
                Some(backend.conns_count().to_string()),
                (!group.is_empty()).then(|| group.to_string()),
            ]);
        }
        rs
    }

    pub async fn insert_backend(&self, spec: &str, kind: BackendType, state: BackendState) -> Result<Outcome> {
        if state == BackendState::Deleted {
            return Err(Error::InvalidParameter("cannot insert a deleted backend".into()));
        }
        self.ctx.registry().add_async(spec, kind, state).await?;
        Ok(Outcome::rows(1))
    }

    /// Change type and/or state; omitted fields keep their value
    pub fn update_backend(
        &self,
        selector: &BackendSelector,
        kind: Option<BackendType>,
        state: Option<BackendState>,
    ) -> Result<Outcome> {
        let index = self.resolve(selector)?;
        let registry = self.ctx.registry();
        let backend = registry
            .get(index)
            .ok_or_else(|| Error::BackendNotFound(selector.to_string()))?;

        let current_kind = backend.backend_type();
        let current_state = backend.state();
        let kind = kind.unwrap_or(current_kind);
        let state = state.unwrap_or(current_state);

        if state == BackendState::Deleted {
            return Err(Error::InvalidParameter("use delete to remove a backend".into()));
        }
        let changed = registry.modify(index, kind, state, Some(current_state))?;
        Ok(Outcome::rows(changed as u64))
    }

    pub fn delete_backend(&self, selector: &BackendSelector) -> Result<Outcome> {
        let index = self.resolve(selector)?;
        let changed = self.ctx.registry().remove(index)?;
        Ok(Outcome::rows(changed as u64))
    }

    pub fn select_all_groups(&self) -> ResultSet {
        let mut rs = ResultSet::new(&["group", "master", "slaves"]);
        for group in self.ctx.registry().groups() {
            rs.push(vec![
                Some(group.name),
                group.master,
                (!group.slaves.is_empty()).then(|| group.slaves.join(",")),
            ]);
        }
        rs
    }

    /// Add a vdb given in its persisted JSON form
    pub fn create_vdb(&self, definition: &Value) -> Result<Outcome> {
        let vdb = Vdb::from_json(definition)?;
        self.ctx
            .sharding()
            .add_vdb(vdb, self.ctx.registry().group_count())?;
        Ok(Outcome::rows(1))
    }

    pub fn create_sharded_table(&self, schema: &str, table: &str, shard_key: &str, vdb_id: i64) -> Result<Outcome> {
        if schema.is_empty() || table.is_empty() || shard_key.is_empty() {
            return Err(Error::InvalidParameter("schema, table and shard key are required".into()));
        }
        self.ctx
            .sharding()
            .add_sharded_table(ShardedTable::new(schema, table, shard_key, vdb_id))?;
        Ok(Outcome::rows(1))
    }

    pub fn create_single_table(&self, schema: &str, table: &str, group: &str) -> Result<Outcome> {
        if schema.is_empty() || table.is_empty() || group.is_empty() {
            return Err(Error::InvalidParameter("schema, table and group are required".into()));
        }
        self.ctx.sharding().add_single_table(schema, table, group)?;
        Ok(Outcome::rows(1))
    }

    pub fn select_vdb(&self) -> ResultSet {
        let mut rs = ResultSet::new(&["VDB id", "Method", "Partitions"]);
        for vdb in self.ctx.sharding().vdbs() {
            rs.push(vec![
                Some(vdb.id().to_string()),
                Some(vdb.method().to_string()),
                Some(vdb.describe_partitions()),
            ]);
        }
        rs
    }

    pub fn select_sharded_tables(&self) -> ResultSet {
        let mut rs = ResultSet::new(&["Table", "VDB id", "Key"]);
        for table in self.ctx.sharding().sharded_tables() {
            rs.push(vec![
                Some(format!("{}.{}", table.schema, table.table)),
                Some(table.vdb_id.to_string()),
                Some(table.shard_key),
            ]);
        }
        rs
    }

    pub fn select_single_tables(&self) -> ResultSet {
        let mut rs = ResultSet::new(&["Table", "Group"]);
        for table in self.ctx.sharding().single_tables() {
            rs.push(vec![
                Some(format!("{}.{}", table.schema, table.table)),
                Some(table.group),
            ]);
        }
        rs
    }

    /// Re-read the sharding object from the store and swap it in
    pub async fn reload_sharding(&self) -> Result<Outcome> {
        let name = &self.ctx.settings().sharding_object;
        let root = self
            .ctx
            .store()
            .query_object(name)
            .await?
            .ok_or_else(|| Error::Sharding(format!("no '{}' object stored", name)))?;

        let sharding = self.ctx.sharding();
        sharding.load(&root, self.ctx.registry().group_count())?;
        Ok(Outcome::rows(sharding.vdbs().len() as u64))
    }

    /// Persist the backend list, and the sharding config when enabled
    pub async fn save_settings(&self) -> Result<Outcome> {
        let settings = self.ctx.settings();
        let store = self.ctx.store().as_ref();

        let (rw, ro) = self.ctx.registry().persisted_specs();
        let backends = json!({ "rw": rw, "ro": ro });
        let body = &backends;
        retry_until("save backends", settings.retry, move || {
            store.write_object(BACKENDS_OBJECT, body)
        })
        .await?;
        let mut written = 1;

        if settings.sharding_enabled {
            let sharding = self.ctx.sharding().to_json();
            let body = &sharding;
            let name = settings.sharding_object.as_str();
            retry_until("save sharding", settings.retry, move || store.write_object(name, body)).await?;
            written += 1;
        }

        tracing::info!("Settings saved ({} objects)", written);
        Ok(Outcome::rows(written))
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let registry = self.ctx.registry();
        ConnectionStats {
            idle_connections: registry.idle_connection_total(),
            used_connections: registry.used_connection_total(),
        }
    }
}
