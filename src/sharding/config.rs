//! Installed sharding configuration
//!
//! The whole configuration lives in one immutable [`Snapshot`] behind an
//! `ArcSwap`. Routing queries load the current snapshot without locking;
//! every mutation builds a new snapshot, validates it and swaps it in, so
//! readers see either the old or the new configuration and nothing in
//! between. A failed validation leaves the installed snapshot untouched.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Partition, Vdb};
use crate::error::{Error, Result};

/// A table sharded over the partitions of a vdb
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardedTable {
    #[serde(rename = "db")]
    pub schema: String,
    pub table: String,
    #[serde(rename = "pkey")]
    pub shard_key: String,
    #[serde(rename = "vdb")]
    pub vdb_id: i64,
}

impl ShardedTable {
    pub fn new(schema: &str, table: &str, shard_key: &str, vdb_id: i64) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            shard_key: shard_key.to_string(),
            vdb_id,
        }
    }

    fn from_json(value: &Value) -> Result<Self> {
        let text = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Sharding(format!("table entry without '{}': {}", name, value)))
        };
        let vdb_id = match value.get("vdb") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| Error::Sharding(format!("table entry without a valid 'vdb': {}", value)))?;

        Ok(Self::new(text("db")?, text("table")?, text("pkey")?, vdb_id))
    }
}

/// A table kept whole on a single group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleTable {
    #[serde(rename = "db")]
    pub schema: String,
    pub table: String,
    pub group: String,
}

fn table_key(schema: &str, table: &str) -> (String, String) {
    (schema.to_lowercase(), table.to_lowercase())
}

/// One consistent generation of the sharding configuration
#[derive(Debug, Clone, Default)]
struct Snapshot {
    vdbs: Vec<Arc<Vdb>>,
    tables: Vec<ShardedTable>,
    table_index: HashMap<(String, String), usize>,
    schema_vdb: HashMap<String, i64>,
    single_tables: Vec<SingleTable>,
    single_index: HashMap<(String, String), usize>,
    groups: Vec<String>,
}

impl Snapshot {
    fn vdb(&self, id: i64) -> Option<&Arc<Vdb>> {
        self.vdbs.iter().find(|v| v.id() == id)
    }

    fn push_vdb(&mut self, vdb: Vdb, group_count: usize, partition_mode: bool) -> Result<()> {
        vdb.validate(group_count, partition_mode)?;
        if self.vdb(vdb.id()).is_some() {
            return Err(Error::DuplicateVdb(vdb.id()));
        }
        for group in vdb.groups() {
            if !self.groups.contains(&group) {
                self.groups.push(group);
            }
        }
        self.vdbs.push(Arc::new(vdb));
        Ok(())
    }

    fn push_table(&mut self, table: ShardedTable) -> Result<()> {
        if self.vdb(table.vdb_id).is_none() {
            return Err(Error::UnknownVdb(table.vdb_id));
        }

        let key = table_key(&table.schema, &table.table);
        if self.table_index.contains_key(&key) {
            return Err(Error::DuplicateTable(format!("{}.{}", table.schema, table.table)));
        }

        match self.schema_vdb.get(&key.0) {
            Some(&id) if id != table.vdb_id => {
                return Err(Error::Sharding(format!(
                    "schema {} is already sharded by vdb {}, cannot use vdb {}",
                    table.schema, id, table.vdb_id
                )));
            }
            Some(_) => {}
            None => {
                self.schema_vdb.insert(key.0.clone(), table.vdb_id);
            }
        }

        self.table_index.insert(key, self.tables.len());
        self.tables.push(table);
        Ok(())
    }

    fn push_single_table(&mut self, table: SingleTable) -> Result<()> {
        if !self.groups.iter().any(|g| g == &table.group) {
            return Err(Error::UnknownGroup(table.group));
        }
        let key = table_key(&table.schema, &table.table);
        if self.single_index.contains_key(&key) {
            return Err(Error::DuplicateTable(format!("{}.{}", table.schema, table.table)));
        }
        self.single_index.insert(key, self.single_tables.len());
        self.single_tables.push(table);
        Ok(())
    }

    /// Vdb routing a table: the table's own entry, else its schema's
    fn table_vdb(&self, schema: &str, table: &str) -> Option<&Arc<Vdb>> {
        let key = table_key(schema, table);
        let id = match self.table_index.get(&key) {
            Some(&i) => self.tables[i].vdb_id,
            None => *self.schema_vdb.get(&key.0)?,
        };
        self.vdb(id)
    }
}

/// Process-wide sharding configuration
pub struct ShardingConfig {
    current: ArcSwap<Snapshot>,
    partition_mode: bool,
    writer: Mutex<()>,
}

impl ShardingConfig {
    pub fn new(partition_mode: bool) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
            partition_mode,
            writer: Mutex::new(()),
        }
    }

    pub fn is_partition_mode(&self) -> bool {
        self.partition_mode
    }

    /// Replace the whole configuration from its persisted JSON form
    ///
    /// All-or-nothing: on any error the previous configuration stays active.
    pub fn load(&self, root: &Value, group_count: usize) -> Result<()> {
        let vdb_list = root
            .get("vdb")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Sharding("sharding config without a 'vdb' array".into()))?;

        let empty = Vec::new();
        let table_list = root.get("table").and_then(Value::as_array).unwrap_or(&empty);
        let single_list = root.get("single_tables").and_then(Value::as_array).unwrap_or(&empty);

        let mut next = Snapshot::default();
        for item in vdb_list {
            next.push_vdb(Vdb::from_json(item)?, group_count, self.partition_mode)?;
        }
        for item in table_list {
            next.push_table(ShardedTable::from_json(item)?)?;
        }
        for item in single_list {
            next.push_single_table(serde_json::from_value(item.clone())?)?;
        }

        let _guard = self.writer.lock();
        tracing::info!(
            "Sharding config installed: {} vdbs, {} tables, {} single tables",
            next.vdbs.len(),
            next.tables.len(),
            next.single_tables.len()
        );
        self.current.store(Arc::new(next));
        Ok(())
    }

    /// `load` from a JSON string
    pub fn load_str(&self, json: &str, group_count: usize) -> Result<()> {
        let root: Value = serde_json::from_str(json)?;
        self.load(&root, group_count)
    }

    /// Copy the current snapshot, apply `f`, and install the result
    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Snapshot) -> Result<()>,
    {
        let _guard = self.writer.lock();
        let mut next = Snapshot::clone(&self.current.load());
        f(&mut next)?;
        self.current.store(Arc::new(next));
        Ok(())
    }

    pub fn add_vdb(&self, vdb: Vdb, group_count: usize) -> Result<()> {
        let id = vdb.id();
        let partition_mode = self.partition_mode;
        self.update(|snap| snap.push_vdb(vdb, group_count, partition_mode))?;
        tracing::info!("vdb {} added", id);
        Ok(())
    }

    pub fn add_sharded_table(&self, table: ShardedTable) -> Result<()> {
        let name = format!("{}.{}", table.schema, table.table);
        self.update(|snap| snap.push_table(table))?;
        tracing::info!("sharded table {} added", name);
        Ok(())
    }

    pub fn add_single_table(&self, schema: &str, table: &str, group: &str) -> Result<()> {
        let entry = SingleTable {
            schema: schema.to_string(),
            table: table.to_string(),
            group: group.to_string(),
        };
        self.update(|snap| snap.push_single_table(entry))?;
        tracing::info!("single table {}.{} pinned to {}", schema, table, group);
        Ok(())
    }

    /// Distinct groups a table's partitions live on
    pub fn table_groups(&self, schema: &str, table: &str) -> Vec<String> {
        self.current
            .load()
            .table_vdb(schema, table)
            .map(|vdb| vdb.groups())
            .unwrap_or_default()
    }

    /// Group of one uniformly chosen partition of the table
    pub fn any_group(&self, schema: &str, table: &str) -> Option<String> {
        let snap = self.current.load();
        let partitions = snap.table_vdb(schema, table)?.partitions();
        if partitions.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..partitions.len());
        Some(partitions[i].group().to_string())
    }

    /// Ordered partitions of the table's vdb
    pub fn table_partitions(&self, schema: &str, table: &str) -> Vec<Partition> {
        self.current
            .load()
            .table_vdb(schema, table)
            .map(|vdb| vdb.partitions().to_vec())
            .unwrap_or_default()
    }

    /// Stable group for an arbitrary integer fixture
    pub fn fixed_group(&self, fixture: u32) -> Option<String> {
        let snap = self.current.load();
        if snap.groups.is_empty() {
            return None;
        }
        Some(snap.groups[fixture as usize % snap.groups.len()].clone())
    }

    pub fn is_sharded_table(&self, schema: &str, table: &str) -> bool {
        self.current.load().table_index.contains_key(&table_key(schema, table))
    }

    pub fn is_single_table(&self, schema: &str, table: &str) -> bool {
        self.single_table_group(schema, table).is_some()
    }

    pub fn single_table_group(&self, schema: &str, table: &str) -> Option<String> {
        let snap = self.current.load();
        let i = *snap.single_index.get(&table_key(schema, table))?;
        Some(snap.single_tables[i].group.clone())
    }

    /// Every group referenced by any vdb
    pub fn all_groups(&self) -> Vec<String> {
        self.current.load().groups.clone()
    }

    /// Groups of a schema's vdb matching `matcher` ("all" or a group name)
    pub fn find_groups(&self, schema: &str, matcher: &str) -> Vec<String> {
        let snap = self.current.load();
        let Some(id) = snap.schema_vdb.get(&schema.to_lowercase()) else {
            return Vec::new();
        };
        let Some(vdb) = snap.vdb(*id) else {
            return Vec::new();
        };
        if matcher.eq_ignore_ascii_case("all") {
            return vdb.groups();
        }
        vdb.groups().into_iter().filter(|g| g == matcher).collect()
    }

    pub fn vdb(&self, id: i64) -> Option<Arc<Vdb>> {
        self.current.load().vdb(id).cloned()
    }

    pub fn vdbs(&self) -> Vec<Arc<Vdb>> {
        self.current.load().vdbs.clone()
    }

    pub fn sharded_tables(&self) -> Vec<ShardedTable> {
        self.current.load().tables.clone()
    }

    pub fn single_tables(&self) -> Vec<SingleTable> {
        self.current.load().single_tables.clone()
    }

    /// Persisted form, accepted back by [`ShardingConfig::load`]
    pub fn to_json(&self) -> Value {
        let snap = self.current.load();
        let vdbs: Vec<Value> = snap.vdbs.iter().map(|v| v.to_json()).collect();
        json!({
            "vdb": vdbs,
            "table": snap.tables,
            "single_tables": snap.single_tables,
        })
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{KeyType, ShardMethod};
    use std::collections::HashSet;

    const TWO_GROUPS: &str = r#"{
        "vdb": [
            {"id": 1, "type": "INT", "method": "hash", "num": 4,
             "partitions": {"g1": [0, 1], "g2": [2, 3]}}
        ],
        "table": [
            {"db": "db", "table": "t1", "pkey": "id", "vdb": 1}
        ],
        "single_tables": [
            {"db": "db", "table": "config", "group": "g2"}
        ]
    }"#;

    fn loaded() -> ShardingConfig {
        let config = ShardingConfig::default();
        config.load_str(TWO_GROUPS, 2).unwrap();
        config
    }

    #[test]
    fn test_table_groups_and_any_group() {
        let config = loaded();
        let groups: HashSet<String> = config.table_groups("db", "t1").into_iter().collect();
        assert_eq!(groups, HashSet::from(["g1".to_string(), "g2".to_string()]));

        for _ in 0..20 {
            let g = config.any_group("db", "t1").unwrap();
            assert!(g == "g1" || g == "g2");
        }
        assert!(config.any_group("other", "t1").is_none());
    }

    #[test]
    fn test_lookup_case_insensitive() {
        let config = loaded();
        assert!(config.is_sharded_table("DB", "T1"));
        assert_eq!(config.single_table_group("Db", "CONFIG").as_deref(), Some("g2"));
        assert!(!config.is_single_table("db", "t1"));
        assert_eq!(config.table_partitions("db", "t1").len(), 2);
    }

    #[test]
    fn test_failed_load_keeps_previous() {
        let config = loaded();
        let bad = r#"{"vdb": [{"id": 1, "type": "INT", "method": "hash", "num": 4,
                       "partitions": {"g1": [0, 1], "g2": [2]}}], "table": []}"#;
        assert!(config.load_str(bad, 2).is_err());
        assert!(config.is_sharded_table("db", "t1"));

        assert!(config.load_str("not json", 2).is_err());
        assert!(config.load_str(TWO_GROUPS, 3).is_err());
        assert_eq!(config.vdbs().len(), 1);
    }

    #[test]
    fn test_duplicates_rejected() {
        let config = loaded();
        let err = config
            .add_sharded_table(ShardedTable::new("DB", "T1", "id", 1))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTable(_)));

        let err = config.add_single_table("db", "Config", "g1").unwrap_err();
        assert!(matches!(err, Error::DuplicateTable(_)));

        let vdb = Vdb::from_json(&serde_json::json!({
            "id": 1, "type": "INT", "method": "hash", "num": 2, "partitions": {"g1": [0], "g2": [1]}
        }))
        .unwrap();
        assert!(matches!(config.add_vdb(vdb, 2).unwrap_err(), Error::DuplicateVdb(1)));
    }

    #[test]
    fn test_table_requires_known_vdb_and_group() {
        let config = loaded();
        let err = config.add_sharded_table(ShardedTable::new("db", "t2", "id", 9)).unwrap_err();
        assert!(matches!(err, Error::UnknownVdb(9)));

        let err = config.add_single_table("db", "log", "g9").unwrap_err();
        assert!(matches!(err, Error::UnknownGroup(_)));

        config.add_sharded_table(ShardedTable::new("db", "t2", "uid", 1)).unwrap();
        config.add_single_table("db", "log", "g1").unwrap();
        assert!(config.is_sharded_table("db", "t2"));
    }

    #[test]
    fn test_schema_bound_to_one_vdb() {
        let config = loaded();
        let vdb = Vdb::new(
            2,
            ShardMethod::Range,
            KeyType::Int,
            0,
            vec![Partition::range("g1", Some(crate::sharding::RangeValue::Int(100))), Partition::range("g2", None)],
        );
        config.add_vdb(vdb, 2).unwrap();
        assert!(config.add_sharded_table(ShardedTable::new("db", "t3", "id", 2)).is_err());
        config.add_sharded_table(ShardedTable::new("db2", "t3", "id", 2)).unwrap();
    }

    #[test]
    fn test_fixed_group_is_stable() {
        let config = loaded();
        assert_eq!(config.fixed_group(0).as_deref(), Some("g1"));
        assert_eq!(config.fixed_group(7), config.fixed_group(7));
        assert_eq!(config.fixed_group(3).as_deref(), Some("g2"));
        assert!(ShardingConfig::default().fixed_group(1).is_none());
    }

    #[test]
    fn test_find_groups() {
        let config = loaded();
        assert_eq!(config.find_groups("db", "ALL").len(), 2);
        assert_eq!(config.find_groups("db", "g2"), vec!["g2".to_string()]);
        assert!(config.find_groups("db", "g3").is_empty());
        assert!(config.find_groups("nodb", "all").is_empty());
    }

    #[test]
    fn test_to_json_round_trip() {
        let config = loaded();
        let copy = ShardingConfig::default();
        copy.load(&config.to_json(), 2).unwrap();

        assert_eq!(copy.sharded_tables(), config.sharded_tables());
        assert_eq!(copy.single_tables(), config.single_tables());
        assert_eq!(*copy.vdb(1).unwrap(), *config.vdb(1).unwrap());
    }

    #[test]
    fn test_readers_see_whole_snapshots() {
        let config = Arc::new(loaded());
        let reader = {
            let config = Arc::clone(&config);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let groups = config.table_groups("db", "t1");
                    assert!(groups.len() == 2, "partial config observed: {:?}", groups);
                }
            })
        };
        for _ in 0..50 {
            config.load_str(TWO_GROUPS, 2).unwrap();
        }
        reader.join().unwrap();
    }
}
