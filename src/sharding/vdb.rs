//! Virtual databases and their partitions

use serde_json::{json, Map, Value};

use super::{epoch_from_string, epoch_to_string, KeyType, ShardMethod};
use crate::error::{Error, Result};

/// Upper bound of `num` for hash vdbs
pub const MAX_HASH_VALUE_COUNT: u32 = 1024;

const SLOT_WORDS: usize = (MAX_HASH_VALUE_COUNT as usize) / 64;

/// Bitset over hash values `[0, MAX_HASH_VALUE_COUNT)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashSlots([u64; SLOT_WORDS]);

impl HashSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, value: u32) {
        let v = value as usize;
        if v < MAX_HASH_VALUE_COUNT as usize {
            self.0[v / 64] |= 1u64 << (v % 64);
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        let v = value as usize;
        v < MAX_HASH_VALUE_COUNT as usize && self.0[v / 64] & (1u64 << (v % 64)) != 0
    }

    /// Set values below `limit`, ascending
    pub fn values(&self, limit: u32) -> Vec<u32> {
        (0..limit.min(MAX_HASH_VALUE_COUNT)).filter(|v| self.contains(*v)).collect()
    }
}

/// A range bound value; datetimes are stored as epoch seconds
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RangeValue {
    Int(i64),
    Str(String),
}

/// What a partition covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionBound {
    /// `(low, high]`; `None` low is -infinity, `None` high is +infinity
    Range {
        low: Option<RangeValue>,
        high: Option<RangeValue>,
    },
    Hash(HashSlots),
}

/// One shard-to-group mapping of a vdb
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    group: String,
    bound: PartitionBound,
}

impl Partition {
    pub fn range(group: impl Into<String>, high: Option<RangeValue>) -> Self {
        Self {
            group: group.into(),
            bound: PartitionBound::Range { low: None, high },
        }
    }

    pub fn hash(group: impl Into<String>, slots: HashSlots) -> Self {
        Self {
            group: group.into(),
            bound: PartitionBound::Hash(slots),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn bound(&self) -> &PartitionBound {
        &self.bound
    }

    pub fn low(&self) -> Option<&RangeValue> {
        match &self.bound {
            PartitionBound::Range { low, .. } => low.as_ref(),
            PartitionBound::Hash(_) => None,
        }
    }

    pub fn high(&self) -> Option<&RangeValue> {
        match &self.bound {
            PartitionBound::Range { high, .. } => high.as_ref(),
            PartitionBound::Hash(_) => None,
        }
    }

    pub fn hash_slots(&self) -> Option<&HashSlots> {
        match &self.bound {
            PartitionBound::Hash(slots) => Some(slots),
            PartitionBound::Range { .. } => None,
        }
    }
}

/// A virtual database: key type, method and partitions
///
/// Immutable once built; reconfiguration replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vdb {
    id: i64,
    method: ShardMethod,
    key_type: KeyType,
    shard_count: u32,
    partitions: Vec<Partition>,
}

impl Vdb {
    /// Build a vdb, ordering range partitions and deriving their low bounds
    pub fn new(
        id: i64,
        method: ShardMethod,
        key_type: KeyType,
        shard_count: u32,
        mut partitions: Vec<Partition>,
    ) -> Self {
        if method == ShardMethod::Range {
            // Unbounded high sorts last
            partitions.sort_by(|a, b| {
                (a.high().is_none(), a.high()).cmp(&(b.high().is_none(), b.high()))
            });
            let mut prev: Option<RangeValue> = None;
            for part in partitions.iter_mut() {
                if let PartitionBound::Range { low, high } = &mut part.bound {
                    *low = prev.take();
                    prev = high.clone();
                }
            }
        }

        Self {
            id,
            method,
            key_type,
            shard_count,
            partitions,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn method(&self) -> ShardMethod {
        self.method
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Distinct group names, in partition order
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for part in &self.partitions {
            if !groups.iter().any(|g| g == part.group()) {
                groups.push(part.group().to_string());
            }
        }
        groups
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidVdb {
            id: self.id,
            reason: reason.into(),
        }
    }

    /// Check the vdb can be installed next to `group_count` backend groups
    ///
    /// Outside partition mode every backend group must be covered, so the
    /// number of distinct partition groups has to equal `group_count`.
    pub fn validate(&self, group_count: usize, partition_mode: bool) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(self.invalid("no partitions"));
        }

        if !partition_mode {
            let distinct = self.groups().len();
            if distinct != group_count {
                return Err(self.invalid(format!(
                    "partitions span {} groups but {} groups are configured",
                    distinct, group_count
                )));
            }
        }

        if self.method == ShardMethod::Hash {
            if self.shard_count == 0 || self.shard_count > MAX_HASH_VALUE_COUNT {
                return Err(self.invalid(format!(
                    "hash num {} out of range (0, {}]",
                    self.shard_count, MAX_HASH_VALUE_COUNT
                )));
            }

            let mut covered = HashSlots::new();
            for part in &self.partitions {
                let Some(slots) = part.hash_slots() else {
                    return Err(self.invalid("range partition in a hash vdb"));
                };
                for v in slots.values(self.shard_count) {
                    covered.set(v);
                }
            }
            if let Some(gap) = (0..self.shard_count).find(|v| !covered.contains(*v)) {
                return Err(self.invalid(format!("hash value {} is not covered by any partition", gap)));
            }
        }

        Ok(())
    }

    pub fn is_valid(&self, group_count: usize, partition_mode: bool) -> bool {
        match self.validate(group_count, partition_mode) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("invalid vdb config: {}", e);
                false
            }
        }
    }

    /// Parse one element of the persisted `vdb` array
    pub fn from_json(value: &Value) -> Result<Self> {
        let id = match value.get("id") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| Error::Sharding("vdb without a valid 'id'".into()))?;

        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidVdb {
                    id,
                    reason: format!("missing '{}'", name),
                })
        };
        let key_type: KeyType = field("type")?.parse()?;
        let method: ShardMethod = field("method")?.parse()?;

        let shard_count = match value.get("num").and_then(Value::as_u64) {
            Some(n) => u32::try_from(n).unwrap_or(u32::MAX),
            None if method == ShardMethod::Range => 0,
            None => {
                return Err(Error::InvalidVdb {
                    id,
                    reason: "hash vdb without 'num'".into(),
                })
            }
        };

        let Some(raw) = value.get("partitions").and_then(Value::as_object) else {
            return Err(Error::InvalidVdb {
                id,
                reason: "missing 'partitions' object".into(),
            });
        };

        let mut partitions = Vec::new();
        for (group, spec) in raw {
            match method {
                ShardMethod::Hash => {
                    partitions.push(parse_hash_partition(id, group, spec, shard_count)?)
                }
                ShardMethod::Range => {
                    let highs = match spec {
                        Value::Array(items) if items.is_empty() => {
                            return Err(Error::InvalidVdb {
                                id,
                                reason: format!("empty partition list for group {}", group),
                            })
                        }
                        Value::Array(items) => items.iter().collect::<Vec<_>>(),
                        other => vec![other],
                    };
                    for high in highs {
                        let bound = parse_range_bound(id, key_type, high)?;
                        partitions.push(Partition::range(group.clone(), bound));
                    }
                }
            }
        }

        Ok(Self::new(id, method, key_type, shard_count, partitions))
    }

    /// Persisted form, parseable by [`Vdb::from_json`]
    pub fn to_json(&self) -> Value {
        let mut raw = Map::new();
        for group in self.groups() {
            let parts: Vec<&Partition> = self.partitions.iter().filter(|p| p.group() == group).collect();
            let spec = match self.method {
                ShardMethod::Hash => {
                    let mut values: Vec<u32> = parts
                        .iter()
                        .filter_map(|p| p.hash_slots())
                        .flat_map(|s| s.values(self.shard_count))
                        .collect();
                    values.sort_unstable();
                    values.dedup();
                    json!(values)
                }
                ShardMethod::Range => {
                    let mut highs: Vec<Value> = parts.iter().map(|p| self.bound_to_json(p.high())).collect();
                    if highs.len() == 1 {
                        highs.remove(0)
                    } else {
                        Value::Array(highs)
                    }
                }
            };
            raw.insert(group, spec);
        }

        json!({
            "id": self.id,
            "type": self.key_type.to_string(),
            "method": self.method.to_string(),
            "num": self.shard_count,
            "partitions": Value::Object(raw),
        })
    }

    fn bound_to_json(&self, bound: Option<&RangeValue>) -> Value {
        match bound {
            None => Value::Null,
            Some(RangeValue::Str(s)) => json!(s),
            Some(RangeValue::Int(n)) if self.key_type.is_temporal() => {
                json!(epoch_to_string(*n, self.key_type))
            }
            Some(RangeValue::Int(n)) => json!(n),
        }
    }

    /// Human readable partition list for admin output
    pub fn describe_partitions(&self) -> String {
        let render = |v: Option<&RangeValue>, unbounded: &str| match v {
            None => unbounded.to_string(),
            Some(RangeValue::Str(s)) => s.clone(),
            Some(RangeValue::Int(n)) if self.key_type.is_temporal() => epoch_to_string(*n, self.key_type),
            Some(RangeValue::Int(n)) => n.to_string(),
        };

        self.partitions
            .iter()
            .map(|p| match p.bound() {
                PartitionBound::Hash(slots) => {
                    let values: Vec<String> =
                        slots.values(self.shard_count).iter().map(u32::to_string).collect();
                    format!("{}:[{}]", p.group(), values.join(","))
                }
                PartitionBound::Range { low, high } => format!(
                    "{}:({}, {}]",
                    p.group(),
                    render(low.as_ref(), "-inf"),
                    render(high.as_ref(), "+inf")
                ),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn parse_hash_partition(id: i64, group: &str, spec: &Value, shard_count: u32) -> Result<Partition> {
    let invalid = |reason: String| Error::InvalidVdb { id, reason };

    let Value::Array(items) = spec else {
        return Err(invalid(format!("hash partition of group {} must be an array", group)));
    };

    let mut slots = HashSlots::new();
    for item in items {
        let value = item
            .as_u64()
            .ok_or_else(|| invalid(format!("group {}: hash value {} is not a number", group, item)))?;
        if value >= shard_count as u64 {
            return Err(invalid(format!(
                "group {}: hash value {} exceeds num {}",
                group, value, shard_count
            )));
        }
        slots.set(value as u32);
    }
    Ok(Partition::hash(group, slots))
}

fn parse_range_bound(id: i64, key_type: KeyType, spec: &Value) -> Result<Option<RangeValue>> {
    let invalid = |reason: String| Error::InvalidVdb { id, reason };

    match spec {
        Value::Null => Ok(None),
        Value::Number(n) if key_type.is_integral() => n
            .as_i64()
            .map(|n| Some(RangeValue::Int(n)))
            .ok_or_else(|| invalid(format!("range bound {} is not an integer", n))),
        Value::String(s) if key_type.is_temporal() => epoch_from_string(s)
            .map(|epoch| Some(RangeValue::Int(epoch)))
            .map_err(|_| invalid(format!("wrong datetime format '{}'", s))),
        Value::String(s) if key_type == KeyType::Int => s
            .trim()
            .parse()
            .map(|n| Some(RangeValue::Int(n)))
            .map_err(|_| invalid(format!("range bound '{}' is not an integer", s))),
        Value::String(s) => Ok(Some(RangeValue::Str(s.clone()))),
        Value::Number(n) => Ok(Some(RangeValue::Str(n.to_string()))),
        other => Err(invalid(format!("unsupported range bound {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_vdb(parts: Value) -> Vdb {
        Vdb::from_json(&json!({
            "id": 1, "type": "INT", "method": "hash", "num": 4, "partitions": parts
        }))
        .unwrap()
    }

    #[test]
    fn test_hash_coverage_gap_rejected() {
        let vdb = hash_vdb(json!({"g1": [0, 1], "g2": [2]}));
        let err = vdb.validate(2, false).unwrap_err();
        assert!(err.to_string().contains("3"));
        assert!(!vdb.is_valid(2, false));
    }

    #[test]
    fn test_hash_full_coverage_accepted() {
        assert!(hash_vdb(json!({"g1": [0, 1], "g2": [2, 3]})).is_valid(2, false));
        assert!(hash_vdb(json!({"g1": [0], "g2": [1, 2, 3]})).is_valid(2, false));
        assert!(hash_vdb(json!({"g1": [0, 1, 2, 3], "g2": [1]})).is_valid(2, false));
    }

    #[test]
    fn test_hash_value_out_of_range() {
        let err = Vdb::from_json(&json!({
            "id": 1, "type": "INT", "method": "hash", "num": 4, "partitions": {"g1": [0, 4]}
        }))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidVdb { id: 1, .. }));
    }

    #[test]
    fn test_hash_num_bounds() {
        let vdb = Vdb::new(1, ShardMethod::Hash, KeyType::Int, 0, vec![Partition::hash("g1", HashSlots::new())]);
        assert!(!vdb.is_valid(1, false));

        let vdb = Vdb::new(1, ShardMethod::Hash, KeyType::Int, 2048, vec![Partition::hash("g1", HashSlots::new())]);
        assert!(!vdb.is_valid(1, false));
    }

    #[test]
    fn test_group_count_must_match() {
        let vdb = hash_vdb(json!({"g1": [0, 1], "g2": [2, 3]}));
        assert!(!vdb.is_valid(3, false));
        // Partition mode does not tie vdbs to the group count
        assert!(vdb.is_valid(1, true));
    }

    #[test]
    fn test_range_low_bound_derivation() {
        let vdb = Vdb::from_json(&json!({
            "id": 2, "type": "INT", "method": "range", "num": 0,
            "partitions": {"g3": null, "g2": 50, "g1": 10}
        }))
        .unwrap();

        let lows: Vec<Option<&RangeValue>> = vdb.partitions().iter().map(Partition::low).collect();
        assert_eq!(lows, vec![None, Some(&RangeValue::Int(10)), Some(&RangeValue::Int(50))]);
        let groups: Vec<&str> = vdb.partitions().iter().map(Partition::group).collect();
        assert_eq!(groups, vec!["g1", "g2", "g3"]);
    }

    #[test]
    fn test_range_string_and_multi_partition() {
        let vdb = Vdb::from_json(&json!({
            "id": 3, "type": "STR", "method": "range", "num": 0,
            "partitions": {"g1": ["f", "t"], "g2": ["m", null]}
        }))
        .unwrap();

        let highs: Vec<Option<&RangeValue>> = vdb.partitions().iter().map(Partition::high).collect();
        assert_eq!(
            highs,
            vec![
                Some(&RangeValue::Str("f".into())),
                Some(&RangeValue::Str("m".into())),
                Some(&RangeValue::Str("t".into())),
                None
            ]
        );
        assert_eq!(vdb.groups(), vec!["g1".to_string(), "g2".to_string()]);
        assert!(vdb.is_valid(2, false));
    }

    #[test]
    fn test_datetime_range_bounds() {
        let vdb = Vdb::from_json(&json!({
            "id": 4, "type": "DATE", "method": "range", "num": 0,
            "partitions": {"g1": "1970-01-02", "g2": null}
        }))
        .unwrap();
        assert_eq!(vdb.partitions()[0].high(), Some(&RangeValue::Int(86_400)));

        let err = Vdb::from_json(&json!({
            "id": 4, "type": "DATETIME", "method": "range", "num": 0,
            "partitions": {"g1": "yesterday"}
        }))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidVdb { .. }));
    }

    #[test]
    fn test_to_json_reparses_identically() {
        let original = Vdb::from_json(&json!({
            "id": 5, "type": "DATETIME", "method": "range", "num": 0,
            "partitions": {"g1": ["2024-01-01 00:00:00", "2024-07-01 00:00:00"], "g2": null}
        }))
        .unwrap();
        let reparsed = Vdb::from_json(&original.to_json()).unwrap();
        assert_eq!(original, reparsed);

        let hash = hash_vdb(json!({"g1": [0, 2], "g2": [1, 3]}));
        assert_eq!(Vdb::from_json(&hash.to_json()).unwrap(), hash);
    }

    #[test]
    fn test_describe_partitions() {
        let vdb = Vdb::from_json(&json!({
            "id": 2, "type": "INT", "method": "range", "num": 0,
            "partitions": {"g1": 10, "g2": null}
        }))
        .unwrap();
        assert_eq!(vdb.describe_partitions(), "g1:(-inf, 10] g2:(10, +inf]");
    }
}
