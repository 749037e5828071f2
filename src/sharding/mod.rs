//! Sharding Configuration Module
//!
//! Virtual databases (vdbs), their hash or range partitions, and the
//! sharded-table / single-table registries the query router consults to
//! map a table onto backend groups.

mod config;
mod vdb;

pub use config::{ShardedTable, ShardingConfig, SingleTable};
pub use vdb::{HashSlots, Partition, PartitionBound, RangeValue, Vdb, MAX_HASH_VALUE_COUNT};

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the persisted sharding object
pub const SHARDING_OBJECT: &str = "sharding";

/// Partitioning method of a vdb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardMethod {
    Hash,
    Range,
}

impl fmt::Display for ShardMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardMethod::Hash => write!(f, "hash"),
            ShardMethod::Range => write!(f, "range"),
        }
    }
}

impl FromStr for ShardMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hash" => Ok(ShardMethod::Hash),
            "range" => Ok(ShardMethod::Range),
            other => Err(Error::Sharding(format!("unknown sharding method '{}'", other))),
        }
    }
}

/// Type of the shard key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    Int,
    Str,
    Date,
    Datetime,
}

impl KeyType {
    /// Keys compared as integers (dates are epoch seconds)
    pub fn is_integral(self) -> bool {
        !matches!(self, KeyType::Str)
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, KeyType::Date | KeyType::Datetime)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Int => write!(f, "INT"),
            KeyType::Str => write!(f, "STR"),
            KeyType::Date => write!(f, "DATE"),
            KeyType::Datetime => write!(f, "DATETIME"),
        }
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INT" => Ok(KeyType::Int),
            "STR" => Ok(KeyType::Str),
            "DATE" => Ok(KeyType::Date),
            "DATETIME" => Ok(KeyType::Datetime),
            other => Err(Error::Sharding(format!("unknown shard key type '{}'", other))),
        }
    }
}

/// Parse "YYYY-MM-DD HH:MM:SS" or "YYYY-MM-DD" as UTC epoch seconds
pub fn epoch_from_string(s: &str) -> Result<i64> {
    let s = s.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc().timestamp());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| Error::Sharding(format!("wrong datetime format '{}'", s)))
}

/// Render epoch seconds back in the persisted form of `key_type`
pub fn epoch_to_string(epoch: i64, key_type: KeyType) -> String {
    let Some(dt) = chrono::DateTime::from_timestamp(epoch, 0) else {
        return epoch.to_string();
    };
    match key_type {
        KeyType::Date => dt.format("%Y-%m-%d").to_string(),
        _ => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}
