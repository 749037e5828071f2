//! Probe connections
//!
//! The monitor talks to backends only through [`Prober`] / [`ProbeConn`],
//! so tests can script backend behaviour without a live MySQL server.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection};

use crate::address::{Address, Endpoint};
use crate::config::WolfGateConfig;
use crate::error::{Error, Result};

/// An open connection used for health checks
#[async_trait]
pub trait ProbeConn: Send {
    /// Lightweight liveness check
    async fn ping(&mut self) -> Result<()>;

    /// "host:port" of the group replication primary, if any
    async fn primary_member(&mut self) -> Result<Option<String>>;

    /// "host:port" of every online group replication secondary
    async fn secondary_members(&mut self) -> Result<Vec<String>>;

    /// Upsert this instance's heartbeat row
    async fn write_heartbeat(&mut self, table: &str, instance_id: &str, ts: DateTime<Utc>) -> Result<()>;

    /// Read back this instance's heartbeat row
    async fn read_heartbeat(&mut self, table: &str, instance_id: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Opens probe connections
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    type Conn: ProbeConn + 'static;

    async fn connect(&self, address: &Address) -> Result<Self::Conn>;
}

const PRIMARY_SQL: &str = "SELECT MEMBER_HOST, CAST(MEMBER_PORT AS SIGNED) \
     FROM performance_schema.replication_group_members \
     WHERE MEMBER_ROLE = 'PRIMARY' AND MEMBER_STATE = 'ONLINE'";

const SECONDARY_SQL: &str = "SELECT MEMBER_HOST, CAST(MEMBER_PORT AS SIGNED) \
     FROM performance_schema.replication_group_members \
     WHERE MEMBER_ROLE = 'SECONDARY' AND MEMBER_STATE = 'ONLINE'";

/// Probes over real MySQL connections
#[derive(Debug, Clone)]
pub struct MySqlProber {
    user: String,
    password: String,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl MySqlProber {
    pub fn new(user: &str, password: &str, connect_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            connect_timeout,
            query_timeout,
        }
    }

    pub fn from_config(config: &WolfGateConfig) -> Self {
        Self::new(
            &config.probe.user,
            &config.probe.password,
            config.connect_timeout(),
            Duration::from_secs(config.probe.query_timeout_secs),
        )
    }
}

async fn bounded<T, F>(what: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::ConnectionTimeout(what.to_string())),
    }
}

#[async_trait]
impl Prober for MySqlProber {
    type Conn = MySqlProbeConn;

    async fn connect(&self, address: &Address) -> Result<MySqlProbeConn> {
        let options = MySqlConnectOptions::new()
            .username(&self.user)
            .password(&self.password);
        let options = match address.endpoint() {
            Endpoint::Inet(addr) => options.host(&addr.ip().to_string()).port(addr.port()),
            Endpoint::Unix(path) => options.socket(path),
        };

        let conn = bounded(address.name(), self.connect_timeout, options.connect())
            .await
            .map_err(|e| Error::Probe {
                address: address.name().to_string(),
                reason: e.to_string(),
            })?;

        Ok(MySqlProbeConn {
            address: address.name().to_string(),
            conn,
            query_timeout: self.query_timeout,
        })
    }
}

/// A live MySQL probe connection
pub struct MySqlProbeConn {
    address: String,
    conn: MySqlConnection,
    query_timeout: Duration,
}

impl MySqlProbeConn {
    async fn members(&mut self, sql: &str) -> Result<Vec<String>> {
        let rows: Vec<(String, i64)> =
            bounded(&self.address, self.query_timeout, sqlx::query_as(sql).fetch_all(&mut self.conn)).await?;
        Ok(rows
            .into_iter()
            .map(|(host, port)| format!("{}:{}", host, port))
            .collect())
    }
}

#[async_trait]
impl ProbeConn for MySqlProbeConn {
    async fn ping(&mut self) -> Result<()> {
        bounded(&self.address, self.query_timeout, self.conn.ping()).await
    }

    async fn primary_member(&mut self) -> Result<Option<String>> {
        Ok(self.members(PRIMARY_SQL).await?.into_iter().next())
    }

    async fn secondary_members(&mut self) -> Result<Vec<String>> {
        self.members(SECONDARY_SQL).await
    }

    async fn write_heartbeat(&mut self, table: &str, instance_id: &str, ts: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (p_id, p_ts) VALUES (?, ?) ON DUPLICATE KEY UPDATE p_ts = VALUES(p_ts)",
            table
        );
        let query = sqlx::query(&sql).bind(instance_id).bind(ts).execute(&mut self.conn);
        bounded(&self.address, self.query_timeout, query).await?;
        Ok(())
    }

    async fn read_heartbeat(&mut self, table: &str, instance_id: &str) -> Result<Option<DateTime<Utc>>> {
        let sql = format!("SELECT p_ts FROM {} WHERE p_id = ?", table);
        let query = sqlx::query_as::<_, (DateTime<Utc>,)>(&sql)
            .bind(instance_id)
            .fetch_optional(&mut self.conn);
        let row = bounded(&self.address, self.query_timeout, query).await?;
        Ok(row.map(|(ts,)| ts))
    }
}
