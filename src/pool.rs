//! Backend Connection Pool
//!
//! Per-backend cache of idle, already-authenticated server connections,
//! keyed by the logical user they were authenticated as.
//!
//! - a request for user X first gets one of X's idle connections
//! - otherwise a connection is taken ("robbed") from any user that keeps
//!   more than `min_idle` connections idling; the caller re-authenticates it

use std::collections::{HashMap, VecDeque};

/// Default upper bound of idle connections
pub const DEFAULT_MAX_IDLE: usize = 20;
/// Default idle level above which the pool may shrink
pub const DEFAULT_MID_IDLE: usize = 10;
/// Default number of idle connections kept per user before robbing
pub const DEFAULT_MIN_IDLE: usize = 1;

/// Pool size bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_idle: usize,
    pub mid_idle: usize,
    pub min_idle: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            mid_idle: DEFAULT_MID_IDLE,
            min_idle: DEFAULT_MIN_IDLE,
        }
    }
}

/// A connection handed out by [`ConnectionPool::get`]
#[derive(Debug)]
pub struct Checkout<C> {
    pub conn: C,
    /// Connection was authenticated as another user
    pub robbed: bool,
}

/// Idle connection cache for one backend
#[derive(Debug)]
pub struct ConnectionPool<C> {
    users: HashMap<String, VecDeque<C>>,
    idle: usize,
    limits: PoolLimits,
}

impl<C> ConnectionPool<C> {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            users: HashMap::new(),
            idle: 0,
            limits,
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Take an idle connection for `user`
    pub fn get(&mut self, user: &str) -> Option<Checkout<C>> {
        if !user.is_empty() {
            if let Some(conn) = self.users.get_mut(user).and_then(|q| q.pop_front()) {
                self.idle -= 1;
                tracing::trace!("pool: reuse idle connection of user '{}'", user);
                return Some(Checkout { conn, robbed: false });
            }
        }

        let min_idle = self.limits.min_idle;
        let donor = self
            .users
            .iter_mut()
            .find(|(_, q)| q.len() > min_idle)
            .map(|(_, q)| q)?;

        let conn = donor.pop_front()?;
        self.idle -= 1;
        tracing::debug!("pool: robbed an idle connection for user '{}'", user);
        Some(Checkout { conn, robbed: true })
    }

    /// Return a connection to the pool. Gives the connection back if the
    /// pool is already at `max_idle`.
    pub fn add(&mut self, user: &str, conn: C) -> Option<C> {
        if self.idle >= self.limits.max_idle {
            return Some(conn);
        }
        self.users.entry(user.to_string()).or_default().push_front(conn);
        self.idle += 1;
        None
    }

    /// Number of idle connections across all users
    pub fn total_idle(&self) -> usize {
        self.idle
    }

    /// Whether idle connections should be closed given the number of
    /// clients currently using this backend
    pub fn should_reduce(&self, connected_clients: usize) -> bool {
        self.idle > self.limits.mid_idle && connected_clients < self.idle
    }

    /// Drop every idle connection, returning how many were closed
    pub fn clear(&mut self) -> usize {
        let closed = self.idle;
        self.users.clear();
        self.idle = 0;
        closed
    }
}

impl<C> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new(PoolLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_prefers_same_user() {
        let mut pool: ConnectionPool<u32> = ConnectionPool::default();
        pool.add("alice", 1);
        pool.add("bob", 2);

        let c = pool.get("bob").unwrap();
        assert_eq!(c.conn, 2);
        assert!(!c.robbed);
        assert_eq!(pool.total_idle(), 1);
    }

    #[test]
    fn test_robbing_respects_min_idle() {
        let mut pool: ConnectionPool<u32> = ConnectionPool::default();
        pool.add("alice", 1);

        // alice keeps her single connection
        assert!(pool.get("carol").is_none());

        pool.add("alice", 2);
        let c = pool.get("carol").unwrap();
        assert!(c.robbed);
        assert_eq!(pool.total_idle(), 1);
        assert!(!pool.get("alice").unwrap().robbed);
    }

    #[test]
    fn test_max_idle_bound() {
        let limits = PoolLimits { max_idle: 2, mid_idle: 1, min_idle: 1 };
        let mut pool: ConnectionPool<u32> = ConnectionPool::new(limits);
        assert!(pool.add("u", 1).is_none());
        assert!(pool.add("u", 2).is_none());
        assert_eq!(pool.add("u", 3), Some(3));
        assert_eq!(pool.total_idle(), 2);
    }

    #[test]
    fn test_reduce_verdict() {
        let limits = PoolLimits { max_idle: 10, mid_idle: 2, min_idle: 1 };
        let mut pool: ConnectionPool<u32> = ConnectionPool::new(limits);
        for i in 0..4 {
            pool.add("u", i);
        }
        assert!(pool.should_reduce(1));
        assert!(!pool.should_reduce(5));
        assert_eq!(pool.clear(), 4);
        assert!(!pool.should_reduce(0));
    }
}
