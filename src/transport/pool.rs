//! Keep-alive connection pool keyed by `(host, port, tls)`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::tls::VerifyConfig;
use super::{Connection, Connector, PoolKey, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections kept per key; the oldest are evicted first.
    pub max_idle_per_key: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 8,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Idle connections waiting for reuse.
///
/// The lock is only held for bookkeeping; connecting and I/O happen outside
/// it.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    config: PoolConfig,
    idle: Mutex<HashMap<PoolKey, VecDeque<Connection>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns an idle connection for `key` or opens a new one.
    pub async fn acquire(
        &self,
        key: &PoolKey,
        verify: &VerifyConfig,
        connector: &dyn Connector,
    ) -> Result<Connection, TransportError> {
        if let Some(conn) = self.checkout(key, verify) {
            log::trace!("reusing pooled connection to {key}");
            return Ok(conn);
        }

        log::debug!("opening connection to {key}");
        let io = connector.connect(key, verify).await?;
        Ok(Connection::new(key.clone(), io, verify))
    }

    /// Most recently released usable connection for `key`, if any.
    ///
    /// Only connections established under compatible TLS settings are
    /// handed out; see [`Connection::serves`].
    fn checkout(&self, key: &PoolKey, verify: &VerifyConfig) -> Option<Connection> {
        let mut idle = self.lock();
        let queue = idle.get_mut(key)?;

        let mut found = None;
        while let Some(position) = queue.iter().rposition(|conn| conn.serves(verify)) {
            let Some(mut conn) = queue.remove(position) else {
                break;
            };
            if conn.idle_since().elapsed() > self.config.idle_timeout {
                log::trace!("dropping expired idle connection to {key}");
                continue;
            }
            if !conn.probe_idle() {
                log::trace!("dropping idle connection to {key} closed by peer");
                continue;
            }
            found = Some(conn);
            break;
        }

        if queue.is_empty() {
            idle.remove(key);
        }
        found
    }

    /// Returns a connection after a fully consumed response.
    ///
    /// Connections marked unusable, or holding unread bytes, are closed.
    pub fn release(&self, mut conn: Connection) {
        if !conn.is_reusable() || self.config.max_idle_per_key == 0 {
            log::trace!("closing connection to {}", conn.key());
            return;
        }

        conn.mark_idle();
        let mut idle = self.lock();
        let queue = idle.entry(conn.key().clone()).or_default();
        queue.push_back(conn);
        while queue.len() > self.config.max_idle_per_key {
            queue.pop_front();
        }
    }

    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.lock().get(key).map_or(0, VecDeque::len)
    }

    pub fn total_idle(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    /// Closes every idle connection.
    pub fn clear(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        log::debug!("closing {} idle connection group(s)", drained.len());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PoolKey, VecDeque<Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
