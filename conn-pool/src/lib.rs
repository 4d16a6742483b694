//! A keep-alive connection pool for HTTP proxies.
//!
//! The pool maps a host name to a multiset of idle sockets. Acquiring a
//! connection first tries to CAS the `busy` flag of a live idle entry;
//! only on miss does it dial a new socket. Every acquire and release runs
//! a refresh pass that evicts idle connections past their deadline and
//! trims the idle set down to the configured size, never touching busy
//! connections. DNS results are cached per host behind an RW lock.
//!
//! The pool is an explicitly constructed, injected service (no process
//! globals): callers own an instance and share it via `Arc`.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

/// Pool configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Idle connections kept per pool (across all hosts).
    pub pool_size: usize,
    /// Deadline extension granted on acquire and release.
    pub socket_timeout: Duration,
    /// Dial timeout for new sockets.
    pub connect_timeout: Duration,
    /// Only dial IPv4 addresses.
    pub force_ipv4: bool,
    /// Only dial IPv6 addresses.
    pub force_ipv6: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: 16,
            socket_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            force_ipv4: false,
            force_ipv6: false,
        }
    }
}

/// Errors produced by [`ConnectionPool::connect`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// The host name did not resolve to any usable address.
    #[error("could not resolve {host}: {source}")]
    Resolve {
        /// Host that failed to resolve.
        host: String,
        /// Underlying resolver error.
        source: io::Error,
    },
    /// No address of the host accepted a connection.
    #[error("could not connect to {host}: {source}")]
    Connect {
        /// Host that refused the connection.
        host: String,
        /// Error from the last address tried.
        source: io::Error,
    },
}

/// A pooled socket.
///
/// `busy` is the ownership bit: whoever CASes it from false to true owns
/// the socket until [`ConnectionPool::release`] or
/// [`ConnectionPool::invalidate`].
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    busy: AtomicBool,
    deadline: Mutex<Instant>,
    id: u32,
}

impl Connection {
    /// The underlying stream.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// The pool-unique connection id, for log correlation.
    pub fn id(&self) -> u32 {
        self.id
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    fn extend_deadline(&self, timeout: Duration) {
        *self.deadline.lock() = Instant::now() + timeout;
    }
}

/// Caches DNS resolutions per host behind an RW lock.
#[derive(Debug, Default)]
pub struct AddressCache {
    cache: RwLock<HashMap<String, Arc<Vec<SocketAddr>>>>,
}

impl AddressCache {
    /// Creates an empty cache.
    pub fn new() -> AddressCache {
        AddressCache::default()
    }

    /// Resolves `host` (with an optional `:port` suffix; port 80 is the
    /// default), consulting the cache first.
    pub fn resolve(&self, host: &str) -> Result<Arc<Vec<SocketAddr>>, PoolError> {
        if let Some(entry) = self.cache.read().get(host) {
            return Ok(Arc::clone(entry));
        }

        let target = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:80")
        };
        let addresses: Vec<SocketAddr> = target
            .to_socket_addrs()
            .map_err(|source| PoolError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();
        let entry = Arc::new(addresses);

        self.cache
            .write()
            .insert(host.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Drops the cached resolution of `host`.
    pub fn evict(&self, host: &str) {
        self.cache.write().remove(host);
    }
}

/// The connection pool itself.
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    addresses: AddressCache,
    connections: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    by_host: HashMap<String, Vec<Arc<Connection>>>,
    next_id: u32,
}

impl ConnectionPool {
    /// Creates a pool with the given configuration.
    pub fn new(config: PoolConfig) -> ConnectionPool {
        ConnectionPool {
            config,
            addresses: AddressCache::new(),
            connections: Mutex::new(Inner::default()),
        }
    }

    /// Acquires a connection to `host`: an idle pooled one if possible, a
    /// freshly dialed one otherwise.
    pub fn connect(
        &self,
        host: &str,
        socket_timeout: Option<Duration>,
    ) -> Result<Arc<Connection>, PoolError> {
        self.refresh();

        let timeout = socket_timeout.unwrap_or(self.config.socket_timeout);

        {
            let inner = self.connections.lock();
            if let Some(pooled) = inner.by_host.get(host) {
                let now = Instant::now();
                for connection in pooled {
                    if connection.deadline() < now {
                        continue;
                    }
                    if connection
                        .busy
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                    connection.extend_deadline(timeout);
                    let _ = connection.stream.set_read_timeout(Some(timeout));
                    let _ = connection.stream.set_write_timeout(Some(timeout));
                    return Ok(Arc::clone(connection));
                }
            }
        }

        let stream = self.dial(host)?;
        let _ = stream.set_read_timeout(Some(timeout));
        let _ = stream.set_write_timeout(Some(timeout));

        let connection = {
            let mut inner = self.connections.lock();
            inner.next_id += 1;
            let connection = Arc::new(Connection {
                stream,
                busy: AtomicBool::new(true),
                deadline: Mutex::new(Instant::now() + timeout),
                id: inner.next_id,
            });
            inner
                .by_host
                .entry(host.to_string())
                .or_default()
                .push(Arc::clone(&connection));
            connection
        };

        debug!(id = connection.id, host, "connection opened");
        Ok(connection)
    }

    /// Returns a connection to the idle set.
    pub fn release(&self, connection: &Arc<Connection>) {
        connection.extend_deadline(self.config.socket_timeout);
        connection.busy.store(false, Ordering::Release);
        self.refresh();
    }

    /// Removes a specific connection from the pool. Used when a response
    /// arrives in a shape that poisons the socket for reuse (non
    /// keep-alive, unexhausted body, error response).
    pub fn invalidate(&self, host: &str, connection: &Arc<Connection>) {
        let mut inner = self.connections.lock();
        if let Some(pooled) = inner.by_host.get_mut(host) {
            if let Some(position) = pooled
                .iter()
                .position(|candidate| Arc::ptr_eq(candidate, connection))
            {
                pooled.swap_remove(position);
                debug!(id = connection.id, host, "connection invalidated");
            }
            if pooled.is_empty() {
                inner.by_host.remove(host);
            }
        }
    }

    /// Count of pooled connections, busy or idle. Test and introspection
    /// hook.
    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .by_host
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Returns true iff the pool holds no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn refresh(&self) {
        let mut inner = self.connections.lock();

        // Oldest deadlines go first so the excess trim drops the stalest
        // idle sockets.
        let mut idle: Vec<(Instant, String, usize)> = Vec::new();
        let mut total = 0usize;
        for (host, pooled) in &inner.by_host {
            total += pooled.len();
            for (index, connection) in pooled.iter().enumerate() {
                if !connection.busy.load(Ordering::Acquire) {
                    idle.push((connection.deadline(), host.clone(), index));
                }
            }
        }
        idle.sort_by(|a, b| a.0.cmp(&b.0));

        let mut remove_count = total.saturating_sub(self.config.pool_size);
        let now = Instant::now();
        // Collect removals first; indexes shift once we start removing.
        let mut doomed: Vec<(String, u32)> = Vec::new();
        for (deadline, host, index) in idle {
            let connection = &inner.by_host[&host][index];
            if remove_count > 0 {
                doomed.push((host.clone(), connection.id));
                remove_count -= 1;
            } else if deadline < now {
                doomed.push((host.clone(), connection.id));
            }
        }

        for (host, id) in doomed {
            if let Some(pooled) = inner.by_host.get_mut(&host) {
                if let Some(position) = pooled.iter().position(|c| c.id == id) {
                    pooled.swap_remove(position);
                    debug!(id, host, "connection closed");
                }
                if pooled.is_empty() {
                    inner.by_host.remove(&host);
                }
            }
        }
    }

    fn dial(&self, host: &str) -> Result<TcpStream, PoolError> {
        let addresses = self.addresses.resolve(host)?;

        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses");
        for address in addresses.iter() {
            if self.config.force_ipv4 && !address.is_ipv4() {
                continue;
            }
            if self.config.force_ipv6 && !address.is_ipv6() {
                continue;
            }
            match TcpStream::connect_timeout(address, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(error) => last_error = error,
            }
        }

        Err(PoolError::Connect {
            host: host.to_string(),
            source: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn local_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap().to_string();
        (listener, host)
    }

    #[test]
    fn released_connection_is_reused() {
        let (_listener, host) = local_listener();
        let pool = ConnectionPool::new(PoolConfig::default());

        let first = pool.connect(&host, None).unwrap();
        let first_id = first.id();
        pool.release(&first);

        let second = pool.connect(&host, None).unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn busy_connection_is_not_handed_out_twice() {
        let (_listener, host) = local_listener();
        let pool = ConnectionPool::new(PoolConfig::default());

        let first = pool.connect(&host, None).unwrap();
        let second = pool.connect(&host, None).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn invalidate_removes_exactly_one() {
        let (_listener, host) = local_listener();
        let pool = ConnectionPool::new(PoolConfig::default());

        let first = pool.connect(&host, None).unwrap();
        let second = pool.connect(&host, None).unwrap();
        pool.invalidate(&host, &first);
        assert_eq!(pool.len(), 1);
        pool.release(&second);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn refresh_evicts_expired_idle_connections() {
        let (_listener, host) = local_listener();
        let pool = ConnectionPool::new(PoolConfig {
            socket_timeout: Duration::from_millis(1),
            ..PoolConfig::default()
        });

        let connection = pool.connect(&host, None).unwrap();
        pool.release(&connection);
        std::thread::sleep(Duration::from_millis(10));

        // A connect to a different host triggers the refresh pass.
        let (_other_listener, other_host) = local_listener();
        let fresh = pool.connect(&other_host, None).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(fresh.id(), 2);
    }

    #[test]
    fn excess_idle_connections_are_trimmed() {
        let (_listener, host) = local_listener();
        let pool = ConnectionPool::new(PoolConfig {
            pool_size: 1,
            ..PoolConfig::default()
        });

        let first = pool.connect(&host, None).unwrap();
        let second = pool.connect(&host, None).unwrap();
        pool.release(&first);
        pool.release(&second);
        assert!(pool.len() <= 2);

        // The next refresh (via connect) trims the idle surplus.
        let _third = pool.connect(&host, None).unwrap();
        assert!(pool.len() <= 2);
    }

    #[test]
    fn address_cache_hits_after_first_resolve() {
        let cache = AddressCache::new();
        let first = cache.resolve("127.0.0.1:80").unwrap();
        let second = cache.resolve("127.0.0.1:80").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        cache.evict("127.0.0.1:80");
        let third = cache.resolve("127.0.0.1:80").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
