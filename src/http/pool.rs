//! Connection pool
//!
//! The pool owns every transport, from the first connection attempt until
//! it is closed. Connections are keyed by [`Authority`] and addressed by
//! [`ConnectionId`] handles, so a request lifecycle only ever holds a
//! handle, never the connection itself.
//!
//! A new connection starts out connecting: [`ConnectionPool::checkout`]
//! returns [`Checkout::Connecting`] and the owner calls
//! [`ConnectionPool::advance_connect`] whenever the attempt's descriptor is
//! ready, until it reports [`ConnectProgress::Established`].
//!
//! The per-host limit counts connections whose authority matches, idle, in
//! use or still connecting. Running out of capacity is reported as
//! [`Checkout::NoCapacity`], which callers treat as "try again later".

use super::connector::{Authority, ConnectOptions, Connector, PendingConnect};
use super::session::{PollEvents, SessionOps};
use super::{Error, Result};
use slab::Slab;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Handle to a pooled connection
///
/// The serial makes a handle stale once its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    key: usize,
    serial: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.serial)
    }
}

/// Result of a checkout attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkout {
    /// An open connection is now in use by the caller
    Connection(ConnectionId),
    /// A new connection is reserved for the caller but not usable yet
    Connecting(ConnectionId),
    /// The authority is at its connection limit
    NoCapacity,
}

/// Where a connection attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Established,
    Pending {
        interest: PollEvents,
        deadline: Option<Instant>,
    },
}

enum Transport {
    Connecting(Box<dyn PendingConnect>),
    Open(Box<dyn SessionOps>),
}

/// A pooled transport
pub struct Connection {
    id: ConnectionId,
    authority: Authority,
    transport: Transport,
    in_use: bool,
    created_at: Instant,
    last_activity: Instant,
    bytes_sent: u64,
    bytes_received: u64,
    checkouts: u64,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.transport, Transport::Connecting(_))
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Time since the last read, write or checkout
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// How many times the connection was handed out
    pub fn checkouts(&self) -> u64 {
        self.checkouts
    }

    /// Whether this connection served an earlier request
    pub fn is_reused(&self) -> bool {
        self.checkouts > 1
    }

    /// The session, once connected
    pub fn session(&self) -> Option<&dyn SessionOps> {
        match &self.transport {
            Transport::Open(session) => Some(session.as_ref()),
            Transport::Connecting(_) => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut dyn SessionOps> {
        match &mut self.transport {
            Transport::Open(session) => Some(session.as_mut()),
            Transport::Connecting(_) => None,
        }
    }

    /// Descriptor to wait on, for the session or the attempt
    pub fn raw_fd(&self) -> RawFd {
        match &self.transport {
            Transport::Open(session) => session.raw_fd(),
            Transport::Connecting(pending) => pending.raw_fd(),
        }
    }

    /// Whether decrypted bytes are waiting that a descriptor poll cannot see
    pub fn has_buffered_data(&self) -> bool {
        self.session().map_or(false, |s| s.has_buffered_data())
    }

    fn is_alive(&self) -> bool {
        self.session().map_or(false, |s| s.is_alive())
    }

    fn open_session(&mut self) -> io::Result<&mut Box<dyn SessionOps>> {
        match &mut self.transport {
            Transport::Open(session) => Ok(session),
            Transport::Connecting(_) => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.open_session()?.read(buf)?;
        self.bytes_received += n as u64;
        self.touch();
        Ok(n)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.open_session()?.write(buf)?;
        self.bytes_sent += n as u64;
        self.touch();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.open_session()?.flush()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("authority", &self.authority)
            .field("connecting", &self.is_connecting())
            .field("in_use", &self.in_use)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_received", &self.bytes_received)
            .finish()
    }
}

/// Live and idle connection counts for one authority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    pub live: usize,
    pub idle: usize,
}

/// Per-authority connection pool
pub struct ConnectionPool {
    connections: Slab<Connection>,
    connector: Box<dyn Connector>,
    options: ConnectOptions,
    max_per_host: usize,
    next_serial: u64,
}

impl ConnectionPool {
    /// Create a pool; `max_per_host` is clamped to at least 1
    pub fn new(
        connector: Box<dyn Connector>,
        options: ConnectOptions,
        max_per_host: usize,
    ) -> Self {
        ConnectionPool {
            connections: Slab::new(),
            connector,
            options,
            max_per_host: max_per_host.max(1),
            next_serial: 0,
        }
    }

    pub fn max_per_host(&self) -> usize {
        self.max_per_host
    }

    /// Hand out a connection for `authority`
    ///
    /// An idle connection is reused when the peer has not closed it; dead
    /// idle connections found on the way are evicted. A new connection is
    /// started only while the authority is under its limit.
    pub fn checkout(&mut self, authority: &Authority) -> Result<Checkout> {
        let idle: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| !c.in_use && c.authority == *authority)
            .map(|(_, c)| c.id)
            .collect();

        for id in idle {
            let alive = self.get(id).map_or(false, |c| c.is_alive());
            if !alive {
                log::warn!("evicting dead connection {} to {}", id, authority);
                self.discard(id);
                continue;
            }

            if let Some(conn) = self.get_mut(id) {
                conn.in_use = true;
                conn.checkouts += 1;
                conn.touch();
                log::debug!("reusing {} for {}", id, authority);
                return Ok(Checkout::Connection(id));
            }
        }

        if self.live_count(authority) >= self.max_per_host {
            log::trace!("no capacity for {} (limit {})", authority, self.max_per_host);
            return Ok(Checkout::NoCapacity);
        }

        let pending = self.connector.connect(authority, &self.options)?;
        let id = self.insert(authority, Transport::Connecting(pending));
        log::debug!("connecting {} to {}", id, authority);
        Ok(Checkout::Connecting(id))
    }

    /// Push a connection attempt forward
    ///
    /// A failed attempt is removed from the pool before its error is
    /// returned. Open connections report [`ConnectProgress::Established`].
    pub fn advance_connect(&mut self, id: ConnectionId) -> Result<ConnectProgress> {
        let conn = self.get_mut(id).ok_or(Error::ConnectionClosed)?;
        let pending = match &mut conn.transport {
            Transport::Connecting(pending) => pending,
            Transport::Open(_) => return Ok(ConnectProgress::Established),
        };

        match pending.advance() {
            Ok(Some(session)) => {
                conn.transport = Transport::Open(session);
                conn.touch();
                log::debug!("opened {} to {}", id, conn.authority);
                Ok(ConnectProgress::Established)
            }
            Ok(None) => Ok(ConnectProgress::Pending {
                interest: pending.interest(),
                deadline: pending.deadline(),
            }),
            Err(e) => {
                log::debug!("connecting {} failed: {}", id, e);
                self.discard(id);
                Err(e)
            }
        }
    }

    /// Return a connection for reuse; false when the handle is stale
    ///
    /// An attempt that never finished connecting is closed instead.
    pub fn checkin(&mut self, id: ConnectionId) -> bool {
        if self.get(id).map_or(false, |c| c.is_connecting()) {
            log::debug!("dropping unfinished {}", id);
            return self.discard(id);
        }
        match self.get_mut(id) {
            Some(conn) => {
                conn.in_use = false;
                conn.touch();
                log::debug!("checked in {} to {}", id, conn.authority);
                true
            }
            None => false,
        }
    }

    /// Close and remove one connection; false when the handle is stale
    pub fn close(&mut self, id: ConnectionId) -> bool {
        let closed = self.discard(id);
        if closed {
            log::debug!("closed {}", id);
        }
        closed
    }

    /// Close every connection, in use or not
    pub fn close_all(&mut self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|(_, c)| c.id).collect();
        ids.into_iter().filter(|&id| self.discard(id)).count()
    }

    /// Close every connection to `host`, on any port
    pub fn close_host(&mut self, host: &str) -> usize {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.authority.host.eq_ignore_ascii_case(host))
            .map(|(_, c)| c.id)
            .collect();
        ids.into_iter().filter(|&id| self.discard(id)).count()
    }

    /// Close idle connections unused for at least `max_idle`
    pub fn close_idle(&mut self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| !c.in_use && c.idle_for(now) >= max_idle)
            .map(|(_, c)| c.id)
            .collect();

        let closed = ids.into_iter().filter(|&id| self.discard(id)).count();
        if closed > 0 {
            log::debug!("closed {} connection(s) idle for {:?}", closed, max_idle);
        }
        closed
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.key).filter(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id.key).filter(|c| c.id == id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// Connections to `authority`, idle, in use or connecting
    pub fn live_count(&self, authority: &Authority) -> usize {
        self.connections
            .iter()
            .filter(|(_, c)| c.authority == *authority)
            .count()
    }

    /// Idle connections to `authority`
    pub fn idle_count(&self, authority: &Authority) -> usize {
        self.connections
            .iter()
            .filter(|(_, c)| !c.in_use && c.authority == *authority)
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Live and idle counts per authority
    pub fn stats(&self) -> HashMap<Authority, AuthorityStats> {
        let mut stats: HashMap<Authority, AuthorityStats> = HashMap::new();
        for (_, conn) in self.connections.iter() {
            let entry = stats.entry(conn.authority.clone()).or_default();
            entry.live += 1;
            if !conn.in_use {
                entry.idle += 1;
            }
        }
        stats
    }

    fn insert(&mut self, authority: &Authority, transport: Transport) -> ConnectionId {
        self.next_serial += 1;
        let serial = self.next_serial;
        let now = Instant::now();

        let entry = self.connections.vacant_entry();
        let id = ConnectionId {
            key: entry.key(),
            serial,
        };
        entry.insert(Connection {
            id,
            authority: authority.clone(),
            transport,
            in_use: true,
            created_at: now,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
            checkouts: 1,
        });
        id
    }

    fn discard(&mut self, id: ConnectionId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let mut conn = self.connections.remove(id.key);
        if let Transport::Open(session) = &mut conn.transport {
            if let Err(e) = session.close() {
                log::trace!("closing {}: {}", id, e);
            }
        }
        true
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connections.len())
            .field("max_per_host", &self.max_per_host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::connector::Established;
    use std::os::fd::RawFd;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MockSession {
        alive: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    impl Read for MockSession {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for MockSession {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SessionOps for MockSession {
        fn poll(&self, _events: PollEvents, _timeout: Option<Duration>) -> Result<bool> {
            Ok(true)
        }

        fn raw_fd(&self) -> RawFd {
            -1
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        sessions: Arc<std::sync::Mutex<Vec<Arc<AtomicBool>>>>,
    }

    impl Connector for MockConnector {
        fn connect(
            &mut self,
            _authority: &Authority,
            _options: &ConnectOptions,
        ) -> Result<Box<dyn PendingConnect>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::new(AtomicBool::new(true));
            if let Ok(mut sessions) = self.sessions.lock() {
                sessions.push(alive.clone());
            }
            Ok(Box::new(Established::new(MockSession {
                alive,
                closed: self.closed.clone(),
            })))
        }
    }

    /// Attempt that never completes, or fails on its first step
    struct Stalled {
        fail: bool,
    }

    impl PendingConnect for Stalled {
        fn advance(&mut self) -> Result<Option<Box<dyn SessionOps>>> {
            if self.fail {
                return Err(Error::Dns("stalled.test".to_string()));
            }
            Ok(None)
        }

        fn interest(&self) -> PollEvents {
            PollEvents::Write
        }

        fn raw_fd(&self) -> RawFd {
            -1
        }

        fn deadline(&self) -> Option<Instant> {
            None
        }
    }

    struct StalledConnector {
        fail: bool,
    }

    impl Connector for StalledConnector {
        fn connect(
            &mut self,
            _authority: &Authority,
            _options: &ConnectOptions,
        ) -> Result<Box<dyn PendingConnect>> {
            Ok(Box::new(Stalled { fail: self.fail }))
        }
    }

    fn pool(limit: usize) -> (ConnectionPool, MockConnector) {
        let connector = MockConnector::default();
        let pool = ConnectionPool::new(
            Box::new(connector.clone()),
            ConnectOptions::default(),
            limit,
        );
        (pool, connector)
    }

    fn checkout(pool: &mut ConnectionPool, authority: &Authority) -> ConnectionId {
        match pool.checkout(authority).unwrap() {
            Checkout::Connection(id) => id,
            Checkout::Connecting(id) => {
                assert_eq!(pool.advance_connect(id).unwrap(), ConnectProgress::Established);
                id
            }
            Checkout::NoCapacity => panic!("expected a connection"),
        }
    }

    #[test]
    fn test_limit_per_authority() {
        let (mut pool, connector) = pool(2);
        let a = Authority::new("a.test", 80, false);
        let b = Authority::new("b.test", 80, false);

        let first = checkout(&mut pool, &a);
        let _second = checkout(&mut pool, &a);
        assert_eq!(pool.checkout(&a).unwrap(), Checkout::NoCapacity);

        // another host is unaffected
        let _other = checkout(&mut pool, &b);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 3);

        assert!(pool.checkin(first));
        assert_eq!(pool.checkout(&a).unwrap(), Checkout::Connection(first));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 3);
        assert_eq!(pool.live_count(&a), 2);
    }

    #[test]
    fn test_transport_kind_is_part_of_key() {
        let (mut pool, _) = pool(1);
        let plain = Authority::new("a.test", 443, false);
        let secure = Authority::new("a.test", 443, true);

        let id = checkout(&mut pool, &plain);
        pool.checkin(id);
        let other = checkout(&mut pool, &secure);
        assert_ne!(id, other);
    }

    #[test]
    fn test_dead_idle_connection_is_evicted() {
        let (mut pool, connector) = pool(1);
        let a = Authority::new("a.test", 80, false);

        let id = checkout(&mut pool, &a);
        pool.checkin(id);
        connector.sessions.lock().unwrap()[0].store(false, Ordering::SeqCst);

        let fresh = checkout(&mut pool, &a);
        assert_ne!(id, fresh);
        assert!(!pool.contains(id));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_and_stale_handles() {
        let (mut pool, _) = pool(4);
        let a = Authority::new("a.test", 80, false);

        let id = checkout(&mut pool, &a);
        assert!(pool.close(id));
        assert!(!pool.close(id));
        assert!(!pool.checkin(id));
        assert!(pool.get(id).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_bulk_close() {
        let (mut pool, _) = pool(4);
        let a80 = Authority::new("a.test", 80, false);
        let a81 = Authority::new("a.test", 81, false);
        let b = Authority::new("b.test", 80, false);

        checkout(&mut pool, &a80);
        checkout(&mut pool, &a81);
        let idle = checkout(&mut pool, &b);
        pool.checkin(idle);

        assert_eq!(pool.close_idle(Duration::from_secs(3600)), 0);
        assert_eq!(pool.close_idle(Duration::ZERO), 1);
        assert_eq!(pool.close_host("A.TEST"), 2);
        assert!(pool.is_empty());

        checkout(&mut pool, &b);
        checkout(&mut pool, &b);
        assert_eq!(pool.close_all(), 2);
    }

    #[test]
    fn test_stats_and_byte_counts() {
        let (mut pool, _) = pool(4);
        let a = Authority::new("a.test", 80, false);

        let busy = checkout(&mut pool, &a);
        let idle = checkout(&mut pool, &a);
        pool.checkin(idle);

        let conn = pool.get_mut(busy).unwrap();
        conn.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(conn.bytes_sent(), 18);
        assert!(!conn.is_reused());

        let stats = pool.stats();
        assert_eq!(stats[&a], AuthorityStats { live: 2, idle: 1 });
    }

    #[test]
    fn test_connecting_counts_toward_limit() {
        let mut pool = ConnectionPool::new(
            Box::new(StalledConnector { fail: false }),
            ConnectOptions::default(),
            1,
        );
        let a = Authority::new("a.test", 80, false);

        let id = match pool.checkout(&a).unwrap() {
            Checkout::Connecting(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(pool.checkout(&a).unwrap(), Checkout::NoCapacity);
        assert_eq!(
            pool.advance_connect(id).unwrap(),
            ConnectProgress::Pending {
                interest: PollEvents::Write,
                deadline: None,
            }
        );

        let conn = pool.get_mut(id).unwrap();
        assert!(conn.is_connecting());
        assert!(conn.session().is_none());
        let err = conn.write(b"GET").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        // never handed back as idle
        assert_eq!(pool.close_idle(Duration::ZERO), 0);
        assert!(pool.checkin(id));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_failed_attempt_is_removed() {
        let mut pool = ConnectionPool::new(
            Box::new(StalledConnector { fail: true }),
            ConnectOptions::default(),
            1,
        );
        let a = Authority::new("a.test", 80, false);

        let id = match pool.checkout(&a).unwrap() {
            Checkout::Connecting(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(pool.advance_connect(id), Err(Error::Dns(_))));
        assert!(!pool.contains(id));
        assert!(matches!(pool.advance_connect(id), Err(Error::ConnectionClosed)));
        assert!(matches!(pool.checkout(&a).unwrap(), Checkout::Connecting(_)));
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let (mut pool, _) = pool(4);
        let a = Authority::new("a.test", 80, false);

        let old = checkout(&mut pool, &a);
        pool.close(old);
        let new = checkout(&mut pool, &a);
        assert_ne!(old, new);
        assert!(pool.get(old).is_none());
        assert!(pool.get(new).is_some());
        assert!(!pool.close(old));
    }

    #[test]
    fn test_limit_is_clamped() {
        let (pool, _) = pool(0);
        assert_eq!(pool.max_per_host(), 1);
    }
}
