//! Idle connection pool.
//!
//! Connections are keyed by (host, port). Each key keeps a list of idle connections, the
//! freshest at the tail: [`ConnectionPool::get`] takes from the tail and the background cleanup
//! trims from the head. A connection whose transport closed is never handed out again.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ahash::AHashMap;
use bytes::Bytes;
use faststr::FastStr;
use parking_lot::Mutex;
use url::Url;

use crate::{
    error::{missing_host, unsupported_scheme, BoxError, Result},
    event_loop::{Dispatch, EventLoop, WeakEventLoop},
    request::HTTP_SCHEME,
    transport::{Completion, RawConnection, RequestHead},
};

const DEFAULT_PORT: u16 = 80;

/// Pool settings.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Idle connections kept per (host, port) once a cleanup ran.
    pub max_idle_per_host: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_idle_per_host: 4,
        }
    }
}

/// Key of the idle lists of a [`ConnectionPool`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: FastStr,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<FastStr>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Key of `url`, which must be an `http` url.
    pub fn from_url(url: &Url) -> Result<Self> {
        if url.scheme() != HTTP_SCHEME {
            return Err(unsupported_scheme(url.scheme()));
        }
        let host = url.host_str().ok_or_else(missing_host)?;
        Ok(Self::new(
            FastStr::new(host),
            url.port_or_known_default().unwrap_or(DEFAULT_PORT),
        ))
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Liveness of a connection, cleared for good by its close hook.
#[derive(Clone, Debug)]
struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A connection checked out of a [`ConnectionPool`].
pub struct Connection {
    raw: Box<dyn RawConnection>,
    key: HostPort,
    liveness: Liveness,
}

impl Connection {
    /// The (host, port) this connection goes to.
    pub fn key(&self) -> &HostPort {
        &self.key
    }

    /// Whether the transport is still open. Once `false`, stays `false`.
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Issue a request, see [`RawConnection::make_request`].
    pub fn make_request(
        &mut self,
        dispatch: &Dispatch<'_>,
        head: RequestHead,
        on_done: Completion,
    ) -> Result<(), BoxError> {
        self.raw.make_request(dispatch, head, on_done)
    }

    /// Attach the body of the request issued last.
    pub fn add_body(&mut self, body: Bytes) -> Result<(), BoxError> {
        self.raw.add_body(body)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Pool of idle connections, shared by cloning.
///
/// The pool does not keep its event loop alive.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

struct Inner {
    event_loop: WeakEventLoop,
    idle: Mutex<AHashMap<HostPort, VecDeque<Connection>>>,
    max_idle_per_host: usize,
    cleanup_scheduled: AtomicBool,
}

impl ConnectionPool {
    /// Create an empty pool whose connections are made by `event_loop`.
    pub fn new(event_loop: &EventLoop, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                event_loop: event_loop.downgrade(),
                idle: Mutex::new(AHashMap::new()),
                max_idle_per_host: config.max_idle_per_host,
                cleanup_scheduled: AtomicBool::new(false),
            }),
        }
    }

    /// Check out a connection for `url`, reusing an idle one when possible.
    pub fn get(&self, dispatch: &Dispatch<'_>, url: &Url) -> Result<Connection> {
        let key = HostPort::from_url(url)?;

        if let Some(list) = self.inner.idle.lock().get_mut(&key) {
            let before = list.len();
            list.retain(Connection::is_alive);
            if list.len() != before {
                tracing::trace!("dropped {} closed connections to {key}", before - list.len());
            }
            if let Some(conn) = list.pop_back() {
                tracing::debug!("reusing idle connection to {key}");
                return Ok(conn);
            }
        }

        tracing::debug!("new connection to {key}");
        let mut raw = dispatch.http_connection_new(&key.host, key.port);
        let liveness = Liveness::new();
        let on_close = liveness.clone();
        raw.on_close(Box::new(move || on_close.mark_dead()));
        Ok(Connection { raw, key, liveness })
    }

    /// Return a connection. Closed connections are dropped.
    pub fn put(&self, conn: Option<Connection>) {
        let Some(conn) = conn else {
            tracing::trace!("nothing to return to the pool");
            return;
        };
        if !conn.is_alive() {
            tracing::debug!("dropping closed connection to {}", conn.key);
            return;
        }

        let mut idle = self.inner.idle.lock();
        tracing::trace!("returning connection to {}", conn.key);
        let list = idle.entry(conn.key.clone()).or_default();
        list.push_back(conn);
        if list.len() > self.inner.max_idle_per_host
            && self
                .inner
                .cleanup_scheduled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            drop(idle);
            let Some(event_loop) = self.inner.event_loop.upgrade() else {
                tracing::debug!("event loop is gone, trimming idle connections in place");
                self.inner.cleanup();
                return;
            };
            let pool = Arc::downgrade(&self.inner);
            event_loop.add(move || {
                if let Some(inner) = pool.upgrade() {
                    inner.cleanup();
                }
            });
        }
    }

    /// Trim every idle list down to the configured size, oldest connections first.
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }

    /// Number of idle connections kept for `key`, dead ones included until swept.
    pub fn idle_count(&self, key: &HostPort) -> usize {
        self.inner.idle.lock().get(key).map_or(0, VecDeque::len)
    }

    #[cfg(test)]
    fn cleanup_scheduled(&self) -> bool {
        self.inner.cleanup_scheduled.load(Ordering::Acquire)
    }
}

impl Inner {
    fn cleanup(&self) {
        let mut idle = self.idle.lock();
        // a put racing with this cleanup may schedule the next one
        self.cleanup_scheduled.store(false, Ordering::Release);
        let max = self.max_idle_per_host;
        idle.retain(|key, list| {
            if list.len() > max {
                tracing::debug!("evicting {} idle connections to {key}", list.len() - max);
                list.drain(..list.len() - max);
            }
            !list.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::{Config, ConnectionPool, HostPort};
    use crate::{
        error::ErrorKind,
        test_helpers::{mock_loop, with_dispatch, Behavior},
    };

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn host_port_from_url() {
        let key = HostPort::from_url(&url("http://example.com/ct/v1/get-sth")).unwrap();
        assert_eq!(key, HostPort::new("example.com", 80));
        assert_eq!(key.to_string(), "example.com:80");

        let key = HostPort::from_url(&url("http://example.com:8080/")).unwrap();
        assert_eq!(key.port, 8080);

        let err = HostPort::from_url(&url("https://example.com/")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn put_then_get_reuses_connection() {
        let (event_loop, connector) = mock_loop(Behavior::Reply(200, ""));
        let pool = ConnectionPool::new(&event_loop, Config::default());
        let key = HostPort::new("example.com", 80);

        let p = pool.clone();
        with_dispatch(&event_loop, move |d| {
            let conn = p.get(d, &url("http://example.com/")).unwrap();
            p.put(Some(conn));
        });
        assert_eq!(pool.idle_count(&key), 1);

        let p = pool.clone();
        with_dispatch(&event_loop, move |d| {
            let conn = p.get(d, &url("http://example.com/other")).unwrap();
            assert!(conn.is_alive());
            p.put(Some(conn));
        });
        assert_eq!(connector.created(), 1);
        assert_eq!(pool.idle_count(&key), 1);
    }

    #[test]
    fn put_none_is_noop() {
        let (event_loop, _connector) = mock_loop(Behavior::Reply(200, ""));
        let pool = ConnectionPool::new(&event_loop, Config::default());
        pool.put(None);
        assert_eq!(pool.idle_count(&HostPort::new("example.com", 80)), 0);
        assert_eq!(event_loop.pending(), 0);
    }

    #[test]
    fn closed_connection_is_not_pooled() {
        let (event_loop, connector) = mock_loop(Behavior::Reply(200, ""));
        let pool = ConnectionPool::new(&event_loop, Config::default());

        let p = pool.clone();
        let c = connector.clone();
        with_dispatch(&event_loop, move |d| {
            let conn = p.get(d, &url("http://example.com/")).unwrap();
            c.close(0);
            assert!(!conn.is_alive());
            p.put(Some(conn));
        });
        assert_eq!(pool.idle_count(&HostPort::new("example.com", 80)), 0);
    }

    #[test]
    fn get_skips_connections_closed_while_idle() {
        let (event_loop, connector) = mock_loop(Behavior::Reply(200, ""));
        let pool = ConnectionPool::new(&event_loop, Config::default());
        let key = HostPort::new("example.com", 80);

        let p = pool.clone();
        with_dispatch(&event_loop, move |d| {
            let first = p.get(d, &url("http://example.com/")).unwrap();
            let second = p.get(d, &url("http://example.com/")).unwrap();
            p.put(Some(first));
            p.put(Some(second));
        });
        assert_eq!(pool.idle_count(&key), 2);

        // the freshest one goes away
        connector.close(1);
        let p = pool.clone();
        with_dispatch(&event_loop, move |d| {
            let conn = p.get(d, &url("http://example.com/")).unwrap();
            assert!(conn.is_alive());
            p.put(Some(conn));
        });
        assert_eq!(connector.created(), 2);
        assert_eq!(pool.idle_count(&key), 1);
    }

    #[test]
    fn unsupported_scheme_creates_nothing() {
        let (event_loop, connector) = mock_loop(Behavior::Reply(200, ""));
        let pool = ConnectionPool::new(&event_loop, Config::default());

        let p = pool.clone();
        let err = with_dispatch(&event_loop, move |d| {
            p.get(d, &url("ftp://example.com/")).unwrap_err()
        });
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(connector.created(), 0);
    }

    #[test]
    fn cleanup_is_scheduled_once_and_trims_oldest() {
        let (event_loop, connector) = mock_loop(Behavior::Reply(200, ""));
        let pool = ConnectionPool::new(
            &event_loop,
            Config {
                max_idle_per_host: 1,
            },
        );
        let key = HostPort::new("example.com", 80);

        let p = pool.clone();
        with_dispatch(&event_loop, move |d| {
            let conns: Vec<_> = (0..3)
                .map(|_| p.get(d, &url("http://example.com/")).unwrap())
                .collect();
            for conn in conns {
                p.put(Some(conn));
            }
        });
        assert_eq!(pool.idle_count(&key), 3);
        assert!(pool.cleanup_scheduled());
        assert_eq!(event_loop.pending(), 1);

        event_loop.dispatch_once();
        assert_eq!(pool.idle_count(&key), 1);
        assert!(!pool.cleanup_scheduled());

        // the survivor is the last one returned
        connector.close(2);
        let p = pool.clone();
        with_dispatch(&event_loop, move |d| {
            let conn = p.get(d, &url("http://example.com/")).unwrap();
            p.put(Some(conn));
        });
        assert_eq!(connector.created(), 4);
    }

    #[test]
    fn put_without_event_loop_trims_in_place() {
        let (event_loop, _connector) = mock_loop(Behavior::Reply(200, ""));
        let pool = ConnectionPool::new(
            &event_loop,
            Config {
                max_idle_per_host: 1,
            },
        );

        let p = pool.clone();
        let conns = with_dispatch(&event_loop, move |d| {
            (0..2)
                .map(|_| p.get(d, &url("http://example.com/")).unwrap())
                .collect::<Vec<_>>()
        });
        drop(event_loop);

        for conn in conns {
            pool.put(Some(conn));
        }
        assert_eq!(pool.idle_count(&HostPort::new("example.com", 80)), 1);
        assert!(!pool.cleanup_scheduled());
    }

    #[test]
    fn cleanup_forgets_empty_keys() {
        let (event_loop, _connector) = mock_loop(Behavior::Reply(200, ""));
        let pool = ConnectionPool::new(
            &event_loop,
            Config {
                max_idle_per_host: 0,
            },
        );

        let p = pool.clone();
        with_dispatch(&event_loop, move |d| {
            let conn = p.get(d, &url("http://example.com/")).unwrap();
            p.put(Some(conn));
        });
        assert_eq!(event_loop.pending(), 1);
        event_loop.dispatch_once();
        assert_eq!(pool.idle_count(&HostPort::new("example.com", 80)), 0);
        assert!(pool.inner.idle.lock().is_empty());
    }
}
