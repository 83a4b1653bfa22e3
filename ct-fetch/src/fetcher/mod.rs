//! Asynchronous fetching of URLs.
//!
//! [`UrlFetcher::fetch`] can be called from any thread. The request is normalized on the calling
//! thread and then driven on the event loop: a connection is checked out of the pool, the
//! request is issued, and the reply is copied into the caller's [`ResponseSlot`] before the
//! [`Task`] resolves. The connection goes back to the pool whatever the outcome.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    error::{
        body_not_attached, connection_refused, issue_failed, no_reply, on_event_thread,
        request_abandoned, shutting_down, task_cancelled, Result, Status,
    },
    event_loop::{Dispatch, EventLoop},
    pool::{self, Connection, ConnectionPool},
    request::{normalize, Request},
    response::Response,
    task::{fail, Task},
    transport::{RawReply, RequestHead},
};


/// Where the response of a fetch is written.
pub type ResponseSlot = Arc<Mutex<Response>>;

/// Fetches URLs over the connections of its own pool.
#[derive(Clone)]
pub struct UrlFetcher {
    inner: Arc<Inner>,
}

struct Inner {
    event_loop: EventLoop,
    pool: ConnectionPool,
    closing: Arc<AtomicBool>,
}

impl UrlFetcher {
    /// Create a fetcher driven by `event_loop`, with a default pool.
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_config(event_loop, pool::Config::default())
    }

    /// Create a fetcher driven by `event_loop`, with a pool configured by `config`.
    pub fn with_config(event_loop: &EventLoop, config: pool::Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                event_loop: event_loop.clone(),
                pool: ConnectionPool::new(event_loop, config),
                closing: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// The pool of idle connections of this fetcher.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Refuse new fetches.
    ///
    /// Fetches still queued on the event loop fail when their turn comes, without touching the
    /// pool. Requests already issued run to completion.
    pub fn shutdown(&self) {
        if !self.inner.closing.swap(true, Ordering::AcqRel) {
            tracing::debug!("url fetcher shutting down");
        }
    }

    /// Fetch `request`, writing the response to `response` and resolving `task` when done.
    ///
    /// Requests that cannot be sent at all fail right away, before anything is queued on the
    /// event loop. Cancelling `task` resolves it as cancelled; the exchange itself, if already
    /// started, still runs to the end so that its connection can be reused.
    pub fn fetch(&self, request: Request, response: ResponseSlot, task: &Task) {
        let _hold = task.hold();

        if self.inner.closing.load(Ordering::Acquire) {
            fail(task, shutting_down());
            return;
        }
        let request = match normalize(request) {
            Ok(request) => request,
            Err(err) => {
                fail(task, err);
                return;
            }
        };
        tracing::trace!("fetching {} {}", request.verb, request.url);

        let cancelled = task.clone();
        task.when_cancelled(move || {
            cancelled.resolve(Err(task_cancelled()));
        });

        let state = Arc::new(Mutex::new(State {
            pool: self.inner.pool.clone(),
            closing: self.inner.closing.clone(),
            request,
            response,
            task: task.clone(),
            conn: None,
        }));
        self.inner
            .event_loop
            .add_dispatch(move |dispatch| make_request(state, dispatch));
    }

    /// Fetch `request` and wait for the response.
    ///
    /// Fails without fetching anything when called on the event dispatch thread, since the
    /// fetch could never complete.
    pub fn fetch_blocking(&self, request: Request) -> Result<Response> {
        if EventLoop::on_event_thread() {
            return Err(on_event_thread());
        }
        let slot = ResponseSlot::default();
        let task = Task::new();
        self.fetch(request, slot.clone(), &task);
        task.wait()?;
        let response = std::mem::take(&mut *slot.lock());
        Ok(response)
    }
}

/// One request in flight.
///
/// Owned by the queued closure and then by the completion. The state only outlives both when
/// the event loop is torn down with the request pending, and its task then fails.
struct State {
    pool: ConnectionPool,
    closing: Arc<AtomicBool>,
    request: Request,
    response: ResponseSlot,
    task: Task,
    conn: Option<Connection>,
}

impl State {
    fn head(&self) -> RequestHead {
        let mut headers = self.request.headers.clone();
        if let Some(body) = &self.request.body {
            if !body.is_empty() && !headers.contains("Content-Length") {
                headers.insert("Content-Length", body.len().to_string());
            }
        }
        RequestHead {
            verb: self.request.verb,
            path_and_query: self.request.path_and_query().to_owned(),
            headers,
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if !self.task.is_resolved() {
            tracing::debug!("request to {} dropped by its event loop", self.request.url);
            fail(&self.task, request_abandoned());
        }
        if self.conn.is_none() || std::thread::panicking() {
            return;
        }
        // off the dispatch thread this only happens when the event loop is torn down with the
        // request still in flight
        if EventLoop::on_event_thread() {
            panic!("request state dropped while still holding a connection");
        }
        tracing::warn!("request abandoned while holding a connection");
    }
}

fn make_request(state: Arc<Mutex<State>>, dispatch: &Dispatch<'_>) {
    let mut guard = state.lock();
    let task = guard.task.clone();
    if task.is_resolved() {
        tracing::debug!("request resolved before it was issued, not sending it");
        return;
    }
    if guard.closing.load(Ordering::Acquire) {
        drop(guard);
        fail(&task, shutting_down());
        return;
    }

    let mut conn = match guard.pool.get(dispatch, &guard.request.url) {
        Ok(conn) => conn,
        Err(err) => {
            drop(guard);
            fail(&task, err);
            return;
        }
    };

    let head = guard.head();
    tracing::debug!(
        "{} {} on {}",
        head.verb,
        head.path_and_query,
        conn.key()
    );
    let on_done = {
        let state = state.clone();
        Box::new(move |dispatch: &Dispatch<'_>, reply: Option<RawReply>| {
            request_done(&state, dispatch, reply)
        })
    };
    if let Err(err) = conn.make_request(dispatch, head, on_done) {
        tracing::warn!("failed to issue request to {}: {err}", conn.key());
        guard.pool.put(Some(conn));
        drop(guard);
        fail(&task, issue_failed());
        return;
    }

    let attached = match guard.request.body.clone() {
        Some(body) if !body.is_empty() => conn.add_body(body),
        _ => Ok(()),
    };
    // from here on the completion returns the connection
    guard.conn = Some(conn);
    drop(guard);
    if let Err(err) = attached {
        tracing::warn!("failed to attach the request body: {err}");
        fail(&task, body_not_attached());
    }
}

fn request_done(state: &Mutex<State>, _: &Dispatch<'_>, reply: Option<RawReply>) {
    let (task, status): (Task, Status) = {
        let mut guard = state.lock();
        let conn = guard.conn.take();
        if conn.is_none() {
            tracing::error!("request completed without a connection checked out");
        }
        guard.pool.put(conn);

        let status = match reply {
            None => Err(no_reply()),
            Some(reply) => {
                guard.response.lock().status_code = reply.status;
                if reply.status < 100 {
                    Err(connection_refused())
                } else {
                    if !guard.task.is_resolved() {
                        let mut response = guard.response.lock();
                        response.headers = reply.headers;
                        response.body = reply.body;
                    }
                    Ok(())
                }
            }
        };
        (guard.task.clone(), status)
    };

    match status {
        Ok(()) => {
            tracing::trace!("request done");
            task.resolve_ok();
        }
        Err(err) => fail(&task, err),
    }
}
