//! Mock transport and helpers shared by the unit tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc, Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    error::BoxError,
    event_loop::{Dispatch, EventLoop},
    request::Headers,
    transport::{CloseHook, Completion, Connect, RawConnection, RawReply, RequestHead},
};

/// How a [`MockConnection`] answers.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Reply with this status and body. A status below 100 closes the connection first, like a
    /// failed connect.
    Reply(u16, &'static str),
    /// Complete without a reply.
    NoReply,
    /// Fail `make_request`.
    FailIssue,
    /// Fail `add_body`.
    FailBody,
    /// Accept the request and never complete it.
    Hang,
}

#[derive(Clone, Debug)]
pub struct Recorded {
    pub host: String,
    pub port: u16,
    pub head: RequestHead,
    pub body: Option<Bytes>,
}

#[derive(Clone)]
pub struct MockConnector {
    inner: Arc<MockState>,
}

struct MockState {
    created: AtomicUsize,
    behavior: Behavior,
    requests: Mutex<Vec<Recorded>>,
    hooks: Mutex<Vec<Arc<Mutex<Hook>>>>,
}

#[derive(Default)]
struct Hook {
    closed: bool,
    hook: Option<CloseHook>,
}

impl Hook {
    fn close(hook: &Mutex<Hook>) {
        let hook = {
            let mut hook = hook.lock();
            hook.closed = true;
            hook.hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new(Behavior::Reply(200, ""))
    }
}

impl MockConnector {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            inner: Arc::new(MockState {
                created: AtomicUsize::new(0),
                behavior,
                requests: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of connections created so far.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.inner.requests.lock().clone()
    }

    /// Close the `index`th created connection.
    pub fn close(&self, index: usize) {
        let hook = self.inner.hooks.lock()[index].clone();
        Hook::close(&hook);
    }

    fn connection(&self, host: &str, port: u16) -> Box<dyn RawConnection> {
        self.inner.created.fetch_add(1, Ordering::SeqCst);
        let hook = Arc::new(Mutex::new(Hook::default()));
        self.inner.hooks.lock().push(hook.clone());
        Box::new(MockConnection {
            state: self.inner.clone(),
            host: host.to_owned(),
            port,
            hook,
        })
    }
}

impl Connect for MockConnector {
    fn http(&self, _: &Dispatch<'_>, host: &str, port: u16) -> Box<dyn RawConnection> {
        self.connection(host, port)
    }

    fn https(&self, _: &Dispatch<'_>, host: &str, port: u16) -> Box<dyn RawConnection> {
        self.connection(host, port)
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
    host: String,
    port: u16,
    hook: Arc<Mutex<Hook>>,
}

impl RawConnection for MockConnection {
    fn make_request(
        &mut self,
        dispatch: &Dispatch<'_>,
        head: RequestHead,
        on_done: Completion,
    ) -> Result<(), BoxError> {
        self.state.requests.lock().push(Recorded {
            host: self.host.clone(),
            port: self.port,
            head,
            body: None,
        });
        let behavior = self.state.behavior.clone();
        let reply = match behavior {
            Behavior::FailIssue => return Err("mock issue failure".into()),
            Behavior::Hang => {
                dispatch.spawn_then(async move {
                    std::future::pending::<()>().await;
                    move |dispatch: &Dispatch<'_>| on_done(dispatch, None)
                });
                return Ok(());
            }
            Behavior::NoReply => None,
            Behavior::Reply(status, body) => Some(RawReply {
                status,
                headers: [("X-Mock", "yes")].into_iter().collect::<Headers>(),
                body: Bytes::from_static(body.as_bytes()),
            }),
            Behavior::FailBody => Some(RawReply {
                status: 200,
                ..Default::default()
            }),
        };
        let hook = self.hook.clone();
        dispatch.spawn_then(async move {
            if reply.as_ref().is_some_and(|reply| reply.status < 100) {
                Hook::close(&hook);
            }
            move |dispatch: &Dispatch<'_>| on_done(dispatch, reply)
        });
        Ok(())
    }

    fn add_body(&mut self, body: Bytes) -> Result<(), BoxError> {
        if matches!(self.state.behavior, Behavior::FailBody) {
            return Err("mock body failure".into());
        }
        if let Some(last) = self.state.requests.lock().last_mut() {
            last.body = Some(body);
        }
        Ok(())
    }

    fn on_close(&mut self, hook: CloseHook) {
        let mut state = self.hook.lock();
        if state.closed {
            drop(state);
            hook();
        } else {
            state.hook = Some(hook);
        }
    }
}

/// Run `f` on `event_loop` from the current thread and return its result.
pub fn with_dispatch<R, F>(event_loop: &EventLoop, f: F) -> R
where
    F: FnOnce(&Dispatch<'_>) -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    event_loop.add_dispatch(move |dispatch| {
        let _ = tx.send(f(dispatch));
    });
    event_loop.dispatch_once();
    rx.try_recv().expect("closure ran in the dispatched batch")
}

/// An event loop using a fresh [`MockConnector`].
pub fn mock_loop(behavior: Behavior) -> (EventLoop, MockConnector) {
    let connector = MockConnector::new(behavior);
    let event_loop = EventLoop::builder()
        .connector(connector.clone())
        .build()
        .unwrap();
    (event_loop, connector)
}
