//! The single-threaded event dispatcher.
//!
//! An [`EventLoop`] owns a current-thread tokio runtime and a queue of closures. Any thread may
//! queue work with [`EventLoop::add`]; the work runs on whichever thread is inside
//! [`EventLoop::dispatch`] or [`EventLoop::dispatch_once`], in FIFO order. Operations that are
//! only valid on that thread take a [`Dispatch`], which is only ever handed to closures run by
//! the loop.

pub mod dns;
mod pump;
mod server;
pub mod tls;

use std::{
    cell::Cell,
    future::Future,
    marker::PhantomData,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Runtime, sync::Notify, task::JoinHandle};

pub use self::{
    pump::EventPumpThread,
    server::{HttpServer, Reply, ServerRequest},
};
use self::{dns::DnsResolver, tls::TlsContext};
use crate::{
    error::{builder_error, task_cancelled, Result},
    task::Task,
    transport::{http1, Connect, HyperConnector, RawConnection},
};

type Closure = Box<dyn FnOnce(&Dispatch<'_>) + Send>;

thread_local! {
    static ON_EVENT_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Handle to an event loop. Cloning creates another handle to the same loop.
///
/// The loop, with its runtime and everything still queued on it, is torn down when the last
/// handle goes away. Work that refers back to the loop holds a [`WeakEventLoop`].
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

/// A handle that does not keep its [`EventLoop`] alive.
#[derive(Clone, Default)]
pub struct WeakEventLoop {
    inner: Weak<Inner>,
}

impl WeakEventLoop {
    /// The loop, unless it was already torn down.
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.inner.upgrade().map(|inner| EventLoop { inner })
    }
}

struct Inner {
    // only taken on drop
    runtime: Option<Runtime>,
    closures: Mutex<Vec<Closure>>,
    wake: Notify,
    exit_requested: AtomicBool,
    dispatch_lock: Mutex<()>,
    dns: Mutex<Option<DnsResolver>>,
    tls: TlsContext,
    connector: Arc<dyn Connect>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Builder of an [`EventLoop`].
#[derive(Default)]
pub struct Builder {
    trusted_root_certs: Option<PathBuf>,
    connector: Option<Arc<dyn Connect>>,
    http1: http1::Config,
}

impl Builder {
    /// PEM bundle of root certificates trusted by HTTPS connections.
    ///
    /// Without one, the bundled Mozilla roots are trusted. A configured bundle that cannot be
    /// loaded fails [`Builder::build`].
    pub fn trusted_root_certs(mut self, path: impl Into<PathBuf>) -> Self {
        self.trusted_root_certs = Some(path.into());
        self
    }

    /// Replace the factory of connections. Defaults to a [`HyperConnector`].
    pub fn connector<C: Connect>(mut self, connector: C) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// HTTP/1 settings of the default connector. Ignored when a connector is set.
    pub fn http1_config(mut self, config: http1::Config) -> Self {
        self.http1 = config;
        self
    }

    /// Build the loop. Fails when the runtime cannot be created or the configured root bundle
    /// cannot be loaded.
    pub fn build(self) -> Result<EventLoop> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(builder_error)?;
        let tls = match &self.trusted_root_certs {
            Some(path) => TlsContext::from_pem_file(path),
            None => TlsContext::with_webpki_roots(),
        }
        .map_err(builder_error)?;
        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(HyperConnector::new(&self.http1)),
        };

        Ok(EventLoop {
            inner: Arc::new(Inner {
                runtime: Some(runtime),
                closures: Mutex::new(Vec::new()),
                wake: Notify::new(),
                exit_requested: AtomicBool::new(false),
                dispatch_lock: Mutex::new(()),
                dns: Mutex::new(None),
                tls,
                connector,
            }),
        })
    }
}

impl EventLoop {
    /// Create an event loop with the default settings.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Start configuring an event loop.
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Queue `f` to run on the dispatch thread.
    pub fn add<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_dispatch(move |_| f());
    }

    /// Queue `f` to run on the dispatch thread, with access to the [`Dispatch`] capability.
    pub fn add_dispatch<F>(&self, f: F)
    where
        F: FnOnce(&Dispatch<'_>) + Send + 'static,
    {
        self.inner.closures.lock().push(Box::new(f));
        self.inner.wake.notify_one();
    }

    /// Resolve `task` successfully once `duration` elapsed.
    ///
    /// A zero duration resolves right away on the calling thread. Cancelling the task stops the
    /// timer and resolves it as cancelled.
    pub fn delay(&self, duration: Duration, task: &Task) {
        if duration.is_zero() {
            task.resolve_ok();
            return;
        }

        let _hold = task.hold();
        let fired = task.clone();
        let weak = self.downgrade();
        let timer = self.spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(event_loop) = weak.upgrade() {
                event_loop.add(move || {
                    fired.resolve_ok();
                });
            }
        });

        let abort = timer.abort_handle();
        let cancelled = task.clone();
        let weak = self.downgrade();
        task.when_cancelled(move || {
            let cancel = move || {
                abort.abort();
                cancelled.resolve(Err(task_cancelled()));
            };
            match weak.upgrade() {
                Some(event_loop) => event_loop.add(cancel),
                None => cancel(),
            }
        });
        let abort = timer.abort_handle();
        task.cleanup_when_done(move || abort.abort());
    }

    /// Run the loop until [`EventLoop::loop_exit`] is called or the process receives SIGHUP,
    /// SIGINT or SIGTERM.
    ///
    /// # Panics
    ///
    /// Panics if another thread is dispatching this loop.
    pub fn dispatch(&self) {
        let Some(_guard) = self.inner.dispatch_lock.try_lock() else {
            panic!("EventLoop::dispatch called while another thread is dispatching");
        };
        let _marker = EventThreadMarker::enter();
        tracing::debug!("event loop dispatching");

        self.runtime().block_on(async {
            let exit_signal = exit_signal();
            tokio::pin!(exit_signal);
            loop {
                if self.inner.exit_requested.swap(false, Ordering::AcqRel) {
                    break;
                }
                tokio::select! {
                    _ = self.inner.wake.notified() => {}
                    _ = &mut exit_signal => {
                        tracing::info!("exit signal received, leaving the event loop");
                        break;
                    }
                }
                self.run_closures();
            }
        });
        tracing::debug!("event loop exited");
    }

    /// Wait for one batch of queued closures and run it.
    pub fn dispatch_once(&self) {
        let _guard = self.inner.dispatch_lock.lock();
        let _marker = EventThreadMarker::enter();

        self.runtime().block_on(async {
            // a wake-up may be left over from closures an earlier batch already ran
            while self.inner.closures.lock().is_empty() {
                self.inner.wake.notified().await;
            }
            self.run_closures();
        });
    }

    /// Make the running dispatch return, or the next one if none is running.
    pub fn loop_exit(&self) {
        self.inner.exit_requested.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    /// The DNS resolver of the loop, created on first use.
    pub fn dns(&self) -> DnsResolver {
        self.inner
            .dns
            .lock()
            .get_or_insert_with(DnsResolver::default)
            .clone()
    }

    /// Whether the current thread is dispatching an event loop.
    pub fn on_event_thread() -> bool {
        ON_EVENT_THREAD.with(Cell::get)
    }

    /// # Panics
    ///
    /// Panics when called from a dispatching thread.
    pub fn check_not_on_event_thread() {
        assert!(
            !Self::on_event_thread(),
            "must not be called on the event dispatch thread"
        );
    }

    fn run_closures(&self) {
        let closures = std::mem::take(&mut *self.inner.closures.lock());
        if closures.is_empty() {
            return;
        }
        tracing::trace!("running {} queued closures", closures.len());
        let dispatch = Dispatch::new(self);
        for closure in closures {
            closure(&dispatch);
        }
    }

    /// Spawn `fut` on the loop runtime. It makes progress only while the loop is dispatched.
    pub(crate) fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime().spawn(fut)
    }

    fn runtime(&self) -> &Runtime {
        self.inner
            .runtime
            .as_ref()
            .expect("runtime is only taken when the loop is dropped")
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.inner.closures.lock().len()
    }
}

/// Capability to perform operations that are only valid on the dispatch thread.
///
/// Only closures run by an [`EventLoop`] ever receive one, and it cannot leave that thread.
pub struct Dispatch<'a> {
    event_loop: &'a EventLoop,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Dispatch<'a> {
    fn new(event_loop: &'a EventLoop) -> Self {
        Self {
            event_loop,
            _not_send: PhantomData,
        }
    }

    /// The loop running the current closure.
    pub fn event_loop(&self) -> &'a EventLoop {
        self.event_loop
    }

    /// Create a plain HTTP connection through the loop's connector.
    pub fn http_connection_new(&self, host: &str, port: u16) -> Box<dyn RawConnection> {
        assert!(EventLoop::on_event_thread());
        self.event_loop.inner.connector.http(self, host, port)
    }

    /// Create an HTTPS connection through the loop's connector.
    pub fn https_connection_new(&self, host: &str, port: u16) -> Box<dyn RawConnection> {
        assert!(EventLoop::on_event_thread());
        self.event_loop.inner.connector.https(self, host, port)
    }

    pub fn dns(&self) -> DnsResolver {
        self.event_loop.dns()
    }

    /// TLS context used by HTTPS connections of this loop.
    pub fn tls(&self) -> &'a TlsContext {
        &self.event_loop.inner.tls
    }

    /// Run `fut` on the loop and hand its output to the dispatch thread as a closure.
    ///
    /// The output is dropped without running if the loop is gone by then.
    pub fn spawn_then<Fut, F>(&self, fut: Fut)
    where
        Fut: Future<Output = F> + Send + 'static,
        F: FnOnce(&Dispatch<'_>) + Send + 'static,
    {
        let weak = self.event_loop.downgrade();
        self.event_loop.spawn(async move {
            let then = fut.await;
            match weak.upgrade() {
                Some(event_loop) => event_loop.add_dispatch(then),
                None => tracing::trace!("event loop dropped, discarding completion"),
            }
        });
    }
}

/// Marks the current thread as dispatching for its lifetime.
struct EventThreadMarker {
    previous: bool,
}

impl EventThreadMarker {
    fn enter() -> Self {
        let previous = ON_EVENT_THREAD.with(|flag| flag.replace(true));
        if previous {
            tracing::warn!("event loop dispatched from a thread already dispatching one");
        }
        Self { previous }
    }
}

impl Drop for EventThreadMarker {
    fn drop(&mut self) {
        let previous = self.previous;
        ON_EVENT_THREAD.with(|flag| flag.set(previous));
    }
}

#[cfg(unix)]
async fn exit_signal() {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    async fn recv(signal: &mut Option<Signal>) {
        match signal {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    let listen = |kind: SignalKind| match signal(kind) {
        Ok(signal) => Some(signal),
        Err(err) => {
            tracing::warn!("failed to listen for signal {kind:?}: {err}");
            None
        }
    };
    let mut hangup = listen(SignalKind::hangup());
    let mut interrupt = listen(SignalKind::interrupt());
    let mut terminate = listen(SignalKind::terminate());

    tokio::select! {
        _ = recv(&mut hangup) => {}
        _ = recv(&mut interrupt) => {}
        _ = recv(&mut terminate) => {}
    }
}

#[cfg(not(unix))]
async fn exit_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{mpsc, Arc},
        time::{Duration, Instant},
    };

    use parking_lot::Mutex;

    use super::{EventLoop, EventPumpThread};
    use crate::{
        error::ErrorKind,
        task::Task,
        test_helpers::{with_dispatch, MockConnector},
    };

    #[test]
    fn closures_run_in_order() {
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            event_loop.add(move || order.lock().push(i));
        }
        assert_eq!(event_loop.pending(), 5);

        event_loop.dispatch_once();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(event_loop.pending(), 0);
    }

    #[test]
    fn closures_queued_while_running_go_to_next_batch() {
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            let inner_loop = event_loop.clone();
            event_loop.add(move || {
                order.lock().push("outer");
                let order = order.clone();
                inner_loop.add(move || order.lock().push("inner"));
            });
        }

        event_loop.dispatch_once();
        assert_eq!(*order.lock(), vec!["outer"]);
        assert_eq!(event_loop.pending(), 1);
        event_loop.dispatch_once();
        assert_eq!(*order.lock(), vec!["outer", "inner"]);
    }

    #[test]
    fn marker_is_set_while_dispatching() {
        let event_loop = EventLoop::new().unwrap();
        assert!(!EventLoop::on_event_thread());
        EventLoop::check_not_on_event_thread();

        let seen = with_dispatch(&event_loop, |_| EventLoop::on_event_thread());
        assert!(seen);
        assert!(!EventLoop::on_event_thread());
    }

    #[test]
    fn check_not_on_event_thread_panics_inside_loop() {
        let event_loop = EventLoop::new().unwrap();
        let result = with_dispatch(&event_loop, |_| {
            catch_unwind(EventLoop::check_not_on_event_thread).is_err()
        });
        assert!(result);
    }

    #[test]
    fn connection_factory_uses_connector() {
        let connector = MockConnector::default();
        let event_loop = EventLoop::builder()
            .connector(connector.clone())
            .build()
            .unwrap();

        with_dispatch(&event_loop, |dispatch| {
            let _http = dispatch.http_connection_new("example.com", 80);
            let _https = dispatch.https_connection_new("example.com", 443);
        });
        assert_eq!(connector.created(), 2);
    }

    #[test]
    fn missing_root_bundle_fails_build() {
        let err = EventLoop::builder()
            .trusted_root_certs("/nonexistent/ct-fetch/roots.pem")
            .build()
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Builder);
    }

    #[test]
    fn dispatch_exits_on_request() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(Mutex::new(false));
        {
            let ran = ran.clone();
            let exit_loop = event_loop.clone();
            event_loop.add(move || {
                *ran.lock() = true;
                exit_loop.loop_exit();
            });
        }
        event_loop.dispatch();
        assert!(*ran.lock());
    }

    #[test]
    fn concurrent_dispatch_panics() {
        let event_loop = EventLoop::new().unwrap();
        let pump = EventPumpThread::new(event_loop.clone()).unwrap();

        // make sure the pump thread is inside dispatch
        let (tx, rx) = mpsc::channel();
        event_loop.add(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| event_loop.dispatch()));
        assert!(result.is_err());
        drop(pump);
    }

    #[test]
    fn zero_delay_resolves_synchronously() {
        let event_loop = EventLoop::new().unwrap();
        let task = Task::new();
        event_loop.delay(Duration::ZERO, &task);
        assert!(task.is_done());
        assert!(task.status().unwrap().is_ok());
        assert_eq!(event_loop.pending(), 0);
    }

    #[test]
    fn delay_fires() {
        let event_loop = EventLoop::new().unwrap();
        let _pump = EventPumpThread::new(event_loop.clone()).unwrap();

        let task = Task::new();
        let start = Instant::now();
        event_loop.delay(Duration::from_millis(50), &task);
        assert!(task.wait().is_ok());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn cancelled_delay_resolves_cancelled() {
        let event_loop = EventLoop::new().unwrap();
        let _pump = EventPumpThread::new(event_loop.clone()).unwrap();

        let task = Task::new();
        let start = Instant::now();
        event_loop.delay(Duration::from_secs(30), &task);
        task.cancel();
        let err = task.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn weak_handle_does_not_keep_loop_alive() {
        let event_loop = EventLoop::new().unwrap();
        let weak = event_loop.downgrade();
        assert!(weak.upgrade().is_some());

        let task = Task::new();
        event_loop.delay(Duration::from_secs(30), &task);
        drop(event_loop);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn dns_is_created_once() {
        let event_loop = EventLoop::new().unwrap();
        let _first = event_loop.dns();
        let _second = event_loop.dns();
        assert!(event_loop.inner.dns.lock().is_some());
    }
}
