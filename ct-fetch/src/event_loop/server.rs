//! A small HTTP/1 server sharing the runtime of an [`EventLoop`].
//!
//! Requests are routed on their exact path, the query is not part of the match. The matching
//! handler runs on the dispatch thread and answers through a [`Reply`], either right away or
//! later from any thread. Sockets are only served while the loop is dispatched.

use std::{
    collections::hash_map::Entry,
    convert::Infallible,
    future::Future,
    io,
    net::{SocketAddr, ToSocketAddrs},
    pin::Pin,
    sync::{Arc, Weak},
};

use ahash::AHashMap;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::Service, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::{AbortHandle, JoinSet},
};

use super::{Dispatch, EventLoop, WeakEventLoop};
use crate::{
    request::{Headers, Verb},
    response::Response,
};

type Handler = Arc<dyn Fn(&Dispatch<'_>, ServerRequest, Reply) + Send + Sync>;
type Handlers = Mutex<AHashMap<String, Handler>>;
type HyperResponse = http::Response<Full<Bytes>>;

/// A request received by an [`HttpServer`].
#[derive(Clone, Debug)]
pub struct ServerRequest {
    pub verb: Verb,
    /// Path of the request target, without the query.
    pub path: String,
    pub query: Option<String>,
    /// Header names are lowercase.
    pub headers: Headers,
    pub body: Bytes,
    /// Address of the client.
    pub peer: SocketAddr,
}

/// Answers one [`ServerRequest`].
///
/// Dropping it without calling [`Reply::send`] answers `500 Internal Server Error`.
pub struct Reply {
    tx: oneshot::Sender<Response>,
}

impl Reply {
    pub fn send(self, response: Response) {
        if self.tx.send(response).is_err() {
            tracing::debug!("client went away before the reply was sent");
        }
    }
}

/// HTTP server whose handlers run on an [`EventLoop`].
///
/// Dropping the server closes its listening sockets and the connections they accepted.
pub struct HttpServer {
    event_loop: EventLoop,
    handlers: Arc<Handlers>,
    listeners: Mutex<Vec<AbortHandle>>,
}

impl HttpServer {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self {
            event_loop: event_loop.clone(),
            handlers: Arc::new(Mutex::new(AHashMap::new())),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Listen on `addr`, and return the bound address.
    ///
    /// The socket is bound right away, so the returned address tells the port picked for a
    /// request of port 0. A server may listen on several addresses.
    pub fn bind(&self, addr: impl ToSocketAddrs) -> io::Result<SocketAddr> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        let accept = accept(
            listener,
            local,
            self.event_loop.downgrade(),
            Arc::downgrade(&self.handlers),
        );
        let task = self.event_loop.spawn(accept);
        self.listeners.lock().push(task.abort_handle());
        tracing::info!("http server listening on {local}");
        Ok(local)
    }

    /// Route requests for `path` to `handler`.
    ///
    /// Returns `false` and keeps the current handler when `path` already has one.
    pub fn add_handler<F>(&self, path: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Dispatch<'_>, ServerRequest, Reply) + Send + Sync + 'static,
    {
        match self.handlers.lock().entry(path.into()) {
            Entry::Occupied(entry) => {
                tracing::warn!("a handler for {} is already registered", entry.key());
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(handler));
                true
            }
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        for listener in self.listeners.get_mut().drain(..) {
            listener.abort();
        }
    }
}

async fn accept(
    listener: std::net::TcpListener,
    local: SocketAddr,
    event_loop: WeakEventLoop,
    handlers: Weak<Handlers>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("failed to register listener {local}: {err}");
            return;
        }
    };
    let builder = http1::Builder::new();
    // dropped with the accept loop, which aborts every connection
    let mut conns = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::debug!("failed to accept on {local}: {err}");
                        continue;
                    }
                };
                tracing::trace!("accepted connection from {peer}");
                let service = HandlerService {
                    event_loop: event_loop.clone(),
                    handlers: handlers.clone(),
                    peer,
                };
                let conn = builder.serve_connection(TokioIo::new(stream), service);
                conns.spawn(async move {
                    if let Err(err) = conn.await {
                        tracing::debug!("connection from {peer} failed: {err}");
                    }
                });
            }
            Some(_) = conns.join_next() => {}
        }
    }
}

#[derive(Clone)]
struct HandlerService {
    event_loop: WeakEventLoop,
    handlers: Weak<Handlers>,
    peer: SocketAddr,
}

impl Service<http::Request<Incoming>> for HandlerService {
    type Response = HyperResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.serve(req).await) })
    }
}

impl HandlerService {
    async fn serve(self, req: http::Request<Incoming>) -> HyperResponse {
        let (parts, body) = req.into_parts();
        let Some(verb) = Verb::from_method(&parts.method) else {
            return status_only(StatusCode::NOT_IMPLEMENTED);
        };
        let path = parts.uri.path().to_owned();
        let Some(handlers) = self.handlers.upgrade() else {
            return status_only(StatusCode::SERVICE_UNAVAILABLE);
        };
        let handler = handlers.lock().get(&path).cloned();
        drop(handlers);
        let Some(handler) = handler else {
            tracing::debug!("no handler for {verb} {path}");
            return status_only(StatusCode::NOT_FOUND);
        };

        let body = match body.collect().await {
            Ok(body) => body.to_bytes(),
            Err(err) => {
                tracing::debug!("failed to read request body from {}: {err}", self.peer);
                return status_only(StatusCode::BAD_REQUEST);
            }
        };
        let headers: Headers = parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), String::from_utf8_lossy(value.as_bytes())))
            .collect();
        let request = ServerRequest {
            verb,
            path,
            query: parts.uri.query().map(ToOwned::to_owned),
            headers,
            body,
            peer: self.peer,
        };

        let (tx, rx) = oneshot::channel();
        match self.event_loop.upgrade() {
            Some(event_loop) => {
                event_loop.add_dispatch(move |dispatch| handler(dispatch, request, Reply { tx }))
            }
            None => return status_only(StatusCode::SERVICE_UNAVAILABLE),
        }
        match rx.await {
            Ok(response) => into_hyper(response),
            Err(_) => {
                tracing::warn!("handler dropped its reply to {verb} {}", parts.uri);
                status_only(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

fn into_hyper(response: Response) -> HyperResponse {
    let mut builder = http::Response::builder().status(response.status_code);
    for (name, value) in response.headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(response.body))
        .unwrap_or_else(|err| {
            tracing::warn!("handler produced an invalid response: {err}");
            status_only(StatusCode::INTERNAL_SERVER_ERROR)
        })
}

fn status_only(status: StatusCode) -> HyperResponse {
    let mut resp = http::Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}
