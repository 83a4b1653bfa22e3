use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use faststr::FastStr;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{Builder, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use super::{http1, CloseHook, Completion, Connect, RawConnection, RawReply, RequestHead};
use crate::{
    error::BoxError,
    event_loop::{dns::DnsResolver, tls::TlsContext, Dispatch},
    request::Headers,
};

type Sender = SendRequest<Full<Bytes>>;

/// Default [`Connect`] implementation, speaking HTTP/1 through hyper.
#[derive(Clone, Debug)]
pub struct HyperConnector {
    builder: Builder,
    nodelay: bool,
}

impl HyperConnector {
    pub fn new(config: &http1::Config) -> Self {
        Self {
            builder: config.client(),
            nodelay: config.is_nodelay(),
        }
    }

    fn connection(
        &self,
        dispatch: &Dispatch<'_>,
        host: &str,
        port: u16,
        tls: Option<TlsContext>,
    ) -> Box<dyn RawConnection> {
        Box::new(HyperConnection {
            target: Arc::new(Target {
                host: FastStr::new(host),
                port,
                tls,
                dns: dispatch.dns(),
                builder: self.builder.clone(),
                nodelay: self.nodelay,
            }),
            shared: Arc::new(Mutex::new(Shared::default())),
        })
    }
}

impl Default for HyperConnector {
    fn default() -> Self {
        Self::new(&http1::Config::default())
    }
}

impl Connect for HyperConnector {
    fn http(&self, dispatch: &Dispatch<'_>, host: &str, port: u16) -> Box<dyn RawConnection> {
        self.connection(dispatch, host, port, None)
    }

    fn https(&self, dispatch: &Dispatch<'_>, host: &str, port: u16) -> Box<dyn RawConnection> {
        let tls = dispatch.tls().clone();
        self.connection(dispatch, host, port, Some(tls))
    }
}

struct Target {
    host: FastStr,
    port: u16,
    tls: Option<TlsContext>,
    dns: DnsResolver,
    builder: Builder,
    nodelay: bool,
}

#[derive(Default)]
struct Shared {
    sender: Option<Sender>,
    pending: Option<Pending>,
    in_flight: bool,
    closed: bool,
    close_hook: Option<CloseHook>,
}

/// A request issued but not yet picked up by its exchange.
struct Pending {
    parts: http::request::Parts,
    body: Option<Bytes>,
}

/// A lazily connected HTTP/1 connection.
///
/// The socket is opened by the first request. The connection is closed for good once the
/// socket goes away or connecting fails; its close hook fires at that point.
pub struct HyperConnection {
    target: Arc<Target>,
    shared: Arc<Mutex<Shared>>,
}

impl RawConnection for HyperConnection {
    fn make_request(
        &mut self,
        dispatch: &Dispatch<'_>,
        head: RequestHead,
        on_done: Completion,
    ) -> Result<(), BoxError> {
        let parts = request_parts(head)?;
        {
            let mut shared = self.shared.lock();
            if shared.closed {
                return Err("connection is closed".into());
            }
            if shared.in_flight {
                return Err("connection already has a request in flight".into());
            }
            shared.in_flight = true;
            shared.pending = Some(Pending { parts, body: None });
        }

        let exchange = Exchange {
            target: self.target.clone(),
            shared: self.shared.clone(),
        };
        dispatch.spawn_then(async move {
            let reply = exchange.run().await;
            move |dispatch: &Dispatch<'_>| on_done(dispatch, reply)
        });
        Ok(())
    }

    fn add_body(&mut self, body: Bytes) -> Result<(), BoxError> {
        let mut shared = self.shared.lock();
        let Some(pending) = shared.pending.as_mut() else {
            return Err("no request waiting for a body".into());
        };
        if pending.body.is_some() {
            return Err("request body already set".into());
        }
        pending.body = Some(body);
        Ok(())
    }

    fn on_close(&mut self, hook: CloseHook) {
        let mut shared = self.shared.lock();
        if shared.closed {
            drop(shared);
            hook();
        } else {
            shared.close_hook = Some(hook);
        }
    }
}

fn request_parts(head: RequestHead) -> Result<http::request::Parts, BoxError> {
    let mut builder = http::Request::builder()
        .method(http::Method::from(head.verb))
        .uri(head.path_and_query);
    for (name, value) in head.headers.iter() {
        builder = builder.header(name, value);
    }
    let (parts, ()) = builder.body(())?.into_parts();
    Ok(parts)
}

fn notify_closed(shared: &Mutex<Shared>) {
    let hook = {
        let mut shared = shared.lock();
        shared.closed = true;
        shared.sender = None;
        shared.close_hook.take()
    };
    if let Some(hook) = hook {
        hook();
    }
}

/// One request/response exchange, run on the event loop runtime.
struct Exchange {
    target: Arc<Target>,
    shared: Arc<Mutex<Shared>>,
}

impl Exchange {
    async fn run(self) -> Option<RawReply> {
        let (pending, sender) = {
            let mut shared = self.shared.lock();
            (shared.pending.take(), shared.sender.take())
        };
        let Some(Pending { parts, body }) = pending else {
            tracing::error!("exchange started without a pending request");
            self.shared.lock().in_flight = false;
            return None;
        };

        let mut sender = match self.ready_sender(sender).await {
            Ok(sender) => sender,
            Err(err) => {
                tracing::debug!(
                    "failed to connect to {}:{}: {err}",
                    self.target.host,
                    self.target.port
                );
                self.shared.lock().in_flight = false;
                notify_closed(&self.shared);
                return Some(RawReply::refused());
            }
        };

        let req = http::Request::from_parts(parts, Full::new(body.unwrap_or_default()));
        let result = send(&mut sender, req).await;
        {
            let mut shared = self.shared.lock();
            shared.in_flight = false;
            if !shared.closed {
                shared.sender = Some(sender);
            }
        }
        match result {
            Ok(reply) => Some(reply),
            Err(err) => {
                tracing::debug!(
                    "request to {}:{} failed: {err}",
                    self.target.host,
                    self.target.port
                );
                None
            }
        }
    }

    /// Reuse the established sender, or connect when there is none or it went stale while
    /// idle. Nothing has been written at this point, so reconnecting never repeats a request.
    async fn ready_sender(&self, sender: Option<Sender>) -> Result<Sender, BoxError> {
        if let Some(mut sender) = sender {
            if sender.ready().await.is_ok() {
                return Ok(sender);
            }
            tracing::debug!(
                "idle connection to {}:{} went away, reconnecting",
                self.target.host,
                self.target.port
            );
        }
        self.connect().await
    }

    async fn connect(&self) -> Result<Sender, BoxError> {
        let target = &self.target;
        let ip = target
            .dns
            .resolve(&target.host)
            .await
            .ok_or_else(|| format!("failed to resolve {}", target.host))?;
        let addr = SocketAddr::new(ip, target.port);
        let tcp = TcpStream::connect(addr).await?;
        if target.nodelay {
            if let Err(err) = tcp.set_nodelay(true) {
                tracing::warn!("failed to set TCP_NODELAY on {addr}: {err}");
            }
        }
        tracing::debug!("connected to {addr}");

        match &target.tls {
            Some(tls) => {
                let stream = tls.connect(&target.host, tcp).await?;
                self.handshake(stream).await
            }
            None => self.handshake(tcp).await,
        }
    }

    async fn handshake<S>(&self, stream: S) -> Result<Sender, BoxError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, conn) = self.target.builder.handshake(TokioIo::new(stream)).await?;
        // the driver only observes the connection, it must not keep the sender alive
        let shared: Weak<Mutex<Shared>> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!("connection terminated: {err}");
            }
            if let Some(shared) = shared.upgrade() {
                notify_closed(&shared);
            }
        });
        Ok(sender)
    }
}

async fn send(
    sender: &mut Sender,
    req: http::Request<Full<Bytes>>,
) -> Result<RawReply, hyper::Error> {
    sender.ready().await?;
    let resp = sender.send_request(req).await?;
    let (parts, body) = resp.into_parts();
    let body = body.collect().await?.to_bytes();
    let headers: Headers = parts
        .headers
        .iter()
        .map(|(name, value)| (name.as_str(), String::from_utf8_lossy(value.as_bytes())))
        .collect();
    Ok(RawReply {
        status: parts.status.as_u16(),
        headers,
        body,
    })
}
