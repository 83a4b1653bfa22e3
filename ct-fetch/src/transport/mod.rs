//! Protocol connections used by the pool and the fetcher.
//!
//! A [`RawConnection`] is one client connection to one (host, port). It carries a single
//! request at a time: [`RawConnection::make_request`] issues it, [`RawConnection::add_body`]
//! attaches the payload and the [`Completion`] reports the reply. Connections are created by a
//! [`Connect`] factory which is owned by the [`EventLoop`](crate::event_loop::EventLoop).

mod connector;
pub mod http1;

use bytes::Bytes;

pub use self::connector::{HyperConnection, HyperConnector};
use crate::{
    error::BoxError,
    event_loop::Dispatch,
    request::{Headers, Verb},
};

/// Continuation fed with the reply of a request.
///
/// `None` means nothing usable came back. A reply with a status below 100 means the connection
/// could not be established at all.
pub type Completion = Box<dyn FnOnce(&Dispatch<'_>, Option<RawReply>) + Send>;

/// Callback fired once when the underlying connection closes.
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// Request line and headers handed to a [`RawConnection`].
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub verb: Verb,
    pub path_and_query: String,
    pub headers: Headers,
}

#[derive(Clone, Debug, Default)]
pub struct RawReply {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl RawReply {
    /// Reply reported when no connection could be established.
    pub fn refused() -> Self {
        Self::default()
    }
}

/// One client connection.
///
/// The completion passed to [`make_request`](RawConnection::make_request) fires at most once,
/// always on the dispatch thread and never before `make_request` returned. It never fires when
/// `make_request` returned an error.
pub trait RawConnection: Send + 'static {
    fn make_request(
        &mut self,
        dispatch: &Dispatch<'_>,
        head: RequestHead,
        on_done: Completion,
    ) -> Result<(), BoxError>;

    /// Attach the body of the request issued last.
    fn add_body(&mut self, body: Bytes) -> Result<(), BoxError>;

    /// Register the close hook. Fires right away on a connection that is already closed.
    fn on_close(&mut self, hook: CloseHook);
}

/// Factory of [`RawConnection`]s.
pub trait Connect: Send + Sync + 'static {
    fn http(&self, dispatch: &Dispatch<'_>, host: &str, port: u16) -> Box<dyn RawConnection>;

    fn https(&self, dispatch: &Dispatch<'_>, host: &str, port: u16) -> Box<dyn RawConnection>;
}
