//! Asynchronous outbound HTTP for certificate transparency services.
//!
//! Work is driven by an [`EventLoop`] which is usually pumped by an [`EventPumpThread`]. A
//! [`UrlFetcher`] issues requests from any thread and reports their outcome through a [`Task`].
//!
//! ```no_run
//! use ct_fetch::{EventLoop, EventPumpThread, Request, UrlFetcher, Verb};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let _pump = EventPumpThread::new(event_loop.clone()).unwrap();
//! let fetcher = UrlFetcher::new(&event_loop);
//!
//! let req = Request::parse(Verb::Get, "http://ct.example.com/ct/v1/get-sth").unwrap();
//! let resp = fetcher.fetch_blocking(req).unwrap();
//! println!("{resp}");
//! ```

pub mod error;
pub mod event_loop;
pub mod fetcher;
pub mod pool;
pub mod request;
pub mod response;
pub mod task;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

#[doc(inline)]
pub use self::{
    error::{Error, ErrorKind, Result, Status},
    event_loop::{Dispatch, EventLoop, EventPumpThread, HttpServer},
    fetcher::{ResponseSlot, UrlFetcher},
    pool::ConnectionPool,
    request::{Headers, Request, Verb},
    response::Response,
    task::{Task, TaskHold},
};
