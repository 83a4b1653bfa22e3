//! HTTP/1 settings of the hyper transport.

use hyper::client::conn::http1::Builder;

/// Settings applied to every HTTP/1 connection created by a
/// [`HyperConnector`](super::HyperConnector).
#[derive(Clone, Debug)]
pub struct Config {
    title_case_headers: bool,
    ignore_invalid_headers_in_responses: bool,
    max_headers: Option<usize>,
    nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title_case_headers: true,
            ignore_invalid_headers_in_responses: false,
            max_headers: None,
            nodelay: true,
        }
    }
}

impl Config {
    /// Write header names as title case on the wire, e.g. `Content-Length`.
    ///
    /// Some log frontends compare header names case-sensitively, so this defaults to `true`.
    pub fn title_case_headers(mut self, enable: bool) -> Self {
        self.title_case_headers = enable;
        self
    }

    /// Silently drop malformed header lines of responses instead of failing the exchange.
    ///
    /// Default is `false`.
    pub fn ignore_invalid_headers_in_responses(mut self, enable: bool) -> Self {
        self.ignore_invalid_headers_in_responses = enable;
        self
    }

    /// Maximum number of headers accepted in a response.
    ///
    /// Setting this moves the header buffer to the heap for every response. Hyper accepts 100
    /// headers when unset.
    pub fn max_headers(mut self, max_headers: usize) -> Self {
        self.max_headers = Some(max_headers);
        self
    }

    /// Set `TCP_NODELAY` on new sockets. Default is `true`.
    pub fn nodelay(mut self, enable: bool) -> Self {
        self.nodelay = enable;
        self
    }

    pub(crate) fn is_nodelay(&self) -> bool {
        self.nodelay
    }

    pub(crate) fn client(&self) -> Builder {
        let mut builder = Builder::new();
        builder
            .title_case_headers(self.title_case_headers)
            .ignore_invalid_headers_in_responses(self.ignore_invalid_headers_in_responses);
        if let Some(max_headers) = self.max_headers {
            builder.max_headers(max_headers);
        }
        builder
    }
}
