//! Request types of [`UrlFetcher`](crate::fetcher::UrlFetcher)

use std::fmt;

use bytes::Bytes;
use url::{Position, Url};

use crate::error::{invalid_argument, missing_host, unsupported_scheme, Result};

/// The only scheme the fetcher speaks.
pub(crate) const HTTP_SCHEME: &str = "http";

/// HTTP verb of a [`Request`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Verb {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl From<Verb> for http::Method {
    fn from(verb: Verb) -> Self {
        match verb {
            Verb::Get => http::Method::GET,
            Verb::Post => http::Method::POST,
            Verb::Put => http::Method::PUT,
            Verb::Delete => http::Method::DELETE,
        }
    }
}

impl Verb {
    /// The verb of `method`, if it is one of the four supported.
    pub fn from_method(method: &http::Method) -> Option<Self> {
        match *method {
            http::Method::GET => Some(Self::Get),
            http::Method::POST => Some(Self::Post),
            http::Method::PUT => Some(Self::Put),
            http::Method::DELETE => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

/// An ordered list of header fields.
///
/// Names are kept exactly as inserted and compared case-sensitively. Repeated names are kept,
/// since a server may legitimately send the same header several times.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header field.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// The value of the first field named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K, V> Extend<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.0
            .extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}

/// A request to be fetched.
#[derive(Clone, Debug)]
pub struct Request {
    pub verb: Verb,
    pub url: Url,
    pub headers: Headers,
    /// An empty body is treated like no body at all.
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(verb: Verb, url: Url) -> Self {
        Self {
            verb,
            url,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Parse `url` and create a request for it.
    pub fn parse(verb: Verb, url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(invalid_argument)?;
        Ok(Self::new(verb, url))
    }

    pub fn get(url: Url) -> Self {
        Self::new(Verb::Get, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Verb::Post, url)
    }

    pub fn put(url: Url) -> Self {
        Self::new(Verb::Put, url)
    }

    pub fn delete(url: Url) -> Self {
        Self::new(Verb::Delete, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Path and query, as written on the request line.
    pub fn path_and_query(&self) -> &str {
        &self.url[Position::BeforePath..Position::AfterQuery]
    }
}

/// Rewrite `req` into the form sent on the wire.
///
/// Only `http` urls with a host are accepted. An empty path becomes `/` and a missing `Host`
/// header is filled from the url.
pub(crate) fn normalize(mut req: Request) -> Result<Request> {
    if req.url.scheme() != HTTP_SCHEME {
        return Err(unsupported_scheme(req.url.scheme()));
    }
    let Some(host) = req.url.host_str().map(ToOwned::to_owned) else {
        return Err(missing_host());
    };
    if req.url.path().is_empty() {
        req.url.set_path("/");
    }
    if !req.headers.contains("Host") {
        req.headers.insert("Host", host);
    }
    Ok(req)
}
