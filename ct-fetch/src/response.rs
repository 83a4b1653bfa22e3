use std::fmt;

use bytes::Bytes;

use crate::request::Headers;

/// The response of a fetch.
///
/// Header names are kept as the transport reported them; the hyper transport lowercases them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "status_code: {}", self.status_code)?;
        writeln!(f, "headers {{")?;
        for (name, value) in self.headers.iter() {
            writeln!(f, "  {name}: {value}")?;
        }
        writeln!(f, "}}")?;
        writeln!(f, "body: <<EOF")?;
        write!(f, "{}", String::from_utf8_lossy(&self.body))?;
        writeln!(f, "EOF")
    }
}
