//! Generic error types for fetching

use std::{error::Error as StdError, fmt, sync::Arc};

use paste::paste;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// [`Result`](std::result::Result) with [`Error`] as its error by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outcome carried by a resolved [`Task`](crate::task::Task).
pub type Status = Result<()>;

/// Generic fetch error.
///
/// The error is cheap to clone since a resolved [`Task`](crate::task::Task) hands out its status
/// to every observer.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
    /// Create a new [`Error`] using the given [`ErrorKind`] and source error
    pub fn new<E>(kind: ErrorKind, error: Option<E>) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            kind,
            source: error.map(|e| Arc::from(Into::<BoxError>::into(e))),
        }
    }

    /// Get a reference to the [`ErrorKind`]
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref()?.as_ref())
    }
}

/// Error kind of [`Error`]
///
/// The classification is deliberately coarse: a missing reply is [`ErrorKind::Unknown`] whether
/// the peer sent garbage, timed out or reset the stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled by its caller
    Cancelled,
    /// The operation failed for a reason that could not be classified
    Unknown,
    /// The request itself is unusable, nothing was touched
    InvalidArgument,
    /// The system is not in a state required for the operation
    FailedPrecondition,
    /// The transport failed after the request was accepted
    Internal,
    /// Error occurs when building an event loop or a fetcher
    Builder,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::Unknown => f.write_str("unknown error"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::FailedPrecondition => f.write_str("failed precondition"),
            Self::Internal => f.write_str("internal error"),
            Self::Builder => f.write_str("builder error"),
        }
    }
}

/// Create an [`Error`] with [`ErrorKind::Builder`]
pub fn builder_error<E>(error: E) -> Error
where
    E: Into<BoxError>,
{
    Error::new(ErrorKind::Builder, Some(error))
}

/// Create an [`Error`] with [`ErrorKind::InvalidArgument`]
pub fn invalid_argument<E>(error: E) -> Error
where
    E: Into<BoxError>,
{
    Error::new(ErrorKind::InvalidArgument, Some(error))
}

macro_rules! simple_error {
    ($(#[$attr:meta])* $kind:ident => $name:ident => $msg:literal) => {
        paste! {
            #[doc = $kind " error \"" $msg "\""]
            $(#[$attr])*
            #[derive(Debug, PartialEq, Eq)]
            pub struct $name;

            $(#[$attr])*
            impl ::std::fmt::Display for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    f.write_str($msg)
                }
            }

            $(#[$attr])*
            impl ::std::error::Error for $name {}

            $(#[$attr])*
            pub(crate) fn [<$name:snake>]() -> Error {
                Error::new(ErrorKind::$kind, Some($name))
            }
        }
    };
}

simple_error!(Cancelled => TaskCancelled => "task cancelled");
simple_error!(InvalidArgument => MissingHost => "url has no host");
simple_error!(FailedPrecondition => ShuttingDown => "fetcher is shutting down");
simple_error!(FailedPrecondition => ConnectionRefused => "connection refused");
simple_error!(Unknown => NoReply => "no reply received");
simple_error!(Internal => IssueFailed => "could not issue the request");
simple_error!(Internal => BodyNotAttached => "could not set the request body");
simple_error!(FailedPrecondition => OnEventThread => "blocking call on the event dispatch thread");
simple_error!(FailedPrecondition => RequestAbandoned => "event loop went away before the request completed");

/// The scheme of a request is not one this layer can speak.
#[derive(Debug, PartialEq, Eq)]
pub struct UnsupportedScheme(pub String);

impl fmt::Display for UnsupportedScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported protocol: {}", self.0)
    }
}

impl StdError for UnsupportedScheme {}

pub(crate) fn unsupported_scheme(scheme: &str) -> Error {
    invalid_argument(UnsupportedScheme(scheme.to_owned()))
}
