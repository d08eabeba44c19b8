use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Malformed literal value or URI pattern
    Parse,
    /// A URI was required but no positional argument was given
    MissingUri,
    /// The first positional argument was present but not a string
    UriType,
    /// Connecting to or joining the router failed; calling `open` again may succeed
    Connect,
    /// The transport was lost; never retried automatically
    FatalTransport,
    /// The router reported an error for a call, publish or subscription
    Application,
    /// Error related to invalid state or configuration within wampli
    Validation,
    /// Error related to WebSocket connections
    WebSocket,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Finds a source of type `E`, looking through errors shared as [`Arc<Error>`].
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        if let Some(found) = e.downcast_ref::<E>() {
            return Some(found);
        }

        e.downcast_ref::<Arc<Error>>()
            .and_then(|shared| shared.downcast_ref::<E>())
    }

    /// Re-raise an error that several waiters observed, keeping its kind.
    #[must_use]
    pub fn shared(err: Arc<Error>) -> Self {
        let kind = err.kind();
        Self::with_source(kind, err)
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn parse<I: Into<String>, R: Into<String>>(input: I, reason: R) -> Self {
        Parse {
            input: input.into(),
            reason: reason.into(),
        }
        .into()
    }

    pub fn connect<S: Into<String>>(reason: S) -> Self {
        ConnectFailed {
            reason: reason.into(),
        }
        .into()
    }

    pub fn transport_lost<S: Into<String>>(reason: S) -> Self {
        TransportLost {
            reason: reason.into(),
        }
        .into()
    }

    pub fn application<S: Into<String>>(error: S, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Application {
            error: error.into(),
            args,
            kwargs,
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Parse {
    pub input: String,
    pub reason: String,
}

impl fmt::Display for Parse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to parse {:?}: {}", self.input, self.reason)
    }
}

impl StdError for Parse {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct MissingUri;

impl fmt::Display for MissingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Please provide a URI")
    }
}

impl StdError for MissingUri {}

#[non_exhaustive]
#[derive(Debug)]
pub struct UriType {
    /// Rendering of the value found where the URI was expected
    pub found: String,
}

impl fmt::Display for UriType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "URI must be a string, got {}", self.found)
    }
}

impl StdError for UriType {}

#[non_exhaustive]
#[derive(Debug)]
pub struct ConnectFailed {
    pub reason: String,
}

impl fmt::Display for ConnectFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect: {}", self.reason)
    }
}

impl StdError for ConnectFailed {}

/// The transport of an established session went away.
#[non_exhaustive]
#[derive(Debug)]
pub struct TransportLost {
    pub reason: String,
}

impl fmt::Display for TransportLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport lost: {}", self.reason)
    }
}

impl StdError for TransportLost {}

/// Error reply from the router.
#[non_exhaustive]
#[derive(Debug)]
pub struct Application {
    /// Error URI, e.g. `wamp.error.no_such_procedure`
    pub error: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(Value::String(message)) = self.args.first() {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl StdError for Application {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Parse> for Error {
    fn from(err: Parse) -> Self {
        Error::with_source(Kind::Parse, err)
    }
}

impl From<MissingUri> for Error {
    fn from(err: MissingUri) -> Self {
        Error::with_source(Kind::MissingUri, err)
    }
}

impl From<UriType> for Error {
    fn from(err: UriType) -> Self {
        Error::with_source(Kind::UriType, err)
    }
}

impl From<ConnectFailed> for Error {
    fn from(err: ConnectFailed) -> Self {
        Error::with_source(Kind::Connect, err)
    }
}

impl From<TransportLost> for Error {
    fn from(err: TransportLost) -> Self {
        Error::with_source(Kind::FatalTransport, err)
    }
}

impl From<Application> for Error {
    fn from(err: Application) -> Self {
        Error::with_source(Kind::Application, err)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}
