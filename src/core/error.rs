use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request: bad comparator, missing value, forbidden full scan.
    Client,
    Forbidden,
    NotFound,
    /// A tracked-record write rejected a wrongly typed value.
    Validation,
    /// Optimistic validation failed at commit time.
    Conflict,
    /// Transient server state, e.g. an index that is still being built.
    Unavailable,
    Io,
    Parse,
    InvalidState,
    Internal,
}

impl ErrorKind {
    /// HTTP-equivalent status code for the transport layer.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::Client | ErrorKind::Validation | ErrorKind::Parse => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Unavailable => 503,
            ErrorKind::Io | ErrorKind::InvalidState | ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn client(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Client, context.into())
    }

    pub fn forbidden(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Forbidden, context.into())
    }

    pub fn not_found(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, context.into())
    }

    pub fn unavailable(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Unavailable, context.into())
    }

    pub fn conflict(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Conflict, context.into())
    }

    pub fn invalid_state(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidState, context.into())
    }

    pub fn internal(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, context.into())
    }

    /// Names the attribute and the offending value.
    pub fn validation(attribute: &str, value: impl fmt::Debug, expected: &str) -> Self {
        Error::new(
            ErrorKind::Validation,
            format!("Value {:?} in property {} must be {}", value, attribute, expected),
        )
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
