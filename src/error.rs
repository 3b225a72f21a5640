use std::fmt;

/// Error type shared by every module in this crate.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Regex(regex::Error),
    Glob(glob::PatternError),
    Database(postgres::Error),
    Config(String),
    MaxFailedReconnections,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Regex(err) => write!(f, "regex error: {err}"),
            Error::Glob(err) => write!(f, "glob pattern error: {err}"),
            Error::Database(err) => write!(f, "database error: {err}"),
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::MaxFailedReconnections => {
                write!(f, "giving up after max-failed-reconnections")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Regex(err) => Some(err),
            Error::Glob(err) => Some(err),
            Error::Database(err) => Some(err),
            Error::Config(_) | Error::MaxFailedReconnections => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<regex::Error> for Error {
    fn from(value: regex::Error) -> Self {
        Error::Regex(value)
    }
}

impl From<glob::PatternError> for Error {
    fn from(value: glob::PatternError) -> Self {
        Error::Glob(value)
    }
}

impl From<postgres::Error> for Error {
    fn from(value: postgres::Error) -> Self {
        Error::Database(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
