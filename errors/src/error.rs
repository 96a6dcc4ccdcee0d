use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Decode,
    Queue,
    Analyzer,
    Download,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Decode => write!(f, "decode"),
            ErrorKind::Queue => write!(f, "queue"),
            ErrorKind::Analyzer => write!(f, "analyzer"),
            ErrorKind::Download => write!(f, "download"),
            ErrorKind::Io => write!(f, "io"),
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub source: Option<BoxError>,
    pub message: Option<String>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: None,
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: String, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: Some(message),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Config)
    }

    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Decode)
    }

    pub fn is_queue(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Queue)
    }

    pub fn is_analyzer(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Analyzer)
    }

    pub fn is_download(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Download)
    }

    pub fn is_timeout(&self) -> bool {
        if let Some(source) = &self.inner.source {
            source.to_string().to_lowercase().contains("timeout")
        } else {
            false
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("totem_dynamic::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::new(ErrorKind::Config, Some(err))
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        Error::new(ErrorKind::Queue, Some(err))
    }
}

impl From<AnalyzerError> for Error {
    fn from(err: AnalyzerError) -> Self {
        Error::new(ErrorKind::Analyzer, Some(err))
    }
}

impl From<DownloadError> for Error {
    fn from(err: DownloadError) -> Self {
        Error::new(ErrorKind::Download, Some(err))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    ReadFailed(#[source] BoxError),
    #[error("could not parse config: {0}")]
    ParseFailed(#[source] BoxError),
    #[error("queue suffix is missing")]
    MissingSuffix,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("push to queue failed: {0}")]
    PushFailed(#[source] BoxError),
    #[error("ack signal lost: {0}")]
    AckFailed(#[source] BoxError),
    #[error("queue operation failed: {0}")]
    OperationFailed(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("returned non-200 status code: {0}")]
    InvalidStatus(u16),
    #[error("{0}")]
    Reported(String),
    #[error("returned an empty task id")]
    EmptyTaskId,
    #[error("request failed: {0}")]
    Transport(#[source] BoxError),
    #[error("invalid reply: {0}")]
    InvalidReply(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed: {0}")]
    DownloadFailed(#[source] BoxError),
    #[error("returned non-200 status code: {0}")]
    InvalidStatus(u16),
    #[error("file write error: {0}")]
    FileWriteError(#[source] BoxError),
}

impl Error {
    pub fn analyzer_reported(message: impl Into<String>) -> Self {
        Error::from(AnalyzerError::Reported(message.into()))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, Some(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Decode, Some(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::new(ErrorKind::Download, Some(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::from(AnalyzerError::Reported("busy".to_string()));
        assert_eq!(err.to_string(), "analyzer error: busy");
        assert!(err.is_analyzer());
    }

    #[test]
    fn test_error_with_message() {
        let err = Error::with_message(
            ErrorKind::Download,
            "fetching sample".to_string(),
            Some(DownloadError::InvalidStatus(404)),
        );
        assert!(err.to_string().contains("fetching sample"));
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_error_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out");
        let err = Error::from(io_err);
        assert!(err.source().is_some());
        assert!(err.is_timeout());
    }

    #[test]
    fn test_json_error_maps_to_decode() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(json_err);
        assert!(err.is_decode());
    }
}
