use thiserror::Error;

/// Failure classes of a single transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Body,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Everything the transport reports is network level, so only
    /// `Other` (request construction) is not worth a second attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self.kind, TransportErrorKind::Other)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_builder() {
            TransportErrorKind::Other
        } else if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() || err.is_request() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Other
        };
        // URLs carry the access token
        TransportError::new(kind, err.without_url().to_string())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),
    #[error("zoom {0} outside supported range 0..=22")]
    InvalidZoom(u8),
    #[error("area needs {count} tiles, more than the limit of {limit}")]
    TooManyTiles { count: u64, limit: u64 },
    #[error("transient fetch error after {attempts} attempt(s): {source}")]
    TransientFetchError {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("remote returned HTTP {status}")]
    RemoteError { status: u16 },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("malformed detection geometry: {0}")]
    MalformedDetectionGeometry(String),
    #[error("missing image data: {0}")]
    MissingImageData(String),
    #[error("run {0} was cancelled")]
    Cancelled(String),
    #[error("invalid session transition: {0}")]
    InvalidTransition(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("render error: {0}")]
    Render(#[from] image::ImageError),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl PipelineError {
    /// Errors that abort a whole run rather than degrading one unit of it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidBoundingBox(_)
                | PipelineError::InvalidZoom(_)
                | PipelineError::TooManyTiles { .. }
                | PipelineError::Cancelled(_)
        )
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}
