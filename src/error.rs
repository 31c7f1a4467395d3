use http::Method;
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    StackLocked,
    NotRegistered,
    DependencyMissing,
    AlreadyFinished,
    HandlerNotFound,
    InvalidHandler,
    Timeout,
    ConnectionFailed,
    Transport,
    RetriableResponse,
    HttpStatus,
    InvalidUri,
    UnsupportedMethod,
    InvalidProxy,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeForm,
    Deserialize,
    RequestBuild,
    ReadBody,
    StubNotFound,
    Handler,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StackLocked => "stack_locked",
            Self::NotRegistered => "not_registered",
            Self::DependencyMissing => "dependency_missing",
            Self::AlreadyFinished => "already_finished",
            Self::HandlerNotFound => "handler_not_found",
            Self::InvalidHandler => "invalid_handler",
            Self::Timeout => "timeout",
            Self::ConnectionFailed => "connection_failed",
            Self::Transport => "transport",
            Self::RetriableResponse => "retriable_response",
            Self::HttpStatus => "http_status",
            Self::InvalidUri => "invalid_uri",
            Self::UnsupportedMethod => "unsupported_method",
            Self::InvalidProxy => "invalid_proxy",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeForm => "serialize_form",
            Self::Deserialize => "deserialize",
            Self::RequestBuild => "request_build",
            Self::ReadBody => "read_body",
            Self::StubNotFound => "stub_not_found",
            Self::Handler => "handler",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("handler stack is locked and can no longer be modified")]
    StackLocked,
    #[error("no handler registered for key {key:?} in the {registry} registry")]
    NotRegistered { registry: &'static str, key: String },
    #[error("missing dependency for handler {handler}: {message}")]
    DependencyMissing { handler: String, message: String },
    #[error("response already finished")]
    AlreadyFinished,
    #[error("no such handler: {target}")]
    HandlerNotFound { target: String },
    #[error("invalid handler {handler}: {message}")]
    InvalidHandler { handler: String, message: String },
    #[error("request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("connection failed for {method} {uri}: {source}")]
    ConnectionFailed {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http transport error for {method} {uri}: {source}")]
    Transport {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http status error {status} for {method} {uri}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("unsupported request method: {method}")]
    UnsupportedMethod { method: Method },
    #[error("invalid proxy uri: {uri}")]
    InvalidProxy { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to read body: {source}")]
    ReadBody {
        #[source]
        source: std::io::Error,
    },
    #[error("no stubbed response for {method} {path}")]
    StubNotFound { method: Method, path: String },
    #[error("handler {handler} failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::StackLocked => ErrorCode::StackLocked,
            Self::NotRegistered { .. } => ErrorCode::NotRegistered,
            Self::DependencyMissing { .. } => ErrorCode::DependencyMissing,
            Self::AlreadyFinished => ErrorCode::AlreadyFinished,
            Self::HandlerNotFound { .. } => ErrorCode::HandlerNotFound,
            Self::InvalidHandler { .. } => ErrorCode::InvalidHandler,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::UnsupportedMethod { .. } => ErrorCode::UnsupportedMethod,
            Self::InvalidProxy { .. } => ErrorCode::InvalidProxy,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::StubNotFound { .. } => ErrorCode::StubNotFound,
            Self::Handler { .. } => ErrorCode::Handler,
        }
    }

    /// Wraps an arbitrary failure raised by a custom middleware.
    pub fn handler(
        handler: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Handler {
            handler: handler.into(),
            source: source.into(),
        }
    }
}
