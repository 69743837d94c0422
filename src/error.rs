use std::sync::Arc;

use http::Method;
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub(crate) type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl TransportErrorKind {
    /// Whether the host could not be reached at all.
    pub const fn is_unreachable(self) -> bool {
        matches!(self, Self::Dns | Self::Connect)
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    SerializeJson,
    SerializeQuery,
    RequestBuild,
    InvalidHeaderName,
    InvalidHeaderValue,
    InvalidBackoffPolicy,
    ServerUnavailable,
    Transport,
    Timeout,
    Aborted,
    ReadBody,
    Deserialize,
    UnexpectedStatus,
    Interceptor,
    UnsupportedServer,
    AuthInvalid,
    AuthExpired,
    Forbidden,
    NotFound,
    VersionIncompatible,
    ResourceConflict,
    ServerResponse,
    StreamRetriesExhausted,
    PollExhausted,
    LoginInterrupted,
    FrameTooLarge,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::RequestBuild => "request_build",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::InvalidBackoffPolicy => "invalid_backoff_policy",
            Self::ServerUnavailable => "server_unavailable",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
            Self::ReadBody => "read_body",
            Self::Deserialize => "deserialize",
            Self::UnexpectedStatus => "unexpected_status",
            Self::Interceptor => "interceptor",
            Self::UnsupportedServer => "unsupported_server",
            Self::AuthInvalid => "auth_invalid",
            Self::AuthExpired => "auth_expired",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::VersionIncompatible => "version_incompatible",
            Self::ResourceConflict => "resource_conflict",
            Self::ServerResponse => "server_response",
            Self::StreamRetriesExhausted => "stream_retries_exhausted",
            Self::PollExhausted => "poll_exhausted",
            Self::LoginInterrupted => "login_interrupted",
            Self::FrameTooLarge => "frame_too_large",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Every failure surfaced by the client.
///
/// The server-response variants (`AuthInvalid` through `ServerResponse`) are
/// the typed taxonomy callers match on; the rest describe failures that
/// happen before a response is available or while reading it.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: Arc<serde_urlencoded::ser::Error>,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: Arc<http::Error>,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderName>,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderValue>,
    },
    #[error("invalid backoff policy: {reason}")]
    InvalidBackoffPolicy { reason: String },
    #[error("{hint} ({method} {uri}: {source})")]
    ServerUnavailable {
        hint: String,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http request was aborted for {method} {uri}")]
    Aborted { method: Method, uri: String },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: SharedError,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: Arc<serde_json::Error>,
        body: String,
    },
    #[error("unexpected http status {status} for {method} {uri}")]
    UnexpectedStatus {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("request rejected by interceptor: {message}")]
    Interceptor { message: String },
    #[error("server type {server_type:?} is not supported")]
    UnsupportedServer { server_type: Option<String> },
    #[error("{message}")]
    AuthInvalid { message: String },
    #[error("{message}")]
    AuthExpired { message: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("{message}")]
    VersionIncompatible { message: String },
    #[error("resource conflict: {message}")]
    ResourceConflict { message: String },
    #[error("server error response {status}: {message}")]
    ServerResponse {
        status: u16,
        message: String,
        body: String,
    },
    #[error("stream {endpoint} did not complete after {attempts} attempts")]
    StreamRetriesExhausted { endpoint: String, attempts: usize },
    #[error("did not get a truthy response after {attempts} attempts for {endpoint}")]
    PollExhausted { endpoint: String, attempts: usize },
    #[error("login task did not complete: {source}")]
    LoginInterrupted {
        #[source]
        source: Arc<tokio::task::JoinError>,
    },
    #[error("frame payload of {len} bytes exceeds the u32 length field")]
    FrameTooLarge { len: usize },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::InvalidBackoffPolicy { .. } => ErrorCode::InvalidBackoffPolicy,
            Self::ServerUnavailable { .. } => ErrorCode::ServerUnavailable,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Aborted { .. } => ErrorCode::Aborted,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::UnexpectedStatus { .. } => ErrorCode::UnexpectedStatus,
            Self::Interceptor { .. } => ErrorCode::Interceptor,
            Self::UnsupportedServer { .. } => ErrorCode::UnsupportedServer,
            Self::AuthInvalid { .. } => ErrorCode::AuthInvalid,
            Self::AuthExpired { .. } => ErrorCode::AuthExpired,
            Self::Forbidden { .. } => ErrorCode::Forbidden,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::VersionIncompatible { .. } => ErrorCode::VersionIncompatible,
            Self::ResourceConflict { .. } => ErrorCode::ResourceConflict,
            Self::ServerResponse { .. } => ErrorCode::ServerResponse,
            Self::StreamRetriesExhausted { .. } => ErrorCode::StreamRetriesExhausted,
            Self::PollExhausted { .. } => ErrorCode::PollExhausted,
            Self::LoginInterrupted { .. } => ErrorCode::LoginInterrupted,
            Self::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
        }
    }

    /// HTTP status carried by a typed server-response error.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::AuthInvalid { .. } | Self::AuthExpired { .. } => Some(401),
            Self::Forbidden { .. } => Some(403),
            Self::NotFound { .. } => Some(404),
            Self::VersionIncompatible { .. } => Some(400),
            Self::ResourceConflict { .. } => Some(409),
            Self::ServerResponse { status, .. } | Self::UnexpectedStatus { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Message the server put in its error body, for typed server-response errors.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::AuthInvalid { message }
            | Self::AuthExpired { message }
            | Self::Forbidden { message }
            | Self::NotFound { message }
            | Self::VersionIncompatible { message }
            | Self::ResourceConflict { message }
            | Self::ServerResponse { message, .. } => Some(message),
            _ => None,
        }
    }

    pub const fn is_server_response(&self) -> bool {
        matches!(
            self,
            Self::AuthInvalid { .. }
                | Self::AuthExpired { .. }
                | Self::Forbidden { .. }
                | Self::NotFound { .. }
                | Self::VersionIncompatible { .. }
                | Self::ResourceConflict { .. }
                | Self::ServerResponse { .. }
        )
    }

    pub fn interceptor(message: impl Into<String>) -> Self {
        Self::Interceptor {
            message: message.into(),
        }
    }
}
