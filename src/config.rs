use std::time::Duration;

use crate::frame::FrameKind;

const DEFAULT_STREAM_MAX_ATTEMPTS: usize = 10;
const DEFAULT_STREAM_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_POLL_MAX_ATTEMPTS: usize = 120;

/// Header names and server contract values exchanged with the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub client_header: String,
    pub version_header: String,
    pub server_type_header: String,
    pub max_client_version_header: String,
    pub accepted_server_types: Vec<String>,
    pub login_endpoint: String,
    pub version_too_low_error: String,
    pub version_too_high_error: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            client_header: "x-client-name".to_owned(),
            version_header: "x-version".to_owned(),
            server_type_header: "x-server-type".to_owned(),
            max_client_version_header: "x-max-client-version".to_owned(),
            accepted_server_types: vec!["facility".to_owned(), "central".to_owned()],
            login_endpoint: "login".to_owned(),
            version_too_low_error: "Client version too low".to_owned(),
            version_too_high_error: "Client version too high".to_owned(),
        }
    }
}

impl ProtocolConfig {
    pub fn with_client_header(mut self, name: impl Into<String>) -> Self {
        self.client_header = name.into();
        self
    }

    pub fn with_version_header(mut self, name: impl Into<String>) -> Self {
        self.version_header = name.into();
        self
    }

    pub fn with_server_type_header(mut self, name: impl Into<String>) -> Self {
        self.server_type_header = name.into();
        self
    }

    pub fn with_accepted_server_types<I, S>(mut self, server_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_server_types = server_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version_errors(
        mut self,
        too_low: impl Into<String>,
        too_high: impl Into<String>,
    ) -> Self {
        self.version_too_low_error = too_low.into();
        self.version_too_high_error = too_high.into();
        self
    }

    pub(crate) fn accepts_server_type(&self, server_type: &str) -> bool {
        self.accepted_server_types
            .iter()
            .any(|accepted| accepted == server_type)
    }
}

/// Restart and decoding settings for [`crate::MessageStream`].
///
/// Built through the setters so `max_attempts` never drops below one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    pub(crate) max_attempts: usize,
    pub(crate) retry_interval: Duration,
    pub(crate) end_kind: FrameKind,
    pub(crate) decode_json: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_STREAM_MAX_ATTEMPTS,
            retry_interval: DEFAULT_STREAM_RETRY_INTERVAL,
            end_kind: FrameKind::END,
            decode_json: true,
        }
    }
}

impl StreamOptions {
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn end_kind(mut self, end_kind: FrameKind) -> Self {
        self.end_kind = end_kind;
        self
    }

    pub fn decode_json(mut self, decode_json: bool) -> Self {
        self.decode_json = decode_json;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: usize,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}
