use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::SyncwireResult;
use crate::config::ProtocolConfig;
use crate::error::Error;
use crate::transport::ResponseBody;
use crate::util::truncate_body;

const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please log in again.";
const FAILED_AUTHENTICATION_MESSAGE: &str = "Failed authentication";

#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponse {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> SyncwireResult<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source: source.into(),
            body: truncate_body(&self.body),
        })
    }
}

/// A 2xx response whose body has not been read yet.
pub struct HttpResponseStream {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl std::fmt::Debug for HttpResponseStream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpResponseStream")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponseStream {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Next data chunk, or `None` once the body is closed. Trailers are skipped.
    pub async fn next_chunk(&mut self) -> SyncwireResult<Option<Bytes>> {
        loop {
            let Some(frame) = self.body.frame().await else {
                return Ok(None);
            };
            let frame = frame.map_err(|source| Error::ReadBody {
                source: source.into(),
            })?;
            if let Ok(data) = frame.into_data() {
                return Ok(Some(data));
            }
        }
    }

    pub async fn into_buffered(self) -> SyncwireResult<HttpResponse> {
        let body = read_body(self.body).await?;
        Ok(HttpResponse::new(self.status, self.headers, body))
    }
}

/// Status line and headers handed to response interceptors.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: String,
}

pub(crate) async fn read_body(body: ResponseBody) -> SyncwireResult<Bytes> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|source| Error::ReadBody {
            source: source.into(),
        })
}

/// Pulls the server's message out of an error body without ever failing.
///
/// Accepts `{"error": {"message": ..}}` and a top-level `{"message": ..}`.
fn error_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let nested = value
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str);
    let top_level = value.get("message").and_then(Value::as_str);
    nested.or(top_level).map(str::to_owned)
}

fn version_incompatible_message(
    message: &str,
    headers: &HeaderMap,
    protocol: &ProtocolConfig,
) -> Option<String> {
    if message == protocol.version_too_low_error {
        return Some(
            "This client is out of date. Reload to get the new version, or contact your system \
             administrator if that does not work."
                .to_owned(),
        );
    }
    if message == protocol.version_too_high_error {
        let max_version = headers
            .get(protocol.max_client_version_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(|version| version.split('.').take(2).collect::<Vec<_>>().join("."));
        return Some(match max_version {
            Some(version) => format!(
                "The server only supports clients up to v{version} and needs to be upgraded. \
                 Please contact your system administrator."
            ),
            None => "The server does not support this client version and needs to be upgraded. \
                     Please contact your system administrator."
                .to_owned(),
        });
    }
    None
}

/// Maps a non-2xx response onto the typed error taxonomy.
pub(crate) fn status_error(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    is_login: bool,
    protocol: &ProtocolConfig,
) -> Error {
    let server_message = error_message(body);
    let message = server_message
        .clone()
        .unwrap_or_else(|| status.as_u16().to_string());

    let incompatible = match status {
        StatusCode::BAD_REQUEST => server_message
            .as_deref()
            .and_then(|text| version_incompatible_message(text, headers, protocol)),
        _ => None,
    };
    if let Some(message) = incompatible {
        return Error::VersionIncompatible { message };
    }

    match status.as_u16() {
        401 if is_login => Error::AuthInvalid {
            message: server_message.unwrap_or_else(|| FAILED_AUTHENTICATION_MESSAGE.to_owned()),
        },
        403 if server_message.is_some() => Error::Forbidden { message },
        404 => Error::NotFound { message },
        401 => Error::AuthExpired {
            message: SESSION_EXPIRED_MESSAGE.to_owned(),
        },
        409 => Error::ResourceConflict { message },
        status => Error::ServerResponse {
            status,
            message,
            body: truncate_body(body),
        },
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, HeaderValue, StatusCode};

    use super::{error_message, status_error};
    use crate::config::ProtocolConfig;
    use crate::error::Error;

    fn map(status: u16, body: &str, is_login: bool) -> Error {
        status_error(
            StatusCode::from_u16(status).expect("valid status"),
            &HeaderMap::new(),
            body.as_bytes(),
            is_login,
            &ProtocolConfig::default(),
        )
    }

    #[test]
    fn reads_nested_or_top_level_message() {
        assert_eq!(
            error_message(br#"{"error":{"message":"nested"}}"#).as_deref(),
            Some("nested")
        );
        assert_eq!(error_message(br#"{"message":"flat"}"#).as_deref(), Some("flat"));
        assert_eq!(error_message(b"<html>oops</html>"), None);
    }

    #[test]
    fn maps_statuses_to_typed_errors() {
        assert!(matches!(
            map(403, r#"{"error":{"message":"nope"}}"#, false),
            Error::Forbidden { message } if message == "nope"
        ));
        assert!(matches!(map(404, "", false), Error::NotFound { message } if message == "404"));
        assert!(matches!(
            map(409, r#"{"error":{"message":"taken"}}"#, false),
            Error::ResourceConflict { .. }
        ));
        assert!(matches!(
            map(401, "{}", false),
            Error::AuthExpired { message } if message.contains("session has expired")
        ));
        assert!(matches!(
            map(401, r#"{"message":"bad password"}"#, true),
            Error::AuthInvalid { message } if message == "bad password"
        ));
        assert!(matches!(
            map(401, "", true),
            Error::AuthInvalid { message } if message == "Failed authentication"
        ));
    }

    #[test]
    fn forbidden_without_body_is_generic() {
        assert!(matches!(
            map(403, "", false),
            Error::ServerResponse { status: 403, .. }
        ));
    }

    #[test]
    fn recognized_version_errors_map_to_incompatible() {
        let mut headers = HeaderMap::new();
        headers.insert("x-max-client-version", HeaderValue::from_static("2.14.3"));
        let error = status_error(
            StatusCode::BAD_REQUEST,
            &headers,
            br#"{"error":{"message":"Client version too high"}}"#,
            false,
            &ProtocolConfig::default(),
        );
        match error {
            Error::VersionIncompatible { message } => assert!(message.contains("v2.14 ")),
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            map(400, r#"{"error":{"message":"Client version too low"}}"#, false),
            Error::VersionIncompatible { .. }
        ));
        assert!(matches!(
            map(400, r#"{"error":{"message":"missing field"}}"#, false),
            Error::ServerResponse { status: 400, message, .. } if message == "missing field"
        ));
    }
}
