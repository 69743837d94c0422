use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use rand::RngExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::SyncwireResult;
use crate::retry::BackoffPolicy;
use crate::util::{encode_query, parse_header_name, parse_header_value};

/// Which bearer token a call carries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthToken {
    /// Whatever the session holds when the request is built.
    #[default]
    Session,
    /// Send no authorization header.
    Disabled,
    Explicit(String),
}

#[derive(Clone, Debug, Default)]
pub enum RequestPayload {
    #[default]
    None,
    Json(Value),
    Raw(Bytes),
    Multipart(MultipartForm),
}

impl RequestPayload {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Per-call overrides layered over the client defaults.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub(crate) method: Method,
    pub(crate) query_pairs: Vec<(String, String)>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: RequestPayload,
    pub(crate) auth: AuthToken,
    pub(crate) wait_for_auth: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) backoff: Option<BackoffPolicy>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestPayload::None,
            auth: AuthToken::Session,
            wait_for_auth: true,
            timeout: None,
            cancel: None,
            backoff: None,
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query_pairs
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query<Q>(mut self, params: &Q) -> SyncwireResult<Self>
    where
        Q: Serialize + ?Sized,
    {
        let encoded = encode_query(params)?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> SyncwireResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestPayload::Json(body);
        self
    }

    pub fn json_from<T>(self, body: &T) -> SyncwireResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(body).map_err(|source| crate::Error::Serialize {
            source: source.into(),
        })?;
        Ok(self.json(value))
    }

    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestPayload::Raw(body.into());
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = RequestPayload::Multipart(form);
        self
    }

    pub fn auth(mut self, auth: AuthToken) -> Self {
        self.auth = auth;
        self
    }

    pub fn bearer(self, token: impl Into<String>) -> Self {
        self.auth(AuthToken::Explicit(token.into()))
    }

    pub fn without_auth(self) -> Self {
        self.auth(AuthToken::Disabled)
    }

    pub fn wait_for_auth(mut self, wait_for_auth: bool) -> Self {
        self.wait_for_auth = wait_for_auth;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Caller-owned cancellation. Disables the client's own timer for this call.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }
}

/// The outgoing request as request interceptors see it.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    pub(crate) fn into_http(self) -> SyncwireResult<http::Request<Bytes>> {
        let mut builder = http::Request::builder()
            .method(self.method)
            .uri(self.url.as_str());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers);
        }
        builder
            .body(self.body.unwrap_or_default())
            .map_err(|source| crate::Error::RequestBuild {
                source: source.into(),
            })
    }
}

#[derive(Clone, Debug)]
struct MultipartPart {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

/// A `multipart/form-data` body. Its boundary is generated per form and
/// carried in [`MultipartForm::content_type`].
#[derive(Clone, Debug)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<MultipartPart>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let boundary = format!(
            "----syncwire-{:016x}{:016x}",
            rng.random::<u64>(),
            rng.random::<u64>()
        );
        Self {
            boundary,
            parts: Vec::new(),
        }
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(MultipartPart {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(MultipartPart {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            data: data.into(),
        });
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        for part in &self.parts {
            buffer.put_slice(format!("--{}\r\n", self.boundary).as_bytes());
            let disposition = match &part.filename {
                Some(filename) => format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    escape_quoted(&part.name),
                    escape_quoted(filename)
                ),
                None => format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n",
                    escape_quoted(&part.name)
                ),
            };
            buffer.put_slice(disposition.as_bytes());
            if let Some(content_type) = &part.content_type {
                buffer.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
            }
            buffer.put_slice(b"\r\n");
            buffer.put_slice(&part.data);
            buffer.put_slice(b"\r\n");
        }
        buffer.put_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        buffer.freeze()
    }
}

fn escape_quoted(value: &str) -> String {
    value.replace('"', "%22").replace(['\r', '\n'], " ")
}

/// Encodes the payload and fixes up `content-type` to match it.
///
/// JSON bodies are only serialized while `application/json` is the active
/// content type; a caller who forced another type gets the JSON text sent
/// as-is under that type. Multipart forms always replace any forced type with
/// their own boundary-carrying one.
pub(crate) fn encode_payload(
    payload: RequestPayload,
    headers: &mut HeaderMap,
) -> SyncwireResult<Option<Bytes>> {
    match payload {
        RequestPayload::None => Ok(None),
        RequestPayload::Raw(bytes) => Ok(Some(bytes)),
        RequestPayload::Json(value) => {
            let is_json = headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_none_or(|value| value.to_ascii_lowercase().starts_with("application/json"));
            if !is_json && let Value::String(text) = value {
                return Ok(Some(Bytes::from(text)));
            }
            let encoded = serde_json::to_vec(&value).map_err(|source| crate::Error::Serialize {
                source: source.into(),
            })?;
            Ok(Some(Bytes::from(encoded)))
        }
        RequestPayload::Multipart(form) => {
            headers.remove(CONTENT_TYPE);
            let content_type = form.content_type();
            headers.insert(
                CONTENT_TYPE,
                parse_header_value(CONTENT_TYPE.as_str(), &content_type)?,
            );
            Ok(Some(form.encode()))
        }
    }
}
