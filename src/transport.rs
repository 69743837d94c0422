//! The raw HTTP call and the timeout/abort guard around it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{Method, Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::SyncwireResult;
use crate::error::{BoxError, Error, TransportErrorKind};
use crate::util::classify_transport_error;

pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

const SERVER_UNAVAILABLE_HINT: &str =
    "The server is unavailable. Please check the connection or contact your system administrator.";

#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} error: {}", self.kind, self.source)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// The `fetch`-like collaborator: sends one request, resolves once response
/// headers arrive. Non-2xx statuses are responses, not errors.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: Request<Bytes>,
    ) -> BoxFuture<'_, Result<Response<ResponseBody>, TransportError>>;
}

type HyperClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn new(connect_timeout: Duration) -> SyncwireResult<Self> {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|source| Error::Transport {
                kind: TransportErrorKind::Tls,
                method: Method::GET,
                uri: String::new(),
                source: Arc::new(source),
            })?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        connector.set_connect_timeout(Some(connect_timeout));
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = Client::builder(TokioExecutor::new()).build(https);
        Ok(Self { client })
    }
}

impl Transport for HyperTransport {
    fn send(
        &self,
        request: Request<Bytes>,
    ) -> BoxFuture<'_, Result<Response<ResponseBody>, TransportError>> {
        async move {
            let request = request.map(Full::new);
            match self.client.request(request).await {
                Ok(response) => Ok(response.map(|body| {
                    body.map_err(|error| Box::new(error) as BoxError)
                        .boxed_unsync()
                })),
                Err(error) => Err(TransportError::new(classify_transport_error(&error), error)),
            }
        }
        .boxed()
    }
}

/// Guards a single transport call.
///
/// A caller-supplied `cancel` token takes precedence: when present no timer
/// is armed and the call ends only when the token fires. Otherwise the call is
/// abandoned after `request_timeout`. Unreachable hosts surface as
/// [`Error::ServerUnavailable`]; everything else keeps its own error.
pub(crate) async fn send_guarded(
    transport: &dyn Transport,
    request: Request<Bytes>,
    request_timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> SyncwireResult<Response<ResponseBody>> {
    let method = request.method().clone();
    let uri = crate::util::redact_uri_for_logs(&request.uri().to_string());
    let call = transport.send(request);

    let outcome = match (cancel, request_timeout) {
        (Some(token), _) => {
            tokio::select! {
                result = call => result,
                () = token.cancelled() => {
                    debug!(method = %method, uri = %uri, "request aborted by caller");
                    return Err(Error::Aborted { method, uri });
                }
            }
        }
        (None, Some(limit)) => match timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                return Err(Error::Timeout {
                    timeout_ms: limit.as_millis(),
                    method,
                    uri,
                });
            }
        },
        (None, None) => call.await,
    };

    outcome.map_err(|error| map_transport_error(error, method, uri))
}

fn map_transport_error(error: TransportError, method: Method, uri: String) -> Error {
    let kind = error.kind;
    let source: Arc<dyn std::error::Error + Send + Sync> = Arc::from(error.source);
    if kind.is_unreachable() {
        return Error::ServerUnavailable {
            hint: SERVER_UNAVAILABLE_HINT.to_owned(),
            method,
            uri,
            source,
        };
    }
    Error::Transport {
        kind,
        method,
        uri,
        source,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use http::{Request, Response};
    use http_body_util::{BodyExt, Empty};
    use tokio_util::sync::CancellationToken;

    use super::{ResponseBody, Transport, TransportError, send_guarded};
    use crate::error::{Error, TransportErrorKind};

    struct Stalled;

    impl Transport for Stalled {
        fn send(
            &self,
            _request: Request<Bytes>,
        ) -> BoxFuture<'_, Result<Response<ResponseBody>, TransportError>> {
            futures_util::future::pending().boxed()
        }
    }

    struct Refused(TransportErrorKind);

    impl Transport for Refused {
        fn send(
            &self,
            _request: Request<Bytes>,
        ) -> BoxFuture<'_, Result<Response<ResponseBody>, TransportError>> {
            let kind = self.0;
            async move { Err(TransportError::new(kind, "connection refused")) }.boxed()
        }
    }

    struct Teapot;

    impl Transport for Teapot {
        fn send(
            &self,
            _request: Request<Bytes>,
        ) -> BoxFuture<'_, Result<Response<ResponseBody>, TransportError>> {
            async {
                let body = Empty::<Bytes>::new()
                    .map_err(|never| match never {})
                    .boxed_unsync();
                Ok(Response::builder()
                    .status(418)
                    .body(body)
                    .expect("response should build"))
            }
            .boxed()
        }
    }

    fn request() -> Request<Bytes> {
        Request::get("http://example.test/api/ping")
            .body(Bytes::new())
            .expect("request should build")
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_caller_token() {
        let error = send_guarded(&Stalled, request(), Some(Duration::from_millis(50)), None)
            .await
            .expect_err("stalled call should time out");
        assert!(matches!(error, Error::Timeout { timeout_ms: 50, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_token_disables_timer() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let error = send_guarded(
            &Stalled,
            request(),
            Some(Duration::from_millis(50)),
            Some(&token),
        )
        .await
        .expect_err("cancelled call should abort");
        assert!(matches!(error, Error::Aborted { .. }));
    }

    #[tokio::test]
    async fn unreachable_host_becomes_server_unavailable() {
        let error = send_guarded(&Refused(TransportErrorKind::Connect), request(), None, None)
            .await
            .expect_err("refused connection should fail");
        assert!(matches!(error, Error::ServerUnavailable { .. }));

        let error = send_guarded(&Refused(TransportErrorKind::Tls), request(), None, None)
            .await
            .expect_err("tls failure should fail");
        assert!(matches!(
            error,
            Error::Transport {
                kind: TransportErrorKind::Tls,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn non_success_status_is_not_an_error() {
        let response = send_guarded(&Teapot, request(), Some(Duration::from_secs(1)), None)
            .await
            .expect("status codes pass through");
        assert_eq!(response.status().as_u16(), 418);
    }
}
