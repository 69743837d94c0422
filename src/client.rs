use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::FutureExt;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::SyncwireResult;
use crate::auth::{AuthSession, LoginResult, PendingLogin, UserData};
use crate::config::{PollPolicy, ProtocolConfig};
use crate::error::Error;
use crate::interceptor::{ChainDirection, Interceptor, InterceptorId, InterceptorRegistry, run_chain};
use crate::request::{AuthToken, MultipartForm, RequestConfig, RequestOptions, encode_payload};
use crate::response::{HttpResponse, HttpResponseStream, ResponseHead, read_body, status_error};
use crate::retry::{BackoffPolicy, RecoverabilityClassifier, default_classifier, retry_with_backoff};
use crate::transport::{HyperTransport, Transport, send_guarded};
use crate::util::{
    compose_url, encode_query, is_truthy, lock_unpoisoned, parse_header_name, parse_header_value,
    redact_uri_for_logs, split_endpoint,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_AGENT_NAME: &str = "syncwire";
const JSON_MIME: &str = "application/json";

pub type NotificationHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub struct ApiClientBuilder {
    endpoint: String,
    agent_name: String,
    agent_version: String,
    device_id: Option<String>,
    request_timeout: Option<Duration>,
    connect_timeout: Duration,
    backoff_policy: BackoffPolicy,
    classifier: Arc<dyn RecoverabilityClassifier>,
    poll_policy: PollPolicy,
    protocol: ProtocolConfig,
    transport: Option<Arc<dyn Transport>>,
    on_auth_failure: Option<NotificationHandler>,
    on_version_incompatible: Option<NotificationHandler>,
}

impl ApiClientBuilder {
    pub(crate) fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            agent_name: DEFAULT_AGENT_NAME.to_owned(),
            agent_version: env!("CARGO_PKG_VERSION").to_owned(),
            device_id: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff_policy: BackoffPolicy::default(),
            classifier: default_classifier(),
            poll_policy: PollPolicy::default(),
            protocol: ProtocolConfig::default(),
            transport: None,
            on_auth_failure: None,
            on_version_incompatible: None,
        }
    }

    pub fn agent_name(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = agent_name.into();
        self
    }

    pub fn agent_version(mut self, agent_version: impl Into<String>) -> Self {
        self.agent_version = agent_version.into();
        self
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    /// Requests run without a timer unless the call sets its own timeout.
    pub fn no_request_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Policy applied by [`ApiClient::fetch_with_backoff`].
    pub fn backoff_policy(mut self, backoff_policy: BackoffPolicy) -> Self {
        self.backoff_policy = backoff_policy;
        self
    }

    pub fn recoverability_classifier(
        mut self,
        classifier: Arc<dyn RecoverabilityClassifier>,
    ) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn poll_policy(mut self, poll_policy: PollPolicy) -> Self {
        self.poll_policy = poll_policy;
        self
    }

    pub fn protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn on_auth_failure<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_auth_failure = Some(Arc::new(handler));
        self
    }

    pub fn on_version_incompatible<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_version_incompatible = Some(Arc::new(handler));
        self
    }

    pub fn try_build(self) -> SyncwireResult<ApiClient> {
        let (host, prefix) = split_endpoint(&self.endpoint)?;
        let client_header = parse_header_name(&self.protocol.client_header)?;
        let version_header = parse_header_name(&self.protocol.version_header)?;
        let agent_name = parse_header_value(client_header.as_str(), &self.agent_name)?;
        let agent_version = parse_header_value(version_header.as_str(), &self.agent_version)?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(self.connect_timeout)?),
        };

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                host,
                prefix,
                client_header,
                version_header,
                agent_name,
                agent_version,
                device_id: self.device_id,
                request_timeout: self.request_timeout,
                backoff_policy: self.backoff_policy,
                classifier: self.classifier,
                poll_policy: self.poll_policy,
                protocol: self.protocol,
                transport,
                session: Mutex::new(AuthSession::default()),
                request_interceptors: Mutex::new(InterceptorRegistry::new()),
                response_interceptors: Mutex::new(InterceptorRegistry::new()),
                on_auth_failure: Mutex::new(self.on_auth_failure),
                on_version_incompatible: Mutex::new(self.on_version_incompatible),
            }),
        })
    }

    #[track_caller]
    pub fn build(self) -> ApiClient {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build syncwire client: {error}; use try_build() to handle configuration errors")
        })
    }
}

struct ClientInner {
    host: String,
    prefix: String,
    client_header: HeaderName,
    version_header: HeaderName,
    agent_name: HeaderValue,
    agent_version: HeaderValue,
    device_id: Option<String>,
    request_timeout: Option<Duration>,
    backoff_policy: BackoffPolicy,
    classifier: Arc<dyn RecoverabilityClassifier>,
    poll_policy: PollPolicy,
    protocol: ProtocolConfig,
    transport: Arc<dyn Transport>,
    session: Mutex<AuthSession>,
    request_interceptors: Mutex<InterceptorRegistry<RequestConfig>>,
    response_interceptors: Mutex<InterceptorRegistry<ResponseHead>>,
    on_auth_failure: Mutex<Option<NotificationHandler>>,
    on_version_incompatible: Mutex<Option<NotificationHandler>>,
}

/// Owned by the login task. Clears the in-flight marker when the task ends,
/// including by panic.
struct InFlightLogin(ApiClient);

impl Drop for InFlightLogin {
    fn drop(&mut self) {
        lock_unpoisoned(&self.0.inner.session).ongoing_login = None;
    }
}

/// Client for one backend endpoint. Cheap to clone; clones share the session
/// and interceptors.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ApiClient")
            .field("prefix", &self.inner.prefix)
            .field("session", &*lock_unpoisoned(&self.inner.session))
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn builder(endpoint: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder::new(endpoint)
    }

    /// Origin of the configured endpoint, e.g. `https://host:3000`.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.inner.protocol
    }

    pub fn set_auth_failure_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *lock_unpoisoned(&self.inner.on_auth_failure) = Some(Arc::new(handler));
    }

    pub fn set_version_incompatible_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *lock_unpoisoned(&self.inner.on_version_incompatible) = Some(Arc::new(handler));
    }

    pub fn add_request_interceptor(&self, interceptor: Interceptor<RequestConfig>) -> InterceptorId {
        lock_unpoisoned(&self.inner.request_interceptors).register(interceptor)
    }

    pub fn remove_request_interceptor(&self, id: InterceptorId) {
        lock_unpoisoned(&self.inner.request_interceptors).remove(id);
    }

    pub fn clear_request_interceptors(&self) {
        lock_unpoisoned(&self.inner.request_interceptors).clear();
    }

    pub fn add_response_interceptor(&self, interceptor: Interceptor<ResponseHead>) -> InterceptorId {
        lock_unpoisoned(&self.inner.response_interceptors).register(interceptor)
    }

    pub fn remove_response_interceptor(&self, id: InterceptorId) {
        lock_unpoisoned(&self.inner.response_interceptors).remove(id);
    }

    pub fn clear_response_interceptors(&self) {
        lock_unpoisoned(&self.inner.response_interceptors).clear();
    }

    pub fn set_token(&self, token: impl Into<String>, refresh_token: Option<String>) {
        lock_unpoisoned(&self.inner.session).set_tokens(Some(token.into()), refresh_token);
    }

    pub fn token(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.session).access_token.clone()
    }

    pub fn refresh_token_value(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.session).refresh_token.clone()
    }

    pub fn user(&self) -> Option<Value> {
        lock_unpoisoned(&self.inner.session).user.clone()
    }

    pub fn last_refreshed(&self) -> Option<SystemTime> {
        lock_unpoisoned(&self.inner.session).last_refreshed
    }

    pub fn is_login_in_flight(&self) -> bool {
        lock_unpoisoned(&self.inner.session).ongoing_login.is_some()
    }

    fn pending_login(&self) -> Option<PendingLogin> {
        lock_unpoisoned(&self.inner.session).ongoing_login.clone()
    }

    /// Logs in, or joins the login already in flight.
    ///
    /// Concurrent callers share one network exchange and all observe its
    /// result. The exchange runs on its own task, so it settles and clears
    /// the in-flight marker even when every caller stops waiting.
    pub async fn login(&self, email: &str, password: &str) -> SyncwireResult<LoginResult> {
        let pending = {
            let mut session = lock_unpoisoned(&self.inner.session);
            if let Some(pending) = session.ongoing_login.clone() {
                debug!("joining in-flight login");
                pending
            } else {
                let in_flight = InFlightLogin(self.clone());
                let email = email.to_owned();
                let password = password.to_owned();
                let task = tokio::spawn(async move {
                    let in_flight = in_flight;
                    in_flight.0.perform_login(&email, &password).await
                });
                let pending = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(source) => Err(Error::LoginInterrupted {
                            source: Arc::new(source),
                        }),
                    }
                }
                .boxed()
                .shared();
                session.ongoing_login = Some(pending.clone());
                pending
            }
        };
        pending.await
    }

    async fn perform_login(&self, email: &str, password: &str) -> SyncwireResult<LoginResult> {
        let mut body = json!({ "email": email, "password": password });
        if let Some(device_id) = &self.inner.device_id
            && let Value::Object(fields) = &mut body
        {
            fields.insert("deviceId".to_owned(), Value::String(device_id.clone()));
        }
        let options = RequestOptions::new(Method::POST)
            .json(body)
            .without_auth()
            .wait_for_auth(false);
        let response = self
            .fetch_response(&self.inner.protocol.login_endpoint, options)
            .await?;

        let server_type = response
            .headers()
            .get(self.inner.protocol.server_type_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let accepted = server_type
            .as_deref()
            .is_some_and(|server_type| self.inner.protocol.accepts_server_type(server_type));
        if !accepted {
            warn!(server_type = ?server_type, "rejecting login from unsupported server");
            return Err(Error::UnsupportedServer { server_type });
        }

        let body: Map<String, Value> = response.json()?;
        let mut result = LoginResult::from_login_body(body, server_type);
        lock_unpoisoned(&self.inner.session)
            .set_tokens(result.token.clone(), result.refresh_token.clone());

        let user_data = self.fetch_user_data(result.ability.clone()).await?;
        result.user = user_data.user;
        result.ability = user_data.ability;
        Ok(result)
    }

    /// Loads the current user and records when the session was last confirmed.
    pub async fn fetch_user_data(&self, permissions: Value) -> SyncwireResult<UserData> {
        let options = RequestOptions::new(Method::GET).wait_for_auth(false);
        let user = self.fetch("user/me", options).await?;
        {
            let mut session = lock_unpoisoned(&self.inner.session);
            session.last_refreshed = Some(SystemTime::now());
            session.user = Some(user.clone());
        }
        Ok(UserData {
            user,
            ability: permissions,
        })
    }

    /// Exchanges the held refresh token (or the access token when no refresh
    /// token is held) for a new pair. Does nothing when no token is held.
    pub async fn refresh_token(&self) -> SyncwireResult<()> {
        let Some(bearer) = lock_unpoisoned(&self.inner.session).refresh_bearer() else {
            return Ok(());
        };
        let options = RequestOptions::new(Method::POST)
            .json(json!({}))
            .bearer(bearer)
            .wait_for_auth(false);
        let response = self.fetch("refresh", options).await?;
        let field = |name: &str| response.get(name).and_then(Value::as_str).map(str::to_owned);
        lock_unpoisoned(&self.inner.session).set_tokens(field("token"), field("refreshToken"));
        debug!("refreshed session tokens");
        Ok(())
    }

    pub async fn request_password_reset(&self, email: &str) -> SyncwireResult<Value> {
        self.post("resetPassword", &json!({ "email": email })).await
    }

    pub async fn change_password<B>(&self, args: &B) -> SyncwireResult<Value>
    where
        B: Serialize + ?Sized,
    {
        self.post("changePassword", args).await
    }

    pub async fn get<Q>(&self, endpoint: &str, query: &Q) -> SyncwireResult<Value>
    where
        Q: Serialize + ?Sized,
    {
        self.fetch(endpoint, RequestOptions::new(Method::GET).query(query)?)
            .await
    }

    pub async fn post<B>(&self, endpoint: &str, body: &B) -> SyncwireResult<Value>
    where
        B: Serialize + ?Sized,
    {
        self.fetch(endpoint, RequestOptions::new(Method::POST).json_from(body)?)
            .await
    }

    pub async fn put<B>(&self, endpoint: &str, body: &B) -> SyncwireResult<Value>
    where
        B: Serialize + ?Sized,
    {
        self.fetch(endpoint, RequestOptions::new(Method::PUT).json_from(body)?)
            .await
    }

    pub async fn delete<Q>(&self, endpoint: &str, query: &Q) -> SyncwireResult<Value>
    where
        Q: Serialize + ?Sized,
    {
        self.fetch(endpoint, RequestOptions::new(Method::DELETE).query(query)?)
            .await
    }

    pub async fn download<Q>(&self, endpoint: &str, query: &Q) -> SyncwireResult<Bytes>
    where
        Q: Serialize + ?Sized,
    {
        let options = RequestOptions::new(Method::GET).query(query)?;
        Ok(self.fetch_response(endpoint, options).await?.into_body())
    }

    /// Posts `file` as a multipart form, with `body` JSON-encoded alongside
    /// it in a `jsonData` field so its types survive the form encoding.
    pub async fn post_with_file_upload<B>(
        &self,
        endpoint: &str,
        file: impl Into<Bytes>,
        body: &B,
    ) -> SyncwireResult<Value>
    where
        B: Serialize + ?Sized,
    {
        let json_data = serde_json::to_string(body).map_err(|source| Error::Serialize {
            source: source.into(),
        })?;
        let form = MultipartForm::new().text("jsonData", json_data).file(
            "file",
            "blob",
            "application/octet-stream",
            file,
        );
        self.fetch(endpoint, RequestOptions::new(Method::POST).multipart(form))
            .await
    }

    /// Repeats the call on a fixed interval until the decoded body is truthy.
    pub async fn poll_until_ok(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> SyncwireResult<Value> {
        let policy = self.inner.poll_policy;
        for attempt in 1..=policy.max_attempts {
            let value = self.fetch(endpoint, options.clone()).await?;
            if is_truthy(&value) {
                return Ok(value);
            }
            debug!(attempt, endpoint, "poll returned a falsy body");
            if attempt < policy.max_attempts {
                sleep(policy.interval).await;
            }
        }
        Err(Error::PollExhausted {
            endpoint: endpoint.to_owned(),
            attempts: policy.max_attempts,
        })
    }

    /// `fetch` retried under the client's default backoff policy.
    pub async fn fetch_with_backoff(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> SyncwireResult<Value> {
        let options = options.backoff(self.inner.backoff_policy);
        self.fetch(endpoint, options).await
    }

    /// Decoded JSON body of a 2xx response; `Value::Null` for 204 or an empty body.
    pub async fn fetch(&self, endpoint: &str, options: RequestOptions) -> SyncwireResult<Value> {
        let response = self.fetch_response(endpoint, options).await?;
        if response.status() == StatusCode::NO_CONTENT || response.body().is_empty() {
            return Ok(Value::Null);
        }
        response.json()
    }

    pub async fn fetch_response(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> SyncwireResult<HttpResponse> {
        self.fetch_stream(endpoint, options)
            .await?
            .into_buffered()
            .await
    }

    /// Runs the full pipeline and hands back the 2xx response with its body
    /// unread. Non-2xx responses come back as typed errors.
    pub async fn fetch_stream(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> SyncwireResult<HttpResponseStream> {
        let RequestOptions {
            method,
            query_pairs,
            headers: caller_headers,
            body,
            auth,
            wait_for_auth,
            timeout,
            cancel,
            backoff,
        } = options;

        let mut token = self.resolve_token(&auth);
        if wait_for_auth && let Some(pending) = self.pending_login() {
            debug!("waiting for in-flight login before sending");
            pending.await?;
            if auth != AuthToken::Disabled {
                token = self.token();
            }
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_MIME));
        if !body.is_none() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_MIME));
        }
        if let Some(token) = token {
            let value = parse_header_value(AUTHORIZATION.as_str(), &format!("Bearer {token}"))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in caller_headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        self.apply_protected_headers(&mut headers);

        let query_string = encode_query(&query_pairs)?;
        let url = compose_url(&self.inner.prefix, endpoint, &query_string);
        let body = encode_payload(body, &mut headers)?;

        let config = RequestConfig {
            method,
            url,
            headers,
            body,
            timeout: timeout.or(self.inner.request_timeout),
        };
        let chain = lock_unpoisoned(&self.inner.request_interceptors).chain(ChainDirection::Reverse);
        let config = run_chain(&chain, Ok(config)).await?;

        let is_login = endpoint.trim_matches('/') == self.inner.protocol.login_endpoint;
        match backoff {
            Some(policy) => {
                let mut attempt = 0_usize;
                retry_with_backoff(policy, self.inner.classifier.as_ref(), || {
                    attempt += 1;
                    self.dispatch(&config, attempt, cancel.as_ref(), is_login)
                })
                .await
            }
            None => self.dispatch(&config, 1, cancel.as_ref(), is_login).await,
        }
    }

    fn resolve_token(&self, auth: &AuthToken) -> Option<String> {
        match auth {
            AuthToken::Session => self.token(),
            AuthToken::Disabled => None,
            AuthToken::Explicit(token) => Some(token.clone()),
        }
    }

    fn apply_protected_headers(&self, headers: &mut HeaderMap) {
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_MIME));
        headers.insert(self.inner.client_header.clone(), self.inner.agent_name.clone());
        headers.insert(self.inner.version_header.clone(), self.inner.agent_version.clone());
    }

    async fn dispatch(
        &self,
        config: &RequestConfig,
        attempt: usize,
        cancel: Option<&CancellationToken>,
        is_login: bool,
    ) -> SyncwireResult<HttpResponseStream> {
        let redacted_uri = redact_uri_for_logs(&config.url);
        let span = info_span!(
            "syncwire.request",
            method = %config.method,
            uri = %redacted_uri,
            attempt = attempt
        );
        async move {
            debug!("sending request");
            let request = config.clone().into_http()?;
            let sent = send_guarded(
                self.inner.transport.as_ref(),
                request,
                config.timeout,
                cancel,
            )
            .await;

            let response = match sent {
                Ok(response) => response,
                Err(error) => {
                    self.observe_response(Err(error.clone())).await;
                    return Err(error);
                }
            };

            let (parts, body) = response.into_parts();
            let head = ResponseHead {
                status: parts.status,
                headers: parts.headers.clone(),
                url: config.url.clone(),
            };
            let success = parts.status.is_success();
            let observed = if success {
                Ok(head)
            } else {
                Err(Error::UnexpectedStatus {
                    status: parts.status.as_u16(),
                    method: config.method.clone(),
                    uri: redacted_uri.clone(),
                })
            };
            self.observe_response(observed).await;

            if success {
                return Ok(HttpResponseStream::new(parts.status, parts.headers, body));
            }

            let body = read_body(body).await?;
            let error = status_error(
                parts.status,
                &parts.headers,
                &body,
                is_login,
                &self.inner.protocol,
            );
            debug!(status = parts.status.as_u16(), error = %error, "server returned an error");
            self.notify(&error);
            Err(error)
        }
        .instrument(span)
        .await
    }

    /// Runs the response interceptors for their side effects only.
    async fn observe_response(&self, initial: SyncwireResult<ResponseHead>) {
        let chain =
            lock_unpoisoned(&self.inner.response_interceptors).chain(ChainDirection::Forward);
        if chain.is_empty() {
            return;
        }
        let started_ok = initial.is_ok();
        if let Err(error) = run_chain(&chain, initial).await
            && started_ok
        {
            warn!(error = %error, "response interceptor failed; continuing");
        }
    }

    fn notify(&self, error: &Error) {
        let handler = match error {
            Error::AuthExpired { .. } => lock_unpoisoned(&self.inner.on_auth_failure).clone(),
            Error::VersionIncompatible { .. } => {
                lock_unpoisoned(&self.inner.on_version_incompatible).clone()
            }
            _ => None,
        };
        if let (Some(handler), Some(message)) = (handler, error.server_message()) {
            handler(message);
        }
    }
}
