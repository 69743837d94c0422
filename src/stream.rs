//! Long-lived framed responses that resume themselves after a broken read.
//!
//! A [`MessageStream`] pulls frames out of one HTTP response at a time. When
//! the body closes before an end frame has been fully received, or a frame
//! cannot be read, the stream waits [`StreamOptions::retry_interval`], asks
//! the caller's endpoint function where to resume, and opens a fresh
//! response. Callers only ever see whole frames, in arrival order.

use std::future::Future;

use bytes::BytesMut;
use futures_core::Stream;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::Method;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::SyncwireResult;
use crate::client::ApiClient;
use crate::config::StreamOptions;
use crate::error::Error;
use crate::frame::{Decoded, StreamMessage, decode_frame};
use crate::request::RequestOptions;
use crate::response::HttpResponseStream;

/// Where one attempt of a stream connects to.
#[derive(Clone, Debug)]
pub struct StreamSession {
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub options: RequestOptions,
}

impl StreamSession {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: Vec::new(),
            options: RequestOptions::new(Method::GET),
        }
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

type EndpointFn = Box<dyn FnMut() -> BoxFuture<'static, SyncwireResult<StreamSession>> + Send>;

enum StreamState {
    Idle,
    Reading {
        response: HttpResponseStream,
        buffer: BytesMut,
    },
    Finished,
}

pub struct MessageStream {
    client: ApiClient,
    endpoint_fn: EndpointFn,
    options: StreamOptions,
    attempts: usize,
    endpoint: String,
    state: StreamState,
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            StreamState::Idle => "idle",
            StreamState::Reading { .. } => "reading",
            StreamState::Finished => "finished",
        };
        formatter
            .debug_struct("MessageStream")
            .field("endpoint", &self.endpoint)
            .field("attempts", &self.attempts)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Opens a framed stream. `endpoint_fn` is called before every attempt,
    /// the first included, so each retry can ask to resume from a new point.
    pub fn stream<F, Fut>(&self, mut endpoint_fn: F, options: StreamOptions) -> MessageStream
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = SyncwireResult<StreamSession>> + Send + 'static,
    {
        MessageStream {
            client: self.clone(),
            endpoint_fn: Box::new(move || endpoint_fn().boxed()),
            options,
            attempts: 0,
            endpoint: String::new(),
            state: StreamState::Idle,
        }
    }
}

impl MessageStream {
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Next complete message, or `None` once the end frame has been received.
    ///
    /// After an error the stream is finished and keeps returning `None`.
    pub async fn next_message(&mut self) -> SyncwireResult<Option<StreamMessage>> {
        loop {
            match &mut self.state {
                StreamState::Finished => return Ok(None),
                StreamState::Idle => {
                    if let Err(error) = self.open().await {
                        self.state = StreamState::Finished;
                        return Err(error);
                    }
                }
                StreamState::Reading { response, buffer } => {
                    match decode_frame(buffer, self.options.decode_json) {
                        Ok(Decoded::Frame(message)) if message.kind == self.options.end_kind => {
                            debug!(endpoint = %self.endpoint, "stream ended");
                            self.state = StreamState::Finished;
                            return Ok(None);
                        }
                        Ok(Decoded::Frame(message)) => {
                            debug!(kind = %message.kind, "frame decoded");
                            return Ok(Some(message));
                        }
                        Ok(Decoded::Incomplete { kind }) => match response.next_chunk().await {
                            Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
                            Ok(None) => {
                                warn!(
                                    endpoint = %self.endpoint,
                                    buffered = buffer.len(),
                                    truncated_end = kind == Some(self.options.end_kind),
                                    "stream closed before end frame"
                                );
                                self.state = StreamState::Idle;
                            }
                            Err(error) => {
                                warn!(endpoint = %self.endpoint, error = %error, "stream read failed");
                                self.state = StreamState::Idle;
                            }
                        },
                        Err(error) => {
                            warn!(endpoint = %self.endpoint, error = %error, "undecodable frame");
                            self.state = StreamState::Idle;
                        }
                    }
                }
            }
        }
    }

    async fn open(&mut self) -> SyncwireResult<()> {
        if self.attempts >= self.options.max_attempts {
            return Err(Error::StreamRetriesExhausted {
                endpoint: self.endpoint.clone(),
                attempts: self.attempts,
            });
        }
        if self.attempts > 0 {
            warn!(
                endpoint = %self.endpoint,
                attempt = self.attempts + 1,
                max_attempts = self.options.max_attempts,
                delay_ms = self.options.retry_interval.as_millis() as u64,
                "restarting interrupted stream"
            );
            sleep(self.options.retry_interval).await;
        }
        self.attempts += 1;

        let StreamSession {
            endpoint,
            query,
            options,
        } = (self.endpoint_fn)().await?;
        self.endpoint = endpoint;
        let options = query
            .into_iter()
            .fold(options, |options, (name, value)| options.query_pair(name, value));

        let response = self.client.fetch_stream(&self.endpoint, options).await?;
        self.state = StreamState::Reading {
            response,
            buffer: BytesMut::new(),
        };
        Ok(())
    }

    /// Adapts this stream to [`futures_core::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = SyncwireResult<StreamMessage>> + Send {
        futures_util::stream::unfold(self, |mut stream| async move {
            match stream.next_message().await {
                Ok(Some(message)) => Some((Ok(message), stream)),
                Ok(None) => None,
                Err(error) => Some((Err(error), stream)),
            }
        })
    }
}
