//! `syncwire` is a resilient client for a versioned JSON-over-HTTP backend and
//! its framed streaming replication protocol.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use syncwire::prelude::{ApiClient, BackoffPolicy, RequestOptions, StreamOptions, StreamSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ApiClient::builder("https://sync.example.com/api")
//!         .agent_name("sync-agent")
//!         .agent_version("2.14.0")
//!         .device_id("device-001")
//!         .request_timeout(Duration::from_secs(10))
//!         .try_build()?;
//!
//!     client.login("admin@example.com", "secret").await?;
//!
//!     let patients = client
//!         .fetch(
//!             "patient",
//!             RequestOptions::default()
//!                 .query_pair("page", "1")
//!                 .backoff(BackoffPolicy::default()),
//!         )
//!         .await?;
//!     println!("{patients}");
//!
//!     let mut changes = client.stream(
//!         || async { Ok(StreamSession::new("sync/pull").query_pair("since", "0")) },
//!         StreamOptions::default(),
//!     );
//!     while let Some(message) = changes.next_message().await? {
//!         println!("kind={} payload={:?}", message.kind, message.payload);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Behavior Notes
//!
//! - Request interceptors run last-registered-first; response interceptors
//!   run first-registered-first and are observed only for side effects.
//! - Concurrent `login` calls share one network exchange.
//! - Retries happen only when a call opts into a [`BackoffPolicy`], and only
//!   for errors the [`RecoverabilityClassifier`] accepts.

mod auth;
mod client;
mod config;
mod error;
mod frame;
mod interceptor;
mod request;
mod response;
mod retry;
mod stream;
mod transport;
mod util;

pub use crate::auth::{LoginResult, ServerInfo, UserData};
pub use crate::client::{ApiClient, ApiClientBuilder, NotificationHandler};
pub use crate::config::{PollPolicy, ProtocolConfig, StreamOptions};
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::frame::{
    Decoded, FrameKind, FramePayload, HEADER_LEN, StreamMessage, decode_frame, encode_frame,
    encode_raw_frame,
};
pub use crate::interceptor::{
    ChainDirection, FailureHandler, Interceptor, InterceptorId, InterceptorRegistry,
    SuccessHandler, run_chain,
};
pub use crate::request::{AuthToken, MultipartForm, RequestConfig, RequestOptions, RequestPayload};
pub use crate::response::{HttpResponse, HttpResponseStream, ResponseHead};
pub use crate::retry::{
    BackoffPolicy, BackoffState, DEFAULT_FATAL_MESSAGE_FRAGMENTS, DefaultRecoverability,
    RecoverabilityClassifier, retry_with_backoff,
};
pub use crate::stream::{MessageStream, StreamSession};
pub use crate::transport::{HyperTransport, ResponseBody, Transport, TransportError};

pub type SyncwireResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        ApiClient, ApiClientBuilder, AuthToken, BackoffPolicy, Error, ErrorCode, FrameKind,
        FramePayload, HttpResponse, Interceptor, InterceptorId, LoginResult, MessageStream,
        MultipartForm, PollPolicy, ProtocolConfig, RecoverabilityClassifier, RequestConfig,
        RequestOptions, ResponseHead, StreamMessage, StreamOptions, StreamSession,
        SyncwireResult, Transport,
    };
}
