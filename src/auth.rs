//! Session state shared by every request a client makes.

use std::time::SystemTime;

use futures_util::future::{BoxFuture, Shared};
use serde_json::{Map, Value};

use crate::SyncwireResult;

pub(crate) type PendingLogin = Shared<BoxFuture<'static, SyncwireResult<LoginResult>>>;

/// Where the server that accepted a login says it lives.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerInfo {
    pub server_type: Option<String>,
    pub central_host: Option<String>,
    /// Remaining fields of the `server` object, verbatim.
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoginResult {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Value,
    /// Permission payload from the login response, handed back untouched.
    pub ability: Value,
    pub server: ServerInfo,
    /// Any other top-level login fields.
    pub extra: Map<String, Value>,
}

impl LoginResult {
    /// Splits a decoded login body into its known parts.
    ///
    /// `server_type_header` is used when the body does not name a server type.
    pub(crate) fn from_login_body(
        mut body: Map<String, Value>,
        server_type_header: Option<String>,
    ) -> Self {
        let mut server_fields = match body.remove("server") {
            Some(Value::Object(fields)) => fields,
            _ => Map::new(),
        };
        let server_type = take_string(&mut body, "serverType").or(server_type_header);
        let central_host = take_string(&mut body, "centralHost");
        server_fields.remove("type");
        server_fields.remove("centralHost");

        let token = take_string(&mut body, "token");
        let refresh_token = take_string(&mut body, "refreshToken");
        let ability = body.remove("permissions").unwrap_or(Value::Null);

        Self {
            token,
            refresh_token,
            user: Value::Null,
            ability,
            server: ServerInfo {
                server_type,
                central_host,
                extra: server_fields,
            },
            extra: body,
        }
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key) {
        Some(Value::String(text)) => Some(text),
        Some(Value::Null) | None => None,
        Some(other) => {
            fields.insert(key.to_owned(), other);
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserData {
    pub user: Value,
    pub ability: Value,
}

/// Tokens, the in-flight login marker, and the last fetched user.
///
/// Owned by one client. Mutated by login, refresh and `set_token`; read by
/// every request when it resolves which bearer token to send.
#[derive(Default)]
pub(crate) struct AuthSession {
    pub(crate) access_token: Option<String>,
    pub(crate) refresh_token: Option<String>,
    pub(crate) ongoing_login: Option<PendingLogin>,
    pub(crate) last_refreshed: Option<SystemTime>,
    pub(crate) user: Option<Value>,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuthSession")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("login_in_flight", &self.ongoing_login.is_some())
            .field("last_refreshed", &self.last_refreshed)
            .finish()
    }
}

impl AuthSession {
    pub(crate) fn set_tokens(&mut self, access_token: Option<String>, refresh_token: Option<String>) {
        self.access_token = access_token;
        self.refresh_token = refresh_token;
    }

    /// Token used for `refresh`: the refresh token if held, else the access token.
    pub(crate) fn refresh_bearer(&self) -> Option<String> {
        self.refresh_token
            .clone()
            .or_else(|| self.access_token.clone())
    }
}
