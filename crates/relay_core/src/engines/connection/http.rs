//! Plain HTTP backend. "Connecting" builds the client (TLS setup,
//! timeouts) and pins the bearer credential; each invocation is a
//! single rendered request.

use super::{Connection, InvocationShape, ProtocolBackendInterface, RawOutput};
use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::{Protocol, TargetAsset};
use async_trait::async_trait;
use std::time::Duration;
use zeroize::Zeroizing;

struct HttpSession {
    client: reqwest::Client,
    // Derived from the resolved credential; zeroed when the session
    // drops. Sessions carrying it never return to the idle pool.
    bearer: Option<Zeroizing<String>>,
}

pub struct HttpBackend;

impl HttpBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolBackendInterface for HttpBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn connect(
        &self,
        asset: &TargetAsset,
        secret: &[u8],
        timeout: Duration,
    ) -> RelayResult<Connection> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                RelayError::new(
                    ErrorCode::HandshakeFailure,
                    ErrorCategory::Connection,
                    ErrorSeverity::High,
                    &format!("failed to build HTTP client: {e}"),
                )
            })?;
        let bearer = if secret.is_empty() {
            None
        } else {
            Some(Zeroizing::new(String::from_utf8_lossy(secret).into_owned()))
        };
        let authenticated = bearer.is_some();
        let session = HttpSession { client, bearer };
        let connection = Connection::new(&asset.id, Protocol::Http, Box::new(session));
        if authenticated {
            Ok(connection.single_use())
        } else {
            Ok(connection)
        }
    }

    async fn invoke(
        &self,
        connection: &mut Connection,
        shape: &InvocationShape,
        timeout: Duration,
    ) -> RelayResult<RawOutput> {
        let InvocationShape::HttpRequest {
            method,
            url,
            headers,
            body,
        } = shape
        else {
            return Err(RelayError::new(
                ErrorCode::InternalError,
                ErrorCategory::Execution,
                ErrorSeverity::High,
                "HTTP backend received a non-HTTP invocation",
            ));
        };
        let session = connection
            .state
            .downcast_ref::<HttpSession>()
            .ok_or_else(|| {
                RelayError::new(
                    ErrorCode::TransportFailure,
                    ErrorCategory::Execution,
                    ErrorSeverity::High,
                    "connection state is not an HTTP session",
                )
            })?;

        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes()).map_err(|_| {
            RelayError::new(
                ErrorCode::ConfigError,
                ErrorCategory::Configuration,
                ErrorSeverity::High,
                &format!("tool declares invalid HTTP method {method}"),
            )
        })?;

        let mut request = session.client.request(method, url).timeout(timeout);
        if let Some(bearer) = &session.bearer {
            request = request.bearer_auth(bearer.as_str());
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::new(
                    ErrorCode::ExecutionTimeout,
                    ErrorCategory::Execution,
                    ErrorSeverity::Medium,
                    "HTTP request exceeded its execution budget",
                )
            } else if e.is_connect() {
                RelayError::new(
                    ErrorCode::ConnectionRefused,
                    ErrorCategory::Connection,
                    ErrorSeverity::Medium,
                    "HTTP connection refused",
                )
            } else {
                RelayError::new(
                    ErrorCode::TransportFailure,
                    ErrorCategory::Execution,
                    ErrorSeverity::High,
                    &format!("HTTP request failed: {e}"),
                )
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            RelayError::new(
                ErrorCode::TransportFailure,
                ErrorCategory::Execution,
                ErrorSeverity::High,
                &format!("failed to read HTTP response body: {e}"),
            )
        })?;
        Ok(RawOutput::Http { status, body })
    }

    async fn probe(&self, connection: &Connection) -> bool {
        // A client is stateless; it is healthy as long as it exists.
        connection.state.downcast_ref::<HttpSession>().is_some()
    }

    async fn close(&self, _connection: Connection) {}
}
