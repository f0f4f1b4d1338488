//! Remote-management backend. Speaks a JSON action envelope over HTTP
//! to an asset's management endpoint: the handshake posts an
//! `identify` action, invocations post `{action, parameters}` and read
//! back `{status, fault, payload}`.

use super::{Connection, InvocationShape, ProtocolBackendInterface, RawOutput};
use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::{Protocol, TargetAsset};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

struct ManagementSession {
    client: reqwest::Client,
    endpoint: String,
    // Derived from the resolved credential; zeroed when the session
    // drops. The session is marked single-use so it never outlives
    // one execution.
    auth_token: Zeroizing<String>,
}

pub struct RemoteManagementBackend;

impl RemoteManagementBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RemoteManagementBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn map_request_error(e: reqwest::Error, context: &str) -> RelayError {
    if e.is_timeout() {
        RelayError::new(
            ErrorCode::ConnectionTimeout,
            ErrorCategory::Connection,
            ErrorSeverity::Medium,
            &format!("{context} timed out"),
        )
    } else if e.is_connect() {
        RelayError::new(
            ErrorCode::ConnectionRefused,
            ErrorCategory::Connection,
            ErrorSeverity::Medium,
            &format!("{context}: connection refused"),
        )
    } else {
        RelayError::new(
            ErrorCode::TransportFailure,
            ErrorCategory::Execution,
            ErrorSeverity::High,
            &format!("{context}: {e}"),
        )
    }
}

#[async_trait]
impl ProtocolBackendInterface for RemoteManagementBackend {
    fn protocol(&self) -> Protocol {
        Protocol::RemoteManagement
    }

    async fn connect(
        &self,
        asset: &TargetAsset,
        secret: &[u8],
        timeout: Duration,
    ) -> RelayResult<Connection> {
        let endpoint = asset.management_endpoint.clone().ok_or_else(|| {
            RelayError::new(
                ErrorCode::HandshakeFailure,
                ErrorCategory::Connection,
                ErrorSeverity::High,
                &format!("asset {} has no management endpoint", asset.id),
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                RelayError::new(
                    ErrorCode::InternalError,
                    ErrorCategory::Connection,
                    ErrorSeverity::High,
                    &format!("failed to build management client: {e}"),
                )
            })?;
        let auth_token = Zeroizing::new(String::from_utf8_lossy(secret).into_owned());

        let response = client
            .post(&endpoint)
            .bearer_auth(auth_token.as_str())
            .json(&json!({ "action": "identify", "parameters": {} }))
            .send()
            .await
            .map_err(|e| map_request_error(e, "management handshake"))?;
        if !response.status().is_success() {
            return Err(RelayError::new(
                ErrorCode::HandshakeFailure,
                ErrorCategory::Connection,
                ErrorSeverity::High,
                &format!(
                    "management endpoint for {} rejected the handshake with status {}",
                    asset.id,
                    response.status()
                ),
            ));
        }
        debug!(target = %asset.id, endpoint = %endpoint, "management session established");

        let session = ManagementSession {
            client,
            endpoint,
            auth_token,
        };
        Ok(Connection::new(&asset.id, Protocol::RemoteManagement, Box::new(session)).single_use())
    }

    async fn invoke(
        &self,
        connection: &mut Connection,
        shape: &InvocationShape,
        timeout: Duration,
    ) -> RelayResult<RawOutput> {
        let InvocationShape::ManagementCall { action, parameters } = shape else {
            return Err(RelayError::new(
                ErrorCode::InternalError,
                ErrorCategory::Execution,
                ErrorSeverity::High,
                "remote-management backend received a non-management invocation",
            ));
        };
        let session = connection
            .state
            .downcast_ref::<ManagementSession>()
            .ok_or_else(|| {
                RelayError::new(
                    ErrorCode::TransportFailure,
                    ErrorCategory::Execution,
                    ErrorSeverity::High,
                    "connection state is not a management session",
                )
            })?;

        let response = session
            .client
            .post(&session.endpoint)
            .bearer_auth(session.auth_token.as_str())
            .timeout(timeout)
            .json(&json!({ "action": action, "parameters": parameters }))
            .send()
            .await
            .map_err(|e| {
                let mapped = map_request_error(e, "management call");
                if mapped.code == ErrorCode::ConnectionTimeout {
                    RelayError::new(
                        ErrorCode::ExecutionTimeout,
                        ErrorCategory::Execution,
                        ErrorSeverity::Medium,
                        "management call exceeded its execution budget",
                    )
                } else {
                    mapped
                }
            })?;

        let http_status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| map_request_error(e, "management response"))?;

        // Endpoints that follow the envelope report status and fault in
        // the body; fall back to the HTTP status otherwise.
        let envelope: serde_json::Value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
        let status_code = envelope
            .get("status")
            .and_then(|v| v.as_i64())
            .unwrap_or(i64::from(http_status.as_u16()));
        let fault = envelope
            .get("fault")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let payload = envelope
            .get("payload")
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or(body);

        Ok(RawOutput::Management {
            status_code,
            fault,
            payload,
        })
    }

    async fn probe(&self, connection: &Connection) -> bool {
        let Some(session) = connection.state.downcast_ref::<ManagementSession>() else {
            return false;
        };
        session
            .client
            .post(&session.endpoint)
            .bearer_auth(session.auth_token.as_str())
            .json(&json!({ "action": "identify", "parameters": {} }))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn close(&self, _connection: Connection) {}
}
