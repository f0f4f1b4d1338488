/*!
# Connection Manager

One pool per (protocol, target) pair with a bounded number of concurrent
connections per target, so the engine never overwhelms a remote host.
Acquisition waits for a slot (or fails fast, per the configured wait
policy), validates idle connections lazily, and retries establishment
once on a refused connection. Connections are exclusively owned by one
request between acquire and release.
*/

pub mod command_shell;
pub mod http;
pub mod remote_mgmt;

use crate::engines::Engine;
use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::{Protocol, TargetAsset, WaitPolicy};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use telemetry::TelemetrySystem;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Protocol-level request shape, rendered from a tool's execution
/// strategy before invocation.
#[derive(Debug, Clone)]
pub enum InvocationShape {
    Command {
        command_line: String,
    },
    ManagementCall {
        action: String,
        parameters: serde_json::Value,
    },
    HttpRequest {
        method: String,
        url: String,
        headers: HashMap<String, String>,
        body: Option<String>,
    },
}

/// Raw protocol output before normalization.
#[derive(Debug, Clone)]
pub enum RawOutput {
    Command {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Management {
        status_code: i64,
        fault: Option<String>,
        payload: String,
    },
    Http {
        status: u16,
        body: String,
    },
}

/// A live protocol session. Backend-specific state rides along as an
/// opaque payload the owning backend downcasts.
pub struct Connection {
    pub id: Uuid,
    pub target_id: String,
    pub protocol: Protocol,
    pub established_at: Instant,
    pub state: Box<dyn Any + Send + Sync>,
    poolable: bool,
}

impl Connection {
    pub fn new(target_id: &str, protocol: Protocol, state: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id: target_id.to_string(),
            protocol,
            established_at: Instant::now(),
            state,
            poolable: true,
        }
    }

    /// Mark the connection single-use: it is closed on release instead
    /// of pooled. Backends whose session state carries an authenticator
    /// use this so a derived secret never outlives its execution.
    pub fn single_use(mut self) -> Self {
        self.poolable = false;
        self
    }

    pub fn poolable(&self) -> bool {
        self.poolable
    }
}

/// Per-protocol capability set: handshake, invocation, liveness, close.
#[async_trait]
pub trait ProtocolBackendInterface: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Perform the protocol handshake against `asset`, authenticating
    /// with the decrypted credential bytes. The backend must not retain
    /// the secret slice beyond this call; a backend whose session needs
    /// an authenticator afterwards derives it into a zeroed-on-drop
    /// buffer and marks the connection [`Connection::single_use`].
    async fn connect(
        &self,
        asset: &TargetAsset,
        secret: &[u8],
        timeout: Duration,
    ) -> RelayResult<Connection>;

    async fn invoke(
        &self,
        connection: &mut Connection,
        shape: &InvocationShape,
        timeout: Duration,
    ) -> RelayResult<RawOutput>;

    /// Cheap liveness check for a pooled connection.
    async fn probe(&self, connection: &Connection) -> bool;

    async fn close(&self, connection: Connection);
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections_per_target: usize,
    pub wait_policy: WaitPolicy,
    pub connect_timeout: Duration,
    pub retry_backoff: Duration,
}

type PoolKey = (Protocol, String);

struct TargetPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
}

/// A connection checked out of the pool. Owns the pool slot for its
/// lifetime; dropping it without release discards the connection and
/// frees the slot.
pub struct PooledConnection {
    connection: Option<Connection>,
    _permit: OwnedSemaphorePermit,
    key: PoolKey,
}

impl PooledConnection {
    pub fn connection(&mut self) -> &mut Connection {
        self.connection
            .as_mut()
            .expect("connection already surrendered")
    }

    pub fn protocol(&self) -> Protocol {
        self.key.0
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("protocol", &self.key.0)
            .field("target_id", &self.key.1)
            .field("live", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

pub struct ConnectionManager {
    backends: HashMap<Protocol, Arc<dyn ProtocolBackendInterface>>,
    pools: Mutex<HashMap<PoolKey, Arc<TargetPool>>>,
    config: PoolConfig,
    telemetry: Arc<TelemetrySystem>,
}

impl ConnectionManager {
    pub fn new(config: PoolConfig, telemetry: Arc<TelemetrySystem>) -> Self {
        Self {
            backends: HashMap::new(),
            pools: Mutex::new(HashMap::new()),
            config,
            telemetry,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ProtocolBackendInterface>) -> Self {
        self.backends.insert(backend.protocol(), backend);
        self
    }

    fn backend(&self, protocol: Protocol) -> RelayResult<Arc<dyn ProtocolBackendInterface>> {
        self.backends.get(&protocol).cloned().ok_or_else(|| {
            RelayError::new(
                ErrorCode::NotSupported,
                ErrorCategory::Connection,
                ErrorSeverity::High,
                &format!("no backend registered for protocol {:?}", protocol),
            )
        })
    }

    fn pool(&self, key: &PoolKey) -> Arc<TargetPool> {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(TargetPool {
                    semaphore: Arc::new(Semaphore::new(self.config.max_connections_per_target)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Acquire a connection to `asset` over `protocol`, waiting for a
    /// pool slot per the wait policy. `credential` is read exactly once
    /// into a zeroed-on-drop buffer for the handshake.
    pub async fn acquire(
        &self,
        asset: &TargetAsset,
        protocol: Protocol,
        credential: &cred_vault::CredentialHandle,
    ) -> RelayResult<PooledConnection> {
        let backend = self.backend(protocol)?;
        let key = (protocol, asset.id.clone());
        let pool = self.pool(&key);

        let permit = match self.config.wait_policy {
            WaitPolicy::Block => {
                match tokio::time::timeout(
                    self.config.connect_timeout,
                    pool.semaphore.clone().acquire_owned(),
                )
                .await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(RelayError::new(
                            ErrorCode::InternalError,
                            ErrorCategory::Connection,
                            ErrorSeverity::High,
                            "connection pool closed",
                        ))
                    }
                    Err(_) => {
                        return Err(RelayError::new(
                            ErrorCode::ConnectionTimeout,
                            ErrorCategory::Connection,
                            ErrorSeverity::Medium,
                            &format!("timed out waiting for a pool slot to {}", asset.id),
                        ))
                    }
                }
            }
            WaitPolicy::FailFast => match pool.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(RelayError::new(
                        ErrorCode::PoolExhausted,
                        ErrorCategory::Connection,
                        ErrorSeverity::Medium,
                        &format!("target {} is at its connection limit", asset.id),
                    ))
                }
            },
        };

        // Reuse an idle connection if one still answers its probe.
        loop {
            let candidate = pool.idle.lock().unwrap().pop();
            let Some(candidate) = candidate else { break };
            if backend.probe(&candidate).await {
                debug!(target = %asset.id, connection = %candidate.id, "reusing pooled connection");
                self.telemetry.incr("connections_reused");
                return Ok(PooledConnection {
                    connection: Some(candidate),
                    _permit: permit,
                    key,
                });
            }
            debug!(target = %asset.id, connection = %candidate.id, "discarding stale pooled connection");
            self.telemetry.incr("connections_discarded");
            backend.close(candidate).await;
        }

        let secret = Zeroizing::new(credential.with_secret(|s| s.to_vec())?);
        let connection = self
            .establish(backend.as_ref(), asset, &secret, protocol)
            .await?;
        self.telemetry.incr("connections_built");
        Ok(PooledConnection {
            connection: Some(connection),
            _permit: permit,
            key,
        })
    }

    /// Handshake with timeout; one transient retry on a refused
    /// connection. No other stage auto-retries.
    async fn establish(
        &self,
        backend: &dyn ProtocolBackendInterface,
        asset: &TargetAsset,
        secret: &[u8],
        protocol: Protocol,
    ) -> RelayResult<Connection> {
        let mut attempted_retry = false;
        loop {
            let attempt =
                tokio::time::timeout(self.config.connect_timeout, backend.connect(asset, secret, self.config.connect_timeout))
                    .await;
            match attempt {
                Ok(Ok(connection)) => return Ok(connection),
                Ok(Err(e)) if e.is_transient() && !attempted_retry => {
                    warn!(target = %asset.id, protocol = ?protocol,
                        "connection refused, retrying once: {}", e);
                    attempted_retry = true;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(RelayError::new(
                        ErrorCode::ConnectionTimeout,
                        ErrorCategory::Connection,
                        ErrorSeverity::Medium,
                        &format!("connection to {} timed out", asset.id),
                    ))
                }
            }
        }
    }

    pub async fn invoke(
        &self,
        pooled: &mut PooledConnection,
        shape: &InvocationShape,
        timeout: Duration,
    ) -> RelayResult<RawOutput> {
        let backend = self.backend(pooled.protocol())?;
        backend.invoke(pooled.connection(), shape, timeout).await
    }

    /// Return a healthy connection to its pool for reuse. Connections
    /// marked single-use carry session state that must not outlive one
    /// execution; those are closed instead of pooled.
    pub async fn release(&self, mut pooled: PooledConnection) {
        if let Some(connection) = pooled.connection.take() {
            if connection.poolable() {
                let pool = self.pool(&pooled.key);
                pool.idle.lock().unwrap().push(connection);
            } else if let Ok(backend) = self.backend(connection.protocol) {
                backend.close(connection).await;
            }
        }
        // The permit drops with `pooled`, freeing the slot.
    }

    /// Remove a connection found broken (or in unknown remote state)
    /// after use; it is never reused.
    pub async fn invalidate(&self, mut pooled: PooledConnection) {
        if let Some(connection) = pooled.connection.take() {
            if let Ok(backend) = self.backend(connection.protocol) {
                backend.close(connection).await;
            }
            self.telemetry.incr("connections_invalidated");
        }
    }
}

impl Engine for ConnectionManager {
    fn get_state(&self) -> String {
        "ready".to_string()
    }

    fn get_dependencies(&self) -> Vec<String> {
        vec!["protocol_backends".to_string()]
    }

    fn health_check(&self) -> bool {
        !self.backends.is_empty()
    }

    fn initialize(&self) -> bool {
        true
    }

    fn shutdown(&self) -> bool {
        true
    }
}
