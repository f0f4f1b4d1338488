/*!
# Engines

Each pipeline stage is housed in its own engine with a common lifecycle
contract; `RelayEngines` wires them together over the injected stores
and backends and exposes the one entry point callers use.
*/

pub mod audit;
pub mod connection;
pub mod executor;
pub mod normalizer;
pub mod registry;
pub mod resolver;
pub mod selector;

use crate::catalog::{AssetInventoryInterface, CatalogStoreInterface};
use crate::errors::RelayResult;
use crate::types::{EngineConfig, ExecutionRequest, ExecutionResult};
use audit::{AuditRecorder, AuditSinkInterface};
use connection::{ConnectionManager, PoolConfig, ProtocolBackendInterface};
use cred_vault::CredentialVault;
use executor::ExecutionEngine;
use registry::ToolRegistry;
use selector::{EmbeddingProviderInterface, SelectorConfig, ToolSelector};
use std::sync::Arc;
use std::time::Duration;
use telemetry::TelemetrySystem;
use tracing::{info, warn};

/// Common lifecycle contract for all engines.
pub trait Engine: Send + Sync {
    /// Current state of the engine.
    fn get_state(&self) -> String;

    /// Names of collaborators this engine needs.
    fn get_dependencies(&self) -> Vec<String>;

    /// Check if the engine is healthy.
    fn health_check(&self) -> bool;

    /// Initialize the engine.
    fn initialize(&self) -> bool;

    /// Shutdown the engine.
    fn shutdown(&self) -> bool;
}

/// The wired engine set. Construct once at startup, share via `Arc`.
pub struct RelayEngines {
    pub registry: Arc<ToolRegistry>,
    pub selector: Arc<ToolSelector>,
    pub vault: Arc<CredentialVault>,
    pub connections: Arc<ConnectionManager>,
    pub auditor: Arc<AuditRecorder>,
    pub executor: Arc<ExecutionEngine>,
    pub telemetry: Arc<TelemetrySystem>,
    config: EngineConfig,
}

impl RelayEngines {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<dyn CatalogStoreInterface>,
        inventory: Arc<dyn AssetInventoryInterface>,
        provider: Arc<dyn EmbeddingProviderInterface>,
        vault: Arc<CredentialVault>,
        sink: Arc<dyn AuditSinkInterface>,
        backends: Vec<Arc<dyn ProtocolBackendInterface>>,
    ) -> Self {
        let telemetry = Arc::new(TelemetrySystem::new());
        let registry = Arc::new(ToolRegistry::new(catalog));
        let selector = Arc::new(ToolSelector::new(
            registry.clone(),
            provider,
            SelectorConfig {
                confidence_threshold: config.confidence_threshold,
                ambiguity_margin: config.ambiguity_margin,
                candidate_count: config.candidate_count,
            },
        ));
        let mut connections = ConnectionManager::new(
            PoolConfig {
                max_connections_per_target: config.max_connections_per_target,
                wait_policy: config.wait_policy,
                connect_timeout: Duration::from_millis(config.connect_timeout_ms),
                retry_backoff: Duration::from_millis(config.connect_retry_backoff_ms),
            },
            telemetry.clone(),
        );
        for backend in backends {
            connections = connections.with_backend(backend);
        }
        let connections = Arc::new(connections);
        let auditor = Arc::new(AuditRecorder::new(
            sink,
            config.max_audit_payload_bytes,
            telemetry.clone(),
        ));
        let executor = Arc::new(ExecutionEngine::new(
            config.clone(),
            registry.clone(),
            selector.clone(),
            vault.clone(),
            connections.clone(),
            auditor.clone(),
            inventory,
            telemetry.clone(),
        ));
        Self {
            registry,
            selector,
            vault,
            connections,
            auditor,
            executor,
            telemetry,
            config,
        }
    }

    fn engines(&self) -> Vec<(&'static str, &dyn Engine)> {
        vec![
            ("tool_registry", self.registry.as_ref()),
            ("tool_selector", self.selector.as_ref()),
            ("connection_manager", self.connections.as_ref()),
            ("audit_recorder", self.auditor.as_ref()),
            ("execution_engine", self.executor.as_ref()),
        ]
    }

    /// Load the first catalog snapshot and run each engine's
    /// initializer. Also starts the periodic catalog refresh.
    pub async fn initialize_all(&self) -> RelayResult<()> {
        let summary = self.registry.reload().await?;
        info!(
            added = summary.added,
            "initial catalog snapshot loaded"
        );
        let _refresh = self.registry.spawn_refresh(Duration::from_secs(
            self.config.catalog_refresh_interval_secs,
        ));
        for (name, engine) in self.engines() {
            if !engine.initialize() {
                warn!(engine = name, "engine failed to initialize");
            }
        }
        Ok(())
    }

    pub fn health_check_all(&self) -> bool {
        let mut healthy = true;
        for (name, engine) in self.engines() {
            if !engine.health_check() {
                warn!(engine = name, "engine unhealthy");
                healthy = false;
            }
        }
        healthy
    }

    pub fn shutdown_all(&self) {
        for (name, engine) in self.engines() {
            if !engine.shutdown() {
                warn!(engine = name, "engine did not shut down cleanly");
            }
        }
    }

    /// Convenience passthrough to the execution engine.
    pub async fn execute(&self, request: ExecutionRequest) -> RelayResult<ExecutionResult> {
        self.executor.execute(request).await
    }
}
