//! Integration tests for the Relay execution engine.
//! These tests drive full requests through the wired engine set with
//! in-memory stores and a real local shell backend.

#![cfg(test)]

use async_trait::async_trait;
use cred_vault::{seal, CipherRecord, CredentialVault, MemoryCredentialStore};
use relay_core::catalog::{MemoryAssetInventory, MemoryCatalogStore};
use relay_core::engines::connection::command_shell::CommandShellBackend;
use relay_core::engines::connection::{
    Connection, InvocationShape, ProtocolBackendInterface, RawOutput,
};
use relay_core::errors::{ErrorCode, RelayResult};
use relay_core::types::{
    ParameterSpec, ParameterType, TargetAsset, ToolEmbedding,
};
use relay_core::{
    EngineConfig, ExecutionRequest, ExecutionStrategy, MemoryAuditSink, Platform, Protocol,
    RelayEngines, StaticEmbeddingProvider, ToolDefinition,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const KEY: [u8; 32] = [7u8; 32];
const NONCE: [u8; 12] = [9u8; 12];

fn tool(
    name: &str,
    platform: Platform,
    template: &str,
    parameters: Vec<ParameterSpec>,
    vector: Vec<f32>,
) -> (ToolDefinition, ToolEmbedding) {
    (
        ToolDefinition {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: format!("test tool {name}"),
            platform,
            categories: vec!["test".to_string()],
            priority: 0,
            parameters,
            strategy: ExecutionStrategy::CommandTemplate {
                template: template.to_string(),
            },
        },
        ToolEmbedding {
            tool_name: name.to_string(),
            vector,
        },
    )
}

fn seeded_catalog() -> Arc<MemoryCatalogStore> {
    let catalog = Arc::new(MemoryCatalogStore::new());
    let (d, e) = tool(
        "restart-service",
        Platform::Linux,
        "echo restarting {{service}}",
        vec![ParameterSpec::new("service", ParameterType::String, true)],
        vec![1.0, 0.0, 0.0],
    );
    catalog.publish(d, e);
    let (d, e) = tool(
        "check-disk",
        Platform::Linux,
        "echo disk ok",
        vec![],
        vec![0.0, 1.0, 0.0],
    );
    catalog.publish(d, e);
    // Same embedding as restart-service but for another platform; it
    // must never collide with Linux-targeted requests.
    let (d, e) = tool(
        "restart-service-win",
        Platform::Windows,
        "echo windows restart",
        vec![],
        vec![1.0, 0.0, 0.0],
    );
    catalog.publish(d, e);
    let (d, e) = tool(
        "provision-user",
        Platform::Linux,
        "echo adduser {{username}} --quota {{quota_gb}}",
        vec![
            ParameterSpec::new("username", ParameterType::String, true),
            ParameterSpec::new("quota_gb", ParameterType::Int, true),
        ],
        vec![0.0, 0.0, 1.0],
    );
    catalog.publish(d, e);
    let (d, e) = tool(
        "slow-noop",
        Platform::Linux,
        "sleep 5",
        vec![],
        vec![0.5, 0.5, 0.0],
    );
    catalog.publish(d, e);
    let (d, e) = tool(
        "failing-probe",
        Platform::Linux,
        "echo permission denied >&2; exit 1",
        vec![],
        vec![0.0, 0.5, 0.5],
    );
    catalog.publish(d, e);
    let (mut d, e) = tool(
        "rotate-secret",
        Platform::Linux,
        "echo rotating",
        vec![ParameterSpec::new("new_secret", ParameterType::String, true)],
        vec![0.3, 0.3, 0.3],
    );
    d.parameters[0].sensitive = true;
    catalog.publish(d, e);
    catalog
}

fn seeded_inventory() -> Arc<MemoryAssetInventory> {
    let inventory = Arc::new(MemoryAssetInventory::new());
    let mut metadata = HashMap::new();
    metadata.insert("service".to_string(), "nginx".to_string());
    inventory.register(TargetAsset {
        id: "web-01".to_string(),
        hostname: "web-01.internal".to_string(),
        address: "127.0.0.1".to_string(),
        platform: Platform::Linux,
        management_endpoint: None,
        metadata,
    });
    inventory.register(TargetAsset {
        id: "bare-host".to_string(),
        hostname: "bare-host.internal".to_string(),
        address: "127.0.0.2".to_string(),
        platform: Platform::Linux,
        management_endpoint: None,
        metadata: HashMap::new(),
    });
    inventory
}

fn seeded_vault() -> Arc<CredentialVault> {
    let store = MemoryCredentialStore::new();
    store.insert(CipherRecord {
        target_id: "web-01".to_string(),
        protocol: "command-shell".to_string(),
        key_ref: "test".to_string(),
        nonce: NONCE.to_vec(),
        ciphertext: seal(&KEY, &NONCE, b"shell-password").expect("seal should succeed"),
    });
    // bare-host deliberately has no credential on record.
    Arc::new(CredentialVault::new(Arc::new(store)).with_key("test", KEY))
}

fn seeded_provider() -> Arc<StaticEmbeddingProvider> {
    let provider = Arc::new(StaticEmbeddingProvider::new(3));
    provider.insert("restart the web service", vec![1.0, 0.0, 0.0]);
    provider.insert("how full are the disks", vec![0.0, 1.0, 0.0]);
    provider
}

async fn engines_with(config: EngineConfig) -> (RelayEngines, Arc<MemoryAuditSink>) {
    let sink = Arc::new(MemoryAuditSink::new());
    let engines = RelayEngines::new(
        config,
        seeded_catalog(),
        seeded_inventory(),
        seeded_provider(),
        seeded_vault(),
        sink.clone(),
        vec![Arc::new(CommandShellBackend::local())],
    );
    engines
        .initialize_all()
        .await
        .expect("engines should initialize");
    (engines, sink)
}

async fn engines() -> (RelayEngines, Arc<MemoryAuditSink>) {
    engines_with(EngineConfig::default()).await
}

#[tokio::test]
async fn intent_execution_end_to_end() {
    let (engines, sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01")
        .with_intent("restart the web service")
        .with_parameter("service", json!("postgres"));
    let result = engines.execute(request).await.expect("execution should succeed");

    assert!(result.success);
    assert_eq!(result.status_code, 0);
    assert!(result.output.contains("restarting postgres"));
    assert_eq!(result.invocations.len(), 1);
    assert_eq!(result.invocations[0].tool_name, "restart-service");

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tool_name.as_deref(), Some("restart-service"));
    assert!(records[0].success);
}

#[tokio::test]
async fn omitted_parameter_is_enriched_from_target_metadata() {
    let (engines, _sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01").with_tool("restart-service");
    let result = engines.execute(request).await.expect("execution should succeed");

    // "service" came from the asset's metadata.
    assert!(result.output.contains("restarting nginx"));
}

#[tokio::test]
async fn unrelated_intent_yields_no_candidate_and_is_audited() {
    let (engines, sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01")
        .with_intent("fold the laundry");
    let err = engines.execute(request).await.expect_err("should not match");

    assert_eq!(err.code, ErrorCode::NoCandidate);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].tool_name.is_none());
    assert!(!records[0].success);
    assert_eq!(records[0].error_class.as_deref(), Some("NoCandidate"));
}

#[tokio::test]
async fn selection_is_scoped_to_the_target_platform() {
    let (engines, _sink) = engines().await;

    // Two tools share the intent's embedding; only the Linux one is
    // eligible for a Linux target, so selection is unambiguous.
    let request = ExecutionRequest::new("ops", "web-01")
        .with_intent("restart the web service")
        .with_parameter("service", json!("nginx"));
    let result = engines.execute(request).await.expect("execution should succeed");
    assert!(result.output.contains("restarting"));
    assert!(!result.output.contains("windows"));
}

#[tokio::test]
async fn validation_reports_every_violation_at_once() {
    let (engines, sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01").with_tool("provision-user");
    let err = engines.execute(request).await.expect_err("should fail validation");

    assert_eq!(err.code, ErrorCode::ParameterValidation);
    let details = err.details.join("\n");
    assert!(details.contains("username"), "details: {details}");
    assert!(details.contains("quota_gb"), "details: {details}");

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_class.as_deref(), Some("ParameterValidation"));
}

#[tokio::test]
async fn explicit_tool_name_skips_selection() {
    // No embedding provider entry exists for this phrasing; lookup by
    // name must not need one.
    let (engines, _sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01").with_tool("check-disk");
    let result = engines.execute(request).await.expect("execution should succeed");
    assert!(result.success);
    assert!(result.output.contains("disk ok"));
}

#[tokio::test]
async fn unknown_tool_name_is_rejected() {
    let (engines, _sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01").with_tool("not-a-tool");
    let err = engines.execute(request).await.expect_err("should fail lookup");
    assert_eq!(err.code, ErrorCode::ToolNotFound);
}

#[tokio::test]
async fn semantic_failure_is_a_result_not_an_error() {
    let (engines, sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01").with_tool("failing-probe");
    let result = engines.execute(request).await.expect("pipeline should complete");

    assert!(!result.success);
    assert_eq!(result.status_code, 1);
    assert!(result.output.contains("permission denied"));
    assert_eq!(result.error_class.as_deref(), Some("command-failed"));

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].status_code, 1);
}

#[tokio::test]
async fn execution_budget_is_enforced() {
    let (engines, sink) = engines().await;

    let mut request = ExecutionRequest::new("ops", "web-01").with_tool("slow-noop");
    request.timeout_ms = Some(150);
    let err = engines.execute(request).await.expect_err("should time out");

    assert_eq!(err.code, ErrorCode::ExecutionTimeout);
    assert_eq!(engines.telemetry.counter("executions_timed_out"), 1);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_class.as_deref(), Some("ExecutionTimeout"));
}

#[tokio::test]
async fn missing_credential_stops_the_pipeline() {
    let (engines, sink) = engines().await;

    let request = ExecutionRequest::new("ops", "bare-host").with_tool("check-disk");
    let err = engines.execute(request).await.expect_err("should fail resolution");

    assert_eq!(err.code, ErrorCode::CredentialNotFound);
    assert_eq!(sink.records().len(), 1);
}

#[tokio::test]
async fn sensitive_parameters_never_reach_the_audit_trail() {
    let (engines, sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01")
        .with_tool("rotate-secret")
        .with_parameter("new_secret", json!("hunter2"));
    engines.execute(request).await.expect("execution should succeed");

    let records = sink.records();
    assert_eq!(records.len(), 1);
    let serialized = serde_json::to_string(&records[0].input).expect("input serializes");
    assert!(!serialized.contains("hunter2"));
    assert!(serialized.contains("[REDACTED]"));
}

#[tokio::test]
async fn replayed_trace_id_produces_distinct_audit_records() {
    let (engines, sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01").with_tool("check-disk");
    let replay = request.clone();
    engines.execute(request).await.expect("first run succeeds");
    engines.execute(replay).await.expect("replay succeeds");

    let records = sink.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].trace_id, records[1].trace_id);
}

#[tokio::test]
async fn execution_counters_are_recorded() {
    let (engines, _sink) = engines().await;

    let request = ExecutionRequest::new("ops", "web-01").with_tool("check-disk");
    engines.execute(request).await.expect("execution should succeed");

    assert_eq!(engines.telemetry.counter("executions_started"), 1);
    assert_eq!(engines.telemetry.counter("executions_succeeded"), 1);
    assert_eq!(engines.telemetry.counter("connections_built"), 1);
    assert_eq!(engines.telemetry.counter("audit_records"), 1);

    let stats = engines
        .registry
        .stats("check-disk")
        .await
        .expect("stats should exist after a run");
    assert_eq!(stats.total_executions, 1);
    assert_eq!(stats.successful_executions, 1);
}

#[tokio::test]
async fn newly_published_tools_appear_after_reload() {
    let catalog = seeded_catalog();
    let sink = Arc::new(MemoryAuditSink::new());
    let engines = RelayEngines::new(
        EngineConfig::default(),
        catalog.clone(),
        seeded_inventory(),
        seeded_provider(),
        seeded_vault(),
        sink,
        vec![Arc::new(CommandShellBackend::local())],
    );
    engines.initialize_all().await.expect("engines should initialize");

    let request = ExecutionRequest::new("ops", "web-01").with_tool("echo-hello");
    let err = engines.execute(request).await.expect_err("not yet published");
    assert_eq!(err.code, ErrorCode::ToolNotFound);

    let (d, e) = tool(
        "echo-hello",
        Platform::Linux,
        "echo hello",
        vec![],
        vec![0.2, 0.2, 0.6],
    );
    catalog.publish(d, e);
    engines.registry.reload().await.expect("reload should succeed");

    let request = ExecutionRequest::new("ops", "web-01").with_tool("echo-hello");
    let result = engines.execute(request).await.expect("visible after reload");
    assert!(result.success);
}

/// Backend that records its own concurrency high-water mark.
struct CountingBackend {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingBackend {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProtocolBackendInterface for CountingBackend {
    fn protocol(&self) -> Protocol {
        Protocol::CommandShell
    }

    async fn connect(
        &self,
        asset: &TargetAsset,
        _secret: &[u8],
        _timeout: Duration,
    ) -> RelayResult<Connection> {
        Ok(Connection::new(&asset.id, Protocol::CommandShell, Box::new(())))
    }

    async fn invoke(
        &self,
        _connection: &mut Connection,
        _shape: &InvocationShape,
        _timeout: Duration,
    ) -> RelayResult<RawOutput> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(RawOutput::Command {
            exit_code: 0,
            stdout: "done".to_string(),
            stderr: String::new(),
        })
    }

    async fn probe(&self, _connection: &Connection) -> bool {
        true
    }

    async fn close(&self, _connection: Connection) {}
}

#[tokio::test]
async fn per_target_concurrency_never_exceeds_the_limit() {
    let backend = Arc::new(CountingBackend::new());
    let sink = Arc::new(MemoryAuditSink::new());
    let mut config = EngineConfig::default();
    config.max_connections_per_target = 4;
    let engines = Arc::new(RelayEngines::new(
        config,
        seeded_catalog(),
        seeded_inventory(),
        seeded_provider(),
        seeded_vault(),
        sink,
        vec![backend.clone()],
    ));
    engines.initialize_all().await.expect("engines should initialize");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engines = engines.clone();
        handles.push(tokio::spawn(async move {
            let request = ExecutionRequest::new("ops", "web-01").with_tool("check-disk");
            engines.execute(request).await
        }));
    }
    for handle in handles {
        let result = handle.await.expect("task should not panic");
        assert!(result.expect("execution should succeed").success);
    }

    assert!(
        backend.peak.load(Ordering::SeqCst) <= 4,
        "peak concurrency {} exceeded the per-target limit",
        backend.peak.load(Ordering::SeqCst)
    );
}
