/*!
# Execution Engine

Drives a request through the full pipeline: select (or look up) the
tool, resolve and validate parameters, fetch the credential, check a
connection out of the pool, invoke, normalize, and record. One audit
record is produced per attempt no matter where the pipeline stops.

The execution budget covers validation through invocation. Selection
and lookup run outside it, audit recording always completes.
*/

use crate::catalog::AssetInventoryInterface;
use crate::engines::audit::{redact_input, AuditRecorder};
use crate::engines::connection::{ConnectionManager, InvocationShape, RawOutput};
use crate::engines::normalizer::ResultNormalizer;
use crate::engines::registry::{CatalogFilter, ToolRegistry};
use crate::engines::resolver::ParameterResolver;
use crate::engines::selector::ToolSelector;
use crate::engines::Engine;
use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::{
    AuditRecord, EngineConfig, ExecutionRequest, ExecutionResult, ExecutionStrategy, TargetAsset,
    ToolDefinition, ToolInvocationRecord,
};
use chrono::Utc;
use cred_vault::CredentialVault;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use telemetry::TelemetrySystem;
use tracing::{debug, info, warn};

pub struct ExecutionEngine {
    registry: Arc<ToolRegistry>,
    selector: Arc<ToolSelector>,
    resolver: ParameterResolver,
    vault: Arc<CredentialVault>,
    connections: Arc<ConnectionManager>,
    normalizer: ResultNormalizer,
    auditor: Arc<AuditRecorder>,
    inventory: Arc<dyn AssetInventoryInterface>,
    telemetry: Arc<TelemetrySystem>,
    config: EngineConfig,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        registry: Arc<ToolRegistry>,
        selector: Arc<ToolSelector>,
        vault: Arc<CredentialVault>,
        connections: Arc<ConnectionManager>,
        auditor: Arc<AuditRecorder>,
        inventory: Arc<dyn AssetInventoryInterface>,
        telemetry: Arc<TelemetrySystem>,
    ) -> Self {
        Self {
            registry,
            selector,
            resolver: ParameterResolver::new(),
            vault,
            connections,
            normalizer: ResultNormalizer::new(config.max_output_bytes),
            auditor,
            inventory,
            telemetry,
            config,
        }
    }

    /// Execute one request end to end. Semantic failures (the tool ran
    /// and reported failure) come back as `Ok` with `success = false`;
    /// `Err` means the pipeline itself stopped.
    pub async fn execute(&self, request: ExecutionRequest) -> RelayResult<ExecutionResult> {
        let started = Instant::now();
        self.telemetry.incr("executions_started");
        debug!(trace_id = %request.trace_id, caller = %request.caller_id,
            target = %request.target_id, "execution started");

        let mut definition: Option<Arc<ToolDefinition>> = None;
        let result = self.run(&request, &mut definition).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(r) if r.success => self.telemetry.incr("executions_succeeded"),
            Ok(_) => self.telemetry.incr("executions_semantic_failures"),
            Err(e) => {
                self.telemetry.incr("executions_failed");
                if e.is_timeout() {
                    self.telemetry.incr("executions_timed_out");
                }
                warn!(trace_id = %request.trace_id, code = ?e.code, "execution failed: {}", e);
            }
        }

        let record = AuditRecord {
            trace_id: request.trace_id,
            caller_id: request.caller_id.clone(),
            target_id: request.target_id.clone(),
            tool_name: definition.as_ref().map(|d| d.name.clone()),
            tool_version: definition.as_ref().map(|d| d.version.clone()),
            success: result.as_ref().map(|r| r.success).unwrap_or(false),
            status_code: result.as_ref().map(|r| r.status_code).unwrap_or(-1),
            input: redact_input(definition.as_deref(), &request.parameters),
            input_truncated: false,
            output_excerpt: result
                .as_ref()
                .map(|r| r.output.clone())
                .unwrap_or_default(),
            invocations: result
                .as_ref()
                .map(|r| r.invocations.clone())
                .unwrap_or_default(),
            duration_ms,
            error_class: match &result {
                Ok(r) => r.error_class.clone(),
                Err(e) => Some(format!("{:?}", e.code)),
            },
            timestamp: Utc::now(),
        };
        self.auditor.record(record).await;

        result
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        definition_slot: &mut Option<Arc<ToolDefinition>>,
    ) -> RelayResult<ExecutionResult> {
        let asset = self
            .inventory
            .get_asset(&request.target_id)
            .await?
            .ok_or_else(|| {
                RelayError::new(
                    ErrorCode::ConfigError,
                    ErrorCategory::Resolution,
                    ErrorSeverity::Medium,
                    &format!("unknown target '{}'", request.target_id),
                )
            })?;

        // Explicit tool names bypass selection entirely.
        let definition = match &request.tool_name {
            Some(name) => self.registry.lookup(name).await?,
            None => {
                let intent = request.intent.as_deref().ok_or_else(|| {
                    RelayError::new(
                        ErrorCode::ConfigError,
                        ErrorCategory::Selection,
                        ErrorSeverity::Medium,
                        "request carries neither a tool name nor an intent",
                    )
                })?;
                let filter = CatalogFilter {
                    platform: Some(asset.platform),
                    category: None,
                };
                let candidate = self.selector.select(intent, &filter).await?;
                info!(trace_id = %request.trace_id, tool = %candidate.definition.name,
                    score = candidate.score, "selected tool for intent");
                candidate.definition
            }
        };
        *definition_slot = Some(definition.clone());

        let budget = Duration::from_millis(
            request
                .timeout_ms
                .unwrap_or(self.config.default_timeout_ms)
                .min(self.config.max_timeout_ms),
        );

        let budgeted = tokio::time::timeout(
            budget,
            self.run_budgeted(request, &definition, &asset, budget),
        )
        .await;
        let (raw, exec_ms) = match budgeted {
            Ok(outcome) => outcome?,
            // Any connection checked out inside the cancelled future is
            // dropped, not pooled; it is never reused.
            Err(_) => {
                return Err(RelayError::new(
                    ErrorCode::ExecutionTimeout,
                    ErrorCategory::Execution,
                    ErrorSeverity::Medium,
                    &format!("execution budget of {}ms exhausted", budget.as_millis()),
                ))
            }
        };

        debug!(trace_id = %request.trace_id, "normalizing result");
        let mut result = self.normalizer.normalize(raw, exec_ms);
        result.invocations.push(ToolInvocationRecord {
            tool_name: definition.name.clone(),
            duration_ms: exec_ms,
            success: result.success,
        });
        self.registry
            .record_invocation(&definition.name, exec_ms, result.success)
            .await;
        Ok(result)
    }

    /// The stages the execution budget covers: validate, fetch the
    /// credential, connect, invoke.
    async fn run_budgeted(
        &self,
        request: &ExecutionRequest,
        definition: &Arc<ToolDefinition>,
        asset: &TargetAsset,
        budget: Duration,
    ) -> RelayResult<(RawOutput, u64)> {
        debug!(trace_id = %request.trace_id, tool = %definition.name, "validating parameters");
        let resolved = self
            .resolver
            .resolve(definition, &request.parameters, Some(asset))?;

        let protocol = definition.strategy.protocol();
        debug!(trace_id = %request.trace_id, protocol = protocol.as_str(), "resolving credential");
        let credential = self.vault.resolve(&asset.id, protocol.as_str()).await?;

        // The credential is needed only for the handshake; release it
        // whether or not the connection was established.
        let acquired = self.connections.acquire(asset, protocol, &credential).await;
        credential.release();
        let mut pooled = acquired?;

        let shape = render_shape(&definition.strategy, &resolved)?;
        debug!(trace_id = %request.trace_id, tool = %definition.name, "invoking");
        let exec_started = Instant::now();
        match self.connections.invoke(&mut pooled, &shape, budget).await {
            Ok(raw) => {
                let exec_ms = exec_started.elapsed().as_millis() as u64;
                self.connections.release(pooled).await;
                Ok((raw, exec_ms))
            }
            Err(e) => {
                // The remote side may still be mid-operation; the
                // connection's state is unknown and it must not be
                // reused.
                self.connections.invalidate(pooled).await;
                Err(e)
            }
        }
    }
}

impl Engine for ExecutionEngine {
    fn get_state(&self) -> String {
        "ready".to_string()
    }

    fn get_dependencies(&self) -> Vec<String> {
        vec![
            "tool_registry".to_string(),
            "tool_selector".to_string(),
            "credential_vault".to_string(),
            "connection_manager".to_string(),
            "audit_recorder".to_string(),
        ]
    }

    fn health_check(&self) -> bool {
        true
    }

    fn initialize(&self) -> bool {
        true
    }

    fn shutdown(&self) -> bool {
        true
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("placeholder pattern is valid")
    })
}

/// Substitute `{{name}}` placeholders with resolved parameter values.
/// A placeholder with no matching parameter is a tool-definition bug,
/// not a caller error.
pub fn render_template(
    template: &str,
    parameters: &HashMap<String, serde_json::Value>,
) -> RelayResult<String> {
    let re = placeholder_regex();
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in re.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = parameters.get(name.as_str()).ok_or_else(|| {
            RelayError::new(
                ErrorCode::ConfigError,
                ErrorCategory::Configuration,
                ErrorSeverity::High,
                &format!(
                    "template references undeclared parameter '{}'",
                    name.as_str()
                ),
            )
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(&render_value(value));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_shape(
    strategy: &ExecutionStrategy,
    parameters: &HashMap<String, serde_json::Value>,
) -> RelayResult<InvocationShape> {
    match strategy {
        ExecutionStrategy::CommandTemplate { template } => Ok(InvocationShape::Command {
            command_line: render_template(template, parameters)?,
        }),
        ExecutionStrategy::RemoteManagementCall { action } => Ok(InvocationShape::ManagementCall {
            action: action.clone(),
            parameters: serde_json::to_value(parameters)?,
        }),
        ExecutionStrategy::HttpTemplate {
            method,
            url_template,
            headers,
            body_template,
        } => Ok(InvocationShape::HttpRequest {
            method: method.clone(),
            url: render_template(url_template, parameters)?,
            headers: headers.clone(),
            body: body_template
                .as_ref()
                .map(|t| render_template(t, parameters))
                .transpose()?,
        }),
    }
}
