use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ==========================================
// TOOL CATALOG TYPES
// ==========================================

/// Target platform a tool is published for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Windows,
    Linux,
    NetworkDevice,
    Http,
}

/// Wire protocol used to reach a target. Derived from the tool's
/// execution strategy, never chosen by the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    CommandShell,
    RemoteManagement,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::CommandShell => "command-shell",
            Protocol::RemoteManagement => "remote-management",
            Protocol::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Int,
    Float,
    Bool,
    List,
}

/// One declared parameter in a tool's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub param_type: ParameterType,
    pub description: String,
    pub required: bool,
    pub default_value: Option<serde_json::Value>,
    /// Redacted to a fixed placeholder before any audit record leaves
    /// the engine.
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub pattern: Option<String>,
}

impl ParameterSpec {
    pub fn new(name: &str, param_type: ParameterType, required: bool) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            description: String::new(),
            required,
            default_value: None,
            sensitive: false,
            min: None,
            max: None,
            pattern: None,
        }
    }
}

/// How a tool is carried out against its target. Placeholders of the
/// form `{{name}}` are rendered from resolved parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    CommandTemplate {
        template: String,
    },
    RemoteManagementCall {
        action: String,
    },
    HttpTemplate {
        method: String,
        url_template: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body_template: Option<String>,
    },
}

impl ExecutionStrategy {
    pub fn protocol(&self) -> Protocol {
        match self {
            ExecutionStrategy::CommandTemplate { .. } => Protocol::CommandShell,
            ExecutionStrategy::RemoteManagementCall { .. } => Protocol::RemoteManagement,
            ExecutionStrategy::HttpTemplate { .. } => Protocol::Http,
        }
    }
}

/// Declarative description of one automation tool. Immutable once
/// published; a new version supersedes rather than mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub version: String,
    pub description: String,
    pub platform: Platform,
    pub categories: Vec<String>,
    /// Tie-break for selection among equal similarity scores.
    pub priority: i32,
    pub parameters: Vec<ParameterSpec>,
    pub strategy: ExecutionStrategy,
}

impl ToolDefinition {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Fixed-dimension vector for similarity ranking. No semantic guarantee
/// beyond "closer vectors are more relevant".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEmbedding {
    pub tool_name: String,
    pub vector: Vec<f32>,
}

// ==========================================
// TARGET ASSETS
// ==========================================

/// Recorded facts about an addressable target, used for parameter
/// enrichment and connection establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetAsset {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub platform: Platform,
    /// Endpoint for remote-management calls, where the target has one.
    pub management_endpoint: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

// ==========================================
// REQUEST & RESULT CONTRACT
// ==========================================

/// Caller-supplied request. Created per call; never persisted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub trace_id: Uuid,
    pub caller_id: String,
    pub target_id: String,
    /// Explicit tool name; when absent, `intent` drives selection.
    pub tool_name: Option<String>,
    pub intent: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
    /// Bounded by `EngineConfig::max_timeout_ms`.
    pub timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(caller_id: &str, target_id: &str) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            caller_id: caller_id.to_string(),
            target_id: target_id.to_string(),
            tool_name: None,
            intent: None,
            parameters: HashMap::new(),
            timeout_ms: None,
        }
    }

    pub fn with_tool(mut self, name: &str) -> Self {
        self.tool_name = Some(name.to_string());
        self
    }

    pub fn with_intent(mut self, intent: &str) -> Self {
        self.intent = Some(intent.to_string());
        self
    }

    pub fn with_parameter(mut self, name: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(name.to_string(), value);
        self
    }
}

/// One sub-tool invocation inside a request's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub tool_name: String,
    pub duration_ms: u64,
    pub success: bool,
}

/// Standardized result shape across all protocols. Immutable once
/// produced; handed to the caller and the audit recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub status_code: i64,
    pub output: String,
    pub truncated: bool,
    pub invocations: Vec<ToolInvocationRecord>,
    pub duration_ms: u64,
    pub error_class: Option<String>,
}

// ==========================================
// AUDIT
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub trace_id: Uuid,
    pub caller_id: String,
    pub target_id: String,
    pub tool_name: Option<String>,
    pub tool_version: Option<String>,
    pub success: bool,
    pub status_code: i64,
    /// Redacted and size-bounded copy of the request parameters.
    pub input: serde_json::Value,
    /// True when the input copy was cut down to fit the size bound.
    #[serde(default)]
    pub input_truncated: bool,
    /// Size-bounded excerpt of the captured output.
    pub output_excerpt: String,
    pub invocations: Vec<ToolInvocationRecord>,
    pub duration_ms: u64,
    pub error_class: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ==========================================
// ENGINE CONFIGURATION
// ==========================================

/// What to do when a target pool is at capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum WaitPolicy {
    /// Wait for a slot, bounded by the connect timeout.
    Block,
    /// Fail immediately with `PoolExhausted`.
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// A lone candidate below this similarity score is rejected.
    pub confidence_threshold: f32,
    /// The top candidate must lead the runner-up by at least this much.
    pub ambiguity_margin: f32,
    /// Candidates fetched per selection round.
    pub candidate_count: usize,
    pub max_connections_per_target: usize,
    pub wait_policy: WaitPolicy,
    pub connect_timeout_ms: u64,
    pub connect_retry_backoff_ms: u64,
    pub default_timeout_ms: u64,
    /// Hard ceiling for caller-supplied timeout overrides.
    pub max_timeout_ms: u64,
    pub catalog_refresh_interval_secs: u64,
    pub max_output_bytes: usize,
    pub max_audit_payload_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            ambiguity_margin: 0.05,
            candidate_count: 5,
            max_connections_per_target: 4,
            wait_policy: WaitPolicy::Block,
            connect_timeout_ms: 10_000,
            connect_retry_backoff_ms: 250,
            default_timeout_ms: 60_000,  // 1 minute
            max_timeout_ms: 300_000,     // 5 minutes
            catalog_refresh_interval_secs: 60,
            max_output_bytes: 64 * 1024,
            max_audit_payload_bytes: 8 * 1024,
        }
    }
}
