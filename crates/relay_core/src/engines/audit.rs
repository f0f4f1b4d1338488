//! Audit trail. Every execution attempt leaves exactly one record,
//! successful or not. Sensitive parameters are redacted before the
//! record is built and payloads are size-bounded; a failing sink is
//! logged and never fails the execution it describes.

use crate::engines::normalizer::bound_utf8;
use crate::engines::Engine;
use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::{AuditRecord, ToolDefinition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use telemetry::TelemetrySystem;
use tracing::warn;

pub const REDACTED: &str = "[REDACTED]";

#[async_trait]
pub trait AuditSinkInterface: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> RelayResult<()>;
}

/// Build the audit copy of the request parameters, replacing values of
/// parameters the tool marks sensitive. Parameters not declared by the
/// tool (or when no tool was resolved) are kept as-is.
pub fn redact_input(
    definition: Option<&ToolDefinition>,
    parameters: &HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (name, value) in parameters {
        let sensitive = definition
            .and_then(|d| d.parameter(name))
            .map(|p| p.sensitive)
            .unwrap_or(false);
        if sensitive {
            out.insert(name.clone(), serde_json::Value::String(REDACTED.to_string()));
        } else {
            out.insert(name.clone(), value.clone());
        }
    }
    serde_json::Value::Object(out)
}

pub struct AuditRecorder {
    sink: Arc<dyn AuditSinkInterface>,
    max_payload_bytes: usize,
    telemetry: Arc<TelemetrySystem>,
}

impl AuditRecorder {
    pub fn new(
        sink: Arc<dyn AuditSinkInterface>,
        max_payload_bytes: usize,
        telemetry: Arc<TelemetrySystem>,
    ) -> Self {
        Self {
            sink,
            max_payload_bytes,
            telemetry,
        }
    }

    /// Bound the record's payloads and hand it to the sink. Sink
    /// failures are reported out-of-band only.
    pub async fn record(&self, mut record: AuditRecord) {
        let (excerpt, _) = bound_utf8(record.output_excerpt, self.max_payload_bytes);
        record.output_excerpt = excerpt;
        if let Ok(serialized) = serde_json::to_string(&record.input) {
            if serialized.len() > self.max_payload_bytes {
                let (bounded, _) = bound_utf8(serialized, self.max_payload_bytes);
                record.input = serde_json::Value::String(bounded);
                record.input_truncated = true;
            }
        }

        self.telemetry.incr("audit_records");
        if let Err(e) = self.sink.record(&record).await {
            self.telemetry.incr("audit_sink_failures");
            warn!(trace_id = %record.trace_id, "audit sink rejected record: {}", e);
        }
    }
}

impl Engine for AuditRecorder {
    fn get_state(&self) -> String {
        "ready".to_string()
    }

    fn get_dependencies(&self) -> Vec<String> {
        vec!["audit_sink".to_string()]
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

/// In-memory sink for development and tests.
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    fail: Mutex<bool>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSinkInterface for MemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> RelayResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(RelayError::new(
                ErrorCode::AuditSinkError,
                ErrorCategory::Audit,
                ErrorSeverity::Medium,
                "sink unavailable",
            ));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
