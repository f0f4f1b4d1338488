/*!
# Relay Core - Unified Tool Execution Engine

This crate contains the core Relay execution engine. It takes a
caller's request (an explicit tool name or free-text intent), picks the
right tool from the published catalog, validates parameters against the
tool's schema, and runs it against a target over the tool's protocol,
producing one normalized result and one audit record per attempt.

## Architecture

The engine consists of several key components:

- **Tool Registry**: Atomic in-memory snapshot of the published catalog
- **Tool Selector**: Embedding-similarity matching of intent to tools
- **Parameter Resolver**: Schema validation, coercion, and enrichment
- **Connection Manager**: Bounded per-target pools over three protocols
- **Execution Engine**: The pipeline orchestrator
- **Result Normalizer**: One result shape across all protocols
- **Audit Recorder**: Redacted, size-bounded execution trail
*/

pub mod catalog;
pub mod engines;
pub mod errors;
pub mod types;

// Re-export main components
pub use engines::audit::{AuditRecorder, AuditSinkInterface, MemoryAuditSink};
pub use engines::connection::{ConnectionManager, ProtocolBackendInterface};
pub use engines::executor::ExecutionEngine;
pub use engines::registry::{CatalogFilter, ToolRegistry};
pub use engines::selector::{EmbeddingProviderInterface, StaticEmbeddingProvider, ToolSelector};
pub use engines::{Engine, RelayEngines};
pub use errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
pub use types::{
    EngineConfig, ExecutionRequest, ExecutionResult, ExecutionStrategy, ParameterSpec,
    ParameterType, Platform, Protocol, TargetAsset, ToolDefinition, ToolEmbedding, WaitPolicy,
};

/// Version of the engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
