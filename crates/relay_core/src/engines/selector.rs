/*!
# Tool Selector

Ranks catalog entries against free-text intent by cosine similarity
between the intent embedding and each tool's precomputed embedding.
The embedding model is an external collaborator behind
[`EmbeddingProviderInterface`]; it must be deterministic for identical
input so ranking stays reproducible. Threshold and tie-break rules are
configuration, not constants.
*/

use crate::engines::registry::{CatalogFilter, ToolRegistry};
use crate::engines::Engine;
use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::ToolDefinition;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// External embedding provider contract. `embed` must return the same
/// vector for the same text.
#[async_trait]
pub trait EmbeddingProviderInterface: Send + Sync {
    async fn embed(&self, text: &str) -> RelayResult<Vec<f32>>;
    fn dimension(&self) -> usize;
}

/// A tool proposed as a match for free-text intent.
#[derive(Debug, Clone)]
pub struct ToolCandidate {
    pub definition: Arc<ToolDefinition>,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub confidence_threshold: f32,
    pub ambiguity_margin: f32,
    pub candidate_count: usize,
}

pub struct ToolSelector {
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn EmbeddingProviderInterface>,
    config: SelectorConfig,
}

impl ToolSelector {
    pub fn new(
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn EmbeddingProviderInterface>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            config,
        }
    }

    /// Top-`k` candidates for `intent`, restricted to entries passing
    /// `filter`. Does not choose among near-ties; that is `select`'s job.
    pub async fn rank(
        &self,
        intent: &str,
        filter: &CatalogFilter,
        k: usize,
    ) -> RelayResult<Vec<ToolCandidate>> {
        let query = self.provider.embed(intent).await?;
        let snapshot = self.registry.snapshot().await;

        let mut candidates: Vec<ToolCandidate> = snapshot
            .iter_tools()
            .filter(|definition| filter.matches(definition))
            .filter_map(|definition| {
                let embedding = snapshot.embedding(&definition.name)?;
                let score = cosine(&query, &embedding.vector);
                // Zero or negative similarity is not a match.
                (score > 0.0).then(|| ToolCandidate {
                    definition: definition.clone(),
                    score,
                })
            })
            .collect();

        // Descending score; ties broken by declared priority, then
        // lexical name order, for determinism.
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.definition.priority.cmp(&a.definition.priority))
                .then_with(|| a.definition.name.cmp(&b.definition.name))
        });
        candidates.truncate(k);
        Ok(candidates)
    }

    /// Single-candidate selection for the pipeline: the leader must
    /// clear the confidence threshold and beat the runner-up by the
    /// ambiguity margin.
    pub async fn select(&self, intent: &str, filter: &CatalogFilter) -> RelayResult<ToolCandidate> {
        let candidates = self
            .rank(intent, filter, self.config.candidate_count)
            .await?;

        let top = candidates.first().cloned().ok_or_else(|| {
            RelayError::new(
                ErrorCode::NoCandidate,
                ErrorCategory::Selection,
                ErrorSeverity::Medium,
                &format!("no tool matches intent '{}'", intent),
            )
        })?;

        if top.score < self.config.confidence_threshold {
            debug!(
                tool = %top.definition.name,
                score = top.score,
                threshold = self.config.confidence_threshold,
                "best candidate below confidence threshold"
            );
            return Err(RelayError::new(
                ErrorCode::AmbiguousSelection,
                ErrorCategory::Selection,
                ErrorSeverity::Medium,
                &format!(
                    "best candidate '{}' scored {:.2}, below threshold {:.2}",
                    top.definition.name, top.score, self.config.confidence_threshold
                ),
            ));
        }

        if let Some(runner_up) = candidates.get(1) {
            if top.score - runner_up.score < self.config.ambiguity_margin {
                return Err(RelayError::new(
                    ErrorCode::AmbiguousSelection,
                    ErrorCategory::Selection,
                    ErrorSeverity::Medium,
                    &format!(
                        "candidates '{}' ({:.2}) and '{}' ({:.2}) are too close to call",
                        top.definition.name,
                        top.score,
                        runner_up.definition.name,
                        runner_up.score
                    ),
                ));
            }
        }

        Ok(top)
    }
}

impl Engine for ToolSelector {
    fn get_state(&self) -> String {
        "ready".to_string()
    }

    fn get_dependencies(&self) -> Vec<String> {
        vec![
            "tool_registry".to_string(),
            "embedding_provider".to_string(),
        ]
    }

    fn health_check(&self) -> bool {
        self.provider.dimension() > 0
    }

    fn initialize(&self) -> bool {
        true
    }

    fn shutdown(&self) -> bool {
        true
    }
}

/// Cosine similarity; 0.0 for mismatched dimensions or zero vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Deterministic provider backed by a fixed text → vector table.
/// Unknown text maps to the zero vector (matches nothing). Suitable for
/// wiring and tests; production injects a real provider.
pub struct StaticEmbeddingProvider {
    dimension: usize,
    vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl StaticEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, text: &str, vector: Vec<f32>) {
        debug_assert_eq!(vector.len(), self.dimension);
        self.vectors.lock().unwrap().insert(text.to_string(), vector);
    }
}

#[async_trait]
impl EmbeddingProviderInterface for StaticEmbeddingProvider {
    async fn embed(&self, text: &str) -> RelayResult<Vec<f32>> {
        let vectors = self.vectors.lock().unwrap();
        Ok(vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.dimension]))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
