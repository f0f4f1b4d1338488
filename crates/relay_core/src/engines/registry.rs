/*!
# Tool Registry

Hot-reloadable, in-memory view of the tool catalog. The registry keeps
an immutable [`CatalogSnapshot`] behind an atomically swapped `Arc`:
readers clone the current `Arc` and are never blocked by (or exposed to
a torn view of) a reload in progress. A reload is all-or-nothing per
snapshot; on failure the previous snapshot stays live.
*/

use crate::catalog::CatalogStoreInterface;
use crate::engines::Engine;
use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::{Platform, ToolDefinition, ToolEmbedding};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Immutable point-in-time view of the published catalog.
pub struct CatalogSnapshot {
    tools: HashMap<String, Arc<ToolDefinition>>,
    embeddings: HashMap<String, ToolEmbedding>,
    pub version: u64,
    pub loaded_at: Instant,
}

impl CatalogSnapshot {
    fn empty() -> Self {
        Self {
            tools: HashMap::new(),
            embeddings: HashMap::new(),
            version: 0,
            loaded_at: Instant::now(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ToolDefinition>> {
        self.tools.get(name)
    }

    pub fn embedding(&self, name: &str) -> Option<&ToolEmbedding> {
        self.embeddings.get(name)
    }

    pub fn iter_tools(&self) -> impl Iterator<Item = &Arc<ToolDefinition>> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Platform/category restriction for listing and selection.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub platform: Option<Platform>,
    pub category: Option<String>,
}

impl CatalogFilter {
    pub fn matches(&self, definition: &ToolDefinition) -> bool {
        if let Some(platform) = self.platform {
            if definition.platform != platform {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if !definition.categories.iter().any(|c| c == category) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ToolExecutionStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub average_execution_time_ms: f64,
    pub last_execution: Option<SystemTime>,
}

pub struct ToolRegistry {
    catalog: Arc<dyn CatalogStoreInterface>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    execution_stats: RwLock<HashMap<String, ToolExecutionStats>>,
}

impl ToolRegistry {
    pub fn new(catalog: Arc<dyn CatalogStoreInterface>) -> Self {
        Self {
            catalog,
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::empty())),
            execution_stats: RwLock::new(HashMap::new()),
        }
    }

    /// Current snapshot. Holding the returned `Arc` pins that catalog
    /// version for the duration of a request.
    pub async fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn lookup(&self, name: &str) -> RelayResult<Arc<ToolDefinition>> {
        let snapshot = self.snapshot().await;
        snapshot.get(name).cloned().ok_or_else(|| {
            RelayError::new(
                ErrorCode::ToolNotFound,
                ErrorCategory::Resolution,
                ErrorSeverity::Medium,
                &format!("tool '{}' not found in catalog", name),
            )
        })
    }

    pub async fn list_all(&self, filter: &CatalogFilter) -> Vec<Arc<ToolDefinition>> {
        let snapshot = self.snapshot().await;
        let mut tools: Vec<Arc<ToolDefinition>> = snapshot
            .iter_tools()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Rebuild the snapshot from the catalog store and swap it in. Any
    /// invalid definition rejects the whole reload and keeps the
    /// previous snapshot live.
    pub async fn reload(&self) -> RelayResult<ReloadSummary> {
        let published = self.catalog.list_published_tools().await.map_err(|e| {
            warn!("catalog reload failed, keeping previous snapshot: {}", e);
            RelayError::new(
                ErrorCode::CatalogUnavailable,
                ErrorCategory::Resolution,
                ErrorSeverity::Medium,
                &format!("catalog unavailable: {}", e),
            )
        })?;

        let mut tools = HashMap::with_capacity(published.len());
        let mut embeddings = HashMap::with_capacity(published.len());
        for (definition, embedding) in published {
            Self::validate_definition(&definition, &embedding)?;
            embeddings.insert(definition.name.clone(), embedding);
            tools.insert(definition.name.clone(), Arc::new(definition));
        }

        let mut current = self.snapshot.write().await;
        let summary = Self::diff(&current.tools, &tools);
        let next = CatalogSnapshot {
            tools,
            embeddings,
            version: current.version + 1,
            loaded_at: Instant::now(),
        };
        info!(
            version = next.version,
            tools = next.len(),
            added = summary.added,
            removed = summary.removed,
            changed = summary.changed,
            "catalog snapshot swapped"
        );
        *current = Arc::new(next);
        Ok(summary)
    }

    fn validate_definition(
        definition: &ToolDefinition,
        embedding: &ToolEmbedding,
    ) -> RelayResult<()> {
        let reject = |reason: &str| {
            RelayError::new(
                ErrorCode::CatalogUnavailable,
                ErrorCategory::Resolution,
                ErrorSeverity::Medium,
                &format!(
                    "catalog reload rejected: tool '{}' {}",
                    definition.name, reason
                ),
            )
        };
        if definition.name.is_empty() || definition.version.is_empty() {
            return Err(reject("is missing name or version"));
        }
        if embedding.tool_name != definition.name {
            return Err(reject("has a mismatched embedding"));
        }
        if embedding.vector.is_empty() {
            return Err(reject("has an empty embedding vector"));
        }
        Ok(())
    }

    fn diff(
        old: &HashMap<String, Arc<ToolDefinition>>,
        new: &HashMap<String, Arc<ToolDefinition>>,
    ) -> ReloadSummary {
        let added = new.keys().filter(|k| !old.contains_key(*k)).count();
        let removed = old.keys().filter(|k| !new.contains_key(*k)).count();
        let changed = new
            .iter()
            .filter(|(name, def)| {
                old.get(*name)
                    .map(|previous| previous.version != def.version)
                    .unwrap_or(false)
            })
            .count();
        ReloadSummary {
            added,
            removed,
            changed,
        }
    }

    /// Age of the live snapshot, for the freshness invariant.
    pub async fn snapshot_age(&self) -> Duration {
        self.snapshot.read().await.loaded_at.elapsed()
    }

    pub async fn record_invocation(&self, name: &str, duration_ms: u64, success: bool) {
        let mut stats = self.execution_stats.write().await;
        let entry = stats.entry(name.to_string()).or_default();
        let previous_total = entry.total_executions as f64;
        entry.average_execution_time_ms = (entry.average_execution_time_ms * previous_total
            + duration_ms as f64)
            / (previous_total + 1.0);
        entry.total_executions += 1;
        if success {
            entry.successful_executions += 1;
        }
        entry.last_execution = Some(SystemTime::now());
    }

    pub async fn stats(&self, name: &str) -> Option<ToolExecutionStats> {
        self.execution_stats.read().await.get(name).cloned()
    }

    /// Periodic refresh loop. Failures only warn; lookups keep serving
    /// the previous snapshot.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately and performs the initial load.
            loop {
                ticker.tick().await;
                let replaced_after = registry.snapshot_age().await;
                match registry.reload().await {
                    Ok(summary) => {
                        debug!(
                            added = summary.added,
                            removed = summary.removed,
                            changed = summary.changed,
                            replaced_after_ms = replaced_after.as_millis() as u64,
                            "periodic catalog refresh complete"
                        );
                    }
                    Err(e) => warn!("periodic catalog refresh failed: {}", e),
                }
            }
        })
    }
}

impl Engine for ToolRegistry {
    fn get_state(&self) -> String {
        "ready".to_string()
    }

    fn get_dependencies(&self) -> Vec<String> {
        vec!["catalog_store".to_string()]
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalogStore;
    use crate::types::{ExecutionStrategy, ParameterSpec, ParameterType};

    fn definition(name: &str, version: &str, platform: Platform) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            version: version.to_string(),
            description: format!("{} tool", name),
            platform,
            categories: vec!["test".to_string()],
            priority: 0,
            parameters: vec![ParameterSpec::new("path", ParameterType::String, true)],
            strategy: ExecutionStrategy::CommandTemplate {
                template: "ls {{path}}".to_string(),
            },
        }
    }

    fn embedding(name: &str) -> ToolEmbedding {
        ToolEmbedding {
            tool_name: name.to_string(),
            vector: vec![1.0, 0.0, 0.0],
        }
    }

    #[tokio::test]
    async fn reload_round_trips_catalog_definitions() {
        let store = Arc::new(MemoryCatalogStore::new());
        store.publish(definition("disk_usage", "1.0.0", Platform::Linux), embedding("disk_usage"));
        let registry = ToolRegistry::new(store.clone());

        let summary = registry.reload().await.unwrap();
        assert_eq!(summary.added, 1);

        let found = registry.lookup("disk_usage").await.unwrap();
        let stored = store.get_tool_by_name("disk_usage").await.unwrap().unwrap();
        assert_eq!(found.version, stored.version);
        assert_eq!(found.parameters.len(), stored.parameters.len());
    }

    #[tokio::test]
    async fn reload_reports_added_removed_changed() {
        let store = Arc::new(MemoryCatalogStore::new());
        store.publish(definition("a", "1.0.0", Platform::Linux), embedding("a"));
        store.publish(definition("b", "1.0.0", Platform::Linux), embedding("b"));
        let registry = ToolRegistry::new(store.clone());
        registry.reload().await.unwrap();

        store.unpublish("b");
        store.publish(definition("a", "2.0.0", Platform::Linux), embedding("a"));
        store.publish(definition("c", "1.0.0", Platform::Windows), embedding("c"));

        let summary = registry.reload().await.unwrap();
        assert_eq!(
            summary,
            ReloadSummary {
                added: 1,
                removed: 1,
                changed: 1
            }
        );
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let store = Arc::new(MemoryCatalogStore::new());
        store.publish(definition("a", "1.0.0", Platform::Linux), embedding("a"));
        let registry = ToolRegistry::new(store.clone());
        registry.reload().await.unwrap();

        store.set_unavailable(true);
        let err = registry.reload().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CatalogUnavailable);

        // Lookups still answer from the old snapshot.
        assert!(registry.lookup("a").await.is_ok());
    }

    #[tokio::test]
    async fn invalid_definition_rejects_whole_reload() {
        let store = Arc::new(MemoryCatalogStore::new());
        store.publish(definition("a", "1.0.0", Platform::Linux), embedding("a"));
        let registry = ToolRegistry::new(store.clone());
        registry.reload().await.unwrap();

        store.publish(
            definition("broken", "1.0.0", Platform::Linux),
            ToolEmbedding {
                tool_name: "broken".to_string(),
                vector: vec![],
            },
        );
        assert!(registry.reload().await.is_err());
        // All-or-nothing: the valid tool from this batch did not land either.
        assert!(registry.lookup("a").await.is_ok());
        assert!(registry.lookup("broken").await.is_err());
    }

    #[tokio::test]
    async fn list_all_honors_filters_and_orders_by_name() {
        let store = Arc::new(MemoryCatalogStore::new());
        store.publish(definition("b", "1.0.0", Platform::Linux), embedding("b"));
        store.publish(definition("a", "1.0.0", Platform::Linux), embedding("a"));
        store.publish(definition("w", "1.0.0", Platform::Windows), embedding("w"));
        let registry = ToolRegistry::new(store);
        registry.reload().await.unwrap();

        let linux = registry
            .list_all(&CatalogFilter {
                platform: Some(Platform::Linux),
                category: None,
            })
            .await;
        let names: Vec<&str> = linux.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn invocation_stats_track_average_latency() {
        let store = Arc::new(MemoryCatalogStore::new());
        let registry = ToolRegistry::new(store);
        registry.record_invocation("t", 100, true).await;
        registry.record_invocation("t", 200, false).await;

        let stats = registry.stats("t").await.unwrap();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful_executions, 1);
        assert!((stats.average_execution_time_ms - 150.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reload_refreshes_snapshot_age() {
        let store = Arc::new(MemoryCatalogStore::new());
        let registry = ToolRegistry::new(store);
        registry.reload().await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.snapshot_age().await >= Duration::from_millis(30));

        registry.reload().await.unwrap();
        assert!(registry.snapshot_age().await < Duration::from_millis(30));
    }
}
