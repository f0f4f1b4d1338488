//! Contracts for the durable tool catalog and the asset inventory,
//! plus in-memory implementations used for wiring and tests. The real
//! stores are external collaborators.

use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::{TargetAsset, ToolDefinition, ToolEmbedding};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable, versioned table of tool definitions and their precomputed
/// embedding vectors. Read-heavy, rarely written.
#[async_trait]
pub trait CatalogStoreInterface: Send + Sync {
    async fn list_published_tools(&self) -> RelayResult<Vec<(ToolDefinition, ToolEmbedding)>>;
    async fn get_tool_by_name(&self, name: &str) -> RelayResult<Option<ToolDefinition>>;
}

/// Lookup of recorded target facts for enrichment and connection
/// establishment.
#[async_trait]
pub trait AssetInventoryInterface: Send + Sync {
    async fn get_asset(&self, target_id: &str) -> RelayResult<Option<TargetAsset>>;
}

/// In-memory catalog store.
pub struct MemoryCatalogStore {
    tools: Mutex<HashMap<String, (ToolDefinition, ToolEmbedding)>>,
    /// When set, list/get calls fail; used to exercise reload failure paths.
    unavailable: Mutex<bool>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(false),
        }
    }

    pub fn publish(&self, definition: ToolDefinition, embedding: ToolEmbedding) {
        let mut tools = self.tools.lock().unwrap();
        tools.insert(definition.name.clone(), (definition, embedding));
    }

    pub fn unpublish(&self, name: &str) {
        self.tools.lock().unwrap().remove(name);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    fn check_available(&self) -> RelayResult<()> {
        if *self.unavailable.lock().unwrap() {
            return Err(RelayError::new(
                ErrorCode::CatalogUnavailable,
                ErrorCategory::Resolution,
                ErrorSeverity::Medium,
                "catalog store unavailable",
            ));
        }
        Ok(())
    }
}

impl Default for MemoryCatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogStoreInterface for MemoryCatalogStore {
    async fn list_published_tools(&self) -> RelayResult<Vec<(ToolDefinition, ToolEmbedding)>> {
        self.check_available()?;
        let tools = self.tools.lock().unwrap();
        Ok(tools.values().cloned().collect())
    }

    async fn get_tool_by_name(&self, name: &str) -> RelayResult<Option<ToolDefinition>> {
        self.check_available()?;
        let tools = self.tools.lock().unwrap();
        Ok(tools.get(name).map(|(definition, _)| definition.clone()))
    }
}

/// In-memory asset inventory.
pub struct MemoryAssetInventory {
    assets: Mutex<HashMap<String, TargetAsset>>,
}

impl MemoryAssetInventory {
    pub fn new() -> Self {
        Self {
            assets: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, asset: TargetAsset) {
        self.assets.lock().unwrap().insert(asset.id.clone(), asset);
    }
}

impl Default for MemoryAssetInventory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssetInventoryInterface for MemoryAssetInventory {
    async fn get_asset(&self, target_id: &str) -> RelayResult<Option<TargetAsset>> {
        Ok(self.assets.lock().unwrap().get(target_id).cloned())
    }
}
