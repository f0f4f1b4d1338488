use relay_core::engines::connection::command_shell::CommandShellBackend;
use relay_core::engines::connection::http::HttpBackend;
use relay_core::engines::connection::remote_mgmt::RemoteManagementBackend;
use relay_core::catalog::{MemoryAssetInventory, MemoryCatalogStore};
use relay_core::types::{ParameterSpec, ParameterType, ToolEmbedding};
use relay_core::{
    EngineConfig, ExecutionRequest, ExecutionStrategy, MemoryAuditSink, Platform,
    RelayEngines, StaticEmbeddingProvider, TargetAsset, ToolDefinition,
};
use cred_vault::{seal, CipherRecord, CredentialVault, MemoryCredentialStore};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};

// Development vault key; production wiring injects one from the key
// management service.
const DEV_KEY: [u8; 32] = [0x52; 32];
const DEV_NONCE: [u8; 12] = [0x01; 12];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment-based filtering
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("🚀 Relay Firmware starting up...");
    info!("Version: {}", relay_core::VERSION);

    let config = EngineConfig::default();
    info!("Configuration loaded:");
    info!("  - Confidence threshold: {}", config.confidence_threshold);
    info!("  - Ambiguity margin: {}", config.ambiguity_margin);
    info!("  - Max connections per target: {}", config.max_connections_per_target);
    info!("  - Default timeout: {}ms", config.default_timeout_ms);
    info!("  - Catalog refresh: every {}s", config.catalog_refresh_interval_secs);

    // Development wiring: in-memory stores seeded with a local target
    // and one shell tool, so the firmware is exercisable end to end.
    let catalog = Arc::new(MemoryCatalogStore::new());
    catalog.publish(
        ToolDefinition {
            name: "host-uptime".to_string(),
            version: "1.0.0".to_string(),
            description: "Report how long the host has been up".to_string(),
            platform: Platform::Linux,
            categories: vec!["diagnostics".to_string()],
            priority: 0,
            parameters: vec![ParameterSpec::new("hostname", ParameterType::String, false)],
            strategy: ExecutionStrategy::CommandTemplate {
                template: "uptime".to_string(),
            },
        },
        ToolEmbedding {
            tool_name: "host-uptime".to_string(),
            vector: vec![1.0, 0.0, 0.0],
        },
    );

    let inventory = Arc::new(MemoryAssetInventory::new());
    inventory.register(TargetAsset {
        id: "local".to_string(),
        hostname: "localhost".to_string(),
        address: "127.0.0.1".to_string(),
        platform: Platform::Linux,
        management_endpoint: None,
        metadata: HashMap::new(),
    });

    let credentials = MemoryCredentialStore::new();
    credentials.insert(CipherRecord {
        target_id: "local".to_string(),
        protocol: "command-shell".to_string(),
        key_ref: "dev".to_string(),
        nonce: DEV_NONCE.to_vec(),
        ciphertext: seal(&DEV_KEY, &DEV_NONCE, b"")?,
    });
    let vault = Arc::new(CredentialVault::new(Arc::new(credentials)).with_key("dev", DEV_KEY));

    let provider = Arc::new(StaticEmbeddingProvider::new(3));
    provider.insert("how long has this machine been running", vec![1.0, 0.0, 0.0]);

    let engines = RelayEngines::new(
        config,
        catalog,
        inventory,
        provider,
        vault,
        Arc::new(MemoryAuditSink::new()),
        vec![
            Arc::new(CommandShellBackend::local()),
            Arc::new(RemoteManagementBackend::new()),
            Arc::new(HttpBackend::new()),
        ],
    );

    if let Err(e) = engines.initialize_all().await {
        error!("❌ Failed to initialize engines: {}", e);
        return Err(e.into());
    }
    info!("✅ Relay engines initialized successfully");

    // An intent passed on the command line runs one execution and exits.
    let args: Vec<String> = env::args().collect();
    if let Some(intent) = args.get(1) {
        let request = ExecutionRequest::new("cli", "local").with_intent(intent);
        match engines.execute(request).await {
            Ok(result) => {
                info!(success = result.success, status = result.status_code,
                    "execution finished");
                println!("{}", result.output);
            }
            Err(e) => error!("Execution failed: {}", e),
        }
        engines.shutdown_all();
        return Ok(());
    }

    info!("🎯 Relay Firmware is ready to accept requests");

    tokio::signal::ctrl_c().await?;
    warn!("🛑 Shutdown signal received");

    engines.shutdown_all();
    info!("👋 Relay Firmware shutdown complete");
    Ok(())
}
