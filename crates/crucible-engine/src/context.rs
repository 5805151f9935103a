use std::sync::Arc;

use crucible_agents::{AgentGateway, AgentRegistry, LlmAgentConfig};
use crucible_store::Store;

use crate::config::EngineConfig;
use crate::orchestrator::RunOrchestrator;
use crate::remediation::RemediationEngine;
use crate::snapshot::SnapshotEngine;

/// Explicit engine wiring: store, gateway and config built once at startup
/// and handed to whoever drives the services. `shutdown` flushes the store.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<Store>,
    pub gateway: Arc<AgentGateway>,
    pub config: EngineConfig,
}

impl EngineContext {
    pub async fn init(config: EngineConfig) -> anyhow::Result<Self> {
        let registry = AgentRegistry::from_llm_config(&LlmAgentConfig::default());
        Self::init_with_registry(config, registry).await
    }

    pub async fn init_with_registry(
        config: EngineConfig,
        registry: AgentRegistry,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(Store::new(config.store_path()).await?);
        Ok(Self {
            store,
            gateway: Arc::new(AgentGateway::new(registry)),
            config,
        })
    }

    pub fn orchestrator(&self) -> RunOrchestrator {
        RunOrchestrator::new(
            self.store.clone(),
            self.gateway.clone(),
            self.config.eval_concurrency,
        )
    }

    pub fn remediation(&self) -> RemediationEngine {
        RemediationEngine::new(self.store.clone(), self.orchestrator())
    }

    pub fn snapshots(&self) -> SnapshotEngine {
        SnapshotEngine::new(self.store.clone(), self.orchestrator())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.store.flush().await
    }
}
