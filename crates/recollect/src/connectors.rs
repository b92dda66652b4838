
//! Document connector capability surface and registration
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One entry of a connector listing: a document or a container of documents.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectorEntry {
    pub id: String,
    pub name: String,
    pub is_container: bool,
}

/// Capability set every document source must implement in full. Fetch logic
/// is the connector's own business; the engine only consumes document text
/// through [`crate::ingest::DocumentProcessor`].
#[async_trait]
pub trait DocumentConnector: Send + Sync {
    fn name(&self) -> &str;
    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    async fn browse(&self, container_id: Option<&str>) -> anyhow::Result<Vec<ConnectorEntry>>;
    async fn read_document(&self, document_id: &str) -> anyhow::Result<String>;
    async fn search(&self, query: &str) -> anyhow::Result<Vec<ConnectorEntry>>;
}

/// Explicit registration table, built once at startup. Lookups after that
/// are read-only; an unknown name is a caller error, not a fallback path.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn DocumentConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector under its declared name. Names must be non-empty
    /// and unique.
    pub fn register(&mut self, connector: Arc<dyn DocumentConnector>) -> anyhow::Result<()> {
        let name = connector.name().to_string();
        if name.trim().is_empty() {
            return Err(anyhow::anyhow!("connector name must not be empty"));
        }
        if self.connectors.contains_key(&name) {
            return Err(anyhow::anyhow!("connector '{}' is already registered", name));
        }
        info!("Registered document connector: {}", name);
        self.connectors.insert(name, connector);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DocumentConnector>> {
        self.connectors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
