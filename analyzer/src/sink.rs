use anyhow::Result;
use async_trait::async_trait;
use database::Persister;
use types::models::Model;

/// Destination of the records the analyzer derives.
#[async_trait]
pub trait ModelSink: Send + Sync {
    /// Models must be stored in the order they are emitted.
    async fn emit(&self, model: Model) -> Result<()>;
}

#[async_trait]
impl ModelSink for Persister {
    async fn emit(&self, model: Model) -> Result<()> {
        self.persist(model).await
    }
}
