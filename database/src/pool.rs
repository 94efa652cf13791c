use anyhow::Result;

use crate::statements::Statement;

/// A connection owned by a single persistence worker.
///
/// Batches are executed on a blocking thread, so implementations may block.
pub trait Connection: Send + 'static {
    /// Executes `statements` atomically. Either all of them take effect or none do.
    fn execute_batch(&mut self, statements: &[Statement]) -> Result<()>;
}

pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> Result<Self::Connection>;

    /// Called once every worker has exited, with the connections they returned.
    fn close(&self, connections: Vec<Self::Connection>) -> Result<()>;
}
