pub use crate::{
    engine::{
        Options as PersistenceOptions, PersistenceEngine, PersistenceReport, Persister,
        WorkerReport,
    },
    pool::{Connection, ConnectionPool},
    sqlite::{SqliteConnection, SqlitePool},
    statements::{Statement, StatementTable},
};

mod arguments;
mod engine;
mod pool;
mod sqlite;
mod statements;
