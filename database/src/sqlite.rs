use core::time::Duration;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::info;
use rusqlite::{params_from_iter, Connection as RawConnection, TransactionBehavior};

use crate::{
    pool::{Connection, ConnectionPool},
    statements::Statement,
};

#[allow(clippy::str_to_string)]
mod schema {
    use refinery::embed_migrations;
    embed_migrations!();
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens one connection per persistence worker to a single SQLite file.
pub struct SqlitePool {
    path: PathBuf,
}

impl SqlitePool {
    /// Creates the database file if needed and brings its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut connection = RawConnection::open(&path)?;
        let report = schema::migrations::runner().run(&mut connection)?;

        for migration in report.applied_migrations() {
            info!("applied database migration {migration}");
        }

        // WAL is persistent, so setting it once per file is enough.
        connection.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self { path })
    }
}

impl ConnectionPool for SqlitePool {
    type Connection = SqliteConnection;

    fn connect(&self) -> Result<Self::Connection> {
        let connection = RawConnection::open(&self.path)?;

        // Workers write concurrently and SQLite allows a single writer at a time.
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;

        Ok(SqliteConnection { connection })
    }

    fn close(&self, connections: Vec<Self::Connection>) -> Result<()> {
        for SqliteConnection { connection } in connections {
            connection.close().map_err(|(_, error)| error)?;
        }

        info!("closed database at {}", self.path.display());

        Ok(())
    }
}

pub struct SqliteConnection {
    connection: RawConnection,
}

impl Connection for SqliteConnection {
    fn execute_batch(&mut self, statements: &[Statement]) -> Result<()> {
        let transaction = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        for Statement { sql, arguments, .. } in statements {
            transaction
                .prepare_cached(sql)?
                .execute(params_from_iter(arguments))?;
        }

        transaction.commit()?;

        Ok(())
    }
}
