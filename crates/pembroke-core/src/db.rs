use std::{path::Path, sync::Arc};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to build database: {0}")]
    Build(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let inner = Builder::new_local(database_path.to_string_lossy().to_string())
            .build()
            .await
            .map_err(DbError::Build)?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(DbError::Statement)?;
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}
