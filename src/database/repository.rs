use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use crate::database::error::DatabaseError;

/// Repositories backed by a PostgreSQL pool
#[async_trait]
pub trait TransactionalRepository: Send + Sync {
    fn pool(&self) -> &PgPool;

    /// Open a transaction. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Transaction<'static, Postgres>, DatabaseError> {
        self.pool().begin().await.map_err(DatabaseError::from_sqlx)
    }
}
