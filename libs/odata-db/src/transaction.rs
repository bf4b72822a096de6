use sea_orm::{DatabaseTransaction, DbErr, TransactionTrait};

use crate::{DbEngine, DbHandle};

/// One request's unit of work.
///
/// Dropping the context without [`commit`](Self::commit) rolls the
/// transaction back.
#[derive(Debug)]
pub struct TransactionContext {
    tx: DatabaseTransaction,
    engine: DbEngine,
}

impl TransactionContext {
    /// # Errors
    /// Returns an error if no pooled connection can be acquired.
    pub async fn begin(db: &DbHandle) -> Result<Self, DbErr> {
        let tx = db.conn().begin().await?;
        tracing::trace!(engine = ?db.engine(), "transaction started");
        Ok(Self {
            tx,
            engine: db.engine(),
        })
    }

    /// Connection to run statements on; implements `ConnectionTrait`.
    #[must_use]
    pub fn conn(&self) -> &DatabaseTransaction {
        &self.tx
    }

    #[must_use]
    pub fn engine(&self) -> DbEngine {
        self.engine
    }

    /// # Errors
    /// Returns the driver error if the commit fails.
    pub async fn commit(self) -> Result<(), DbErr> {
        self.tx.commit().await?;
        tracing::trace!("transaction committed");
        Ok(())
    }

    /// # Errors
    /// Returns the driver error if the rollback fails.
    pub async fn rollback(self) -> Result<(), DbErr> {
        self.tx.rollback().await?;
        tracing::trace!("transaction rolled back");
        Ok(())
    }
}
