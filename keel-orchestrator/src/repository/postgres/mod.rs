//! PostgreSQL store
//!
//! Implements every repository trait on top of a `PgPool`. Writes that take a
//! [`Transaction`] run on the transaction's connection; everything else runs
//! on the pool.

mod catalog;
mod chart;
mod release;
mod status;
mod timeline;
mod workflow;

use std::any::Any;

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres};

use super::{Transaction, TransactionManager};
use crate::error::StoreError;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgTransaction(sqlx::Transaction<'static, Postgres>);

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.0.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.0.rollback().await?;
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

#[async_trait]
impl TransactionManager for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction(tx)))
    }
}

/// Connection of a transaction opened by this store
fn conn(tx: &mut dyn Transaction) -> Result<&mut PgConnection, StoreError> {
    tx.as_any()
        .downcast_mut::<PgTransaction>()
        .map(|t| &mut *t.0)
        .ok_or(StoreError::ForeignTransaction)
}

fn corrupt(column: &str, value: &str) -> StoreError {
    StoreError::Corrupt(format!("unexpected {} value {:?}", column, value))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
