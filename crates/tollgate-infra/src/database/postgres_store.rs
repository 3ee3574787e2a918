//! PostgreSQL idempotency store.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict, SimpleExpr};
use sea_orm::{ColumnTrait, DbConn, DbErr, EntityTrait, QueryFilter};

use tollgate_core::domain::{IdempotencyRecord, RecordState};
use tollgate_core::ports::{IdempotencyStore, StoreError};

use super::entity::idempotency_record::{self, Column, Entity as RecordEntity};

/// PostgreSQL record store.
///
/// Uniqueness is enforced by the primary key on `key`. An insert only
/// replaces an existing row when that row has already expired; completion
/// also replaces a pending claim.
pub struct PostgresIdempotencyStore {
    db: DbConn,
}

impl PostgresIdempotencyStore {
    pub fn new(db: DbConn) -> Self {
        Self { db }
    }
}

fn map_db_err(e: DbErr) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl PostgresIdempotencyStore {
    /// `INSERT .. ON CONFLICT (key) DO UPDATE .. WHERE replaceable`.
    async fn upsert(
        &self,
        record: IdempotencyRecord,
        replaceable: SimpleExpr,
    ) -> Result<(), StoreError> {
        let key = record.key.clone();
        let active_model = idempotency_record::ActiveModel::try_from(record)?;

        let on_conflict = OnConflict::column(Column::Key)
            .update_columns([
                Column::RequestHash,
                Column::State,
                Column::StatusCode,
                Column::ResponseHeaders,
                Column::ResponseBody,
                Column::CreatedAt,
                Column::ExpiresAt,
            ])
            .action_and_where(replaceable)
            .to_owned();

        let result = RecordEntity::insert(active_model)
            .on_conflict(on_conflict)
            .exec_without_returning(&self.db)
            .await;

        match result {
            Ok(0) | Err(DbErr::RecordNotInserted) => Err(StoreError::AlreadyExists(key)),
            Ok(_) => Ok(()),
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("duplicate") || err_str.contains("unique") {
                    Err(StoreError::AlreadyExists(key))
                } else {
                    Err(StoreError::Backend(err_str))
                }
            }
        }
    }
}

fn expired_row() -> SimpleExpr {
    Expr::col((RecordEntity, Column::ExpiresAt)).lte(Utc::now().fixed_offset())
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let model = RecordEntity::find_by_id(key.to_string())
            .filter(Column::ExpiresAt.gt(Utc::now().fixed_offset()))
            .one(&self.db)
            .await
            .map_err(map_db_err)?;

        model.map(IdempotencyRecord::try_from).transpose()
    }

    async fn store(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        self.upsert(record, expired_row()).await
    }

    async fn complete(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        let pending = Expr::col((RecordEntity, Column::State)).eq(RecordState::Pending.as_str());
        self.upsert(record, pending.or(expired_row())).await
    }

    async fn delete_expired(&self) -> Result<u64, StoreError> {
        let result = RecordEntity::delete_many()
            .filter(Column::ExpiresAt.lte(Utc::now().fixed_offset()))
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(result.rows_affected)
    }
}
