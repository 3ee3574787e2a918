//! Idempotency record entity for SeaORM.

use sea_orm::Set;
use sea_orm::entity::prelude::*;

use tollgate_core::domain::{IdempotencyRecord, RecordState};
use tollgate_core::ports::StoreError;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "idempotency_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,
    pub request_hash: String,
    /// `pending` or `completed`.
    pub state: String,
    pub status_code: i32,
    /// JSON array of `[name, value]` pairs.
    #[sea_orm(column_type = "Text")]
    pub response_headers: String,
    pub response_body: Vec<u8>,
    pub created_at: DateTimeWithTimeZone,
    pub expires_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Conversion from SeaORM Model to the domain record.
impl TryFrom<Model> for IdempotencyRecord {
    type Error = StoreError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let response_headers = serde_json::from_str(&model.response_headers).map_err(|e| {
            StoreError::Backend(format!("Corrupt headers for key {}: {e}", model.key))
        })?;
        let status_code = u16::try_from(model.status_code).map_err(|_| {
            StoreError::Backend(format!(
                "Invalid status {} for key {}",
                model.status_code, model.key
            ))
        })?;
        let state = RecordState::parse(&model.state)
            .map_err(|e| StoreError::Backend(format!("{e} for key {}", model.key)))?;

        Ok(Self {
            key: model.key,
            request_hash: model.request_hash,
            state,
            status_code,
            response_headers,
            response_body: model.response_body,
            created_at: model.created_at.into(),
            expires_at: model.expires_at.into(),
        })
    }
}

/// Conversion from the domain record to SeaORM ActiveModel.
impl TryFrom<IdempotencyRecord> for ActiveModel {
    type Error = StoreError;

    fn try_from(record: IdempotencyRecord) -> Result<Self, Self::Error> {
        let response_headers = serde_json::to_string(&record.response_headers)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self {
            key: Set(record.key),
            request_hash: Set(record.request_hash),
            state: Set(record.state.as_str().to_string()),
            status_code: Set(i32::from(record.status_code)),
            response_headers: Set(response_headers),
            response_body: Set(record.response_body),
            created_at: Set(record.created_at.into()),
            expires_at: Set(record.expires_at.into()),
        })
    }
}
