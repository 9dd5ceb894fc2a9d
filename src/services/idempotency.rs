//! Idempotency guard for externally retried mutating requests.
//!
//! A client-supplied key plus a hash of the request body identify one logical
//! request. The first caller inserts a `PROCESSING` row (the primary key makes
//! the insert act as a mutex), runs the operation and records its outcome.
//! Later callers with the same key either get the stored response replayed,
//! or a conflict.

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, SqlErr,
};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::entities::idempotency_key::{self, Entity as IdempotencyKeyEntity, IdempotencyStatus};
use crate::errors::ServiceError;

const MAX_KEY_LENGTH: usize = 200;
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;

/// Hashes a serializable request into the fingerprint stored next to the key.
pub fn request_hash<T: Serialize>(request: &T) -> Result<String, ServiceError> {
    let bytes = serde_json::to_vec(request)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

enum Claim<T> {
    /// This caller owns the key and must run the operation.
    Acquired,
    /// A previous identical request already succeeded.
    Replay(T),
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    db: Arc<DatabaseConnection>,
    retention: chrono::Duration,
    processing_timeout: chrono::Duration,
}

impl IdempotencyGuard {
    pub fn new(db: Arc<DatabaseConnection>, retention: Duration, processing_timeout: Duration) -> Self {
        Self {
            db,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            processing_timeout: chrono::Duration::from_std(processing_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    /// Runs `operation` at most once per `(scope, key)`.
    ///
    /// A repeat with the same body returns the stored response; a repeat with
    /// a different body fails with `IdempotencyConflict`; a repeat while the
    /// first request is still running fails with `Conflict`.
    #[instrument(skip(self, operation), fields(scope = %scope))]
    pub async fn execute<T, F, Fut>(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
        operation: F,
    ) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let key = key.trim();
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(ServiceError::ValidationError(format!(
                "Idempotency key must be between 1 and {} characters",
                MAX_KEY_LENGTH
            )));
        }
        let record_key = format!("{}:{}", scope, key);

        match self.claim::<T>(&record_key, request_hash).await? {
            Claim::Replay(response) => {
                counter!("idempotency.replayed", 1);
                info!("Replaying stored response for idempotency key");
                return Ok(response);
            }
            Claim::Acquired => {}
        }

        let outcome = operation().await;
        match &outcome {
            Ok(response) => self.complete(&record_key, response).await,
            Err(err) if err.is_retriable() => self.forget(&record_key).await,
            Err(err) => self.fail(&record_key, err).await,
        }
        outcome
    }

    async fn claim<T: DeserializeOwned>(
        &self,
        record_key: &str,
        request_hash: &str,
    ) -> Result<Claim<T>, ServiceError> {
        let db = &*self.db;

        // Two passes: the second follows the removal of an expired record.
        for _ in 0..2 {
            let now = Utc::now();
            match self.insert_processing(record_key, request_hash, now).await {
                Ok(()) => return Ok(Claim::Acquired),
                Err(err) if is_unique_violation(&err) => {}
                Err(err) => return Err(err.into()),
            }

            let Some(existing) = IdempotencyKeyEntity::find_by_id(record_key.to_string())
                .one(db)
                .await?
            else {
                continue;
            };

            if existing.expires_at <= now {
                debug!(status = ?existing.status, "Reclaiming expired idempotency record");
                IdempotencyKeyEntity::delete_many()
                    .filter(idempotency_key::Column::Key.eq(record_key))
                    .filter(idempotency_key::Column::ExpiresAt.lte(now))
                    .exec(db)
                    .await?;
                continue;
            }

            if existing.request_hash != request_hash {
                counter!("idempotency.conflict", 1);
                warn!("Idempotency key reused with a different request body");
                return Err(ServiceError::IdempotencyConflict);
            }

            return match existing.status {
                IdempotencyStatus::Success => {
                    let payload = existing.response_payload.ok_or_else(|| {
                        ServiceError::InternalError(
                            "Completed idempotency record has no stored response".to_string(),
                        )
                    })?;
                    Ok(Claim::Replay(serde_json::from_str(&payload)?))
                }
                IdempotencyStatus::Failed => Err(ServiceError::Conflict(format!(
                    "A previous request with this idempotency key failed: {}",
                    existing
                        .error_message
                        .unwrap_or_else(|| "unknown error".to_string())
                ))),
                IdempotencyStatus::Processing => Err(ServiceError::Conflict(
                    "A request with this idempotency key is already in progress".to_string(),
                )),
            };
        }

        Err(ServiceError::Conflict(
            "A request with this idempotency key is already in progress".to_string(),
        ))
    }

    async fn insert_processing(
        &self,
        record_key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let record = idempotency_key::ActiveModel {
            key: Set(record_key.to_string()),
            request_hash: Set(request_hash.to_string()),
            status: Set(IdempotencyStatus::Processing),
            response_payload: Set(None),
            error_message: Set(None),
            expires_at: Set(now + self.processing_timeout),
            created_at: Set(now),
            updated_at: Set(now),
        };
        IdempotencyKeyEntity::insert(record)
            .exec_without_returning(&*self.db)
            .await
            .map(|_| ())
    }

    async fn complete<T: Serialize>(&self, record_key: &str, response: &T) {
        let payload = match serde_json::to_string(response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Could not serialize response for idempotent replay");
                self.forget(record_key).await;
                return;
            }
        };
        let now = Utc::now();
        let expires_at = now + self.retention;
        let (db, payload) = (&*self.db, &payload);
        let result = write_with_retry(OUTCOME_WRITE_ATTEMPTS, move || async move {
            IdempotencyKeyEntity::update_many()
                .set(idempotency_key::ActiveModel {
                    status: Set(IdempotencyStatus::Success),
                    response_payload: Set(Some(payload.clone())),
                    expires_at: Set(expires_at),
                    updated_at: Set(now),
                    ..Default::default()
                })
                .filter(idempotency_key::Column::Key.eq(record_key))
                .exec(db)
                .await
                .map(|_| ())
        })
        .await;
        if let Err(e) = result {
            error!(
                error = %e,
                "Operation succeeded but its response could not be stored; the key stays in progress until its lease lapses"
            );
        }
    }

    async fn fail(&self, record_key: &str, err: &ServiceError) {
        let now = Utc::now();
        let expires_at = now + self.retention;
        let message = err.response_message();
        let (db, message) = (&*self.db, &message);
        let result = write_with_retry(OUTCOME_WRITE_ATTEMPTS, move || async move {
            IdempotencyKeyEntity::update_many()
                .set(idempotency_key::ActiveModel {
                    status: Set(IdempotencyStatus::Failed),
                    error_message: Set(Some(message.clone())),
                    expires_at: Set(expires_at),
                    updated_at: Set(now),
                    ..Default::default()
                })
                .filter(idempotency_key::Column::Key.eq(record_key))
                .exec(db)
                .await
                .map(|_| ())
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to record idempotent failure");
        }
    }

    /// Drops the record so the client may retry with the same key.
    async fn forget(&self, record_key: &str) {
        if let Err(e) = IdempotencyKeyEntity::delete_by_id(record_key.to_string())
            .exec(&*self.db)
            .await
        {
            warn!(error = %e, "Failed to release idempotency key");
        }
    }

    /// Removes records whose retention or processing lease has lapsed.
    #[instrument(skip(self))]
    pub async fn cleanup_expired(&self) -> Result<u64, ServiceError> {
        let result = IdempotencyKeyEntity::delete_many()
            .filter(idempotency_key::Column::ExpiresAt.lt(Utc::now()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected > 0 {
            info!(deleted = result.rows_affected, "Removed expired idempotency records");
        }
        Ok(result.rows_affected)
    }
}

/// Repeats `write` with a short linear backoff until it succeeds or
/// `attempts` runs out.
async fn write_with_retry<F, Fut>(attempts: u32, mut write: F) -> Result<(), DbErr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), DbErr>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(attempt, error = %e, "Retrying idempotency record write");
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                attempt += 1;
            }
        }
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Body {
        session_id: String,
        note: Option<String>,
    }

    #[test]
    fn identical_requests_hash_identically() {
        let a = Body {
            session_id: "s1".into(),
            note: None,
        };
        let b = Body {
            session_id: "s1".into(),
            note: None,
        };
        let c = Body {
            session_id: "s1".into(),
            note: Some("gift".into()),
        };
        assert_eq!(request_hash(&a).unwrap(), request_hash(&b).unwrap());
        assert_ne!(request_hash(&a).unwrap(), request_hash(&c).unwrap());
        assert_eq!(request_hash(&a).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn outcome_write_survives_a_passing_outage() {
        let mut calls = 0;
        let result = write_with_retry(3, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(DbErr::Custom("connection reset".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn outcome_write_gives_up_after_the_last_attempt() {
        let mut calls = 0;
        let result = write_with_retry(2, || {
            calls += 1;
            async { Err(DbErr::Custom("database is locked".into())) }
        })
        .await;
        assert!(matches!(result, Err(DbErr::Custom(_))));
        assert_eq!(calls, 2);
    }
}
