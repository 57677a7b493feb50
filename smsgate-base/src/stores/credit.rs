//! Postgres-backed credit ledger.
//!
//! Spend decisions for one client are serialized by an exclusive lock on the
//! client row; concurrency across clients is unaffected. The unique
//! constraint on `credit_locks.message_id` makes hold retries safe.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tracing::instrument;
use uuid::Uuid;

use smsgate_core::{CreditLedger, CreditLock, GatewayError, GatewayResult, LockState};

#[derive(sqlx::FromRow)]
struct LockRow {
    id: Uuid,
    client_id: Uuid,
    message_id: Uuid,
    amount_cents: i64,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LockRow> for CreditLock {
    type Error = GatewayError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        let state = LockState::from_str(&row.state)
            .map_err(|_| GatewayError::Other(format!("corrupt lock state: {}", row.state)))?;
        Ok(CreditLock {
            id: row.id,
            client_id: row.client_id,
            message_id: row.message_id,
            amount_cents: row.amount_cents,
            state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// `CreditLedger` over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    /// Wrap the shared pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    #[instrument(skip(self), fields(client_id = %client_id, msg_id = %message_id))]
    async fn hold(
        &self,
        client_id: Uuid,
        message_id: Uuid,
        amount_cents: i64,
    ) -> GatewayResult<CreditLock> {
        let mut tx = self.pool.begin().await.map_err(GatewayError::database)?;

        let balance: Option<(i64,)> =
            sqlx::query_as("SELECT credit_cents FROM clients WHERE id = $1 FOR UPDATE")
                .bind(client_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(GatewayError::database)?;
        let Some((available_cents,)) = balance else {
            return Err(GatewayError::NotFound("client"));
        };

        // With the client row locked, same-client holds are serialized, so
        // this lookup cannot race a concurrent insert for the same message.
        let existing = sqlx::query_as::<_, LockRow>(
            "SELECT id, client_id, message_id, amount_cents, state, created_at, updated_at \
             FROM credit_locks WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(GatewayError::database)?;
        if let Some(row) = existing {
            let lock = CreditLock::try_from(row)?;
            return if lock.state == LockState::Held && lock.amount_cents == amount_cents {
                Ok(lock)
            } else {
                Err(GatewayError::LockConflict { message_id })
            };
        }

        if available_cents < amount_cents {
            return Err(GatewayError::InsufficientCredit {
                required_cents: amount_cents,
                available_cents,
            });
        }

        sqlx::query("UPDATE clients SET credit_cents = credit_cents - $2 WHERE id = $1")
            .bind(client_id)
            .bind(amount_cents)
            .execute(&mut *tx)
            .await
            .map_err(GatewayError::database)?;

        let row = sqlx::query_as::<_, LockRow>(
            "INSERT INTO credit_locks \
             (id, client_id, message_id, amount_cents, state, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 'HELD', now(), now()) \
             RETURNING id, client_id, message_id, amount_cents, state, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(client_id)
        .bind(message_id)
        .bind(amount_cents)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                GatewayError::LockConflict { message_id }
            } else {
                GatewayError::database(e)
            }
        })?;

        tx.commit().await.map_err(GatewayError::database)?;
        row.try_into()
    }

    #[instrument(skip(self), fields(msg_id = %message_id))]
    async fn capture(&self, message_id: Uuid) -> GatewayResult<()> {
        // Single conditional statement: captures the HELD lock or repeats a
        // prior capture; released/absent locks fall through to the error.
        let result = sqlx::query(
            "UPDATE credit_locks SET state = 'CAPTURED', updated_at = now() \
             WHERE message_id = $1 AND state IN ('HELD', 'CAPTURED')",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::database)?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::LockNotHeld { message_id });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(msg_id = %message_id))]
    async fn release(&self, message_id: Uuid) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await.map_err(GatewayError::database)?;

        let row = sqlx::query_as::<_, LockRow>(
            "SELECT id, client_id, message_id, amount_cents, state, created_at, updated_at \
             FROM credit_locks WHERE message_id = $1 FOR UPDATE",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(GatewayError::database)?;
        let Some(row) = row else {
            return Err(GatewayError::LockNotHeld { message_id });
        };
        let lock = CreditLock::try_from(row)?;

        match lock.state {
            // Second release is a no-op.
            LockState::Released => return Ok(()),
            LockState::Captured => return Err(GatewayError::LockNotHeld { message_id }),
            LockState::Held => {}
        }

        sqlx::query("UPDATE clients SET credit_cents = credit_cents + $2 WHERE id = $1")
            .bind(lock.client_id)
            .bind(lock.amount_cents)
            .execute(&mut *tx)
            .await
            .map_err(GatewayError::database)?;
        sqlx::query("UPDATE credit_locks SET state = 'RELEASED', updated_at = now() WHERE id = $1")
            .bind(lock.id)
            .execute(&mut *tx)
            .await
            .map_err(GatewayError::database)?;

        tx.commit().await.map_err(GatewayError::database)?;
        Ok(())
    }
}
