// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::str::FromStr;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::{
    errors::{impl_coded_debug, CodedError},
    now_timestamp,
    txm::{
        RevertedTxKind, RevertedTxnRecord, SendStrategy, Tx, TxManager, TxMeta, TxReceipt,
        TxRequest, TxState,
    },
};

#[cfg(test)]
mod fuzz_db;

#[derive(Error)]
pub enum DbError {
    #[error("{code} SQL error: {0}", code = self.code())]
    SqlErr(#[from] sqlx::Error),

    #[error("{code} SQL migration error: {0}", code = self.code())]
    MigrateErr(#[from] sqlx::migrate::MigrateError),

    #[error("{code} JSON (de)serialization error: {0}", code = self.code())]
    JsonErr(#[from] serde_json::Error),

    #[error("{code} Invalid row: {0}", code = self.code())]
    InvalidRow(String),

    #[error("{code} Tx {0} not found", code = self.code())]
    TxNotFound(i64),
}

impl_coded_debug!(DbError);

impl CodedError for DbError {
    fn code(&self) -> &str {
        match self {
            DbError::SqlErr(_) => "[V-DB-001]",
            DbError::MigrateErr(_) => "[V-DB-002]",
            DbError::JsonErr(_) => "[V-DB-003]",
            DbError::InvalidRow(_) => "[V-DB-004]",
            DbError::TxNotFound(_) => "[V-DB-005]",
        }
    }
}

/// SQLite backed transaction queue
pub struct SqliteDb {
    pool: SqlitePool,
}

impl SqliteDb {
    /// Constructs a [SqliteDb] from an existing [SqlitePool]
    ///
    /// This method applies database migrations
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Construct a new [SqliteDb] from a connection string
    pub async fn new(conn_str: &str) -> Result<Self, DbError> {
        let opts = SqliteConnectOptions::from_str(conn_str)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own empty database
        let pool = if conn_str.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        } else {
            SqlitePoolOptions::new().max_connections(5).connect_with(opts).await?
        };

        Self::from_pool(pool).await
    }

    pub async fn get_tx(&self, id: i64) -> Result<Tx, DbError> {
        let row: Option<DbTx> = sqlx::query_as(&format!("SELECT {TX_COLUMNS} FROM txes WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(DbError::TxNotFound(id))?.try_into()
    }

    /// Moves a transaction to a new lifecycle state
    pub async fn set_tx_state(&self, id: i64, state: TxState) -> Result<(), DbError> {
        let res = sqlx::query("UPDATE txes SET state = $1 WHERE id = $2")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(DbError::TxNotFound(id));
        }
        Ok(())
    }

    /// Stores the receipt of a mined transaction and marks it confirmed
    pub async fn insert_receipt(&self, tx_id: i64, receipt: &TxReceipt) -> Result<(), DbError> {
        let mut txn = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO tx_receipts (tx_id, tx_hash, block_number, status, logs) VALUES ($1, $2, $3, $4, $5) ON CONFLICT (tx_id) DO UPDATE SET tx_hash = $2, block_number = $3, status = $4, logs = $5",
        )
        .bind(tx_id)
        .bind(format!("{:x}", receipt.tx_hash))
        .bind(receipt.block_number as i64)
        .bind(receipt.status as i64)
        .bind(serde_json::to_string(&receipt.logs)?)
        .execute(&mut *txn)
        .await?;

        let res = sqlx::query("UPDATE txes SET state = $1 WHERE id = $2")
            .bind(TxState::Confirmed.as_str())
            .bind(tx_id)
            .execute(&mut *txn)
            .await?;
        if res.rows_affected() == 0 {
            return Err(DbError::TxNotFound(tx_id));
        }
        txn.commit().await?;
        Ok(())
    }
}

const TX_COLUMNS: &str = "id, from_address, to_address, payload, fee_limit, strategy, state, meta, transmit_checker, created_at";

#[derive(sqlx::FromRow)]
struct DbTx {
    id: i64,
    from_address: String,
    to_address: String,
    payload: Vec<u8>,
    fee_limit: i64,
    strategy: String,
    state: String,
    meta: String,
    transmit_checker: Option<String>,
    created_at: i64,
}

impl TryFrom<DbTx> for Tx {
    type Error = DbError;

    fn try_from(row: DbTx) -> Result<Self, Self::Error> {
        let parse_addr = |s: &str| {
            Address::from_str(s).map_err(|err| DbError::InvalidRow(format!("address {s}: {err}")))
        };
        Ok(Tx {
            id: row.id,
            from: parse_addr(&row.from_address)?,
            to: parse_addr(&row.to_address)?,
            payload: row.payload.into(),
            fee_limit: row.fee_limit as u64,
            strategy: serde_json::from_value(serde_json::Value::String(row.strategy))?,
            state: row.state.parse()?,
            meta: serde_json::from_str(&row.meta)?,
            checker: row.transmit_checker.as_deref().map(serde_json::from_str).transpose()?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DbRevertedTx {
    #[sqlx(flatten)]
    tx: DbTx,
    tx_hash: String,
    block_number: i64,
    status: i64,
    logs: String,
}

impl TryFrom<DbRevertedTx> for RevertedTxnRecord {
    type Error = DbError;

    fn try_from(row: DbRevertedTx) -> Result<Self, Self::Error> {
        let tx_hash = B256::from_str(&row.tx_hash)
            .map_err(|err| DbError::InvalidRow(format!("tx hash {}: {err}", row.tx_hash)))?;
        Ok(RevertedTxnRecord {
            tx: row.tx.try_into()?,
            receipt: TxReceipt {
                tx_hash,
                block_number: row.block_number as u64,
                status: row.status != 0,
                logs: serde_json::from_str(&row.logs)?,
            },
        })
    }
}

fn strategy_str(strategy: SendStrategy) -> Result<String, DbError> {
    match serde_json::to_value(strategy)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(DbError::InvalidRow(format!("strategy {other}"))),
    }
}

#[async_trait]
impl TxManager for SqliteDb {
    async fn create_transaction(&self, req: TxRequest) -> Result<Tx, DbError> {
        let meta = serde_json::to_string(&req.meta)?;
        let checker = req.checker.as_ref().map(serde_json::to_string).transpose()?;
        let created_at = now_timestamp() as i64;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO txes (from_address, to_address, payload, fee_limit, strategy, state, meta, transmit_checker, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
        )
        .bind(req.from.to_string())
        .bind(req.to.to_string())
        .bind(req.payload.to_vec())
        .bind(req.fee_limit as i64)
        .bind(strategy_str(req.strategy)?)
        .bind(TxState::Unstarted.as_str())
        .bind(&meta)
        .bind(checker)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::trace!("Queued tx {id} to {} with meta {meta}", req.to);

        Ok(Tx {
            id,
            from: req.from,
            to: req.to,
            payload: req.payload,
            fee_limit: req.fee_limit,
            strategy: req.strategy,
            state: TxState::Unstarted,
            meta: req.meta,
            checker: req.checker,
            created_at,
        })
    }

    async fn find_txes_by_meta_field_and_states(
        &self,
        field: &str,
        value: &str,
        states: &[TxState],
    ) -> Result<Vec<Tx>, DbError> {
        let states: Vec<&str> = states.iter().map(TxState::as_str).collect();
        let rows: Vec<DbTx> = sqlx::query_as(&format!(
            "SELECT {TX_COLUMNS} FROM txes WHERE CAST(json_extract(meta, $1) AS TEXT) = $2 AND state IN (SELECT value FROM json_each($3)) ORDER BY id"
        ))
        .bind(format!("$.{field}"))
        .bind(value)
        .bind(serde_json::to_string(&states)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Tx::try_from).collect()
    }

    async fn find_reverted_txes(
        &self,
        kind: RevertedTxKind,
        from_block: u64,
    ) -> Result<Vec<RevertedTxnRecord>, DbError> {
        let filter = match kind {
            RevertedTxKind::Single => {
                "json_extract(t.meta, '$.RequestID') IS NOT NULL AND COALESCE(json_extract(t.meta, '$.ForceFulfilled'), 0) = 0 AND r.status = 0"
            }
            RevertedTxKind::Batch => "json_extract(t.meta, '$.RequestIDs') IS NOT NULL",
            RevertedTxKind::ForceFulfilled => {
                "json_extract(t.meta, '$.ForceFulfilled') = 1 AND r.status = 0"
            }
        };
        let rows: Vec<DbRevertedTx> = sqlx::query_as(&format!(
            "SELECT t.id, t.from_address, t.to_address, t.payload, t.fee_limit, t.strategy, t.state, t.meta, t.transmit_checker, t.created_at, r.tx_hash, r.block_number, r.status, r.logs FROM txes t JOIN tx_receipts r ON r.tx_id = t.id WHERE r.block_number >= $1 AND {filter} ORDER BY r.block_number, t.id"
        ))
        .bind(from_block as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RevertedTxnRecord::try_from).collect()
    }

    async fn find_pending_force_fulfillments(&self) -> Result<Vec<Tx>, DbError> {
        let rows: Vec<DbTx> = sqlx::query_as(
            "SELECT t.id, t.from_address, t.to_address, t.payload, t.fee_limit, t.strategy, t.state, t.meta, t.transmit_checker, t.created_at FROM txes t LEFT JOIN tx_receipts r ON r.tx_id = t.id WHERE json_extract(t.meta, '$.ForceFulfilled') = 1 AND r.tx_id IS NULL AND t.state IN ('unstarted', 'in_progress', 'unconfirmed') ORDER BY t.id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Tx::try_from).collect()
    }

    async fn find_unstarted_checked_txes(&self) -> Result<Vec<Tx>, DbError> {
        let rows: Vec<DbTx> = sqlx::query_as(&format!(
            "SELECT {TX_COLUMNS} FROM txes WHERE state = $1 AND transmit_checker IS NOT NULL ORDER BY id"
        ))
        .bind(TxState::Unstarted.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Tx::try_from).collect()
    }

    async fn abandon_unstarted(&self, id: i64) -> Result<bool, DbError> {
        let res = sqlx::query("UPDATE txes SET state = $1 WHERE id = $2 AND state = $3")
            .bind(TxState::FatalError.as_str())
            .bind(id)
            .bind(TxState::Unstarted.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }
}
