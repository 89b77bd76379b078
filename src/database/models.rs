// Database Models
//
// Row mappings between tokio-postgres rows and pipeline types.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio_postgres::Row;
use tokio_postgres::types::Json;

use super::store::StoredTransaction;
use crate::pipeline::types::{
    DecodedInstruction, PoolState, StrategyDocument, StrategyReport, Transaction, TxStatus,
};

/// Trait for converting from tokio-postgres Row
pub trait FromRow {
    fn from_row(row: &Row) -> Result<Self, tokio_postgres::Error>
    where
        Self: Sized;
}

pub const TRANSACTION_COLUMNS: &str =
    "seq, signature, slot, block_time, fee_payer, status, instructions";

pub const POOL_COLUMNS: &str =
    "pool_address, token_a, token_b, reserve_a, reserve_b, last_price, last_updated_slot";

pub const REPORT_COLUMNS: &str = "report_date, version, generated_at, document";

impl FromRow for StoredTransaction {
    fn from_row(row: &Row) -> Result<Self, tokio_postgres::Error> {
        let seq: i64 = row.try_get("seq")?;
        let slot: i64 = row.try_get("slot")?;
        let block_time: DateTime<Utc> = row.try_get("block_time")?;
        let status: String = row.try_get("status")?;
        let Json(instructions): Json<Vec<DecodedInstruction>> = row.try_get("instructions")?;

        Ok(Self {
            seq: seq as u64,
            transaction: Transaction {
                signature: row.try_get("signature")?,
                slot: slot as u64,
                block_time,
                fee_payer: row.try_get("fee_payer")?,
                instructions,
                status: TxStatus::parse(&status),
            },
        })
    }
}

impl FromRow for PoolState {
    fn from_row(row: &Row) -> Result<Self, tokio_postgres::Error> {
        let reserve_a: Decimal = row.try_get("reserve_a")?;
        let reserve_b: Decimal = row.try_get("reserve_b")?;
        let last_price: Decimal = row.try_get("last_price")?;
        let slot: i64 = row.try_get("last_updated_slot")?;
        Ok(Self {
            pool_address: row.try_get("pool_address")?,
            token_a: row.try_get("token_a")?,
            token_b: row.try_get("token_b")?,
            reserve_a,
            reserve_b,
            last_price,
            last_updated_slot: slot as u64,
        })
    }
}

impl FromRow for StrategyReport {
    fn from_row(row: &Row) -> Result<Self, tokio_postgres::Error> {
        let report_date: NaiveDate = row.try_get("report_date")?;
        let version: i32 = row.try_get("version")?;
        let Json(document): Json<StrategyDocument> = row.try_get("document")?;
        Ok(Self {
            report_date,
            version: version.max(0) as u32,
            generated_at: row.try_get("generated_at")?,
            document,
        })
    }
}
