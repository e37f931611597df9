//! PostgreSQL series backend.
//!
//! Precedence is decided inside the upsert itself, so concurrent writers to the same
//! key converge without an application lock. A per-series row in `candle_series` is
//! locked for the duration of each write to keep retention and expiry consistent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool};

use candle_sync_core::{Candle, CandleVersion, DatabaseConfig, Timeframe, VersionedCandle};

use super::{SeriesBackend, WritePolicy};
use crate::error::StoreError;

const SCHEMA: [&str; 3] = [
    r"
    CREATE TABLE IF NOT EXISTS candle_series (
        series_key TEXT PRIMARY KEY,
        expires_at TIMESTAMPTZ
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS candles (
        series_key   TEXT        NOT NULL,
        ts           TIMESTAMPTZ NOT NULL,
        exchange     TEXT        NOT NULL,
        symbol       TEXT        NOT NULL,
        timeframe    TEXT        NOT NULL,
        open         NUMERIC     NOT NULL,
        high         NUMERIC     NOT NULL,
        low          NUMERIC     NOT NULL,
        close        NUMERIC     NOT NULL,
        volume       NUMERIC     NOT NULL,
        sequence_num BIGINT,
        is_synthetic BOOLEAN     NOT NULL DEFAULT FALSE,
        written_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (series_key, ts)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_candles_series_ts_desc
        ON candles (series_key, ts DESC)
    ",
];

#[derive(Debug, Clone, sqlx::FromRow)]
struct CandleRow {
    series_key: String,
    ts: DateTime<Utc>,
    exchange: String,
    symbol: String,
    timeframe: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    sequence_num: Option<i64>,
    is_synthetic: bool,
}

impl TryFrom<CandleRow> for VersionedCandle {
    type Error = StoreError;

    fn try_from(row: CandleRow) -> Result<Self, Self::Error> {
        let timeframe: Timeframe = row.timeframe.parse().map_err(|e| StoreError::CorruptRow {
            key: row.series_key.clone(),
            reason: format!("{e}"),
        })?;
        let version = match row.sequence_num {
            Some(seq) => CandleVersion::Live {
                sequence: u64::try_from(seq).map_err(|_| StoreError::CorruptRow {
                    key: row.series_key.clone(),
                    reason: format!("negative sequence number {seq}"),
                })?,
            },
            None => CandleVersion::Backfill,
        };
        Ok(Self {
            candle: Candle {
                exchange: row.exchange,
                symbol: row.symbol,
                timeframe,
                timestamp: row.ts,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                is_synthetic: row.is_synthetic,
            },
            version,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool using the database section of the config.
    ///
    /// # Errors
    /// Returns an error if the database connection cannot be established.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Ok(Self::new(pool))
    }

    /// Creates the candle tables if they do not exist.
    ///
    /// # Errors
    /// Returns an error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply candle schema")?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn sequence_param(version: CandleVersion) -> Option<i64> {
    // Sequence numbers past i64::MAX saturate; they still outrank every smaller value.
    version
        .sequence()
        .map(|seq| i64::try_from(seq).unwrap_or(i64::MAX))
}

#[async_trait]
impl SeriesBackend for PostgresBackend {
    async fn write_if_newer(
        &self,
        key: &str,
        candle: &VersionedCandle,
        policy: WritePolicy,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO candle_series (series_key, expires_at)
            VALUES ($1, NULL)
            ON CONFLICT (series_key) DO NOTHING
            ",
        )
        .bind(key)
        .execute(&mut *tx)
        .await?;

        let (expires_at,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT expires_at FROM candle_series WHERE series_key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        if expires_at.is_some_and(|at| at <= Utc::now()) {
            sqlx::query("DELETE FROM candles WHERE series_key = $1")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }

        let max_len = i64::try_from(policy.max_len).unwrap_or(i64::MAX);
        let c = &candle.candle;
        let result = sqlx::query(
            r"
            INSERT INTO candles (
                series_key, ts, exchange, symbol, timeframe,
                open, high, low, close, volume, sequence_num, is_synthetic, written_at
            )
            SELECT $1, $2::timestamptz, $3, $4, $5,
                   $6::numeric, $7::numeric, $8::numeric, $9::numeric, $10::numeric,
                   $11::bigint, $12::boolean, NOW()
            WHERE (SELECT COUNT(*) FROM candles WHERE series_key = $1) < $13
               OR $2::timestamptz >= (SELECT MIN(ts) FROM candles WHERE series_key = $1)
            ON CONFLICT (series_key, ts) DO UPDATE SET
                exchange = EXCLUDED.exchange,
                symbol = EXCLUDED.symbol,
                timeframe = EXCLUDED.timeframe,
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume,
                sequence_num = EXCLUDED.sequence_num,
                is_synthetic = EXCLUDED.is_synthetic,
                written_at = EXCLUDED.written_at
            WHERE candles.sequence_num IS NULL
               OR (EXCLUDED.sequence_num IS NOT NULL
                   AND EXCLUDED.sequence_num > candles.sequence_num)
            ",
        )
        .bind(key)
        .bind(c.timestamp)
        .bind(&c.exchange)
        .bind(&c.symbol)
        .bind(c.timeframe.as_str())
        .bind(c.open)
        .bind(c.high)
        .bind(c.low)
        .bind(c.close)
        .bind(c.volume)
        .bind(sequence_param(candle.version))
        .bind(c.is_synthetic)
        .bind(max_len)
        .execute(&mut *tx)
        .await?;

        let written = result.rows_affected() > 0;
        if written {
            sqlx::query(
                r"
                DELETE FROM candles
                WHERE series_key = $1
                  AND ts < (
                      SELECT ts FROM candles
                      WHERE series_key = $1
                      ORDER BY ts DESC
                      OFFSET $2 - 1 LIMIT 1
                  )
                ",
            )
            .bind(key)
            .bind(max_len)
            .execute(&mut *tx)
            .await?;

            let expires_at = policy.ttl.map(|ttl| Utc::now() + ttl);
            sqlx::query("UPDATE candle_series SET expires_at = $2 WHERE series_key = $1")
                .bind(key)
                .bind(expires_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn range(
        &self,
        key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<VersionedCandle>, StoreError> {
        let rows = sqlx::query_as::<_, CandleRow>(
            r"
            SELECT c.series_key, c.ts, c.exchange, c.symbol, c.timeframe,
                   c.open, c.high, c.low, c.close, c.volume, c.sequence_num, c.is_synthetic
            FROM candles c
            LEFT JOIN candle_series s ON s.series_key = c.series_key
            WHERE c.series_key = $1 AND c.ts >= $2 AND c.ts <= $3
              AND (s.expires_at IS NULL OR s.expires_at > NOW())
            ORDER BY c.ts ASC
            ",
        )
        .bind(key)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(VersionedCandle::try_from).collect()
    }

    async fn latest(&self, key: &str, count: usize) -> Result<Vec<VersionedCandle>, StoreError> {
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, CandleRow>(
            r"
            SELECT * FROM (
                SELECT c.series_key, c.ts, c.exchange, c.symbol, c.timeframe,
                       c.open, c.high, c.low, c.close, c.volume, c.sequence_num, c.is_synthetic
                FROM candles c
                LEFT JOIN candle_series s ON s.series_key = c.series_key
                WHERE c.series_key = $1
                  AND (s.expires_at IS NULL OR s.expires_at > NOW())
                ORDER BY c.ts DESC
                LIMIT $2
            ) recent
            ORDER BY ts ASC
            ",
        )
        .bind(key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(VersionedCandle::try_from).collect()
    }
}
