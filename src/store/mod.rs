// =============================================================================
// Candle Store — idempotent SQLite persistence for canonical candles
// =============================================================================
//
// Rows are keyed by the unique tuple (provider, symbol, interval, timestamp);
// inserts are `INSERT OR IGNORE` upserts so duplicate writes are silent
// no-ops. Batch inserts run inside one transaction and report how many rows
// were actually new. Reads are plain indexed scans; the backward page is
// fetched descending and reversed so results are always ascending.
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{Interval, OHLCVCandle};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS candles (
    provider  TEXT    NOT NULL,
    symbol    TEXT    NOT NULL,
    interval  TEXT    NOT NULL,
    timestamp INTEGER NOT NULL,
    open      REAL    NOT NULL,
    high      REAL    NOT NULL,
    low       REAL    NOT NULL,
    close     REAL    NOT NULL,
    volume    REAL    NOT NULL,
    PRIMARY KEY (provider, symbol, interval, timestamp)
);
CREATE INDEX IF NOT EXISTS idx_candles_series
    ON candles (symbol, interval, timestamp);
";

const INSERT_SQL: &str = "INSERT OR IGNORE INTO candles \
    (provider, symbol, interval, timestamp, open, high, low, close, volume) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const SELECT_COLUMNS: &str =
    "provider, symbol, interval, timestamp, open, high, low, close, volume";

// =============================================================================
// Query types
// =============================================================================

/// Direction of a cursor-paged scan. Either way, results come back ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageDirection {
    Forward,
    Backward,
}

/// One page of candles plus the cursors callers use to continue paging.
#[derive(Debug, Clone, Serialize)]
pub struct CandlePage {
    pub candles: Vec<OHLCVCandle>,
    pub next_cursor: Option<i64>,
    pub prev_cursor: Option<i64>,
}

/// Filters for [`CandleStore::delete`]. At least one must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteFilter {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub interval: Option<Interval>,
}

impl DeleteFilter {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none() && self.symbol.is_none() && self.interval.is_none()
    }
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatistics {
    pub total_candles: u64,
    pub provider_count: u64,
    pub symbol_count: u64,
    pub interval_count: u64,
    pub oldest_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
}

/// One row of a grouped statistics breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatistics {
    pub key: String,
    pub candle_count: u64,
    pub oldest_timestamp: i64,
    pub newest_timestamp: i64,
}

/// Statistics with per-provider / per-symbol / per-interval breakdowns.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedStatistics {
    pub totals: StoreStatistics,
    pub providers: Vec<GroupStatistics>,
    pub symbols: Vec<GroupStatistics>,
    pub intervals: Vec<GroupStatistics>,
}

// =============================================================================
// CandleStore
// =============================================================================

pub struct CandleStore {
    pool: Pool<SqliteConnectionManager>,
}

impl CandleStore {
    /// Open (or create) the store at `path` and ensure the schema exists.
    pub fn open(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .with_context(|| format!("failed to open candle store at {path}"))?;

        let store = Self { pool };
        store.init_schema()?;
        // WAL keeps readers unblocked while the dispatcher writes.
        let conn = store.pool.get()?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        info!(path, "candle store opened");
        Ok(store)
    }

    /// In-memory store for tests. One connection only: each in-memory SQLite
    /// connection is its own database.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("failed to open in-memory candle store")?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialise candle schema")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Upsert a single candle. Returns `true` if the row was newly inserted,
    /// `false` if an identical key already existed (silent no-op).
    pub fn insert(&self, candle: &OHLCVCandle) -> Result<bool> {
        let conn = self.pool.get()?;
        let inserted = conn
            .execute(
                INSERT_SQL,
                params![
                    candle.provider,
                    candle.symbol,
                    candle.interval.as_str(),
                    candle.timestamp,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                ],
            )
            .context("candle insert failed")?;
        Ok(inserted > 0)
    }

    /// Upsert a batch of candles in one transaction (all-or-nothing) and
    /// return the number of rows that were actually new.
    pub fn insert_batch(&self, candles: &[OHLCVCandle]) -> Result<u64> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction().context("failed to begin transaction")?;

        let mut inserted: u64 = 0;
        {
            let mut stmt = tx.prepare(INSERT_SQL)?;
            for candle in candles {
                inserted += stmt.execute(params![
                    candle.provider,
                    candle.symbol,
                    candle.interval.as_str(),
                    candle.timestamp,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                ])? as u64;
            }
        }
        tx.commit().context("batch insert commit failed")?;

        debug!(
            total = candles.len(),
            inserted, "candle batch stored"
        );
        Ok(inserted)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Inclusive range scan, ascending by timestamp, across all providers.
    pub fn get_by_range(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
    ) -> Result<Vec<OHLCVCandle>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM candles \
             WHERE symbol = ?1 AND interval = ?2 AND timestamp BETWEEN ?3 AND ?4 \
             ORDER BY timestamp ASC, provider ASC",
        ))?;
        let rows = stmt
            .query_map(params![symbol, interval.as_str(), from, to], map_candle_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Range scan constrained to a single provider.
    pub fn get_by_range_for_provider(
        &self,
        provider: &str,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
    ) -> Result<Vec<OHLCVCandle>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM candles \
             WHERE provider = ?1 AND symbol = ?2 AND interval = ?3 \
               AND timestamp BETWEEN ?4 AND ?5 \
             ORDER BY timestamp ASC",
        ))?;
        let rows = stmt
            .query_map(
                params![provider, symbol, interval.as_str(), from, to],
                map_candle_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Cursor-paged scan. Both directions are cursor-inclusive; the backward
    /// page is fetched descending and reversed to chronological order.
    pub fn get_page(
        &self,
        provider: &str,
        symbol: &str,
        interval: Interval,
        cursor: i64,
        direction: PageDirection,
        limit: u32,
    ) -> Result<CandlePage> {
        let conn = self.pool.get()?;
        let sql = match direction {
            PageDirection::Forward => format!(
                "SELECT {SELECT_COLUMNS} FROM candles \
                 WHERE provider = ?1 AND symbol = ?2 AND interval = ?3 AND timestamp >= ?4 \
                 ORDER BY timestamp ASC LIMIT ?5",
            ),
            PageDirection::Backward => format!(
                "SELECT {SELECT_COLUMNS} FROM candles \
                 WHERE provider = ?1 AND symbol = ?2 AND interval = ?3 AND timestamp <= ?4 \
                 ORDER BY timestamp DESC LIMIT ?5",
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let mut candles = stmt
            .query_map(
                params![provider, symbol, interval.as_str(), cursor, limit],
                map_candle_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        if direction == PageDirection::Backward {
            candles.reverse();
        }

        let next_cursor = candles.last().map(|c| c.timestamp + 1);
        let prev_cursor = candles.first().map(|c| c.timestamp - 1);

        Ok(CandlePage {
            candles,
            next_cursor,
            prev_cursor,
        })
    }

    /// Most recent candle for a (symbol, interval), across providers.
    pub fn get_latest(&self, symbol: &str, interval: Interval) -> Result<Option<OHLCVCandle>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM candles \
                     WHERE symbol = ?1 AND interval = ?2 \
                     ORDER BY timestamp DESC LIMIT 1",
                ),
                params![symbol, interval.as_str()],
                map_candle_row,
            )
            .optional()?;
        Ok(row)
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    pub fn statistics(&self) -> Result<StoreStatistics> {
        let conn = self.pool.get()?;
        let stats = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT provider), COUNT(DISTINCT symbol), \
                    COUNT(DISTINCT interval), MIN(timestamp), MAX(timestamp) \
             FROM candles",
            [],
            |row| {
                Ok(StoreStatistics {
                    total_candles: row.get::<_, i64>(0)? as u64,
                    provider_count: row.get::<_, i64>(1)? as u64,
                    symbol_count: row.get::<_, i64>(2)? as u64,
                    interval_count: row.get::<_, i64>(3)? as u64,
                    oldest_timestamp: row.get(4)?,
                    newest_timestamp: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }

    pub fn detailed_statistics(&self) -> Result<DetailedStatistics> {
        Ok(DetailedStatistics {
            totals: self.statistics()?,
            providers: self.group_statistics("provider")?,
            symbols: self.group_statistics("symbol")?,
            intervals: self.group_statistics("interval")?,
        })
    }

    fn group_statistics(&self, column: &str) -> Result<Vec<GroupStatistics>> {
        let conn = self.pool.get()?;
        // `column` is one of three fixed identifiers, never caller input.
        let mut stmt = conn.prepare(&format!(
            "SELECT {column}, COUNT(*), MIN(timestamp), MAX(timestamp) \
             FROM candles GROUP BY {column} ORDER BY {column}",
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(GroupStatistics {
                    key: row.get(0)?,
                    candle_count: row.get::<_, i64>(1)? as u64,
                    oldest_timestamp: row.get(2)?,
                    newest_timestamp: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------------

    /// Delete rows matching the given filters. Rejected before touching
    /// storage when no filter is set. Returns the number of rows removed.
    pub fn delete(&self, filter: &DeleteFilter) -> Result<u64> {
        if filter.is_empty() {
            anyhow::bail!("delete requires at least one of provider, symbol, interval");
        }

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(provider) = &filter.provider {
            clauses.push("provider = ?");
            values.push(provider.clone());
        }
        if let Some(symbol) = &filter.symbol {
            clauses.push("symbol = ?");
            values.push(symbol.clone());
        }
        if let Some(interval) = filter.interval {
            clauses.push("interval = ?");
            values.push(interval.as_str().to_string());
        }

        let sql = format!("DELETE FROM candles WHERE {}", clauses.join(" AND "));
        let conn = self.pool.get()?;
        let removed = conn
            .execute(&sql, rusqlite::params_from_iter(values.iter()))
            .context("candle delete failed")?;

        info!(removed, filter = ?filter, "candles deleted");
        Ok(removed as u64)
    }
}

fn map_candle_row(row: &Row<'_>) -> rusqlite::Result<OHLCVCandle> {
    let interval_raw: String = row.get(2)?;
    let interval = Interval::from_str(&interval_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(OHLCVCandle {
        provider: row.get(0)?,
        symbol: row.get(1)?,
        interval,
        timestamp: row.get(3)?,
        open: row.get(4)?,
        high: row.get(5)?,
        low: row.get(6)?,
        close: row.get(7)?,
        volume: row.get(8)?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(provider: &str, symbol: &str, interval: Interval, ts: i64) -> OHLCVCandle {
        OHLCVCandle {
            symbol: symbol.into(),
            interval,
            timestamp: ts,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
            provider: provider.into(),
        }
    }

    fn store_with(candles: &[OHLCVCandle]) -> CandleStore {
        let store = CandleStore::open_in_memory().unwrap();
        store.insert_batch(candles).unwrap();
        store
    }

    #[test]
    fn insert_is_idempotent() {
        let store = CandleStore::open_in_memory().unwrap();
        let c = candle("binance", "BTC/USDT", Interval::M1, 60_000);

        assert!(store.insert(&c).unwrap());
        assert!(!store.insert(&c).unwrap());

        let rows = store
            .get_by_range("BTC/USDT", Interval::M1, 0, 120_000)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn batch_insert_counts_only_new_rows() {
        let store = CandleStore::open_in_memory().unwrap();
        let c = candle("binance", "BTC/USDT", Interval::M1, 60_000);

        // Two identical candles in one batch: exactly one row lands.
        let inserted = store.insert_batch(&[c.clone(), c.clone()]).unwrap();
        assert_eq!(inserted, 1);

        // Repeating the same batch inserts nothing.
        let inserted = store.insert_batch(&[c]).unwrap();
        assert_eq!(inserted, 0);
    }

    #[test]
    fn same_key_different_provider_is_distinct() {
        let store = store_with(&[
            candle("binance", "BTC/USDT", Interval::M1, 60_000),
            candle("coinbase", "BTC/USDT", Interval::M1, 60_000),
        ]);
        let rows = store
            .get_by_range("BTC/USDT", Interval::M1, 0, 120_000)
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn range_is_inclusive_and_bounded() {
        let store = store_with(&[
            candle("binance", "BTC/USDT", Interval::M1, 1_000),
            candle("binance", "BTC/USDT", Interval::M1, 2_000),
            candle("binance", "BTC/USDT", Interval::M1, 3_000),
            candle("binance", "BTC/USDT", Interval::M1, 4_000),
        ]);

        let rows = store
            .get_by_range("BTC/USDT", Interval::M1, 2_000, 3_000)
            .unwrap();
        let timestamps: Vec<i64> = rows.iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![2_000, 3_000]);
        assert!(rows.iter().all(|c| c.timestamp >= 2_000 && c.timestamp <= 3_000));
    }

    #[test]
    fn range_provider_filter_constrains_source() {
        let store = store_with(&[
            candle("binance", "BTC/USDT", Interval::M1, 1_000),
            candle("coinbase", "BTC/USDT", Interval::M1, 2_000),
        ]);
        let rows = store
            .get_by_range_for_provider("coinbase", "BTC/USDT", Interval::M1, 0, 10_000)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].provider, "coinbase");
    }

    #[test]
    fn paging_forward_and_backward() {
        let store = store_with(&[
            candle("binance", "BTC/USDT", Interval::M1, 1_000),
            candle("binance", "BTC/USDT", Interval::M1, 2_000),
            candle("binance", "BTC/USDT", Interval::M1, 3_000),
        ]);

        let fwd = store
            .get_page(
                "binance",
                "BTC/USDT",
                Interval::M1,
                2_000,
                PageDirection::Forward,
                10,
            )
            .unwrap();
        let timestamps: Vec<i64> = fwd.candles.iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![2_000, 3_000]);
        assert_eq!(fwd.next_cursor, Some(3_001));
        assert_eq!(fwd.prev_cursor, Some(1_999));

        let bwd = store
            .get_page(
                "binance",
                "BTC/USDT",
                Interval::M1,
                2_000,
                PageDirection::Backward,
                10,
            )
            .unwrap();
        let timestamps: Vec<i64> = bwd.candles.iter().map(|c| c.timestamp).collect();
        // Backward pages still come back in ascending order.
        assert_eq!(timestamps, vec![1_000, 2_000]);
        assert_eq!(bwd.next_cursor, Some(2_001));
        assert_eq!(bwd.prev_cursor, Some(999));
    }

    #[test]
    fn paging_respects_limit() {
        let store = store_with(&[
            candle("binance", "BTC/USDT", Interval::M1, 1_000),
            candle("binance", "BTC/USDT", Interval::M1, 2_000),
            candle("binance", "BTC/USDT", Interval::M1, 3_000),
        ]);
        let page = store
            .get_page(
                "binance",
                "BTC/USDT",
                Interval::M1,
                0,
                PageDirection::Forward,
                2,
            )
            .unwrap();
        assert_eq!(page.candles.len(), 2);
        assert_eq!(page.next_cursor, Some(2_001));
    }

    #[test]
    fn empty_page_yields_null_cursors() {
        let store = CandleStore::open_in_memory().unwrap();
        let page = store
            .get_page(
                "binance",
                "BTC/USDT",
                Interval::M1,
                0,
                PageDirection::Forward,
                10,
            )
            .unwrap();
        assert!(page.candles.is_empty());
        assert_eq!(page.next_cursor, None);
        assert_eq!(page.prev_cursor, None);
    }

    #[test]
    fn latest_returns_most_recent_or_none() {
        let store = store_with(&[
            candle("binance", "BTC/USDT", Interval::M1, 1_000),
            candle("binance", "BTC/USDT", Interval::M1, 3_000),
        ]);
        let latest = store.get_latest("BTC/USDT", Interval::M1).unwrap().unwrap();
        assert_eq!(latest.timestamp, 3_000);

        assert!(store.get_latest("ETH/USDT", Interval::M1).unwrap().is_none());
    }

    #[test]
    fn statistics_counts_and_bounds() {
        let store = store_with(&[
            candle("binance", "BTC/USDT", Interval::M1, 1_000),
            candle("binance", "ETH/USDT", Interval::M5, 2_000),
            candle("coinbase", "BTC/USD", Interval::M1, 3_000),
        ]);

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_candles, 3);
        assert_eq!(stats.provider_count, 2);
        assert_eq!(stats.symbol_count, 3);
        assert_eq!(stats.interval_count, 2);
        assert_eq!(stats.oldest_timestamp, Some(1_000));
        assert_eq!(stats.newest_timestamp, Some(3_000));

        let detailed = store.detailed_statistics().unwrap();
        assert_eq!(detailed.providers.len(), 2);
        let binance = detailed
            .providers
            .iter()
            .find(|g| g.key == "binance")
            .unwrap();
        assert_eq!(binance.candle_count, 2);
        assert_eq!(binance.oldest_timestamp, 1_000);
        assert_eq!(binance.newest_timestamp, 2_000);
        assert_eq!(detailed.intervals.len(), 2);
    }

    #[test]
    fn statistics_on_empty_store() {
        let store = CandleStore::open_in_memory().unwrap();
        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_candles, 0);
        assert_eq!(stats.oldest_timestamp, None);
        assert_eq!(stats.newest_timestamp, None);
    }

    #[test]
    fn delete_requires_a_filter() {
        let store = store_with(&[candle("binance", "BTC/USDT", Interval::M1, 1_000)]);

        assert!(store.delete(&DeleteFilter::default()).is_err());
        // Nothing was removed by the rejected call.
        assert_eq!(store.statistics().unwrap().total_candles, 1);
    }

    #[test]
    fn delete_applies_filters() {
        let store = store_with(&[
            candle("binance", "BTC/USDT", Interval::M1, 1_000),
            candle("binance", "BTC/USDT", Interval::M5, 1_000),
            candle("coinbase", "BTC/USD", Interval::M1, 1_000),
        ]);

        let removed = store
            .delete(&DeleteFilter {
                provider: Some("binance".into()),
                interval: Some(Interval::M1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.statistics().unwrap().total_candles, 2);
    }
}
