// =============================================================================
// Store — SQLite timeseries, symbol metadata, derived stats, anomaly log
// =============================================================================
//
// Single-writer storage for the sentinel. All writes are batched per cycle and
// committed in one transaction per table; metric tables carry a
// (timestamp, symbol_id) primary key and batch inserts use INSERT OR IGNORE,
// so re-ingesting a cycle is idempotent.
//
// WAL + synchronous=NORMAL keeps committed cycles across abrupt termination.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::types::{
    AnomalyRecord, AnomalyRow, CollectorStats, FundingRow, LsRow, MetricKind, OiPoint, OiRow,
    Severity, SymbolMeta, SymbolRef, SymbolStats, TakerRow,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS symbols (
    id INTEGER PRIMARY KEY,
    symbol TEXT UNIQUE NOT NULL,
    base_asset TEXT,
    status TEXT DEFAULT 'active',
    is_hot INTEGER DEFAULT 1,
    quote_volume_24h REAL DEFAULT 0,
    first_seen INTEGER,
    last_seen INTEGER
);

CREATE TABLE IF NOT EXISTS open_interest (
    timestamp INTEGER NOT NULL,
    symbol_id INTEGER NOT NULL,
    oi_contracts REAL,
    oi_usd REAL,
    mark_price REAL,
    PRIMARY KEY (timestamp, symbol_id)
);

CREATE TABLE IF NOT EXISTS funding_rate (
    timestamp INTEGER NOT NULL,
    symbol_id INTEGER NOT NULL,
    rate REAL,
    next_funding_time INTEGER,
    PRIMARY KEY (timestamp, symbol_id)
);

CREATE TABLE IF NOT EXISTS long_short_ratio (
    timestamp INTEGER NOT NULL,
    symbol_id INTEGER NOT NULL,
    ratio REAL,
    long_pct REAL,
    short_pct REAL,
    PRIMARY KEY (timestamp, symbol_id)
);

CREATE TABLE IF NOT EXISTS taker_ratio (
    timestamp INTEGER NOT NULL,
    symbol_id INTEGER NOT NULL,
    buy_sell_ratio REAL,
    buy_vol REAL,
    sell_vol REAL,
    PRIMARY KEY (timestamp, symbol_id)
);

CREATE TABLE IF NOT EXISTS anomalies (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    cycle_ts INTEGER NOT NULL,
    symbol_id INTEGER NOT NULL,
    type TEXT NOT NULL,
    severity TEXT NOT NULL DEFAULT 'medium',
    value REAL,
    description TEXT,
    notified INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS symbol_stats (
    symbol_id INTEGER PRIMARY KEY,
    updated_at INTEGER,
    mean_funding REAL,
    std_funding REAL,
    mean_oi_change_1h REAL,
    std_oi_change_1h REAL,
    mean_ls_ratio REAL,
    std_ls_ratio REAL,
    mean_taker_ratio REAL,
    std_taker_ratio REAL,
    avg_oi_usd REAL
);

CREATE TABLE IF NOT EXISTS collector_stats (
    timestamp INTEGER PRIMARY KEY,
    cycle_duration_sec REAL,
    requests_ok INTEGER,
    requests_failed INTEGER,
    pairs_collected INTEGER,
    anomalies_found INTEGER
);

CREATE INDEX IF NOT EXISTS idx_oi_symbol ON open_interest(symbol_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_funding_symbol ON funding_rate(symbol_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_ls_symbol ON long_short_ratio(symbol_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_taker_symbol ON taker_ratio(symbol_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_anomalies_time ON anomalies(timestamp);
CREATE INDEX IF NOT EXISTS idx_anomalies_cycle ON anomalies(cycle_ts);
CREATE INDEX IF NOT EXISTS idx_stats_time ON collector_stats(timestamp);
"#;

/// The four metric tables eligible for archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricTable {
    OpenInterest,
    FundingRate,
    LongShortRatio,
    TakerRatio,
}

impl MetricTable {
    pub const ALL: [MetricTable; 4] = [
        MetricTable::OpenInterest,
        MetricTable::FundingRate,
        MetricTable::LongShortRatio,
        MetricTable::TakerRatio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenInterest => "open_interest",
            Self::FundingRate => "funding_rate",
            Self::LongShortRatio => "long_short_ratio",
            Self::TakerRatio => "taker_ratio",
        }
    }
}

/// Latest state of one pair, as reported to the operator.
#[derive(Debug, Clone)]
pub struct PairSnapshot {
    pub symbol: String,
    pub is_hot: bool,
    pub quote_volume_24h: f64,
    pub oi_contracts: Option<f64>,
    pub oi_usd: Option<f64>,
    pub mark_price: Option<f64>,
    /// Latest oi_usd at or before now − 1h / 24h / 7d.
    pub oi_1h: Option<f64>,
    pub oi_24h: Option<f64>,
    pub oi_7d: Option<f64>,
    pub funding: Option<f64>,
    pub funding_7d_avg: Option<f64>,
    pub ls_ratio: Option<f64>,
    pub long_pct: Option<f64>,
    pub short_pct: Option<f64>,
    pub taker_ratio: Option<f64>,
}

/// SQLite-backed store. Cheap to clone; all methods lock internally so the
/// single writer and any readers serialise on the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open (or create) the store at `path` and apply pragmas + schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous=NORMAL")?;
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;

        info!(path = %path.display(), "database initialised");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    // ── symbols ──────────────────────────────────────────────────────────────

    /// Insert or re-activate symbols; returns the full {symbol → id} map.
    pub fn upsert_symbols(&self, symbols: &[SymbolMeta], now: i64) -> Result<HashMap<String, i64>> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO symbols (symbol, base_asset, status, first_seen, last_seen)
                     VALUES (?1, ?2, 'active', ?3, ?3)
                     ON CONFLICT(symbol) DO UPDATE SET
                         status='active', last_seen=excluded.last_seen",
                )?;
                for s in symbols {
                    stmt.execute(params![s.symbol, s.base_asset, now])?;
                }
            }
            tx.commit()?;
        }
        self.symbol_map()
    }

    pub fn symbol_map(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT symbol, id FROM symbols")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut map = HashMap::new();
        for row in rows {
            let (sym, id) = row?;
            map.insert(sym, id);
        }
        Ok(map)
    }

    /// Apply the hot filter: {symbol → (is_hot, 24h quote volume)}.
    pub fn update_hot_status(&self, hot: &HashMap<String, (bool, f64)>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE symbols SET is_hot=?1, quote_volume_24h=?2 WHERE symbol=?3",
            )?;
            for (symbol, (is_hot, vol)) in hot {
                stmt.execute(params![*is_hot as i64, vol, symbol])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn hot_symbols(&self) -> Result<Vec<SymbolRef>> {
        self.select_symbols("SELECT id, symbol FROM symbols WHERE is_hot=1 AND status='active'")
    }

    pub fn active_symbols(&self) -> Result<Vec<SymbolRef>> {
        self.select_symbols("SELECT id, symbol FROM symbols WHERE status='active'")
    }

    fn select_symbols(&self, sql: &str) -> Result<Vec<SymbolRef>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map([], |r| {
            Ok(SymbolRef {
                id: r.get(0)?,
                symbol: r.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("symbol query failed")
    }

    /// (hot, total) counts over active symbols.
    pub fn symbol_counts(&self) -> Result<(u32, u32)> {
        let conn = self.conn.lock();
        let total: u32 = conn.query_row(
            "SELECT COUNT(*) FROM symbols WHERE status='active'",
            [],
            |r| r.get(0),
        )?;
        let hot: u32 = conn.query_row(
            "SELECT COUNT(*) FROM symbols WHERE status='active' AND is_hot=1",
            [],
            |r| r.get(0),
        )?;
        Ok((hot, total))
    }

    // ── batch inserts ────────────────────────────────────────────────────────

    pub fn insert_open_interest(&self, rows: &[OiRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO open_interest
                 (timestamp, symbol_id, oi_contracts, oi_usd, mark_price)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in rows {
                stmt.execute(params![r.ts, r.symbol_id, r.oi_contracts, r.oi_usd, r.mark_price])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_funding_rates(&self, rows: &[FundingRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO funding_rate
                 (timestamp, symbol_id, rate, next_funding_time)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for r in rows {
                stmt.execute(params![r.ts, r.symbol_id, r.rate, r.next_funding_time])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_long_short_ratios(&self, rows: &[LsRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO long_short_ratio
                 (timestamp, symbol_id, ratio, long_pct, short_pct)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in rows {
                stmt.execute(params![r.ts, r.symbol_id, r.ratio, r.long_pct, r.short_pct])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_taker_ratios(&self, rows: &[TakerRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO taker_ratio
                 (timestamp, symbol_id, buy_sell_ratio, buy_vol, sell_vol)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in rows {
                stmt.execute(params![r.ts, r.symbol_id, r.buy_sell_ratio, r.buy_vol, r.sell_vol])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_anomalies(&self, rows: &[AnomalyRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO anomalies
                 (timestamp, cycle_ts, symbol_id, type, severity, value, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.detected_at,
                    r.cycle_ts,
                    r.symbol_id,
                    r.kind.as_str(),
                    r.severity.as_str(),
                    r.value,
                    r.description,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_collector_stats(&self, s: &CollectorStats) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO collector_stats
             (timestamp, cycle_duration_sec, requests_ok,
              requests_failed, pairs_collected, anomalies_found)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                s.cycle_ts,
                s.duration_sec,
                s.requests_ok,
                s.requests_fail,
                s.pairs_collected,
                s.anomalies_found,
            ],
        )?;
        Ok(())
    }

    // ── cache hydration ──────────────────────────────────────────────────────

    /// Load the newest value per (symbol, metric) so restart produces no
    /// spurious change-detection.
    pub fn load_last_values(&self) -> Result<HashMap<(i64, MetricKind), f64>> {
        let mut last = HashMap::new();
        self.load_latest_into(
            &mut last,
            MetricKind::Oi,
            "SELECT t.symbol_id, t.oi_contracts FROM open_interest t
             INNER JOIN (SELECT symbol_id, MAX(timestamp) AS max_ts
                         FROM open_interest GROUP BY symbol_id) m
                ON t.symbol_id = m.symbol_id AND t.timestamp = m.max_ts",
        )?;
        self.load_latest_into(
            &mut last,
            MetricKind::Funding,
            "SELECT t.symbol_id, t.rate FROM funding_rate t
             INNER JOIN (SELECT symbol_id, MAX(timestamp) AS max_ts
                         FROM funding_rate GROUP BY symbol_id) m
                ON t.symbol_id = m.symbol_id AND t.timestamp = m.max_ts",
        )?;
        self.load_latest_into(
            &mut last,
            MetricKind::Ls,
            "SELECT t.symbol_id, t.ratio FROM long_short_ratio t
             INNER JOIN (SELECT symbol_id, MAX(timestamp) AS max_ts
                         FROM long_short_ratio GROUP BY symbol_id) m
                ON t.symbol_id = m.symbol_id AND t.timestamp = m.max_ts",
        )?;
        self.load_latest_into(
            &mut last,
            MetricKind::Taker,
            "SELECT t.symbol_id, t.buy_sell_ratio FROM taker_ratio t
             INNER JOIN (SELECT symbol_id, MAX(timestamp) AS max_ts
                         FROM taker_ratio GROUP BY symbol_id) m
                ON t.symbol_id = m.symbol_id AND t.timestamp = m.max_ts",
        )?;
        info!(count = last.len(), "cache hydration: loaded last values");
        Ok(last)
    }

    fn load_latest_into(
        &self,
        out: &mut HashMap<(i64, MetricKind), f64>,
        kind: MetricKind,
        sql: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, Option<f64>>(1)?))
        })?;
        for row in rows {
            let (sid, val) = row?;
            if let Some(v) = val {
                out.insert((sid, kind), v);
            }
        }
        Ok(())
    }

    // ── symbol stats ─────────────────────────────────────────────────────────

    pub fn load_symbol_stats(&self) -> Result<HashMap<i64, SymbolStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol_id, updated_at, mean_funding, std_funding,
                    mean_oi_change_1h, std_oi_change_1h,
                    mean_ls_ratio, std_ls_ratio,
                    mean_taker_ratio, std_taker_ratio, avg_oi_usd
             FROM symbol_stats",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(SymbolStats {
                symbol_id: r.get(0)?,
                updated_at: r.get(1)?,
                mean_funding: r.get(2)?,
                std_funding: r.get(3)?,
                mean_oi_change_1h: r.get(4)?,
                std_oi_change_1h: r.get(5)?,
                mean_ls_ratio: r.get(6)?,
                std_ls_ratio: r.get(7)?,
                mean_taker_ratio: r.get(8)?,
                std_taker_ratio: r.get(9)?,
                avg_oi_usd: r.get::<_, Option<f64>>(10)?.unwrap_or(0.0),
            })
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let s = row?;
            map.insert(s.symbol_id, s);
        }
        Ok(map)
    }

    /// Replace the stats rows for the given symbols.
    pub fn save_symbol_stats(&self, rows: &[SymbolStats]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO symbol_stats
                 (symbol_id, updated_at, mean_funding, std_funding,
                  mean_oi_change_1h, std_oi_change_1h,
                  mean_ls_ratio, std_ls_ratio,
                  mean_taker_ratio, std_taker_ratio, avg_oi_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for s in rows {
                stmt.execute(params![
                    s.symbol_id,
                    s.updated_at,
                    s.mean_funding,
                    s.std_funding,
                    s.mean_oi_change_1h,
                    s.std_oi_change_1h,
                    s.mean_ls_ratio,
                    s.std_ls_ratio,
                    s.mean_taker_ratio,
                    s.std_taker_ratio,
                    s.avg_oi_usd,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── series queries for the stats worker ──────────────────────────────────

    pub fn funding_series(&self, symbol_id: i64, since: i64) -> Result<Vec<f64>> {
        self.select_series(
            "SELECT rate FROM funding_rate
             WHERE symbol_id=?1 AND timestamp>=?2 AND rate IS NOT NULL",
            symbol_id,
            since,
        )
    }

    /// 1-hour OI change samples: pairs of rows exactly 3600 s apart.
    pub fn oi_changes_1h(&self, symbol_id: i64, since: i64) -> Result<Vec<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT a.oi_usd, b.oi_usd
             FROM open_interest a
             INNER JOIN open_interest b
                 ON a.symbol_id = b.symbol_id
                 AND b.timestamp = a.timestamp - 3600
             WHERE a.symbol_id=?1 AND a.timestamp>=?2
                 AND a.oi_usd IS NOT NULL AND b.oi_usd IS NOT NULL
                 AND b.oi_usd > 0",
        )?;
        let rows = stmt.query_map(params![symbol_id, since], |r| {
            Ok((r.get::<_, f64>(0)?, r.get::<_, f64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (cur, prev) = row?;
            out.push((cur - prev) / prev);
        }
        Ok(out)
    }

    pub fn ls_series(&self, symbol_id: i64, since: i64) -> Result<Vec<f64>> {
        self.select_series(
            "SELECT ratio FROM long_short_ratio
             WHERE symbol_id=?1 AND timestamp>=?2 AND ratio IS NOT NULL",
            symbol_id,
            since,
        )
    }

    pub fn taker_series(&self, symbol_id: i64, since: i64) -> Result<Vec<f64>> {
        self.select_series(
            "SELECT buy_sell_ratio FROM taker_ratio
             WHERE symbol_id=?1 AND timestamp>=?2 AND buy_sell_ratio IS NOT NULL",
            symbol_id,
            since,
        )
    }

    fn select_series(&self, sql: &str, symbol_id: i64, since: i64) -> Result<Vec<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![symbol_id, since], |r| r.get::<_, f64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("series query failed")
    }

    pub fn avg_oi_usd(&self, symbol_id: i64, since: i64) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(oi_usd) FROM open_interest WHERE symbol_id=?1 AND timestamp>=?2",
            params![symbol_id, since],
            |r| r.get(0),
        )?;
        Ok(avg)
    }

    // ── queries for anomaly detection ────────────────────────────────────────

    pub fn count_oi(&self, symbol_id: i64) -> Result<u32> {
        let conn = self.conn.lock();
        let cnt: u32 = conn.query_row(
            "SELECT COUNT(*) FROM open_interest WHERE symbol_id=?1",
            params![symbol_id],
            |r| r.get(0),
        )?;
        Ok(cnt)
    }

    /// Newest oi_usd at or before `ts`.
    pub fn oi_at_or_before(&self, symbol_id: i64, ts: i64) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let row: Option<Option<f64>> = conn
            .query_row(
                "SELECT oi_usd FROM open_interest
                 WHERE symbol_id=?1 AND timestamp<=?2
                 ORDER BY timestamp DESC LIMIT 1",
                params![symbol_id, ts],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.flatten())
    }

    /// [(timestamp, oi_usd)] ascending, for the flush window.
    pub fn oi_history_since(&self, symbol_id: i64, since: i64) -> Result<Vec<(i64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, oi_usd FROM open_interest
             WHERE symbol_id=?1 AND timestamp>=?2 AND oi_usd IS NOT NULL
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![symbol_id, since], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("oi history query failed")
    }

    /// Last `limit` OI samples, ascending: [(timestamp, oi_usd)].
    pub fn recent_oi_window(&self, symbol_id: i64, limit: usize) -> Result<Vec<(i64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, oi_usd FROM open_interest
             WHERE symbol_id=?1 AND oi_usd IS NOT NULL
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol_id, limit as i64], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?))
        })?;
        let mut window = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("recent oi window query failed")?;
        window.reverse();
        Ok(window)
    }

    /// Newest funding rate recorded strictly before `ts` (i.e. before the
    /// current cycle's rows).
    pub fn funding_before(&self, symbol_id: i64, ts: i64) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let row: Option<Option<f64>> = conn
            .query_row(
                "SELECT rate FROM funding_rate
                 WHERE symbol_id=?1 AND timestamp<?2
                 ORDER BY timestamp DESC LIMIT 1",
                params![symbol_id, ts],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.flatten())
    }

    pub fn latest_funding(&self, symbol_id: i64) -> Result<Option<f64>> {
        self.latest_value(
            "SELECT rate FROM funding_rate
             WHERE symbol_id=?1 ORDER BY timestamp DESC LIMIT 1",
            symbol_id,
        )
    }

    /// Latest (ratio, long_pct).
    pub fn latest_ls(&self, symbol_id: i64) -> Result<Option<(f64, f64)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT ratio, long_pct FROM long_short_ratio
                 WHERE symbol_id=?1 ORDER BY timestamp DESC LIMIT 1",
                params![symbol_id],
                |r| {
                    Ok((
                        r.get::<_, Option<f64>>(0)?,
                        r.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                    ))
                },
            )
            .optional()?;
        Ok(row.and_then(|(ratio, long_pct)| ratio.map(|x| (x, long_pct))))
    }

    pub fn latest_taker(&self, symbol_id: i64) -> Result<Option<f64>> {
        self.latest_value(
            "SELECT buy_sell_ratio FROM taker_ratio
             WHERE symbol_id=?1 ORDER BY timestamp DESC LIMIT 1",
            symbol_id,
        )
    }

    fn latest_value(&self, sql: &str, symbol_id: i64) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let row: Option<Option<f64>> = conn
            .query_row(sql, params![symbol_id], |r| r.get(0))
            .optional()?;
        Ok(row.flatten())
    }

    // ── anomaly & collector-stats reads ──────────────────────────────────────

    pub fn recent_anomalies(&self, limit: u32) -> Result<Vec<AnomalyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT a.id, a.timestamp, a.cycle_ts, s.symbol, a.type,
                    a.severity, a.value, a.description
             FROM anomalies a
             JOIN symbols s ON a.symbol_id = s.id
             ORDER BY a.timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |r| {
            Ok(AnomalyRecord {
                id: r.get(0)?,
                detected_at: r.get(1)?,
                cycle_ts: r.get(2)?,
                symbol: r.get(3)?,
                kind: r.get(4)?,
                severity: Severity::parse(&r.get::<_, String>(5)?),
                value: r.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                description: r.get::<_, Option<String>>(7)?.unwrap_or_default(),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("recent anomalies query failed")
    }

    /// Severity → count for anomalies at or after `since`.
    pub fn anomaly_counts_since(&self, since: i64) -> Result<HashMap<String, u32>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT severity, COUNT(*) FROM anomalies WHERE timestamp>=?1 GROUP BY severity",
        )?;
        let rows = stmt.query_map(params![since], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (sev, cnt) = row?;
            map.insert(sev, cnt);
        }
        Ok(map)
    }

    pub fn last_collector_stats(&self) -> Result<Option<CollectorStats>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT timestamp, cycle_duration_sec, requests_ok,
                        requests_failed, pairs_collected, anomalies_found
                 FROM collector_stats ORDER BY timestamp DESC LIMIT 1",
                [],
                |r| {
                    Ok(CollectorStats {
                        cycle_ts: r.get(0)?,
                        duration_sec: r.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                        requests_ok: r.get::<_, Option<u32>>(2)?.unwrap_or(0),
                        requests_fail: r.get::<_, Option<u32>>(3)?.unwrap_or(0),
                        pairs_collected: r.get::<_, Option<u32>>(4)?.unwrap_or(0),
                        anomalies_found: r.get::<_, Option<u32>>(5)?.unwrap_or(0),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ── daily summary queries ────────────────────────────────────────────────

    /// Top |funding| readings since `since`: (symbol, rate).
    pub fn daily_top_funding(&self, since: i64, limit: u32) -> Result<Vec<(String, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT s.symbol, fr.rate
             FROM funding_rate fr
             INNER JOIN symbols s ON fr.symbol_id = s.id
             WHERE fr.timestamp >= ?1 AND fr.rate IS NOT NULL
             ORDER BY ABS(fr.rate) DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, limit], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("top funding query failed")
    }

    /// Largest intraday OI range since `since`: (symbol, range pct).
    pub fn daily_top_oi_change(&self, since: i64, limit: u32) -> Result<Vec<(String, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT s.symbol,
                    (MAX(oi.oi_usd) - MIN(oi.oi_usd)) / MIN(oi.oi_usd) * 100 AS pct
             FROM open_interest oi
             INNER JOIN symbols s ON oi.symbol_id = s.id
             WHERE oi.timestamp >= ?1 AND oi.oi_usd > 0
             GROUP BY oi.symbol_id
             ORDER BY pct DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, limit], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("top oi change query failed")
    }

    /// Highest L/S ratio seen since `since`: (symbol, max ratio).
    pub fn daily_top_ls(&self, since: i64, limit: u32) -> Result<Vec<(String, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT s.symbol, MAX(ls.ratio) AS max_ratio
             FROM long_short_ratio ls
             INNER JOIN symbols s ON ls.symbol_id = s.id
             WHERE ls.timestamp >= ?1 AND ls.ratio IS NOT NULL
             GROUP BY ls.symbol_id
             ORDER BY max_ratio DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, limit], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("top ls query failed")
    }

    /// Full latest snapshot of one pair, `None` if the symbol is unknown.
    pub fn pair_snapshot(&self, symbol: &str, now: i64) -> Result<Option<PairSnapshot>> {
        let sym = symbol.to_uppercase();
        let meta = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id, symbol, is_hot, quote_volume_24h FROM symbols WHERE symbol=?1",
                params![sym],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)? != 0,
                        r.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    ))
                },
            )
            .optional()?
        };
        let Some((sid, symbol, is_hot, quote_volume_24h)) = meta else {
            return Ok(None);
        };

        let latest_oi = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT oi_contracts, oi_usd, mark_price FROM open_interest
                 WHERE symbol_id=?1 ORDER BY timestamp DESC LIMIT 1",
                params![sid],
                |r| {
                    Ok((
                        r.get::<_, Option<f64>>(0)?,
                        r.get::<_, Option<f64>>(1)?,
                        r.get::<_, Option<f64>>(2)?,
                    ))
                },
            )
            .optional()?
        };
        let (oi_contracts, oi_usd, mark_price) = latest_oi.unwrap_or((None, None, None));

        let funding_7d_avg = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT AVG(rate) FROM funding_rate WHERE symbol_id=?1 AND timestamp>=?2",
                params![sid, now - 604_800],
                |r| r.get::<_, Option<f64>>(0),
            )?
        };

        let ls = self.latest_ls(sid)?;
        let short_pct = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT short_pct FROM long_short_ratio
                 WHERE symbol_id=?1 ORDER BY timestamp DESC LIMIT 1",
                params![sid],
                |r| r.get::<_, Option<f64>>(0),
            )
            .optional()?
            .flatten()
        };

        Ok(Some(PairSnapshot {
            symbol,
            is_hot,
            quote_volume_24h,
            oi_contracts,
            oi_usd,
            mark_price,
            oi_1h: self.oi_at_or_before(sid, now - 3600)?,
            oi_24h: self.oi_at_or_before(sid, now - 86_400)?,
            oi_7d: self.oi_at_or_before(sid, now - 604_800)?,
            funding: self.latest_funding(sid)?,
            funding_7d_avg,
            ls_ratio: ls.map(|(r, _)| r),
            long_pct: ls.map(|(_, l)| l),
            short_pct,
            taker_ratio: self.latest_taker(sid)?,
        }))
    }

    // ── backtest loaders ─────────────────────────────────────────────────────

    /// (min, max) timestamp over open_interest, `None` when empty.
    pub fn oi_time_range(&self) -> Result<Option<(i64, i64)>> {
        let conn = self.conn.lock();
        let row: (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM open_interest",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(match row {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        })
    }

    /// Full OI series for one symbol, both oi_usd and mark_price present.
    pub fn oi_series(&self, symbol_id: i64) -> Result<Vec<OiPoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, oi_usd, mark_price FROM open_interest
             WHERE symbol_id = ?1 AND oi_usd IS NOT NULL AND mark_price IS NOT NULL
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![symbol_id], |r| {
            Ok(OiPoint {
                ts: r.get(0)?,
                oi_usd: r.get(1)?,
                mark_price: r.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("oi series query failed")
    }

    pub fn funding_at_or_before(&self, symbol_id: i64, ts: i64) -> Result<Option<f64>> {
        self.metric_at_or_before("funding_rate", "rate", symbol_id, ts)
    }

    pub fn ls_at_or_before(&self, symbol_id: i64, ts: i64) -> Result<Option<f64>> {
        self.metric_at_or_before("long_short_ratio", "ratio", symbol_id, ts)
    }

    pub fn taker_at_or_before(&self, symbol_id: i64, ts: i64) -> Result<Option<f64>> {
        self.metric_at_or_before("taker_ratio", "buy_sell_ratio", symbol_id, ts)
    }

    fn metric_at_or_before(
        &self,
        table: &str,
        column: &str,
        symbol_id: i64,
        ts: i64,
    ) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {column} FROM {table}
             WHERE symbol_id = ?1 AND timestamp <= ?2
             ORDER BY timestamp DESC LIMIT 1"
        );
        let row: Option<Option<f64>> = conn
            .query_row(&sql, params![symbol_id, ts], |r| r.get(0))
            .optional()?;
        Ok(row.flatten())
    }

    /// All L/S ratios grouped by symbol, for adaptive threshold fitting.
    pub fn ls_ratios_by_symbol(&self) -> Result<HashMap<i64, Vec<f64>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol_id, ratio FROM long_short_ratio
             WHERE ratio IS NOT NULL ORDER BY symbol_id",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?)))?;
        let mut map: HashMap<i64, Vec<f64>> = HashMap::new();
        for row in rows {
            let (sid, ratio) = row?;
            map.entry(sid).or_default().push(ratio);
        }
        Ok(map)
    }

    /// Timestamps where L/S exceeds `ls_threshold` while the taker ratio sits
    /// below `taker_threshold`, joined on equal sample timestamps.
    pub fn ls_taker_hits(
        &self,
        symbol_id: i64,
        ls_threshold: f64,
        taker_threshold: f64,
    ) -> Result<Vec<(i64, f64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ls.timestamp, ls.ratio, t.buy_sell_ratio
             FROM long_short_ratio ls
             INNER JOIN taker_ratio t
                 ON ls.symbol_id = t.symbol_id AND ls.timestamp = t.timestamp
             WHERE ls.symbol_id = ?1
               AND ls.ratio > ?2
               AND t.buy_sell_ratio < ?3
             ORDER BY ls.timestamp ASC",
        )?;
        let rows = stmt.query_map(params![symbol_id, ls_threshold, taker_threshold], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("ls/taker join query failed")
    }

    // ── archive ──────────────────────────────────────────────────────────────

    /// Header and stringified rows older than `before_ts`, for CSV export.
    pub fn archive_rows(
        &self,
        table: MetricTable,
        before_ts: i64,
    ) -> Result<(Vec<String>, Vec<Vec<String>>)> {
        let conn = self.conn.lock();
        let sql = format!("SELECT * FROM {} WHERE timestamp < ?1", table.as_str());
        let mut stmt = conn.prepare(&sql)?;
        let header: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let ncols = header.len();
        let rows = stmt.query_map(params![before_ts], |r| {
            let mut out = Vec::with_capacity(ncols);
            for i in 0..ncols {
                let cell = match r.get_ref(i)? {
                    rusqlite::types::ValueRef::Null => String::new(),
                    rusqlite::types::ValueRef::Integer(v) => v.to_string(),
                    rusqlite::types::ValueRef::Real(v) => v.to_string(),
                    rusqlite::types::ValueRef::Text(t) => {
                        String::from_utf8_lossy(t).into_owned()
                    }
                    rusqlite::types::ValueRef::Blob(_) => String::new(),
                };
                out.push(cell);
            }
            Ok(out)
        })?;
        let data = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("archive query failed")?;
        Ok((header, data))
    }

    pub fn delete_rows_before(&self, table: MetricTable, before_ts: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let sql = format!("DELETE FROM {} WHERE timestamp < ?1", table.as_str());
        let deleted = conn.execute(&sql, params![before_ts])?;
        Ok(deleted)
    }

    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn size_mb(&self) -> f64 {
        std::fs::metadata(&self.path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnomalyKind;

    fn meta(symbol: &str) -> SymbolMeta {
        SymbolMeta {
            symbol: symbol.to_string(),
            base_asset: symbol.trim_end_matches("USDT").to_string(),
        }
    }

    fn oi_row(ts: i64, sid: i64, contracts: f64, price: f64) -> OiRow {
        OiRow {
            ts,
            symbol_id: sid,
            oi_contracts: contracts,
            oi_usd: contracts * price,
            mark_price: price,
        }
    }

    #[test]
    fn upsert_symbols_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let map1 = db
            .upsert_symbols(&[meta("BTCUSDT"), meta("ETHUSDT")], 1000)
            .unwrap();
        let map2 = db
            .upsert_symbols(&[meta("BTCUSDT"), meta("ETHUSDT")], 2000)
            .unwrap();
        assert_eq!(map1, map2);
        assert_eq!(map1.len(), 2);
        let (_, total) = db.symbol_counts().unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn hot_filter_applies() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_symbols(&[meta("BTCUSDT"), meta("DOGEUSDT")], 0)
            .unwrap();
        let mut hot = HashMap::new();
        hot.insert("BTCUSDT".to_string(), (true, 5e9));
        hot.insert("DOGEUSDT".to_string(), (false, 1e5));
        db.update_hot_status(&hot).unwrap();

        let hot_syms = db.hot_symbols().unwrap();
        assert_eq!(hot_syms.len(), 1);
        assert_eq!(hot_syms[0].symbol, "BTCUSDT");
        assert_eq!(db.active_symbols().unwrap().len(), 2);
    }

    #[test]
    fn metric_insert_ignores_duplicate_primary_key() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("BTCUSDT")], 0).unwrap();
        let sid = map["BTCUSDT"];

        db.insert_open_interest(&[oi_row(300, sid, 100.0, 50_000.0)])
            .unwrap();
        // Re-ingest the same (ts, symbol) with a different value: ignored.
        db.insert_open_interest(&[oi_row(300, sid, 999.0, 50_000.0)])
            .unwrap();

        assert_eq!(db.count_oi(sid).unwrap(), 1);
        let series = db.oi_series(sid).unwrap();
        assert_eq!(series.len(), 1);
        assert!((series[0].oi_usd - 100.0 * 50_000.0).abs() < 1e-9);
    }

    #[test]
    fn oi_usd_is_contracts_times_mark() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("ETHUSDT")], 0).unwrap();
        let sid = map["ETHUSDT"];
        let row = oi_row(600, sid, 1234.5, 3210.75);
        db.insert_open_interest(&[row.clone()]).unwrap();
        let got = db.oi_series(sid).unwrap();
        assert_eq!(got[0].oi_usd, 1234.5 * 3210.75);
        assert_eq!(got[0].oi_usd, row.oi_usd);
    }

    #[test]
    fn hydration_returns_latest_committed_values() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("BTCUSDT")], 0).unwrap();
        let sid = map["BTCUSDT"];

        db.insert_open_interest(&[
            oi_row(300, sid, 100.0, 50_000.0),
            oi_row(600, sid, 110.0, 50_100.0),
        ])
        .unwrap();
        db.insert_funding_rates(&[
            FundingRow {
                ts: 300,
                symbol_id: sid,
                rate: 0.0001,
                next_funding_time: 0,
            },
            FundingRow {
                ts: 600,
                symbol_id: sid,
                rate: 0.0003,
                next_funding_time: 0,
            },
        ])
        .unwrap();
        db.insert_long_short_ratios(&[LsRow {
            ts: 600,
            symbol_id: sid,
            ratio: 2.5,
            long_pct: 0.71,
            short_pct: 0.29,
        }])
        .unwrap();
        db.insert_taker_ratios(&[TakerRow {
            ts: 600,
            symbol_id: sid,
            buy_sell_ratio: 0.8,
            buy_vol: 10.0,
            sell_vol: 12.5,
        }])
        .unwrap();

        let last = db.load_last_values().unwrap();
        assert_eq!(last[&(sid, MetricKind::Oi)], 110.0);
        assert_eq!(last[&(sid, MetricKind::Funding)], 0.0003);
        assert_eq!(last[&(sid, MetricKind::Ls)], 2.5);
        assert_eq!(last[&(sid, MetricKind::Taker)], 0.8);
    }

    #[test]
    fn oi_at_or_before_picks_newest_no_later_than_ts() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("BTCUSDT")], 0).unwrap();
        let sid = map["BTCUSDT"];
        db.insert_open_interest(&[
            oi_row(300, sid, 100.0, 1.0),
            oi_row(600, sid, 110.0, 1.0),
            oi_row(900, sid, 120.0, 1.0),
        ])
        .unwrap();

        assert_eq!(db.oi_at_or_before(sid, 650).unwrap(), Some(110.0));
        assert_eq!(db.oi_at_or_before(sid, 900).unwrap(), Some(120.0));
        assert_eq!(db.oi_at_or_before(sid, 100).unwrap(), None);

        let history = db.oi_history_since(sid, 600).unwrap();
        assert_eq!(history, vec![(600, 110.0), (900, 120.0)]);

        let window = db.recent_oi_window(sid, 2).unwrap();
        assert_eq!(window, vec![(600, 110.0), (900, 120.0)]);
    }

    #[test]
    fn symbol_stats_rows_are_replaced_not_appended() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("BTCUSDT")], 0).unwrap();
        let sid = map["BTCUSDT"];

        let mut s = SymbolStats {
            symbol_id: sid,
            updated_at: 1000,
            mean_funding: Some(0.0001),
            std_funding: Some(0.0002),
            avg_oi_usd: 1e9,
            ..Default::default()
        };
        db.save_symbol_stats(std::slice::from_ref(&s)).unwrap();
        s.updated_at = 2000;
        s.avg_oi_usd = 2e9;
        db.save_symbol_stats(std::slice::from_ref(&s)).unwrap();

        let loaded = db.load_symbol_stats().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&sid].updated_at, 2000);
        assert!((loaded[&sid].avg_oi_usd - 2e9).abs() < 1e-3);
        assert_eq!(loaded[&sid].mean_ls_ratio, None);
    }

    #[test]
    fn oi_changes_1h_requires_exact_hour_pairs() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("BTCUSDT")], 0).unwrap();
        let sid = map["BTCUSDT"];
        db.insert_open_interest(&[
            oi_row(0, sid, 100.0, 1.0),
            oi_row(3600, sid, 110.0, 1.0),
            oi_row(4000, sid, 115.0, 1.0),
        ])
        .unwrap();

        let changes = db.oi_changes_1h(sid, 0).unwrap();
        // Only (3600, 0) pairs up exactly; 4000 has no row at 400.
        assert_eq!(changes.len(), 1);
        assert!((changes[0] - 0.10).abs() < 1e-12);
    }

    #[test]
    fn anomaly_roundtrip_and_counts() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("BTCUSDT")], 0).unwrap();
        let sid = map["BTCUSDT"];

        db.insert_anomalies(&[
            AnomalyRow {
                detected_at: 1000,
                cycle_ts: 900,
                symbol_id: sid,
                kind: AnomalyKind::FundingSpike,
                severity: Severity::High,
                value: 0.002,
                description: "Funding 0.002000 (threshold 0.001000)".to_string(),
            },
            AnomalyRow {
                detected_at: 1100,
                cycle_ts: 900,
                symbol_id: sid,
                kind: AnomalyKind::OiFlush,
                severity: Severity::Medium,
                value: 4.9,
                description: "flush".to_string(),
            },
        ])
        .unwrap();

        let recent = db.recent_anomalies(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, "oi_flush");
        assert_eq!(recent[0].severity, Severity::Medium);
        assert_eq!(recent[1].symbol, "BTCUSDT");

        let counts = db.anomaly_counts_since(0).unwrap();
        assert_eq!(counts["high"], 1);
        assert_eq!(counts["medium"], 1);
    }

    #[test]
    fn collector_stats_latest_row() {
        let db = Database::open_in_memory().unwrap();
        for ts in [300, 600] {
            db.insert_collector_stats(&CollectorStats {
                cycle_ts: ts,
                duration_sec: 12.5,
                requests_ok: 40,
                requests_fail: 2,
                pairs_collected: 38,
                anomalies_found: 1,
            })
            .unwrap();
        }
        let last = db.last_collector_stats().unwrap().unwrap();
        assert_eq!(last.cycle_ts, 600);
        assert_eq!(last.requests_ok, 40);
    }

    #[test]
    fn archive_rows_and_delete() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("BTCUSDT")], 0).unwrap();
        let sid = map["BTCUSDT"];
        db.insert_open_interest(&[
            oi_row(100, sid, 1.0, 1.0),
            oi_row(200, sid, 2.0, 1.0),
            oi_row(900, sid, 3.0, 1.0),
        ])
        .unwrap();

        let (header, rows) = db.archive_rows(MetricTable::OpenInterest, 500).unwrap();
        assert_eq!(header[0], "timestamp");
        assert_eq!(rows.len(), 2);

        let deleted = db
            .delete_rows_before(MetricTable::OpenInterest, 500)
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.count_oi(sid).unwrap(), 1);
    }

    #[test]
    fn ls_taker_join_filters_on_both_conditions() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("BTCUSDT")], 0).unwrap();
        let sid = map["BTCUSDT"];
        db.insert_long_short_ratios(&[
            LsRow {
                ts: 300,
                symbol_id: sid,
                ratio: 3.0,
                long_pct: 0.75,
                short_pct: 0.25,
            },
            LsRow {
                ts: 600,
                symbol_id: sid,
                ratio: 1.0,
                long_pct: 0.5,
                short_pct: 0.5,
            },
        ])
        .unwrap();
        db.insert_taker_ratios(&[
            TakerRow {
                ts: 300,
                symbol_id: sid,
                buy_sell_ratio: 0.7,
                buy_vol: 1.0,
                sell_vol: 1.4,
            },
            TakerRow {
                ts: 600,
                symbol_id: sid,
                buy_sell_ratio: 0.7,
                buy_vol: 1.0,
                sell_vol: 1.4,
            },
        ])
        .unwrap();

        let hits = db.ls_taker_hits(sid, 2.0, 1.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 300);
    }

    #[test]
    fn pair_snapshot_reports_latest_state() {
        let db = Database::open_in_memory().unwrap();
        let map = db.upsert_symbols(&[meta("BTCUSDT")], 0).unwrap();
        let sid = map["BTCUSDT"];
        let now = 100_000;
        db.insert_open_interest(&[
            oi_row(now - 7200, sid, 90.0, 50_000.0),
            oi_row(now, sid, 100.0, 51_000.0),
        ])
        .unwrap();
        db.insert_funding_rates(&[FundingRow {
            ts: now,
            symbol_id: sid,
            rate: 0.0005,
            next_funding_time: 0,
        }])
        .unwrap();

        let snap = db.pair_snapshot("btcusdt", now).unwrap().unwrap();
        assert_eq!(snap.symbol, "BTCUSDT");
        assert_eq!(snap.oi_contracts, Some(100.0));
        assert_eq!(snap.oi_1h, Some(90.0 * 50_000.0));
        assert_eq!(snap.funding, Some(0.0005));
        assert!(db.pair_snapshot("NOPEUSDT", now).unwrap().is_none());
    }
}
