// =============================================================================
// Archival — monthly export of old metric rows to compressed CSV
// =============================================================================
//
// Wakes hourly; on the first day of the month at 03:00 UTC, rows older than
// ARCHIVE_AFTER_DAYS move from the four metric tables into
// archives/<table>_<YYYY_MM>.csv.gz, then the store is VACUUMed to reclaim
// space.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Timelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::db::{Database, MetricTable};
use crate::types::now_ts;

/// Export + delete rows older than the retention window. Returns the total
/// number of rows archived.
pub fn run_archive(cfg: &Config, db: &Database, out_dir: &Path) -> Result<usize> {
    let before_ts = now_ts() - cfg.archive_after_days * 86_400;
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let stamp = Utc::now().format("%Y_%m").to_string();
    let mut total_rows = 0usize;

    for table in MetricTable::ALL {
        let (header, rows) = db.archive_rows(table, before_ts)?;
        if rows.is_empty() {
            continue;
        }

        let path = out_dir.join(format!("{}_{stamp}.csv.gz", table.as_str()));
        let file = std::fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = csv::Writer::from_writer(GzEncoder::new(file, Compression::default()));
        writer.write_record(&header)?;
        for row in &rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("csv flush failed: {e}"))?
            .finish()
            .context("gzip finish failed")?;

        let deleted = db.delete_rows_before(table, before_ts)?;
        total_rows += deleted;
        info!(table = table.as_str(), rows = deleted, path = %path.display(), "table archived");
    }

    if total_rows > 0 {
        db.vacuum()?;
        info!(
            total_rows,
            db_size_mb = format!("{:.1}", db.size_mb()),
            "archive complete"
        );
    }
    Ok(total_rows)
}

/// Hourly loop; archives on day 1 at 03:00 UTC. Runs until cancelled.
pub async fn run_archive_loop(cfg: Arc<Config>, db: Database, cancel: CancellationToken) {
    loop {
        let now = Utc::now();
        if now.day() == 1 && now.hour() == 3 {
            if let Err(e) = run_archive(&cfg, &db, Path::new("archives")) {
                error!(error = %e, "archive run failed");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(std::time::Duration::from_secs(3600)) => {}
        }
    }
    info!("archive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OiRow, SymbolMeta};
    use flate2::read::GzDecoder;

    #[test]
    fn archive_exports_and_prunes_old_rows() {
        let db = Database::open_in_memory().unwrap();
        let map = db
            .upsert_symbols(
                &[SymbolMeta {
                    symbol: "BTCUSDT".into(),
                    base_asset: "BTC".into(),
                }],
                0,
            )
            .unwrap();
        let sid = map["BTCUSDT"];
        let now = now_ts();
        let old_ts = now - 40 * 86_400;

        db.insert_open_interest(&[
            OiRow {
                ts: old_ts,
                symbol_id: sid,
                oi_contracts: 1.0,
                oi_usd: 100.0,
                mark_price: 100.0,
            },
            OiRow {
                ts: now,
                symbol_id: sid,
                oi_contracts: 2.0,
                oi_usd: 200.0,
                mark_price: 100.0,
            },
        ])
        .unwrap();

        let cfg = Config::default(); // 30-day retention
        let dir = tempfile::tempdir().unwrap();
        let archived = run_archive(&cfg, &db, dir.path()).unwrap();
        assert_eq!(archived, 1);
        assert_eq!(db.count_oi(sid).unwrap(), 1);

        // The export is readable gzip CSV with a header and one data row.
        let stamp = Utc::now().format("%Y_%m").to_string();
        let path = dir.path().join(format!("open_interest_{stamp}.csv.gz"));
        let file = std::fs::File::open(path).unwrap();
        let mut reader = csv::Reader::from_reader(GzDecoder::new(file));
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "timestamp");
        let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][0], old_ts.to_string().as_str());
    }

    #[test]
    fn nothing_to_archive_is_a_noop() {
        let db = Database::open_in_memory().unwrap();
        let cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(run_archive(&cfg, &db, dir.path()).unwrap(), 0);
    }
}
