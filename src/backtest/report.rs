// =============================================================================
// Report Delivery — save to a timestamped file, optionally upload to chat
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

/// Write the report next to the working directory as
/// `<prefix>_<YYYY-MM-DD_HHMM>.txt` and return the path.
pub fn save_report(prefix: &str, text: &str) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y-%m-%d_%H%M");
    let path = PathBuf::from(format!("{prefix}_{stamp}.txt"));
    std::fs::write(&path, text)
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    info!(path = %path.display(), "report saved");
    Ok(path)
}

/// Upload the report file via the Telegram sendDocument endpoint. A missing
/// token or chat id downgrades to a log line.
pub async fn send_document(token: &str, chat_id: i64, path: &Path) -> Result<()> {
    if token.is_empty() || chat_id == 0 {
        warn!("TELEGRAM_BOT_TOKEN or ADMIN_ID not set, report not uploaded");
        return Ok(());
    }

    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read report at {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report.txt".to_string());

    let form = reqwest::multipart::Form::new()
        .text("chat_id", chat_id.to_string())
        .part(
            "document",
            reqwest::multipart::Part::bytes(bytes)
                .file_name(filename.clone())
                .mime_str("text/plain")?,
        );

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .expect("failed to build reqwest client for report upload");
    let url = format!("https://api.telegram.org/bot{token}/sendDocument");
    let resp = client
        .post(&url)
        .multipart(form)
        .send()
        .await
        .context("sendDocument request failed")?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("sendDocument returned HTTP {status}: {body}");
    }
    info!(file = %filename, "report uploaded");
    Ok(())
}
