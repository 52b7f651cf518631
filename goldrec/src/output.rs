//! Report output for CLI commands.
//!
//! Every command produces one JSON document, printed to stdout or written to
//! the file given with `--output`.

use goldrec_core::{GoldrecError, Result};
use serde::Serialize;
use std::path::Path;

/// Serializes a report and writes it to `destination` if given.
///
/// Returns the JSON text so the caller can print it when no file was named.
pub async fn write_report<T: Serialize>(report: &T, destination: Option<&Path>) -> Result<String> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| GoldrecError::serialization("report serialization", e))?;

    if let Some(path) = destination {
        save_json(&json, path).await?;
        tracing::info!(path = %path.display(), "Report written");
    }
    Ok(json)
}

/// Saves JSON data to file.
pub async fn save_json(json_data: &str, output_path: &Path) -> Result<()> {
    tokio::fs::write(output_path, json_data)
        .await
        .map_err(|e| GoldrecError::io(format!("Failed to write to {}", output_path.display()), e))
}
