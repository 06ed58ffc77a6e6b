//! Turning verification records into a report row.
//!
//! The report is a single flat row per run, appended to a
//! spreadsheet-style range.  Cells carry signed ordinals so a reader can
//! see at a glance which identity a verdict belongs to and whether the
//! source had anything to say about it at all.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::sign::SignEntry;
use crate::verify::Verification;

pub const DEFAULT_RANGE: &str = "Data!A3";

/// A report cell: the leading timestamp or a signed ordinal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Text(String),
    Number(i64),
}

/// Turn verification records into one report row.
///
/// Identities are ordered lexicographically (a missing identity sorts as
/// the empty string) and numbered from 1.  For identity `i` a source's
/// cell is `i` when any of its records verified, `-i` when it produced
/// records but none verified, and `0` when it produced no record at all.
/// The row starts with an RFC 3339 timestamp, followed by the legacy and
/// cosign cells for each identity in order.
pub fn evaluate(
    entries: &[SignEntry],
    legacy: &[Verification],
    cosign: &[Verification],
) -> Vec<Cell> {
    evaluate_at(Utc::now(), entries, legacy, cosign)
}

fn evaluate_at(
    now: DateTime<Utc>,
    entries: &[SignEntry],
    legacy: &[Verification],
    cosign: &[Verification],
) -> Vec<Cell> {
    let mut identities: Vec<&str> = entries
        .iter()
        .map(|entry| entry.identity.as_deref().unwrap_or(""))
        .collect();
    identities.sort();
    identities.dedup();

    let mut row = Vec::with_capacity(1 + 2 * identities.len());
    row.push(Cell::Text(now.to_rfc3339()));
    for (index, identity) in identities.iter().enumerate() {
        let ordinal = (index + 1) as i64;
        row.push(source_cell(ordinal, identity, legacy));
        row.push(source_cell(ordinal, identity, cosign));
    }
    row
}

fn source_cell(ordinal: i64, identity: &str, records: &[Verification]) -> Cell {
    let mut recorded = false;
    for record in records {
        if record.entry.identity.as_deref().unwrap_or("") != identity {
            continue;
        }
        if record.verified {
            return Cell::Number(ordinal);
        }
        recorded = true;
    }
    Cell::Number(if recorded { -ordinal } else { 0 })
}

/// Where finished report rows go.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Append `row` at `range`, a spreadsheet-style anchor like `Data!A3`.
    async fn append(&self, range: &str, row: Vec<Cell>) -> Result<()>;
}

/// JSON-lines sink: one `{"range": ..., "values": [[...]]}` object per
/// appended row, matching the spreadsheet append request body.
#[derive(Debug)]
pub struct JsonlReportSink {
    path: PathBuf,
}

impl JsonlReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonlReportSink { path: path.into() }
    }
}

#[async_trait]
impl ReportSink for JsonlReportSink {
    async fn append(&self, range: &str, row: Vec<Cell>) -> Result<()> {
        let record = serde_json::json!({ "range": range, "values": [row] });
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
