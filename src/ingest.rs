//! Line-delimited record ingestion.
//!
//! Each input line is one JSON [`SensorRecord`]. Each output line is the
//! report for that record, or an error line when the record could not be
//! parsed or evaluated. A bad record never stops the stream.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::detect::{DetectionEngine, DetectionMethod, SensorRecord, Status};

/// Which part of the pipeline a stream runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Combined,
    Stage(DetectionMethod),
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combined" => Ok(Mode::Combined),
            other => other.parse().map(Mode::Stage),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Combined => write!(f, "combined"),
            Mode::Stage(m) => write!(f, "{}", m),
        }
    }
}

/// Counters for one processed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub records: usize,
    pub anomalies: usize,
    pub errors: usize,
    /// Lines that were not valid records.
    pub rejected: usize,
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

/// Evaluate one record and render it as a JSON value.
async fn process(
    engine: &DetectionEngine,
    mode: Mode,
    record: &SensorRecord,
) -> (Status, serde_json::Value) {
    match mode {
        Mode::Combined => {
            let report = engine.evaluate(record).await;
            let value = to_json(&report);
            (report.verdict, value)
        }
        Mode::Stage(method) => match engine.detect_stage(method, record).await {
            Ok(report) => {
                let status = report.status();
                let value = to_json(&report);
                (status, value)
            }
            Err(e) => {
                warn!(%method, timestamp = %record.timestamp, error = %e, "Stage failed");
                (
                    Status::Error,
                    json!({
                        "timestamp": record.timestamp,
                        "method": method,
                        "status": Status::Error,
                        "error": e.to_string(),
                    }),
                )
            }
        },
    }
}

/// Run every line of `reader` through `engine`, writing one JSON line per
/// input line to `writer`. Blank lines are skipped.
pub async fn run_stream<R, W>(
    engine: &DetectionEngine,
    mode: Mode,
    reader: R,
    mut writer: W,
) -> Result<StreamSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = StreamSummary::default();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let output = match serde_json::from_str::<SensorRecord>(trimmed) {
            Ok(record) => {
                summary.records += 1;
                let (status, value) = process(engine, mode, &record).await;
                match status {
                    Status::Anomaly => summary.anomalies += 1,
                    Status::Error => summary.errors += 1,
                    Status::Normal => {}
                }
                value
            }
            Err(e) => {
                warn!(line = line_no, error = %e, "Rejected malformed record");
                summary.rejected += 1;
                json!({
                    "line": line_no,
                    "status": Status::Error,
                    "error": format!("invalid record: {}", e),
                })
            }
        };

        let mut rendered = serde_json::to_string(&output)?;
        rendered.push('\n');
        writer
            .write_all(rendered.as_bytes())
            .await
            .context("failed to write report")?;
    }

    writer.flush().await.context("failed to flush output")?;
    info!(
        %mode,
        records = summary.records,
        anomalies = summary.anomalies,
        errors = summary.errors,
        rejected = summary.rejected,
        "Stream complete"
    );
    Ok(summary)
}
