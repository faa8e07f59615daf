//! Event log export in CSV or JSON.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::Write;
use std::str::FromStr;

use crate::storage::LoggedEvent;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(anyhow!("unsupported export format '{}' (csv|json)", other)),
        }
    }
}

/// One flat CSV row per logged event.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    id: i64,
    session_id: &'a str,
    track_id: u64,
    timestamp_ms: u64,
    gesture: &'a str,
    confidence: f32,
    held_frames: usize,
    x_min: f32,
    y_min: f32,
    x_max: f32,
    y_max: f32,
}

impl<'a> From<&'a LoggedEvent> for CsvRow<'a> {
    fn from(logged: &'a LoggedEvent) -> Self {
        let ev = &logged.event;
        let bbox = ev.bbox();
        Self {
            id: logged.id,
            session_id: ev.session_id(),
            track_id: ev.track_id().as_u64(),
            timestamp_ms: ev.timestamp_ms(),
            gesture: ev.label().as_str(),
            confidence: ev.confidence(),
            held_frames: ev.held_frames(),
            x_min: bbox.x_min,
            y_min: bbox.y_min,
            x_max: bbox.x_max,
            y_max: bbox.y_max,
        }
    }
}

/// Write `events` in the given format. CSV output always carries a header
/// row, even when there are no events.
pub fn write_events<W: Write>(events: &[LoggedEvent], format: ExportFormat, mut out: W) -> Result<()> {
    match format {
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut out, events)?;
            writeln!(out)?;
            out.flush()?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(out);
            writer.write_record([
                "id",
                "session_id",
                "track_id",
                "timestamp_ms",
                "gesture",
                "confidence",
                "held_frames",
                "x_min",
                "y_min",
                "x_max",
                "y_max",
            ])?;
            for logged in events {
                writer.serialize(CsvRow::from(logged))?;
            }
            writer.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_parse() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!(" json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::default(), ExportFormat::Csv);
    }

    #[test]
    fn empty_csv_still_has_header() {
        let mut out = Vec::new();
        write_events(&[], ExportFormat::Csv, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("id,session_id,track_id,timestamp_ms,gesture"));
        assert_eq!(text.lines().count(), 1);
    }
}
