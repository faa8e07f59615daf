//! JSON-lines replay source.
//!
//! Each non-empty line is one `Frame`:
//!
//! ```json
//! {"timestamp_ms": 1700000000000, "detections": [{"bbox": [10, 20, 110, 140],
//!   "landmarks": [{"x": 15, "y": 25}], "gesture": "Peace", "confidence": 0.91}]}
//! ```
//!
//! Lines that fail to decode or parse are skipped with a warning so one corrupt record
//! does not end a replay.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use crate::detect::backend::DetectionSource;
use crate::detect::result::Frame;

pub struct JsonlSource {
    name: String,
    reader: Box<dyn BufRead + Send>,
    line_no: u64,
    skipped: u64,
}

impl JsonlSource {
    pub fn from_reader(name: &str, reader: Box<dyn BufRead + Send>) -> Self {
        Self {
            name: name.to_string(),
            reader,
            line_no: 0,
            skipped: 0,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open detection replay {}", path.display()))?;
        Ok(Self::from_reader(
            &path.display().to_string(),
            Box::new(BufReader::new(file)),
        ))
    }

    pub fn stdin() -> Self {
        Self::from_reader("stdin", Box::new(BufReader::new(std::io::stdin())))
    }

    /// Lines skipped because they were not valid frames.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn skip(&mut self, reason: &dyn std::fmt::Display) {
        self.skipped += 1;
        log::warn!(
            "data quality: skipping {} line {}: {}",
            self.name,
            self.line_no,
            reason
        );
    }
}

impl DetectionSource for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("read {} line {}", self.name, self.line_no + 1))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(e) => {
                    self.skip(&e);
                    continue;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Frame>(trimmed) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => self.skip(&e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GestureLabel;
    use std::io::Cursor;

    #[test]
    fn parses_frames_and_skips_garbage() -> Result<()> {
        let input = concat!(
            r#"{"timestamp_ms": 10, "detections": [{"bbox": [0, 0, 10, 10], "landmarks": [{"x": 1, "y": 1}], "gesture": "Fist", "confidence": 0.8}]}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"timestamp_ms": 43}"#,
            "\n"
        );
        let mut source = JsonlSource::from_reader("test", Box::new(Cursor::new(input)));

        let first = source.next_frame()?.expect("first frame");
        assert_eq!(first.timestamp_ms, 10);
        assert_eq!(first.detections[0].label, GestureLabel::Fist);

        let second = source.next_frame()?.expect("second frame");
        assert_eq!(second.timestamp_ms, 43);
        assert!(second.detections.is_empty());

        assert!(source.next_frame()?.is_none());
        assert_eq!(source.skipped(), 1);
        Ok(())
    }

    #[test]
    fn invalid_utf8_line_is_skipped() -> Result<()> {
        let mut input = b"{\"timestamp_ms\": 1}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe\n");
        input.extend_from_slice(b"{\"timestamp_ms\": 2}\n");
        let mut source = JsonlSource::from_reader("test", Box::new(Cursor::new(input)));

        assert_eq!(source.next_frame()?.expect("first frame").timestamp_ms, 1);
        assert_eq!(source.next_frame()?.expect("second frame").timestamp_ms, 2);
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.skipped(), 1);
        Ok(())
    }
}
