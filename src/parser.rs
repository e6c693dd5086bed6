//! Sample parsing and persistence.
//!
//! A successful cycle yields one raw record. A [`SampleParser`] turns it into
//! a [`ScalarSample`] for the detector, and a [`SampleLog`] persists it.

use crate::error::{AppResult, DaqError};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// One scalar measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalarSample {
    /// Measured value.
    pub value: f64,
    /// Acquisition time, epoch milliseconds.
    pub timestamp_ms: i64,
    /// Name of the measured parameter.
    pub parameter: String,
    /// Engineering units.
    pub units: String,
}

/// Extracts a scalar from a raw record.
pub trait SampleParser: Send + Sync {
    /// Parse `raw`, stamping the result with `timestamp_ms`.
    fn parse(&self, raw: &[u8], timestamp_ms: i64) -> AppResult<ScalarSample>;
}

/// Parser that pulls a number out of an ASCII record with a regex.
///
/// Uses the named group `value` when present, otherwise group 1.
#[derive(Debug, Clone)]
pub struct RegexSampleParser {
    pattern: Regex,
    parameter: String,
    units: String,
}

impl RegexSampleParser {
    /// Compile `pattern`; it must contain a `value` group or at least one group.
    pub fn new(pattern: &str, parameter: impl Into<String>, units: impl Into<String>) -> AppResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| DaqError::Configuration(format!("invalid sample pattern: {e}")))?;
        if pattern.captures_len() < 2 {
            return Err(DaqError::Configuration(
                "sample pattern needs a capture group".into(),
            ));
        }
        Ok(Self {
            pattern,
            parameter: parameter.into(),
            units: units.into(),
        })
    }

    /// Parameter name attached to parsed samples.
    pub fn parameter(&self) -> &str {
        &self.parameter
    }
}

impl SampleParser for RegexSampleParser {
    fn parse(&self, raw: &[u8], timestamp_ms: i64) -> AppResult<ScalarSample> {
        let text = String::from_utf8_lossy(raw);
        let caps = self
            .pattern
            .captures(&text)
            .ok_or_else(|| DaqError::Parse(format!("no match in {:?}", text.trim())))?;
        let field = caps
            .name("value")
            .or_else(|| caps.get(1))
            .ok_or_else(|| DaqError::Parse("value group did not participate".into()))?;
        let value: f64 = field
            .as_str()
            .trim()
            .parse()
            .map_err(|e| DaqError::Parse(format!("{:?}: {e}", field.as_str())))?;
        if !value.is_finite() {
            return Err(DaqError::Parse(format!("non-finite value {value}")));
        }
        Ok(ScalarSample {
            value,
            timestamp_ms,
            parameter: self.parameter.clone(),
            units: self.units.clone(),
        })
    }
}

/// Sink for parsed samples.
pub trait SampleLog: Send {
    /// Persist one sample.
    fn append(&mut self, sample: &ScalarSample) -> AppResult<()>;

    /// Flush buffered records.
    fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Appends `timestamp_ms,parameter,value,units` rows to a CSV file.
#[cfg(feature = "storage_csv")]
pub struct CsvSampleLog {
    writer: csv::Writer<std::fs::File>,
    path: std::path::PathBuf,
}

#[cfg(feature = "storage_csv")]
impl CsvSampleLog {
    /// Open `path` for appending, writing a header if the file is new.
    pub fn open(path: impl Into<std::path::PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let is_new = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer
                .write_record(["timestamp_ms", "parameter", "value", "units"])
                .map_err(csv_error)?;
        }
        Ok(Self { writer, path })
    }

    /// File being written.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(feature = "storage_csv")]
impl SampleLog for CsvSampleLog {
    fn append(&mut self, sample: &ScalarSample) -> AppResult<()> {
        self.writer
            .write_record([
                sample.timestamp_ms.to_string(),
                sample.parameter.clone(),
                sample.value.to_string(),
                sample.units.clone(),
            ])
            .map_err(csv_error)?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Read `(timestamp_ms, value)` pairs back from a file.
///
/// Accepts files written by [`CsvSampleLog`] or a bare column of numbers,
/// in which case rows are stamped with their index.
#[cfg(feature = "storage_csv")]
pub fn read_values(path: impl AsRef<std::path::Path>) -> AppResult<Vec<(i64, f64)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path.as_ref())
        .map_err(csv_error)?;

    let mut values = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(csv_error)?;
        let parsed = match record.len() {
            0 => continue,
            1 => record[0].parse::<f64>().ok().map(|v| (row as i64, v)),
            _ => match (record[0].parse::<i64>(), record.get(2).map(str::parse::<f64>)) {
                (Ok(ts), Some(Ok(v))) => Some((ts, v)),
                _ => None,
            },
        };
        match parsed {
            Some(pair) => values.push(pair),
            // Header row
            None if row == 0 => {}
            None => {
                return Err(DaqError::Parse(format!(
                    "{}: bad value in row {}",
                    path.as_ref().display(),
                    row + 1
                )))
            }
        }
    }
    Ok(values)
}

#[cfg(feature = "storage_csv")]
fn csv_error(e: csv::Error) -> DaqError {
    DaqError::Io(std::io::Error::other(e))
}

/// In-memory log shared with its clones.
#[derive(Debug, Default, Clone)]
pub struct MemorySampleLog {
    samples: Arc<Mutex<Vec<ScalarSample>>>,
}

impl MemorySampleLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far.
    pub fn samples(&self) -> Vec<ScalarSample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl SampleLog for MemorySampleLog {
    fn append(&mut self, sample: &ScalarSample) -> AppResult<()> {
        self.samples
            .lock()
            .map_err(|_| DaqError::Io(std::io::Error::other("sample log poisoned")))?
            .push(sample.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_group() {
        let parser = RegexSampleParser::new(
            r"^\s*[-\d.]+,\s*(?P<value>[-\d.]+)",
            "turbidity",
            "NTU",
        )
        .unwrap();
        let sample = parser.parse(b" 14.2031, 3.90\r\n", 42).unwrap();
        assert_eq!(sample.value, 3.9);
        assert_eq!(sample.timestamp_ms, 42);
        assert_eq!(sample.parameter, "turbidity");
        assert_eq!(sample.units, "NTU");
    }

    #[test]
    fn falls_back_to_first_group() {
        let parser = RegexSampleParser::new(r"T=([-\d.]+)", "temperature", "C").unwrap();
        assert_eq!(parser.parse(b"T=-1.25\r\n", 0).unwrap().value, -1.25);
    }

    #[test]
    fn rejects_unmatched_and_garbage() {
        let parser = RegexSampleParser::new(r"T=(\S+)", "temperature", "C").unwrap();
        assert!(matches!(parser.parse(b"S>", 0), Err(DaqError::Parse(_))));
        assert!(matches!(parser.parse(b"T=abc", 0), Err(DaqError::Parse(_))));
        assert!(matches!(parser.parse(b"T=NaN", 0), Err(DaqError::Parse(_))));
    }

    #[test]
    fn pattern_needs_group() {
        assert!(RegexSampleParser::new(r"\d+", "x", "").is_err());
        assert!(RegexSampleParser::new(r"(", "x", "").is_err());
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_log_appends_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("ctd.csv");
        let sample = ScalarSample {
            value: 3.5,
            timestamp_ms: 1000,
            parameter: "turbidity".into(),
            units: "NTU".into(),
        };
        {
            let mut log = CsvSampleLog::open(&path).unwrap();
            log.append(&sample).unwrap();
        }
        {
            let mut log = CsvSampleLog::open(&path).unwrap();
            log.append(&ScalarSample {
                timestamp_ms: 2000,
                ..sample.clone()
            })
            .unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "timestamp_ms,parameter,value,units",
                "1000,turbidity,3.5,NTU",
                "2000,turbidity,3.5,NTU",
            ]
        );
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn reads_back_log_and_bare_columns() {
        let dir = tempfile::tempdir().unwrap();

        let log_path = dir.path().join("log.csv");
        std::fs::write(
            &log_path,
            "timestamp_ms,parameter,value,units\n1000,turbidity,3.5,NTU\n2000,turbidity,4,NTU\n",
        )
        .unwrap();
        assert_eq!(read_values(&log_path).unwrap(), vec![(1000, 3.5), (2000, 4.0)]);

        let column = dir.path().join("column.csv");
        std::fs::write(&column, "1.0\n 2.5\n\n10\n").unwrap();
        let values: Vec<f64> = read_values(&column).unwrap().into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![1.0, 2.5, 10.0]);

        let bad = dir.path().join("bad.csv");
        std::fs::write(&bad, "1.0\nnope\n").unwrap();
        assert!(matches!(read_values(&bad), Err(DaqError::Parse(_))));
    }

    #[test]
    fn memory_log_shares_between_clones() {
        let log = MemorySampleLog::new();
        let mut writer = log.clone();
        writer
            .append(&ScalarSample {
                value: 1.0,
                timestamp_ms: 0,
                parameter: "p".into(),
                units: "u".into(),
            })
            .unwrap();
        assert_eq!(log.samples().len(), 1);
    }
}
