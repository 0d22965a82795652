//! Metric sinks: where the controller sends windowed loss means and
//! evaluation results. Logging never fails the run.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Destination for `(name, value)` metrics at a training step.
pub trait MetricSink {
    fn log(&mut self, values: &[(String, f64)], step: usize);
}

/// Emits one `tracing::info!` line per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log(&mut self, values: &[(String, f64)], step: usize) {
        if values.is_empty() {
            return;
        }
        let rendered = values
            .iter()
            .map(|(k, v)| format!("{k}={v:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(step, "{rendered}");
    }
}

/// Appends one JSON object per call: `{"step": N, "<name>": value, …}`.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating parent directories.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open metrics file {}: {e}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricSink for JsonlSink {
    fn log(&mut self, values: &[(String, f64)], step: usize) {
        let mut record = serde_json::Map::new();
        record.insert("step".to_string(), serde_json::Value::from(step));
        for (k, v) in values {
            record.insert(k.clone(), serde_json::Value::from(*v));
        }
        let line = serde_json::Value::Object(record).to_string();
        let result = writeln!(self.writer, "{line}").and_then(|_| self.writer.flush());
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write metrics");
        }
    }
}

/// Forwards every call to each inner sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricSink for FanoutSink {
    fn log(&mut self, values: &[(String, f64)], step: usize) {
        for sink in &mut self.sinks {
            sink.log(values, step);
        }
    }
}

/// Keeps everything in memory. Handy for inspecting a run programmatically.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub records: Vec<(usize, Vec<(String, f64)>)>,
}

impl MetricSink for MemorySink {
    fn log(&mut self, values: &[(String, f64)], step: usize) {
        self.records.push((step, values.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/metrics.jsonl");
        {
            let mut sink = JsonlSink::create(&path).unwrap();
            sink.log(&[("total".to_string(), 1.5)], 10);
            sink.log(&[("total".to_string(), 0.5), ("kl".to_string(), 0.25)], 20);
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 10);
        assert_eq!(lines[1]["kl"], 0.25);

        // Reopening appends
        JsonlSink::create(&path).unwrap().log(&[], 30);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.jsonl");
        let mut sink = FanoutSink::new()
            .with(TracingSink)
            .with(JsonlSink::create(&path).unwrap());
        sink.log(&[("x".to_string(), 2.0)], 1);
        drop(sink);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_memory_sink_records() {
        let mut sink = MemorySink::default();
        sink.log(&[("a".to_string(), 1.0)], 3);
        assert_eq!(sink.records, vec![(3, vec![("a".to_string(), 1.0)])]);
    }
}
