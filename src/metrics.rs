use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::error::Result;

/// Scalars of one iteration, keyed like `gen_up/loss_adv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub iteration: u64,
    pub epoch: u64,
    pub values: BTreeMap<String, f64>,
}

pub trait MetricsSink {
    fn record(&mut self, record: &MetricsRecord) -> Result<()>;
}

/// Keeps every record; handy for tests and small experiments.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<MetricsRecord>,
}

impl MetricsSink for MemorySink {
    fn record(&mut self, record: &MetricsRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct LogEntry {
    iteration: u64,
    epoch: u64,
    elapsed_time: f64,
    #[serde(flatten)]
    means: BTreeMap<String, f64>,
}

/// Averages values over `interval` iterations, logs each average and
/// rewrites `<out>/log` as a JSON array of every average so far.
pub struct LogReport {
    path: PathBuf,
    interval: u64,
    started: Instant,
    sums: BTreeMap<String, (f64, u64)>,
    entries: Vec<LogEntry>,
}

impl LogReport {
    pub fn new(out_dir: impl Into<PathBuf>, interval: u64) -> Self {
        LogReport {
            path: out_dir.into().join("log"),
            interval: interval.max(1),
            started: Instant::now(),
            sums: BTreeMap::new(),
            entries: Vec::new(),
        }
    }

    fn flush(&mut self, iteration: u64, epoch: u64) -> Result<()> {
        let means: BTreeMap<String, f64> = std::mem::take(&mut self.sums)
            .into_iter()
            .map(|(key, (sum, n))| (key, sum / n as f64))
            .collect();
        let line = means
            .iter()
            .map(|(key, mean)| format!("{key}={mean:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(epoch, iteration, "{line}");

        self.entries.push(LogEntry {
            iteration,
            epoch,
            elapsed_time: self.started.elapsed().as_secs_f64(),
            means,
        });
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }
}

impl MetricsSink for LogReport {
    fn record(&mut self, record: &MetricsRecord) -> Result<()> {
        for (key, value) in &record.values {
            let entry = self.sums.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        if record.iteration % self.interval == 0 {
            self.flush(record.iteration, record.epoch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(iteration: u64, value: f64) -> MetricsRecord {
        MetricsRecord {
            iteration,
            epoch: 0,
            values: BTreeMap::from([("gen_up/loss_rec".to_string(), value)]),
        }
    }

    #[test]
    fn log_report_writes_interval_means() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = LogReport::new(dir.path(), 2);
        report.record(&record(1, 1.0)).unwrap();
        assert!(!dir.path().join("log").exists());
        report.record(&record(2, 3.0)).unwrap();

        let log: serde_json::Value = serde_json::from_str(&fs::read_to_string(dir.path().join("log")).unwrap()).unwrap();
        assert_eq!(log[0]["iteration"], 2);
        assert_eq!(log[0]["gen_up/loss_rec"], 2.0);
    }
}
