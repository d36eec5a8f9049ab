//! Per-epoch training history

use crate::error::Result;
use crate::model::MetricKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One training pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based
    pub epoch: usize,
    pub loss: f64,
    pub metrics: Vec<(MetricKind, f64)>,
    /// `None` when there is no validation split
    pub val_loss: Option<f64>,
    pub val_metrics: Vec<(MetricKind, f64)>,
    /// Learning rate used during this epoch
    pub learning_rate: f64,
}

fn lookup(values: &[(MetricKind, f64)], kind: MetricKind) -> Option<f64> {
    values.iter().find(|(k, _)| *k == kind).map(|(_, v)| *v)
}

impl EpochRecord {
    pub fn metric(&self, kind: MetricKind) -> Option<f64> {
        lookup(&self.metrics, kind)
    }

    pub fn val_metric(&self, kind: MetricKind) -> Option<f64> {
        lookup(&self.val_metrics, kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub metric_names: Vec<MetricKind>,
    pub records: Vec<EpochRecord>,
}

impl History {
    pub fn new(metric_names: Vec<MetricKind>) -> Self {
        Self {
            metric_names,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    pub fn losses(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.loss).collect()
    }

    pub fn val_losses(&self) -> Vec<f64> {
        self.records.iter().filter_map(|r| r.val_loss).collect()
    }

    /// Column names of the CSV export
    pub fn header(&self) -> Vec<String> {
        let mut header = vec!["epoch".to_string(), "loss".to_string()];
        header.extend(self.metric_names.iter().map(|m| m.name().to_string()));
        header.push("val_loss".to_string());
        header.extend(self.metric_names.iter().map(|m| format!("val_{}", m.name())));
        header.push("lr".to_string());
        header
    }

    /// One row per epoch. Missing validation values are left empty.
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        writer.write_record(self.header())?;

        let fmt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        for record in &self.records {
            let mut row = vec![record.epoch.to_string(), record.loss.to_string()];
            row.extend(self.metric_names.iter().map(|&m| fmt(record.metric(m))));
            row.push(fmt(record.val_loss));
            row.extend(self.metric_names.iter().map(|&m| fmt(record.val_metric(m))));
            row.push(record.learning_rate.to_string());
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");

        let mut history = History::new(vec![MetricKind::Mae, MetricKind::Mse]);
        history.push(EpochRecord {
            epoch: 1,
            loss: 0.5,
            metrics: vec![(MetricKind::Mae, 0.4), (MetricKind::Mse, 0.5)],
            val_loss: Some(0.6),
            val_metrics: vec![(MetricKind::Mae, 0.45), (MetricKind::Mse, 0.6)],
            learning_rate: 0.001,
        });
        history.push(EpochRecord {
            epoch: 2,
            loss: 0.3,
            metrics: vec![(MetricKind::Mae, 0.3), (MetricKind::Mse, 0.3)],
            val_loss: None,
            val_metrics: vec![],
            learning_rate: 0.0005,
        });
        history.save_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "epoch,loss,mae,mse,val_loss,val_mae,val_mse,lr");
        assert_eq!(lines[1], "1,0.5,0.4,0.5,0.6,0.45,0.6,0.001");
        assert_eq!(lines[2], "2,0.3,0.3,0.3,,,,0.0005");
        assert_eq!(history.val_losses(), vec![0.6]);
    }
}
