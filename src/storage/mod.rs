// Date-partitioned CSV storage
use crate::types::*;
use chrono::NaiveDate;
use csv::WriterBuilder;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name used inside every partition
pub const PARTITION_FILE: &str = "btc.csv";

/// Directory naming convention for partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionLayout {
    /// `dt=2025-09-28`
    #[default]
    KeyValue,
    /// `2025_09_28`
    Underscore,
}

impl PartitionLayout {
    pub fn folder_name(&self, date: NaiveDate) -> String {
        match self {
            PartitionLayout::KeyValue => format!("dt={}", date.format("%Y-%m-%d")),
            PartitionLayout::Underscore => date.format("%Y_%m_%d").to_string(),
        }
    }
}

/// Maps logical dates to partition folders under a data root
#[derive(Debug, Clone)]
pub struct PartitionResolver {
    root: PathBuf,
    layout: PartitionLayout,
}

impl PartitionResolver {
    pub fn new(root: impl Into<PathBuf>, layout: PartitionLayout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    /// Path of the partition for `logical_date`, without touching the disk
    pub fn partition_path(&self, logical_date: NaiveDate) -> PathBuf {
        self.root.join(self.layout.folder_name(logical_date))
    }

    /// Resolve and create (idempotently) the partition folder
    pub fn resolve(&self, logical_date: NaiveDate) -> Result<PathBuf> {
        let folder = self.partition_path(logical_date);
        std::fs::create_dir_all(&folder).map_err(|e| EtlError::io(&folder, e))?;
        debug!("Partition ready: {}", folder.display());
        Ok(folder)
    }
}

/// Appends records to a partition's CSV file
///
/// Each call opens the file in append mode, writes, flushes and closes it.
/// There is no locking: callers must keep to one writer per partition.
#[derive(Debug, Clone, Default)]
pub struct CsvAppender;

impl CsvAppender {
    pub fn new() -> Self {
        Self
    }

    /// Append one row to `folder/btc.csv`, writing the header if the file is empty
    pub fn append(&self, record: &PriceRecord, folder: &Path) -> Result<PathBuf> {
        let csv_path = folder.join(PARTITION_FILE);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&csv_path)
            .map_err(|e| EtlError::io(&csv_path, e))?;

        // A zero-length file (new, or left empty by an earlier failure) still needs its header
        let write_header = file
            .metadata()
            .map_err(|e| EtlError::io(&csv_path, e))?
            .len()
            == 0;

        let mut writer = WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);

        writer
            .serialize(record)
            .map_err(|e| EtlError::io(&csv_path, e.into()))?;
        writer.flush().map_err(|e| EtlError::io(&csv_path, e))?;

        Ok(csv_path)
    }
}
