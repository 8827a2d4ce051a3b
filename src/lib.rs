pub mod config;
pub mod types;
pub mod sources {
    pub mod coinbase;
}
pub mod normalizers;
pub mod storage;
pub mod triggers;

pub use config::Settings;
pub use sources::coinbase::CoinbaseSpotClient;
pub use storage::{CsvAppender, PartitionLayout, PartitionResolver};
pub use triggers::{FixedIntervalSchedule, PollingLoop, Trigger, TriggerStats};
pub use types::*;

use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Stages of a single run
///
/// `Idle → Fetching → Normalizing → Partitioning → Appending → Done`, with any
/// stage able to end in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Fetching,
    Normalizing,
    Partitioning,
    Appending,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Idle => "idle",
            RunStage::Fetching => "fetching",
            RunStage::Normalizing => "normalizing",
            RunStage::Partitioning => "partitioning",
            RunStage::Appending => "appending",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub logical_date: NaiveDate,
    pub record: PriceRecord,
    pub csv_path: PathBuf,
}

/// A run that stopped early, with the stage it stopped in
#[derive(Debug)]
pub struct RunFailure {
    pub logical_date: NaiveDate,
    pub stage: RunStage,
    pub error: EtlError,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run for {} failed while {}: {}",
            self.logical_date,
            self.stage.as_str(),
            self.error
        )
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub type RunResult = std::result::Result<RunReport, RunFailure>;

/// Fetch → normalize → partition → append, once per call
pub struct Pipeline {
    source: Arc<dyn PriceSource>,
    resolver: PartitionResolver,
    appender: CsvAppender,
}

impl Pipeline {
    pub fn new(source: Arc<dyn PriceSource>, resolver: PartitionResolver) -> Self {
        Self {
            source,
            resolver,
            appender: CsvAppender::new(),
        }
    }

    /// Wire the Coinbase client and storage from settings
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let client = CoinbaseSpotClient::from_settings(settings)?;
        let resolver = PartitionResolver::new(&settings.data_dir, settings.partition_layout);
        Ok(Self::new(Arc::new(client), resolver))
    }

    /// Run the whole pipeline for `logical_date`, stamping the record with the current time
    pub async fn run_once(&self, logical_date: NaiveDate) -> RunResult {
        self.run_once_at(logical_date, Utc::now).await
    }

    /// Same as [`Pipeline::run_once`] with an explicit clock, read after the fetch returns
    pub async fn run_once_at<F>(&self, logical_date: NaiveDate, clock: F) -> RunResult
    where
        F: FnOnce() -> DateTime<Utc> + Send,
    {
        let mut stage = RunStage::Idle;
        let fail = |stage: RunStage, error: EtlError| RunFailure {
            logical_date,
            stage,
            error,
        };

        stage = advance(stage, RunStage::Fetching);
        let raw = self.source.fetch().await.map_err(|e| fail(stage, e))?;
        debug!("Quote from {}: {:?}", self.source.name(), raw);

        stage = advance(stage, RunStage::Normalizing);
        let record = normalizers::normalize_quote(&raw, clock()).map_err(|e| fail(stage, e))?;

        stage = advance(stage, RunStage::Partitioning);
        let folder = self.resolver.resolve(logical_date).map_err(|e| fail(stage, e))?;

        stage = advance(stage, RunStage::Appending);
        let csv_path = self
            .appender
            .append(&record, &folder)
            .map_err(|e| fail(stage, e))?;

        advance(stage, RunStage::Done);
        info!(
            "Saved {} {} = {} to {}",
            record.crypto_asset,
            record.quote_currency,
            record.value,
            csv_path.display()
        );

        Ok(RunReport {
            logical_date,
            record,
            csv_path,
        })
    }
}

fn advance(from: RunStage, to: RunStage) -> RunStage {
    debug!("Run stage {} -> {}", from.as_str(), to.as_str());
    to
}
