//! Run record sinks.
//!
//! A sink receives ordered sample tuples and appends them durably, one open
//! handle per run. The sink never validates row shape; the acquisition loop
//! owns that responsibility.

use crate::error::{AppResult, SweepError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Name of the sample table inside a run record.
pub const DATA_TABLE: &str = "data";

/// Everything a sink needs to lay out a run record.
#[derive(Debug, Clone)]
pub struct RunSchema {
    /// Target file, if the sink is file-backed.
    pub path: Option<PathBuf>,
    /// Sample table name.
    pub table: String,
    /// Column names, in row order.
    pub columns: Vec<String>,
    /// Operator-facing metadata rows recorded alongside the data.
    pub metadata: Vec<(String, String)>,
}

impl RunSchema {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            path: None,
            table: DATA_TABLE.to_string(),
            columns,
            metadata: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<(String, String)>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Trait for a durable run record writer.
///
/// Lifecycle: `open` once, `write_row` per sample in acquisition order,
/// `close` exactly once on every exit path.
#[async_trait]
pub trait RunSink: Send {
    /// Create the run record. An existing record of the same name is
    /// replaced; there is no append-to-existing-run support.
    async fn open(&mut self, schema: &RunSchema) -> AppResult<()>;

    /// Append one sample tuple to `table`.
    async fn write_row(&mut self, table: &str, row: &[f64]) -> AppResult<()>;

    /// Flush and close the record.
    async fn close(&mut self) -> AppResult<()>;
}

// =============================================================================
// CSV sink
// =============================================================================

/// File-backed sink writing one CSV per run, metadata as `# ` header lines.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    path: PathBuf,
    writer: Option<csv::Writer<std::fs::File>>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            writer: None,
        }
    }
}

#[cfg(feature = "storage_csv")]
impl Default for CsvSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl RunSink for CsvSink {
    async fn open(&mut self, schema: &RunSchema) -> AppResult<()> {
        use std::io::Write;

        let path = schema.path.clone().ok_or_else(|| {
            SweepError::Storage("CSV sink needs a target path".to_string())
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SweepError::Storage(e.to_string()))?;
        }
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| SweepError::Storage(e.to_string()))?;
        }

        let mut file =
            std::fs::File::create(&path).map_err(|e| SweepError::Storage(e.to_string()))?;
        let metadata: serde_json::Map<String, serde_json::Value> = schema
            .metadata
            .iter()
            .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
            .collect();
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| SweepError::Storage(e.to_string()))?;
        for line in json.lines() {
            writeln!(file, "# {line}").map_err(|e| SweepError::Storage(e.to_string()))?;
        }

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(&schema.columns)
            .map_err(|e| SweepError::Storage(e.to_string()))?;

        info!(path = %path.display(), "run record opened");
        self.path = path;
        self.writer = Some(writer);
        Ok(())
    }

    async fn write_row(&mut self, _table: &str, row: &[f64]) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SweepError::Storage("run record is not open".to_string()))?;
        writer
            .write_record(row.iter().map(|value| value.to_string()))
            .map_err(|e| SweepError::Storage(e.to_string()))
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| SweepError::Storage(e.to_string()))?;
            info!(path = %self.path.display(), "run record closed");
        }
        Ok(())
    }
}

// Skeleton when the backend is compiled out.
#[cfg(not(feature = "storage_csv"))]
pub struct CsvSink;

#[cfg(not(feature = "storage_csv"))]
impl CsvSink {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(feature = "storage_csv"))]
impl Default for CsvSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(feature = "storage_csv"))]
#[async_trait]
impl RunSink for CsvSink {
    async fn open(&mut self, _schema: &RunSchema) -> AppResult<()> {
        Err(SweepError::FeatureNotEnabled("storage_csv".to_string()))
    }
    async fn write_row(&mut self, _table: &str, _row: &[f64]) -> AppResult<()> {
        Err(SweepError::FeatureNotEnabled("storage_csv".to_string()))
    }
    async fn close(&mut self) -> AppResult<()> {
        Err(SweepError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

// =============================================================================
// In-memory sink
// =============================================================================

#[derive(Default)]
struct MemorySinkState {
    schema: Option<RunSchema>,
    rows: Vec<(String, Vec<f64>)>,
    open_count: usize,
    close_count: usize,
    is_open: bool,
}

/// In-memory sink for tests and dry inspection.
///
/// Cheap to clone; every clone shares the same buffer, so a test can keep a
/// handle while the run engine consumes the other.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, MemorySinkState>> {
        self.state
            .lock()
            .map_err(|_| SweepError::Storage("memory sink poisoned".to_string()))
    }

    /// All rows written so far, with their table names.
    pub fn rows(&self) -> Vec<(String, Vec<f64>)> {
        self.lock().map(|s| s.rows.clone()).unwrap_or_default()
    }

    /// The schema passed to `open`.
    pub fn schema(&self) -> Option<RunSchema> {
        self.lock().ok().and_then(|s| s.schema.clone())
    }

    pub fn open_count(&self) -> usize {
        self.lock().map(|s| s.open_count).unwrap_or(0)
    }

    pub fn close_count(&self) -> usize {
        self.lock().map(|s| s.close_count).unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.lock().map(|s| s.is_open).unwrap_or(false)
    }
}

#[async_trait]
impl RunSink for MemorySink {
    async fn open(&mut self, schema: &RunSchema) -> AppResult<()> {
        let mut state = self.lock()?;
        state.schema = Some(schema.clone());
        state.open_count += 1;
        state.is_open = true;
        Ok(())
    }

    async fn write_row(&mut self, table: &str, row: &[f64]) -> AppResult<()> {
        let mut state = self.lock()?;
        if !state.is_open {
            return Err(SweepError::Storage("run record is not open".to_string()));
        }
        state.rows.push((table.to_string(), row.to_vec()));
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let mut state = self.lock()?;
        state.is_open = false;
        state.close_count += 1;
        Ok(())
    }
}
