//! Partitioned Parquet data lake.
//!
//! Layout: `lake/source=S/fy=YYYY-YY/month=YYYY-MM/agency=A/company=C/part-<ts>.parquet`.
//! Parts are append-never-modify; the catalog indexes them for fast
//! candidate selection, and a month with at least one part is considered
//! cached and skipped by subsequent fetches.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arrow_array::{Array, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field, Schema};
use austender_core::dates::{financial_year_label, month_label, sanitize_partition_component};
use austender_core::{
    normalize_source_id, CollectError, DateWindow, MatchSummary, SearchRequest,
};
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::catalog::{Catalog, CatalogEntry};

const WRITE_BATCH_ROWS: usize = 512;
const READ_BATCH_ROWS: usize = 1024;

/// Partitioned parquet store rooted at `<base_dir>/lake`.
pub struct DataLake {
    base_dir: PathBuf,
    catalog: Arc<Catalog>,
}

impl DataLake {
    pub fn new(base_dir: impl Into<PathBuf>, catalog: Arc<Catalog>) -> Self {
        Self {
            base_dir: base_dir.into(),
            catalog,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn lake_root(&self) -> PathBuf {
        self.base_dir.join("lake")
    }

    /// Relative partition key for a summary, derived purely from content.
    pub fn partition_key(
        source: &str,
        ts: Option<DateTime<Utc>>,
        agency: &str,
        company: &str,
    ) -> String {
        let ts = ts.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        format!(
            "source={}/{}/{}/agency={}/company={}",
            source_partition_key(source),
            financial_year_label(ts),
            month_label(ts),
            agency_partition_key(agency),
            company_partition_key(company),
        )
    }

    fn partition_dir(&self, summary: &MatchSummary) -> PathBuf {
        let key = Self::partition_key(
            &summary.source,
            summary.release_date,
            &summary.agency,
            &summary.supplier,
        );
        self.lake_root().join(key)
    }

    /// True when at least one parquet part exists for the month of `ts`.
    pub fn has_month_partition(&self, source: &str, ts: DateTime<Utc>) -> bool {
        let root = self
            .lake_root()
            .join(format!("source={}", source_partition_key(source)))
            .join(financial_year_label(ts))
            .join(month_label(ts));
        if !root.is_dir() {
            return false;
        }
        WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .any(|entry| is_parquet_part(entry.path()))
    }

    /// Fetch-skip gate: the month holding `window.start` is the month a
    /// window writes into, so an existing part there means the window is
    /// already cached.
    pub fn should_fetch_window(&self, source: &str, window: &DateWindow) -> bool {
        !self.has_month_partition(source, window.start)
    }

    /// Sum amounts of cached rows matching the request. Returns the total
    /// and whether any row matched at all (the cache-hit signal).
    pub fn query_totals(&self, req: &SearchRequest) -> Result<(Decimal, bool), CollectError> {
        let source_key = source_partition_key(&req.source);
        let agency_key = non_empty(&req.agency).map(|v| sanitize_partition_component(v));
        let company_key = non_empty(&req.company).map(|v| sanitize_partition_component(v));
        // FY floor for the index prefilter: an explicit start date wins
        // over the lookback so historical ranges stay reachable.
        let min_fy = if let Some(start) = req.start_date {
            Some(
                financial_year_label(start)
                    .trim_start_matches("fy=")
                    .to_string(),
            )
        } else if req.lookback_period > 0 {
            let floor = Utc::now()
                .checked_sub_months(chrono::Months::new(12 * req.lookback_period as u32))
                .unwrap_or_else(Utc::now);
            Some(
                financial_year_label(floor)
                    .trim_start_matches("fy=")
                    .to_string(),
            )
        } else {
            None
        };

        let paths = self.catalog.select_paths(
            &source_key,
            agency_key.as_deref(),
            company_key.as_deref(),
            min_fy.as_deref(),
        )?;

        let mut total = Decimal::ZERO;
        let mut matched = false;
        for path in paths {
            // Rows pointing at files reindex has not yet removed are
            // skipped, not fatal.
            let (sum, hit) = match sum_parquet_file(Path::new(&path), req) {
                Ok(result) => result,
                Err(err) => {
                    debug!(path, error = %err, "skipping unreadable lake part");
                    continue;
                }
            };
            if hit {
                matched = true;
                total += sum;
            }
        }
        Ok((total, matched))
    }

    /// Walk the lake directory and rebuild `parquet_files` from scratch.
    /// Returns the number of parts indexed.
    pub fn rebuild_index(&self) -> Result<usize, CollectError> {
        self.catalog.truncate_parquet_files()?;
        let root = self.lake_root();
        if !root.is_dir() {
            return Ok(0);
        }

        let mut indexed = 0usize;
        for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            let path = entry.path();
            if !is_parquet_part(path) {
                continue;
            }
            let row_count = match count_rows(path) {
                Ok(count) => count,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable part during reindex");
                    continue;
                }
            };
            let (source, fy, agency_key, company_key) = parse_lake_partition(path);
            self.catalog.upsert_parquet_file(&CatalogEntry {
                path: path.to_string_lossy().into_owned(),
                source,
                fy,
                agency_key,
                company_key,
                row_count,
                created_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            })?;
            indexed += 1;
        }
        Ok(indexed)
    }
}

/// Lazily opens one parquet writer per partition observed during a run
/// and registers each part with the catalog on close.
pub struct LakeWriterPool {
    lake: Arc<DataLake>,
    sinks: Mutex<HashMap<String, LakeSink>>,
    errors: Mutex<Vec<String>>,
}

impl LakeWriterPool {
    pub fn new(lake: Arc<DataLake>) -> Self {
        Self {
            lake,
            sinks: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Route a summary to its partition sink. Write failures are recorded
    /// rather than propagated so a lake problem never hides upstream data.
    pub fn write(&self, summary: &MatchSummary) {
        if let Err(err) = self.try_write(summary) {
            self.errors.lock().unwrap_or_else(|e| e.into_inner()).push(err.to_string());
        }
    }

    fn try_write(&self, summary: &MatchSummary) -> Result<(), CollectError> {
        let key = DataLake::partition_key(
            &summary.source,
            summary.release_date,
            &summary.agency,
            &summary.supplier,
        );
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        if !sinks.contains_key(&key) {
            let sink = LakeSink::open(&self.lake, summary)?;
            sinks.insert(key.clone(), sink);
        }
        let sink = sinks
            .get_mut(&key)
            .ok_or_else(|| CollectError::CacheIo("writer pool entry vanished".into()))?;
        sink.write(summary)
    }

    /// Flush and close every sink, upserting one catalog row per part.
    /// Returns accumulated write errors for surfacing at run end.
    pub fn close_all(&self) -> Vec<String> {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        for (_, sink) in sinks.drain() {
            if let Err(err) = sink.close(&self.lake) {
                errors.push(err.to_string());
            }
        }
        std::mem::take(&mut errors)
    }
}

struct LakeSink {
    writer: ArrowWriter<File>,
    schema: Arc<Schema>,
    path: PathBuf,
    source_key: String,
    fy: String,
    agency_key: String,
    company_key: String,
    partition: String,
    buffer: Vec<MatchSummary>,
    rows: i64,
}

impl LakeSink {
    fn open(lake: &DataLake, summary: &MatchSummary) -> Result<Self, CollectError> {
        let dir = lake.partition_dir(summary);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("part-{}.parquet", Utc::now().timestamp()));
        let file = File::create(&path)?;

        let schema = Arc::new(parquet_schema());
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(props))
            .map_err(parquet_err)?;

        let ts = summary.release_date.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Ok(Self {
            writer,
            schema,
            path,
            source_key: source_partition_key(&summary.source),
            fy: financial_year_label(ts)
                .trim_start_matches("fy=")
                .to_string(),
            agency_key: agency_partition_key(&summary.agency),
            company_key: company_partition_key(&summary.supplier),
            partition: DataLake::partition_key(
                &summary.source,
                summary.release_date,
                &summary.agency,
                &summary.supplier,
            ),
            buffer: Vec::new(),
            rows: 0,
        })
    }

    fn write(&mut self, summary: &MatchSummary) -> Result<(), CollectError> {
        self.buffer.push(summary.clone());
        self.rows += 1;
        if self.buffer.len() >= WRITE_BATCH_ROWS {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<(), CollectError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = rows_to_batch(&self.schema, &self.partition, &self.buffer)
            .map_err(|err| CollectError::CacheIo(err.to_string()))?;
        self.writer.write(&batch).map_err(parquet_err)?;
        self.buffer.clear();
        Ok(())
    }

    fn close(mut self, lake: &DataLake) -> Result<(), CollectError> {
        self.flush_buffer()?;
        self.writer.close().map_err(parquet_err)?;
        if self.rows > 0 {
            lake.catalog.upsert_parquet_file(&CatalogEntry {
                path: self.path.to_string_lossy().into_owned(),
                source: self.source_key,
                fy: self.fy,
                agency_key: self.agency_key,
                company_key: self.company_key,
                row_count: self.rows,
                created_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            })?;
        }
        Ok(())
    }
}

fn parquet_schema() -> Schema {
    Schema::new(vec![
        Field::new("partition", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("financial_year", DataType::Utf8, false),
        Field::new("agency_key", DataType::Utf8, false),
        Field::new("company_key", DataType::Utf8, false),
        Field::new("contract_id", DataType::Utf8, false),
        Field::new("release_id", DataType::Utf8, false),
        Field::new("ocid", DataType::Utf8, false),
        Field::new("supplier", DataType::Utf8, false),
        Field::new("agency", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("amount", DataType::Float64, false),
        Field::new("release_epoch_ms", DataType::Int64, false),
        Field::new("is_update", DataType::Boolean, false),
    ])
}

fn rows_to_batch(
    schema: &Arc<Schema>,
    partition: &str,
    rows: &[MatchSummary],
) -> Result<RecordBatch, ArrowError> {
    let ts_of = |s: &MatchSummary| s.release_date.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    RecordBatch::try_new(
        Arc::clone(schema),
        vec![
            Arc::new(StringArray::from(vec![partition; rows.len()])),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|s| normalize_source_id(&s.source))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|s| {
                        financial_year_label(ts_of(s))
                            .trim_start_matches("fy=")
                            .to_string()
                    })
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|s| sanitize_partition_component(&s.agency))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|s| sanitize_partition_component(&s.supplier))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|s| s.contract_id.clone()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|s| s.release_id.clone()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|s| s.ocid.clone()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|s| s.supplier.clone()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|s| s.agency.clone()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|s| s.title.clone()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter()
                    .map(|s| s.amount.to_f64().unwrap_or(0.0))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter()
                    .map(|s| {
                        s.release_date
                            .map(|d| d.timestamp_millis())
                            .unwrap_or_default()
                    })
                    .collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                rows.iter().map(|s| s.is_update).collect::<Vec<_>>(),
            )),
        ],
    )
}

/// Sum a single parquet part under the row-level filters.
fn sum_parquet_file(path: &Path, req: &SearchRequest) -> Result<(Decimal, bool), CollectError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(parquet_err)?
        .with_batch_size(READ_BATCH_ROWS)
        .build()
        .map_err(parquet_err)?;

    let source_key = normalize_source_id(&req.source);
    let keyword = req.keyword.trim().to_lowercase();
    let company = req.company.trim().to_lowercase();
    let agency = req.agency.trim().to_lowercase();
    let start_ms = req.start_date.map(|d| d.timestamp_millis());
    let end_ms = req.end_date.map(|d| d.timestamp_millis());

    let mut total = Decimal::ZERO;
    let mut matched = false;

    for batch in reader {
        let batch = batch.map_err(|err| CollectError::Decode(err.to_string()))?;
        let source = string_column(&batch, "source")?;
        let supplier = string_column(&batch, "supplier")?;
        let agency_col = string_column(&batch, "agency")?;
        let title = string_column(&batch, "title")?;
        let contract_id = string_column(&batch, "contract_id")?;
        let amount = float_column(&batch, "amount")?;
        let epoch = int_column(&batch, "release_epoch_ms")?;

        for i in 0..batch.num_rows() {
            if source.value(i) != source_key {
                continue;
            }
            if !keyword.is_empty() {
                let hay = format!(
                    "{} {} {} {}",
                    supplier.value(i),
                    title.value(i),
                    agency_col.value(i),
                    contract_id.value(i)
                )
                .to_lowercase();
                if !hay.contains(&keyword) {
                    continue;
                }
            }
            if !company.is_empty() && !supplier.value(i).to_lowercase().contains(&company) {
                continue;
            }
            if !agency.is_empty() && !agency_col.value(i).to_lowercase().contains(&agency) {
                continue;
            }
            let row_ms = epoch.value(i);
            if let Some(start) = start_ms {
                if row_ms < start {
                    continue;
                }
            }
            if let Some(end) = end_ms {
                if row_ms > end {
                    continue;
                }
            }

            matched = true;
            // Amounts are reconstituted from the on-disk f64; accuracy is
            // bounded at 1e-6 of the total.
            total += Decimal::from_f64(amount.value(i)).unwrap_or_default();
        }
    }

    Ok((total, matched))
}

/// Row count straight from the parquet footer, no scan.
fn count_rows(path: &Path) -> Result<i64, CollectError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err)?;
    Ok(builder.metadata().file_metadata().num_rows())
}

/// Extract partition keys from a lake file path.
fn parse_lake_partition(path: &Path) -> (String, String, String, String) {
    let mut source = String::new();
    let mut fy = String::new();
    let mut agency = String::new();
    let mut company = String::new();
    for component in path.components() {
        let part = component.as_os_str().to_string_lossy();
        if let Some(v) = part.strip_prefix("source=") {
            source = v.to_string();
        } else if let Some(v) = part.strip_prefix("fy=") {
            fy = v.to_string();
        } else if let Some(v) = part.strip_prefix("agency=") {
            agency = v.to_string();
        } else if let Some(v) = part.strip_prefix("company=") {
            company = v.to_string();
        }
    }
    if source.is_empty() {
        source = austender_core::DEFAULT_SOURCE_ID.to_string();
    }
    (source, fy, agency, company)
}

fn is_parquet_part(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("parquet"))
            .unwrap_or(false)
}

fn source_partition_key(source: &str) -> String {
    sanitize_partition_component(&normalize_source_id(source))
}

fn agency_partition_key(agency: &str) -> String {
    let key = sanitize_partition_component(agency);
    if key == "unknown" {
        "unknown_agency".to_string()
    } else {
        key
    }
}

fn company_partition_key(company: &str) -> String {
    let key = sanitize_partition_component(company);
    if key == "unknown" {
        "unknown_company".to_string()
    } else {
        key
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parquet_err(err: parquet::errors::ParquetError) -> CollectError {
    CollectError::CacheIo(err.to_string())
}


fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, CollectError> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| CollectError::Decode(format!("column {name} is not utf8")))
}

fn float_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array, CollectError> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| CollectError::Decode(format!("column {name} is not f64")))
}

fn int_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array, CollectError> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| CollectError::Decode(format!("column {name} is not i64")))
}

fn column<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a Arc<dyn Array>, CollectError> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|err| CollectError::Decode(err.to_string()))?;
    Ok(batch.column(idx))
}
