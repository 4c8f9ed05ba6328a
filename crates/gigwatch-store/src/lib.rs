//! Append-only persistence for the pipeline stages: parquet directories for
//! the raw and staged stages, flat CSV logs for sent/applied tracking.
//!
//! Every append writes a fresh parquet file into the stage directory and
//! never touches existing files. Scans read the whole directory; a missing
//! or unreadable directory means "no rows yet", not an error. Timestamps
//! persist as RFC3339 strings.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use gigwatch_core::{AppliedRecord, RawPosting, Score, SentRecord, StagedPosting};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gigwatch-store";

fn stage_file_name(stage: &str, at: DateTime<Utc>) -> String {
    format!(
        "{stage}_{}_{}.parquet",
        at.format("%Y%m%d_%H%M%S"),
        Uuid::new_v4()
    )
}

fn write_stage_file(dir: &Path, stage: &str, batch: RecordBatch) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating stage directory {}", dir.display()))?;
    let path = dir.join(stage_file_name(stage, Utc::now()));
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(path)
}

/// Read every parquet file under `dir`. An absent or unlistable directory
/// yields no batches; a present-but-corrupt file is a real error.
fn read_stage_batches(dir: &Path) -> Result<Vec<RecordBatch>> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(Vec::new());
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "parquet").unwrap_or(false))
        .collect();
    paths.sort();

    let mut batches = Vec::new();
    for path in paths {
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("reading parquet metadata {}", path.display()))?
            .build()
            .with_context(|| format!("building parquet reader {}", path.display()))?;
        for batch in reader {
            batches.push(batch.with_context(|| format!("decoding {}", path.display()))?);
        }
    }
    Ok(batches)
}

fn utf8_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("column '{name}' missing"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("column '{name}' is not utf8"))
}

fn bool_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a BooleanArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("column '{name}' missing"))?
        .as_any()
        .downcast_ref::<BooleanArray>()
        .with_context(|| format!("column '{name}' is not boolean"))
}

fn f64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    batch
        .column_by_name(name)
        .with_context(|| format!("column '{name}' missing"))?
        .as_any()
        .downcast_ref::<Float64Array>()
        .with_context(|| format!("column '{name}' is not float64"))
}

fn opt_str(array: &StringArray, row: usize) -> Option<String> {
    (!array.is_null(row)).then(|| array.value(row).to_string())
}

fn req_str(array: &StringArray, row: usize) -> String {
    array.value(row).to_string()
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp '{value}'"))?
        .with_timezone(&Utc))
}

fn opt_strings(rows: usize, values: impl Iterator<Item = Option<String>>) -> StringArray {
    let collected: Vec<Option<String>> = values.collect();
    debug_assert_eq!(collected.len(), rows);
    StringArray::from(collected)
}

/// Append-only directory of parquet files for freshly scraped postings.
#[derive(Debug, Clone)]
pub struct RawStore {
    dir: PathBuf,
}

impl RawStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, rows: &[RawPosting]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("url", DataType::Utf8, false),
            Field::new("description", DataType::Utf8, true),
            Field::new("posted_relative_text", DataType::Utf8, true),
            Field::new("type_level", DataType::Utf8, true),
            Field::new("experience_level", DataType::Utf8, true),
            Field::new("is_fixed_price", DataType::Boolean, false),
            Field::new("duration_label", DataType::Utf8, true),
            Field::new("scraped_at", DataType::Utf8, false),
        ]));

        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(
                    rows.iter().map(|r| Some(r.id.as_str())).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    rows.iter().map(|r| Some(r.title.as_str())).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    rows.iter().map(|r| Some(r.url.as_str())).collect::<Vec<_>>(),
                )),
                Arc::new(opt_strings(rows.len(), rows.iter().map(|r| r.description.clone()))),
                Arc::new(opt_strings(
                    rows.len(),
                    rows.iter().map(|r| r.posted_relative_text.clone()),
                )),
                Arc::new(opt_strings(rows.len(), rows.iter().map(|r| r.type_level.clone()))),
                Arc::new(opt_strings(
                    rows.len(),
                    rows.iter().map(|r| r.experience_level.clone()),
                )),
                Arc::new(BooleanArray::from(
                    rows.iter().map(|r| r.is_fixed_price).collect::<Vec<_>>(),
                )),
                Arc::new(opt_strings(
                    rows.len(),
                    rows.iter().map(|r| r.duration_label.clone()),
                )),
                Arc::new(StringArray::from(
                    rows.iter()
                        .map(|r| Some(r.scraped_at.to_rfc3339()))
                        .collect::<Vec<_>>(),
                )),
            ],
        )
        .context("building raw record batch")?;

        let path = write_stage_file(&self.dir, "raw", batch)?;
        debug!(rows = rows.len(), path = %path.display(), "appended raw postings");
        Ok(())
    }

    pub fn scan(&self) -> Result<Vec<RawPosting>> {
        let mut rows = Vec::new();
        for batch in read_stage_batches(&self.dir)? {
            let ids = utf8_col(&batch, "id")?;
            let titles = utf8_col(&batch, "title")?;
            let urls = utf8_col(&batch, "url")?;
            let descriptions = utf8_col(&batch, "description")?;
            let posted = utf8_col(&batch, "posted_relative_text")?;
            let type_levels = utf8_col(&batch, "type_level")?;
            let experience = utf8_col(&batch, "experience_level")?;
            let fixed = bool_col(&batch, "is_fixed_price")?;
            let durations = utf8_col(&batch, "duration_label")?;
            let scraped = utf8_col(&batch, "scraped_at")?;

            for row in 0..batch.num_rows() {
                rows.push(RawPosting {
                    id: req_str(ids, row),
                    title: req_str(titles, row),
                    url: req_str(urls, row),
                    description: opt_str(descriptions, row),
                    posted_relative_text: opt_str(posted, row),
                    type_level: opt_str(type_levels, row),
                    experience_level: opt_str(experience, row),
                    is_fixed_price: fixed.value(row),
                    duration_label: opt_str(durations, row),
                    scraped_at: parse_rfc3339(scraped.value(row))?,
                });
            }
        }
        Ok(rows)
    }

    pub fn scan_where(&self, predicate: impl Fn(&RawPosting) -> bool) -> Result<Vec<RawPosting>> {
        Ok(self.scan()?.into_iter().filter(|row| predicate(row)).collect())
    }

    pub fn distinct_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for batch in read_stage_batches(&self.dir)? {
            let column = utf8_col(&batch, "id")?;
            for row in 0..batch.num_rows() {
                ids.insert(column.value(row).to_string());
            }
        }
        Ok(ids)
    }
}

/// Append-only directory of parquet files for scored postings.
#[derive(Debug, Clone)]
pub struct StagedStore {
    dir: PathBuf,
}

impl StagedStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, rows: &[StagedPosting]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("url", DataType::Utf8, false),
            Field::new("description", DataType::Utf8, true),
            Field::new("posted_relative_text", DataType::Utf8, true),
            Field::new("type_level", DataType::Utf8, true),
            Field::new("experience_level", DataType::Utf8, true),
            Field::new("is_fixed_price", DataType::Boolean, false),
            Field::new("duration_label", DataType::Utf8, true),
            Field::new("scraped_at", DataType::Utf8, false),
            Field::new("match_level", DataType::Float64, true),
            Field::new("should_apply", DataType::Boolean, true),
            Field::new("reason", DataType::Utf8, false),
            Field::new("scoring_model", DataType::Utf8, false),
        ]));

        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(
                    rows.iter().map(|r| Some(r.posting.id.as_str())).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    rows.iter()
                        .map(|r| Some(r.posting.title.as_str()))
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    rows.iter().map(|r| Some(r.posting.url.as_str())).collect::<Vec<_>>(),
                )),
                Arc::new(opt_strings(
                    rows.len(),
                    rows.iter().map(|r| r.posting.description.clone()),
                )),
                Arc::new(opt_strings(
                    rows.len(),
                    rows.iter().map(|r| r.posting.posted_relative_text.clone()),
                )),
                Arc::new(opt_strings(
                    rows.len(),
                    rows.iter().map(|r| r.posting.type_level.clone()),
                )),
                Arc::new(opt_strings(
                    rows.len(),
                    rows.iter().map(|r| r.posting.experience_level.clone()),
                )),
                Arc::new(BooleanArray::from(
                    rows.iter().map(|r| r.posting.is_fixed_price).collect::<Vec<_>>(),
                )),
                Arc::new(opt_strings(
                    rows.len(),
                    rows.iter().map(|r| r.posting.duration_label.clone()),
                )),
                Arc::new(StringArray::from(
                    rows.iter()
                        .map(|r| Some(r.posting.scraped_at.to_rfc3339()))
                        .collect::<Vec<_>>(),
                )),
                Arc::new(Float64Array::from(
                    rows.iter().map(|r| r.score.match_level).collect::<Vec<_>>(),
                )),
                Arc::new(BooleanArray::from(
                    rows.iter().map(|r| r.score.should_apply).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    rows.iter()
                        .map(|r| Some(r.score.reason.as_str()))
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    rows.iter()
                        .map(|r| Some(r.score.scoring_model.as_str()))
                        .collect::<Vec<_>>(),
                )),
            ],
        )
        .context("building staged record batch")?;

        let path = write_stage_file(&self.dir, "staged", batch)?;
        debug!(rows = rows.len(), path = %path.display(), "appended staged postings");
        Ok(())
    }

    pub fn scan(&self) -> Result<Vec<StagedPosting>> {
        let mut rows = Vec::new();
        for batch in read_stage_batches(&self.dir)? {
            let ids = utf8_col(&batch, "id")?;
            let titles = utf8_col(&batch, "title")?;
            let urls = utf8_col(&batch, "url")?;
            let descriptions = utf8_col(&batch, "description")?;
            let posted = utf8_col(&batch, "posted_relative_text")?;
            let type_levels = utf8_col(&batch, "type_level")?;
            let experience = utf8_col(&batch, "experience_level")?;
            let fixed = bool_col(&batch, "is_fixed_price")?;
            let durations = utf8_col(&batch, "duration_label")?;
            let scraped = utf8_col(&batch, "scraped_at")?;
            let match_levels = f64_col(&batch, "match_level")?;
            let should_apply = bool_col(&batch, "should_apply")?;
            let reasons = utf8_col(&batch, "reason")?;
            let models = utf8_col(&batch, "scoring_model")?;

            for row in 0..batch.num_rows() {
                rows.push(StagedPosting {
                    posting: RawPosting {
                        id: req_str(ids, row),
                        title: req_str(titles, row),
                        url: req_str(urls, row),
                        description: opt_str(descriptions, row),
                        posted_relative_text: opt_str(posted, row),
                        type_level: opt_str(type_levels, row),
                        experience_level: opt_str(experience, row),
                        is_fixed_price: fixed.value(row),
                        duration_label: opt_str(durations, row),
                        scraped_at: parse_rfc3339(scraped.value(row))?,
                    },
                    score: Score {
                        match_level: (!match_levels.is_null(row)).then(|| match_levels.value(row)),
                        should_apply: (!should_apply.is_null(row)).then(|| should_apply.value(row)),
                        reason: req_str(reasons, row),
                        scoring_model: req_str(models, row),
                    },
                });
            }
        }
        Ok(rows)
    }

    pub fn scan_where(
        &self,
        predicate: impl Fn(&StagedPosting) -> bool,
    ) -> Result<Vec<StagedPosting>> {
        Ok(self.scan()?.into_iter().filter(|row| predicate(row)).collect())
    }

    pub fn distinct_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for batch in read_stage_batches(&self.dir)? {
            let column = utf8_col(&batch, "id")?;
            for row in 0..batch.num_rows() {
                ids.insert(column.value(row).to_string());
            }
        }
        Ok(ids)
    }

    /// Postings approved by the scorer, weakest match first.
    pub fn approved(&self) -> Result<Vec<StagedPosting>> {
        let mut rows = self.scan_where(|row| row.score.should_apply == Some(true))?;
        rows.sort_by(|a, b| {
            let left = a.score.match_level.unwrap_or(0.0);
            let right = b.score.match_level.unwrap_or(0.0);
            left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows)
    }
}

/// Flat append-only CSV log of postings already surfaced to the operator.
/// The header is written once when the file is created; `ids` preserves the
/// append order, duplicates included, so callers can trim "the last N".
#[derive(Debug, Clone)]
pub struct SentLog {
    path: PathBuf,
}

impl SentLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, record: &SentRecord) -> Result<()> {
        append_csv_row(&self.path, record)
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        read_csv_rows::<SentRecord>(&self.path)
            .map(|rows| rows.into_iter().map(|row| row.job_id).collect())
    }
}

/// Flat append-only CSV log of postings the operator applied to.
#[derive(Debug, Clone)]
pub struct AppliedLog {
    path: PathBuf,
}

impl AppliedLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, record: &AppliedRecord) -> Result<()> {
        append_csv_row(&self.path, record)
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        read_csv_rows::<AppliedRecord>(&self.path)
            .map(|rows| rows.into_iter().map(|row| row.job_id).collect())
    }
}

fn append_csv_row<T: serde::Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let write_header = !path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);
    writer
        .serialize(record)
        .with_context(|| format!("appending to {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

fn read_csv_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<T>() {
        rows.push(row.with_context(|| format!("decoding row in {}", path.display()))?);
    }
    Ok(rows)
}
