//! Dataset persistence + HTTP fetch utilities for boxtrack.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arrow_array::{Array, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use boxtrack_core::{parse_release_date, MovieRecord, DATE_FORMAT};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "boxtrack-storage";

/// Query parameters whose values never reach logs or error messages.
const SECRET_PARAMS: &[&str] = &["api_key"];

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredDataset {
    pub path: PathBuf,
    pub rows: usize,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Flat parquet file holding the whole dataset, read and rewritten wholesale.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    path: PathBuf,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every persisted row. `Ok(None)` means no dataset has been written yet.
    pub fn load(&self) -> anyhow::Result<Option<Vec<MovieRecord>>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("opening dataset {}", self.path.display()))
            }
        };

        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("reading parquet metadata {}", self.path.display()))?
            .build()
            .with_context(|| format!("opening parquet reader {}", self.path.display()))?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch =
                batch.with_context(|| format!("reading record batch {}", self.path.display()))?;
            rows.extend(batch_to_records(&batch)?);
        }
        Ok(Some(rows))
    }

    /// Replace the dataset atomically: write a temp file next to it, then rename over it.
    pub fn save(&self, records: &[MovieRecord]) -> anyhow::Result<StoredDataset> {
        let bytes = encode_parquet(records)?;
        let content_hash = sha256_hex(&bytes);

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .with_context(|| format!("creating dataset directory {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("dataset");
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        if let Err(err) = write_new_file(&temp_path, &bytes) {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp dataset {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        Ok(StoredDataset {
            path: self.path.clone(),
            rows: records.len(),
            content_hash,
            byte_size: bytes.len(),
        })
    }
}

fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening temp dataset file {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("writing temp dataset file {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing temp dataset file {}", path.display()))?;
    Ok(())
}

fn dataset_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::UInt64, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("release_date", DataType::Utf8, true),
        ArrowField::new("vote_average", DataType::Float64, false),
        ArrowField::new("popularity", DataType::Float64, false),
        ArrowField::new("budget", DataType::UInt64, false),
        ArrowField::new("revenue", DataType::UInt64, false),
        ArrowField::new("runtime", DataType::UInt32, false),
        ArrowField::new("genres", DataType::Utf8, false),
        ArrowField::new("poster_url", DataType::Utf8, false),
        ArrowField::new("production_companies", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, true),
    ]))
}

fn encode_parquet(records: &[MovieRecord]) -> anyhow::Result<Vec<u8>> {
    let ids = UInt64Array::from(records.iter().map(|r| r.id).collect::<Vec<_>>());
    let titles = StringArray::from(records.iter().map(|r| r.title.as_str()).collect::<Vec<_>>());
    let release_dates = StringArray::from(
        records
            .iter()
            .map(|r| r.release_date.map(|d| d.format(DATE_FORMAT).to_string()))
            .collect::<Vec<_>>(),
    );
    let vote_averages = Float64Array::from(records.iter().map(|r| r.vote_average).collect::<Vec<_>>());
    let popularities = Float64Array::from(records.iter().map(|r| r.popularity).collect::<Vec<_>>());
    let budgets = UInt64Array::from(records.iter().map(|r| r.budget).collect::<Vec<_>>());
    let revenues = UInt64Array::from(records.iter().map(|r| r.revenue).collect::<Vec<_>>());
    let runtimes = UInt32Array::from(records.iter().map(|r| r.runtime).collect::<Vec<_>>());
    let genres = StringArray::from(records.iter().map(|r| r.genres.as_str()).collect::<Vec<_>>());
    let poster_urls =
        StringArray::from(records.iter().map(|r| r.poster_url.as_str()).collect::<Vec<_>>());
    let companies = StringArray::from(
        records
            .iter()
            .map(|r| r.production_companies.as_str())
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        records
            .iter()
            .map(|r| r.status.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        dataset_schema(),
        vec![
            Arc::new(ids),
            Arc::new(titles),
            Arc::new(release_dates),
            Arc::new(vote_averages),
            Arc::new(popularities),
            Arc::new(budgets),
            Arc::new(revenues),
            Arc::new(runtimes),
            Arc::new(genres),
            Arc::new(poster_urls),
            Arc::new(companies),
            Arc::new(statuses),
        ],
    )
    .context("building dataset record batch")?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing dataset record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("dataset is missing column `{name}`"))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("dataset column `{name}` has an unexpected type"))
}

fn optional_str(array: &StringArray, row: usize) -> Option<&str> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row))
    }
}

fn batch_to_records(batch: &RecordBatch) -> anyhow::Result<Vec<MovieRecord>> {
    let ids = column::<UInt64Array>(batch, "id")?;
    let titles = column::<StringArray>(batch, "title")?;
    let release_dates = column::<StringArray>(batch, "release_date")?;
    let vote_averages = column::<Float64Array>(batch, "vote_average")?;
    let popularities = column::<Float64Array>(batch, "popularity")?;
    let budgets = column::<UInt64Array>(batch, "budget")?;
    let revenues = column::<UInt64Array>(batch, "revenue")?;
    let runtimes = column::<UInt32Array>(batch, "runtime")?;
    let genres = column::<StringArray>(batch, "genres")?;
    let poster_urls = column::<StringArray>(batch, "poster_url")?;
    let companies = column::<StringArray>(batch, "production_companies")?;
    let statuses = column::<StringArray>(batch, "status")?;

    Ok((0..batch.num_rows())
        .map(|row| MovieRecord {
            id: ids.value(row),
            title: titles.value(row).to_string(),
            release_date: optional_str(release_dates, row).and_then(parse_release_date),
            vote_average: vote_averages.value(row),
            popularity: popularities.value(row),
            budget: budgets.value(row),
            revenue: revenues.value(row),
            runtime: runtimes.value(row),
            genres: genres.value(row).to_string(),
            poster_url: poster_urls.value(row).to_string(),
            production_companies: companies.value(row).to_string(),
            status: optional_str(statuses, row).map(str::to_string),
        })
        .collect())
}

/// Minimum spacing between consecutive outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub min_interval: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(300),
        }
    }
}

/// Blocks the calling path until `min_interval` has passed since the previous call.
#[derive(Debug)]
pub struct Pacer {
    policy: PacingPolicy,
    last_request: Option<Instant>,
}

impl Pacer {
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            policy,
            last_request: None,
        }
    }

    pub async fn wait(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.policy.min_interval {
                let wait_for = self.policy.min_interval - elapsed;
                debug!(?wait_for, "pacing outbound request");
                tokio::time::sleep(wait_for).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Replace the values of credential-bearing query parameters.
pub fn redact_secret_params(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    if parsed.query().is_none() {
        return parsed.to_string();
    }
    let pairs = parsed
        .query_pairs()
        .map(|(key, value)| {
            let value = if SECRET_PARAMS.contains(&key.as_ref()) {
                "REDACTED".to_string()
            } else {
                value.into_owned()
            };
            (key.into_owned(), value)
        })
        .collect::<Vec<_>>();
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}

/// Sequential GET client. No retries: a failed request is reported to the caller as-is.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;

            let status = resp.status();
            let final_url = redact_secret_params(resp.url().as_str());
            debug!(%status, url = %final_url, "received response");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?
                .to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn record(id: u64, revenue: u64) -> MovieRecord {
        MovieRecord {
            id,
            title: format!("Movie {id}"),
            release_date: NaiveDate::from_ymd_opt(2026, 8, 21),
            vote_average: 6.8,
            popularity: 120.5,
            budget: 50_000_000,
            revenue,
            runtime: 118,
            genres: "Horror, Thriller".into(),
            poster_url: "https://image.tmdb.org/t/p/w500/abc.jpg".into(),
            production_companies: "Blumhouse Productions".into(),
            status: Some("Released".into()),
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn missing_dataset_loads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("movies.parquet"));
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn saved_rows_load_back_with_nulls_preserved() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("data").join("movies.parquet"));

        let mut undetailed = record(2, 0);
        undetailed.release_date = None;
        undetailed.status = None;
        undetailed.genres.clear();
        let rows = vec![record(1, 900_000), undetailed];

        let stored = store.save(&rows).expect("save");
        assert_eq!(stored.rows, 2);
        assert_eq!(stored.content_hash.len(), 64);

        let loaded = store.load().expect("load").expect("dataset exists");
        assert_eq!(loaded, rows);
    }

    #[test]
    fn save_replaces_previous_content_without_leaving_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("movies.parquet"));

        store.save(&[record(1, 100), record(2, 200)]).expect("first save");
        store.save(&[record(3, 300)]).expect("second save");

        let loaded = store.load().expect("load").expect("dataset exists");
        assert_eq!(loaded.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3]);

        let leftovers = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn empty_dataset_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("movies.parquet"));
        store.save(&[]).expect("save");
        assert_eq!(store.load().expect("load"), Some(Vec::new()));
    }

    #[test]
    fn corrupt_dataset_is_an_error_and_left_in_place() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("movies.parquet");
        fs::write(&path, b"not parquet").expect("write");

        let store = DatasetStore::new(&path);
        assert!(store.load().is_err());
        assert_eq!(fs::read(&path).expect("read"), b"not parquet");
    }

    #[test]
    fn api_key_is_redacted_from_urls() {
        let redacted = redact_secret_params(
            "https://api.themoviedb.org/3/movie/42?api_key=s3cret&language=en-US",
        );
        assert!(!redacted.contains("s3cret"));
        assert!(redacted.contains("api_key=REDACTED"));
        assert!(redacted.contains("language=en-US"));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_calls() {
        let mut pacer = Pacer::new(PacingPolicy {
            min_interval: Duration::from_millis(300),
        });

        let started = Instant::now();
        pacer.wait().await;
        assert!(started.elapsed() < Duration::from_millis(300));

        pacer.wait().await;
        pacer.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(600));
    }
}
