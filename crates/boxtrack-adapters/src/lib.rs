//! Movie source contracts + the TMDB adapter and its fixture-replay twin.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use boxtrack_core::{parse_release_date, Candidate, DiscoveryWindow, MovieDetail, MovieId};
use boxtrack_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "boxtrack-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://api.themoviedb.org/3";
pub const DEFAULT_IMAGE_BASE_URL: &str = "https://image.tmdb.org/t/p/w500";
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// Sort criterion sent with every discovery query.
pub const DISCOVER_SORT: &str = "revenue.desc";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no detail available for movie {0}")]
    DetailUnavailable(MovieId),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A remote catalogue that can list candidates for a window and describe one movie.
#[async_trait]
pub trait MovieSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// First page of movies released inside `window`, revenue descending.
    async fn discover(&self, window: &DiscoveryWindow) -> Result<Vec<Candidate>, SourceError>;

    async fn fetch_detail(&self, id: MovieId) -> Result<MovieDetail, SourceError>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoverResponse {
    #[serde(default)]
    pub results: Vec<DiscoverResult>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoverResult {
    pub id: MovieId,
    pub title: Option<String>,
    pub release_date: Option<String>,
    pub vote_average: Option<f64>,
    pub popularity: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamedEntity {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetailResponse {
    pub budget: Option<u64>,
    pub revenue: Option<u64>,
    pub runtime: Option<u32>,
    pub genres: Option<Vec<NamedEntity>>,
    pub poster_path: Option<String>,
    pub production_companies: Option<Vec<NamedEntity>>,
    pub status: Option<String>,
}

impl From<DiscoverResult> for Candidate {
    fn from(result: DiscoverResult) -> Self {
        Candidate {
            id: result.id,
            title: result.title.unwrap_or_default(),
            release_date: result.release_date.as_deref().and_then(parse_release_date),
            vote_average: result.vote_average.unwrap_or(0.0),
            popularity: result.popularity.unwrap_or(0.0),
        }
    }
}

pub fn candidates_from_discover(response: DiscoverResponse) -> Vec<Candidate> {
    response.results.into_iter().map(Candidate::from).collect()
}

fn join_names(entities: Option<Vec<NamedEntity>>) -> String {
    entities
        .unwrap_or_default()
        .into_iter()
        .map(|entity| entity.name)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn poster_url(image_base_url: &str, poster_path: Option<&str>) -> String {
    match poster_path {
        Some(path) if !path.is_empty() => format!("{image_base_url}{path}"),
        _ => String::new(),
    }
}

/// Flatten a detail payload. `id` is the requested id, not whatever the payload echoes.
pub fn detail_from_response(
    id: MovieId,
    response: DetailResponse,
    image_base_url: &str,
) -> MovieDetail {
    MovieDetail {
        id,
        budget: response.budget.unwrap_or(0),
        revenue: response.revenue.unwrap_or(0),
        runtime: response.runtime.unwrap_or(0),
        genres: join_names(response.genres),
        poster_url: poster_url(image_base_url, response.poster_path.as_deref()),
        production_companies: join_names(response.production_companies),
        status: response.status.unwrap_or_else(|| "Unknown".to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct TmdbConfig {
    pub api_key: String,
    pub api_base_url: String,
    pub image_base_url: String,
    pub language: String,
}

impl TmdbConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            image_base_url: DEFAULT_IMAGE_BASE_URL.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base_url.trim_end_matches('/'), path)
    }
}

pub struct TmdbSource {
    http: HttpFetcher,
    config: TmdbConfig,
}

impl TmdbSource {
    pub fn new(http: HttpFetcher, config: TmdbConfig) -> Self {
        Self { http, config }
    }

    pub fn discover_query(&self, window: &DiscoveryWindow) -> Vec<(&'static str, String)> {
        vec![
            ("api_key", self.config.api_key.clone()),
            ("language", self.config.language.clone()),
            ("sort_by", DISCOVER_SORT.to_string()),
            ("primary_release_date.gte", window.start_param()),
            ("primary_release_date.lte", window.end_param()),
            ("page", "1".to_string()),
        ]
    }
}

#[async_trait]
impl MovieSource for TmdbSource {
    fn source_id(&self) -> &'static str {
        "tmdb"
    }

    async fn discover(&self, window: &DiscoveryWindow) -> Result<Vec<Candidate>, SourceError> {
        let url = self.config.endpoint("discover/movie");
        let query = self.discover_query(window);
        let response = self.http.fetch(&url, &query).await?;
        let payload: DiscoverResponse = response.json()?;
        debug!(results = payload.results.len(), "discover page received");
        Ok(candidates_from_discover(payload))
    }

    async fn fetch_detail(&self, id: MovieId) -> Result<MovieDetail, SourceError> {
        let url = self.config.endpoint(&format!("movie/{id}"));
        let query = [
            ("api_key", self.config.api_key.clone()),
            ("language", self.config.language.clone()),
        ];
        let response = self.http.fetch(&url, &query).await?;
        let payload: DetailResponse = response.json()?;
        Ok(detail_from_response(id, payload, &self.config.image_base_url))
    }
}

/// Captured discover page plus per-movie detail payloads, replayed without network access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default = "default_image_base_url")]
    pub image_base_url: String,
    pub discover: JsonValue,
    #[serde(default)]
    pub details: BTreeMap<MovieId, JsonValue>,
    pub notes: Option<String>,
}

fn default_image_base_url() -> String {
    DEFAULT_IMAGE_BASE_URL.to_string()
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a [`FixtureBundle`] verbatim; the discover page is not re-filtered by window.
pub struct FixtureSource {
    bundle: FixtureBundle,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }
}

#[async_trait]
impl MovieSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "tmdb-fixture"
    }

    async fn discover(&self, _window: &DiscoveryWindow) -> Result<Vec<Candidate>, SourceError> {
        let payload: DiscoverResponse = serde_json::from_value(self.bundle.discover.clone())?;
        Ok(candidates_from_discover(payload))
    }

    async fn fetch_detail(&self, id: MovieId) -> Result<MovieDetail, SourceError> {
        let raw = self
            .bundle
            .details
            .get(&id)
            .ok_or(SourceError::DetailUnavailable(id))?;
        let payload: DetailResponse = serde_json::from_value(raw.clone())?;
        Ok(detail_from_response(id, payload, &self.bundle.image_base_url))
    }
}
