//! Core domain model for boxtrack: discovery candidates, detail enrichment and joined rows.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "boxtrack-core";

/// Canonical on-disk and on-wire date layout.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Stable identifier assigned by the metadata service.
pub type MovieId = u64;

/// Parse a `YYYY-MM-DD` date, coercing blank or malformed input to `None`.
pub fn parse_release_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

/// Inclusive release-date range used by the discovery query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DiscoveryWindow {
    /// Window spanning `[today - start_days_ago, today - end_days_ago]`.
    ///
    /// Returns `None` when either bound falls outside the representable date range.
    pub fn trailing(today: NaiveDate, start_days_ago: u32, end_days_ago: u32) -> Option<Self> {
        let days_before = |days: u32| today.checked_sub_signed(Duration::days(i64::from(days)));
        Some(Self {
            start: days_before(start_days_ago)?,
            end: days_before(end_days_ago)?,
        })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn start_param(&self) -> String {
        self.start.format(DATE_FORMAT).to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format(DATE_FORMAT).to_string()
    }
}

/// Lightweight row returned by the discovery query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: MovieId,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub vote_average: f64,
    pub popularity: f64,
}

/// Financial and structural fields fetched per movie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieDetail {
    pub id: MovieId,
    pub budget: u64,
    pub revenue: u64,
    pub runtime: u32,
    /// Genre names joined with `", "`.
    pub genres: String,
    /// Absolute poster URL, empty when the movie has no poster.
    pub poster_url: String,
    /// Production company names joined with `", "`.
    pub production_companies: String,
    pub status: String,
}

/// Joined candidate + detail row; the unit of the persisted dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieRecord {
    pub id: MovieId,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub vote_average: f64,
    pub popularity: f64,
    pub budget: u64,
    pub revenue: u64,
    pub runtime: u32,
    pub genres: String,
    pub poster_url: String,
    pub production_companies: String,
    /// `None` when the detail lookup for this movie failed.
    pub status: Option<String>,
}

impl MovieRecord {
    /// Build a row from a candidate, defaulting every detail field when `detail` is absent.
    pub fn from_parts(candidate: Candidate, detail: Option<MovieDetail>) -> Self {
        let Candidate {
            id,
            title,
            release_date,
            vote_average,
            popularity,
        } = candidate;

        match detail {
            Some(detail) => Self {
                id,
                title,
                release_date,
                vote_average,
                popularity,
                budget: detail.budget,
                revenue: detail.revenue,
                runtime: detail.runtime,
                genres: detail.genres,
                poster_url: detail.poster_url,
                production_companies: detail.production_companies,
                status: Some(detail.status),
            },
            None => Self {
                id,
                title,
                release_date,
                vote_average,
                popularity,
                budget: 0,
                revenue: 0,
                runtime: 0,
                genres: String::new(),
                poster_url: String::new(),
                production_companies: String::new(),
                status: None,
            },
        }
    }

    pub fn has_detail(&self) -> bool {
        self.status.is_some()
    }
}

/// Left join of candidates with whatever details were fetched, keyed on `id`.
///
/// Every candidate yields exactly one row in input order. Details without a
/// matching candidate are discarded.
pub fn left_join(candidates: Vec<Candidate>, details: Vec<MovieDetail>) -> Vec<MovieRecord> {
    let by_id: HashMap<MovieId, MovieDetail> = details.into_iter().map(|d| (d.id, d)).collect();
    candidates
        .into_iter()
        .map(|candidate| {
            let detail = by_id.get(&candidate.id).cloned();
            MovieRecord::from_parts(candidate, detail)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: MovieId) -> Candidate {
        Candidate {
            id,
            title: format!("Movie {id}"),
            release_date: NaiveDate::from_ymd_opt(2026, 8, 1),
            vote_average: 7.1,
            popularity: 42.0,
        }
    }

    fn detail(id: MovieId) -> MovieDetail {
        MovieDetail {
            id,
            budget: 1_000,
            revenue: 5_000,
            runtime: 101,
            genres: "Action, Comedy".into(),
            poster_url: "https://image.tmdb.org/t/p/w500/p.jpg".into(),
            production_companies: "Studio A".into(),
            status: "Released".into(),
        }
    }

    #[test]
    fn release_dates_coerce_bad_input_to_none() {
        assert_eq!(parse_release_date("2026-09-14"), NaiveDate::from_ymd_opt(2026, 9, 14));
        assert_eq!(parse_release_date(" 2026-09-14 "), NaiveDate::from_ymd_opt(2026, 9, 14));
        assert_eq!(parse_release_date(""), None);
        assert_eq!(parse_release_date("2026-02-30"), None);
        assert_eq!(parse_release_date("soon"), None);
    }

    #[test]
    fn trailing_window_counts_back_from_today() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let window = DiscoveryWindow::trailing(today, 60, 10).unwrap();
        assert_eq!(window.start_param(), "2026-08-17");
        assert_eq!(window.end_param(), "2026-10-06");
        assert!(window.contains(window.start));
        assert!(window.contains(window.end));
        assert!(!window.contains(today));
    }

    #[test]
    fn trailing_window_rejects_offsets_past_the_calendar() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        assert_eq!(DiscoveryWindow::trailing(today, u32::MAX, 10), None);
        assert_eq!(DiscoveryWindow::trailing(today, 60, u32::MAX), None);
    }

    #[test]
    fn left_join_keeps_every_candidate_once() {
        let candidates = vec![candidate(1), candidate(2), candidate(3)];
        let details = vec![detail(3), detail(1), detail(99)];

        let joined = left_join(candidates, details);

        assert_eq!(joined.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(joined[0].has_detail());
        assert_eq!(joined[0].revenue, 5_000);
        assert_eq!(joined[2].genres, "Action, Comedy");
    }

    #[test]
    fn unmatched_candidate_gets_default_detail_fields() {
        let joined = left_join(vec![candidate(7)], Vec::new());
        let row = &joined[0];

        assert!(!row.has_detail());
        assert_eq!(row.title, "Movie 7");
        assert_eq!((row.budget, row.revenue, row.runtime), (0, 0, 0));
        assert!(row.genres.is_empty());
        assert!(row.poster_url.is_empty());
        assert!(row.production_companies.is_empty());
        assert_eq!(row.status, None);
    }
}
