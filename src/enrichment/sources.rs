//! External release-year sources, tried in priority order by the resolver.

use std::sync::OnceLock;

use log::warn;
use regex::Regex;
use serde_json::Value;

use crate::fetch::{FetchedPage, PageFetcher};

/// What the sources know about a song.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongQuery {
    pub title: String,
    pub artist: Option<String>,
}

pub trait YearSource: Send + Sync {
    /// Name recorded in the row note when this source supplies the year.
    fn name(&self) -> &str;
    /// `Ok(None)` means the source answered but had no year.
    fn lookup_year(&self, query: &SongQuery) -> Result<Option<u16>, String>;
}

fn year_pattern() -> &'static Regex {
    static YEAR: OnceLock<Regex> = OnceLock::new();
    YEAR.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").expect("valid year pattern"))
}

/// First plausible four-digit year (1900-2099) in `text`.
pub fn extract_year(text: &str) -> Option<u16> {
    year_pattern()
        .find(text)
        .and_then(|found| found.as_str().parse().ok())
}

fn parse_json(page: &FetchedPage, label: &str) -> Result<Value, String> {
    serde_json::from_str(&page.body)
        .map_err(|error| format!("{label}: invalid JSON response: {error}"))
}

fn require_success(page: Option<FetchedPage>, label: &str) -> Result<FetchedPage, String> {
    let page = page.ok_or_else(|| format!("{label}: no response"))?;
    if !page.is_success() {
        return Err(format!("{label}: HTTP {}", page.status));
    }
    Ok(page)
}

fn first_entry<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    value.get(key).and_then(Value::as_array).and_then(|items| items.first())
}

pub struct MusicBrainzSource<'a> {
    fetcher: &'a dyn PageFetcher,
    endpoint: String,
}

impl<'a> MusicBrainzSource<'a> {
    pub fn new(fetcher: &'a dyn PageFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }
}

impl YearSource for MusicBrainzSource<'_> {
    fn name(&self) -> &str {
        "MusicBrainz"
    }

    fn lookup_year(&self, query: &SongQuery) -> Result<Option<u16>, String> {
        let search = match &query.artist {
            Some(artist) => format!("{} AND artist:{artist}", query.title),
            None => query.title.clone(),
        };
        let page = require_success(
            self.fetcher.fetch(
                &self.endpoint,
                &[("query", search.as_str()), ("fmt", "json"), ("limit", "1")],
            ),
            "MusicBrainz",
        )?;
        let data = parse_json(&page, "MusicBrainz")?;

        Ok(first_entry(&data, "recordings")
            .and_then(|recording| first_entry(recording, "releases"))
            .and_then(|release| release.get("date"))
            .and_then(Value::as_str)
            .and_then(extract_year))
    }
}

/// Encyclopedia search + page summary across regional endpoints.
pub struct WikipediaSource<'a> {
    fetcher: &'a dyn PageFetcher,
    endpoints: Vec<String>,
}

impl<'a> WikipediaSource<'a> {
    pub fn new(fetcher: &'a dyn PageFetcher, endpoints: Vec<String>) -> Self {
        Self { fetcher, endpoints }
    }

    fn summary_url(endpoint: &str, page_title: &str) -> String {
        let site = endpoint.trim_end_matches("/w/api.php");
        format!(
            "{site}/api/rest_v1/page/summary/{}",
            urlencoding::encode(page_title)
        )
    }
}

impl YearSource for WikipediaSource<'_> {
    fn name(&self) -> &str {
        "Wikipedia"
    }

    fn lookup_year(&self, query: &SongQuery) -> Result<Option<u16>, String> {
        for endpoint in &self.endpoints {
            let search = self.fetcher.fetch(
                endpoint,
                &[
                    ("action", "query"),
                    ("list", "search"),
                    ("srsearch", query.title.as_str()),
                    ("format", "json"),
                    ("utf8", "1"),
                    ("srlimit", "1"),
                ],
            );
            if search.as_ref().is_some_and(FetchedPage::is_forbidden) {
                warn!("[Wikipedia] {endpoint} refused the search, trying the next endpoint");
                continue;
            }
            let data = parse_json(&require_success(search, "Wikipedia search")?, "Wikipedia")?;
            let Some(page_title) = data
                .get("query")
                .and_then(|query| first_entry(query, "search"))
                .and_then(|hit| hit.get("title"))
                .and_then(Value::as_str)
            else {
                continue;
            };

            let summary = self
                .fetcher
                .fetch(&Self::summary_url(endpoint, page_title), &[]);
            if summary.as_ref().is_some_and(FetchedPage::is_forbidden) {
                warn!("[Wikipedia] {endpoint} refused the summary, trying the next endpoint");
                continue;
            }
            let summary = parse_json(
                &require_success(summary, "Wikipedia summary")?,
                "Wikipedia",
            )?;
            if let Some(year) = summary
                .get("extract")
                .and_then(Value::as_str)
                .and_then(extract_year)
            {
                return Ok(Some(year));
            }
        }
        Ok(None)
    }
}

pub struct ItunesSource<'a> {
    fetcher: &'a dyn PageFetcher,
    endpoint: String,
    country: String,
}

impl<'a> ItunesSource<'a> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        endpoint: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
            country: country.into(),
        }
    }
}

impl YearSource for ItunesSource<'_> {
    fn name(&self) -> &str {
        "iTunes"
    }

    fn lookup_year(&self, query: &SongQuery) -> Result<Option<u16>, String> {
        let term = match &query.artist {
            Some(artist) => format!("{} {artist}", query.title),
            None => query.title.clone(),
        };
        let page = require_success(
            self.fetcher.fetch(
                &self.endpoint,
                &[
                    ("term", term.as_str()),
                    ("entity", "song"),
                    ("limit", "1"),
                    ("country", self.country.as_str()),
                ],
            ),
            "iTunes",
        )?;
        let data = parse_json(&page, "iTunes")?;

        Ok(first_entry(&data, "results")
            .and_then(|result| result.get("releaseDate"))
            .and_then(Value::as_str)
            .and_then(extract_year))
    }
}
