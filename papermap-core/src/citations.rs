//! Citation counts from the OpenAlex works API.
//!
//! Each record's title is searched, and the best candidate is accepted only
//! when its normalized title is at least `min_similarity` similar (character
//! sequence ratio). Lookups run with bounded concurrency. A failed request is
//! recorded as a miss for that record and never aborts the run. The index is
//! checkpointed while running so an interrupted fetch resumes where it
//! stopped.

use crate::error::{PapermapError, Result};
use crate::persistence;
use crate::record::PaperRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Citation lookup settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationOptions {
    pub api_url: String,
    /// Contact address sent as `User-Agent: mailto:<contact>` (OpenAlex polite pool).
    pub contact: Option<String>,
    pub concurrency: usize,
    pub min_similarity: f64,
    pub timeout_secs: u64,
    pub checkpoint_every: usize,
    pub query_max_chars: usize,
}

impl Default for CitationOptions {
    fn default() -> Self {
        Self {
            api_url: "https://api.openalex.org/works".to_string(),
            contact: None,
            concurrency: 10,
            min_similarity: 0.7,
            timeout_secs: 15,
            checkpoint_every: 100,
            query_max_chars: 300,
        }
    }
}

/// Outcome of one record's lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationResult {
    pub id: String,
    pub found: bool,
    pub cited_by_count: u64,
    pub openalex_id: Option<String>,
    pub openalex_title: Option<String>,
    pub publication_year: Option<i32>,
    pub similarity: f64,
    pub reason: Option<String>,
    /// The lookup itself failed; a resumed fetch tries this record again.
    #[serde(default)]
    pub request_failed: bool,
}

impl CitationResult {
    pub fn found(
        id: &str,
        cited_by_count: u64,
        openalex_id: &str,
        openalex_title: &str,
        publication_year: Option<i32>,
        similarity: f64,
    ) -> Self {
        Self {
            id: id.to_string(),
            found: true,
            cited_by_count,
            openalex_id: Some(openalex_id.to_string()),
            openalex_title: Some(openalex_title.to_string()),
            publication_year,
            similarity,
            reason: None,
            request_failed: false,
        }
    }

    pub fn missing(id: &str, similarity: f64, reason: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            found: false,
            cited_by_count: 0,
            openalex_id: None,
            openalex_title: None,
            publication_year: None,
            similarity,
            reason: Some(reason.into()),
            request_failed: false,
        }
    }

    pub fn failed(id: &str, error: impl std::fmt::Display) -> Self {
        Self {
            request_failed: true,
            ..Self::missing(id, 0.0, format!("request failed: {error}"))
        }
    }
}

/// Citation results keyed by record id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationIndex {
    pub results: BTreeMap<String, CitationResult>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CitationIndex {
    pub fn insert(&mut self, result: CitationResult) {
        self.results.insert(result.id.clone(), result);
    }

    /// Citation count for a matched record.
    pub fn cited_by(&self, id: &str) -> Option<u64> {
        self.results
            .get(id)
            .filter(|r| r.found)
            .map(|r| r.cited_by_count)
    }

    pub fn max_count(&self) -> u64 {
        self.results
            .values()
            .filter(|r| r.found)
            .map(|r| r.cited_by_count)
            .max()
            .unwrap_or(0)
    }

    pub fn found_count(&self) -> usize {
        self.results.values().filter(|r| r.found).count()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Load an index, or an empty one if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(persistence::load_json(path)?.unwrap_or_default())
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Some(Utc::now());
        persistence::atomic_write_json(path, self)?;
        Ok(())
    }
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_for_match(title: &str) -> String {
    let cleaned: String = title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity in `[0, 1]` between two titles after normalization.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_for_match(a), normalize_for_match(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    f64::from(TextDiff::from_chars(a.as_str(), b.as_str()).ratio())
}

/// One candidate work from a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub cited_by_count: u64,
    pub publication_year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct WorksResponse {
    #[serde(default)]
    results: Vec<Work>,
}

/// The most similar candidate and its similarity, first wins on ties.
pub fn best_match<'a>(title: &str, works: &'a [Work]) -> Option<(&'a Work, f64)> {
    let mut best: Option<(&Work, f64)> = None;
    for work in works {
        let Some(candidate) = work.title.as_deref() else {
            continue;
        };
        let sim = title_similarity(title, candidate);
        if best.is_none_or(|(_, top)| sim > top) {
            best = Some((work, sim));
        }
    }
    best
}

/// Title search over a bibliographic index.
#[async_trait]
pub trait WorkSearch: Send + Sync {
    async fn search(&self, title: &str) -> Result<Vec<Work>>;
}

/// OpenAlex `/works` search client.
pub struct OpenAlexClient {
    client: reqwest::Client,
    api_url: String,
    query_max_chars: usize,
}

impl OpenAlexClient {
    pub fn new(options: &CitationOptions) -> Result<Self> {
        let agent = match &options.contact {
            Some(contact) => format!("mailto:{contact}"),
            None => format!("papermap/{}", env!("CARGO_PKG_VERSION")),
        };
        let client = reqwest::Client::builder()
            .user_agent(agent)
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_url: options.api_url.clone(),
            query_max_chars: options.query_max_chars,
        })
    }
}

#[async_trait]
impl WorkSearch for OpenAlexClient {
    async fn search(&self, title: &str) -> Result<Vec<Work>> {
        let query: String = title.chars().take(self.query_max_chars).collect();
        let response: WorksResponse = self
            .client
            .get(&self.api_url)
            .query(&[
                ("search", query.as_str()),
                ("select", "id,title,cited_by_count,publication_year"),
                ("per_page", "5"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.results)
    }
}

async fn lookup(source: &dyn WorkSearch, rec: &PaperRecord, min_similarity: f64) -> CitationResult {
    let works = match source.search(&rec.title).await {
        Ok(works) => works,
        Err(e) => {
            warn!(id = %rec.id, error = %e, "Citation lookup failed");
            return CitationResult::failed(&rec.id, e);
        }
    };
    match best_match(&rec.title, &works) {
        None => CitationResult::missing(&rec.id, 0.0, "no results"),
        Some((_, sim)) if sim < min_similarity => CitationResult::missing(
            &rec.id,
            sim,
            format!("best similarity {sim:.2} below {min_similarity:.2}"),
        ),
        Some((work, sim)) => CitationResult::found(
            &rec.id,
            work.cited_by_count,
            &work.id,
            work.title.as_deref().unwrap_or_default(),
            work.publication_year,
            sim,
        ),
    }
}

/// Look up citations for every record not already settled in `index`.
///
/// Results recorded as failed requests are looked up again.
///
/// When `checkpoint` is given the index is written there every
/// `checkpoint_every` results and once more at the end.
pub async fn fetch_citations(
    source: &dyn WorkSearch,
    records: &[PaperRecord],
    options: &CitationOptions,
    mut index: CitationIndex,
    checkpoint: Option<&Path>,
) -> Result<CitationIndex> {
    if options.concurrency == 0 {
        return Err(PapermapError::config("citations.concurrency must be at least 1"));
    }
    let pending: Vec<&PaperRecord> = records
        .iter()
        .filter(|r| index.results.get(&r.id).is_none_or(|c| c.request_failed))
        .collect();
    info!(
        total = records.len(),
        cached = records.len() - pending.len(),
        pending = pending.len(),
        "Fetching citations"
    );

    let min_similarity = options.min_similarity;
    let mut results = futures::stream::iter(pending)
        .map(|rec| lookup(source, rec, min_similarity))
        .buffer_unordered(options.concurrency);

    let mut done = 0usize;
    while let Some(result) = results.next().await {
        debug!(id = %result.id, found = result.found, similarity = result.similarity, "Citation result");
        index.insert(result);
        done += 1;
        if done % options.checkpoint_every.max(1) == 0 {
            info!(done, found = index.found_count(), "Citation progress");
            if let Some(path) = checkpoint {
                index.save(path)?;
            }
        }
    }

    if let Some(path) = checkpoint {
        index.save(path)?;
    }
    info!(
        records = index.len(),
        found = index.found_count(),
        "Citation fetch complete"
    );
    Ok(index)
}
