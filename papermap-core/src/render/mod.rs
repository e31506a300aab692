//! Interactive paper map rendering.
//!
//! [`build_map`] joins an assign snapshot with its projection into a
//! [`MapDocument`]: one [`MapPoint`] per record, carrying coordinates, the
//! label hierarchy (macro-category → cluster → title) and display metadata.
//! [`render_html`] turns the document into a single self-contained HTML file
//! with the document embedded as JSON, and [`summarize`] produces the
//! `summary.json` written next to it.
//!
//! Everything the page does on interaction (what a click opens, whether
//! search is shown, dark mode, marker sizing) comes from [`RenderConfig`].

pub mod template;

pub use template::{extract_document, render_html};

use crate::citations::CitationIndex;
use crate::error::{PapermapError, Result};
use crate::persistence;
use crate::project::Projection;
use crate::record::{UNCATEGORIZED, display_authors, truncate_chars};
use crate::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::info;

/// What clicking a point does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickAction {
    /// Open the point's link in a new browser tab.
    NewTab,
    SameTab,
    Disabled,
}

/// How marker sizes are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MarkerSizing {
    Uniform { size: f32 },
    /// Log-scaled by citation count between `min_size` and `max_size`.
    Citations { min_size: f32, max_size: f32 },
}

impl Default for MarkerSizing {
    fn default() -> Self {
        MarkerSizing::Uniform { size: 5.0 }
    }
}

/// Presentation and interaction settings for the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub title: String,
    /// Defaults to "{N} papers across {K} research areas".
    pub subtitle: Option<String>,
    pub font_family: String,
    pub dark_mode: bool,
    pub enable_search: bool,
    pub click_action: ClickAction,
    pub marker: MarkerSizing,
    pub title_max_chars: usize,
    pub abstract_max_chars: usize,
    /// Year shown for papers without one.
    pub fallback_year: i32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            title: "Research Paper Map".to_string(),
            subtitle: None,
            font_family: "Helvetica, Arial, sans-serif".to_string(),
            dark_mode: true,
            enable_search: true,
            click_action: ClickAction::NewTab,
            marker: MarkerSizing::default(),
            title_max_chars: 50,
            abstract_max_chars: 300,
            fallback_year: 2024,
        }
    }
}

/// One plotted paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPoint {
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub title: String,
    /// Title shown on the map, truncated.
    pub label: String,
    pub authors: String,
    /// Lowercased title, matched by the search box.
    pub search_title: String,
    /// Lowercased full author list, matched separately from the title.
    pub search_authors: String,
    pub year: i32,
    pub year_known: bool,
    pub category: String,
    pub cluster_id: Option<i64>,
    pub cluster_label: Option<String>,
    pub abstract_snippet: Option<String>,
    pub link: Option<String>,
    pub citations: Option<u64>,
    pub size: f32,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStyle {
    pub name: String,
    pub color: String,
    pub count: usize,
}

/// Everything the rendered page needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapDocument {
    pub title: String,
    pub subtitle: String,
    pub config: RenderConfig,
    pub year_min: i32,
    pub year_max: i32,
    pub categories: Vec<CategoryStyle>,
    pub points: Vec<MapPoint>,
}

const PALETTE: &[&str] = &[
    "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948", "#b07aa1", "#ff9da7",
    "#9c755f", "#86bcb6", "#d37295", "#a0cbe8", "#ffbe7d", "#8cd17d", "#b6992d", "#f1ce63",
    "#499894", "#fabfd2", "#d4a6c8", "#79706e",
];
const SENTINEL_COLOR: &str = "#8c8c8c";

/// Case-insensitive substring match on title or author text.
///
/// An empty query matches everything.
pub fn matches_search(point: &MapPoint, query: &str) -> bool {
    let query = query.trim().to_lowercase();
    query.is_empty() || point.search_title.contains(&query) || point.search_authors.contains(&query)
}

fn marker_size(sizing: &MarkerSizing, citations: Option<u64>, max_citations: u64) -> f32 {
    match *sizing {
        MarkerSizing::Uniform { size } => size,
        MarkerSizing::Citations { min_size, max_size } => {
            let (Some(c), true) = (citations, max_citations > 0) else {
                return min_size;
            };
            let t = (c as f64).ln_1p() / (max_citations as f64).ln_1p();
            min_size + (max_size - min_size) * t as f32
        }
    }
}

/// Category legend ordered by size, then name; the sentinel always last.
fn category_styles(counts: &BTreeMap<String, usize>) -> Vec<CategoryStyle> {
    let mut names: Vec<(&String, &usize)> = counts
        .iter()
        .filter(|(name, _)| name.as_str() != UNCATEGORIZED)
        .collect();
    names.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    let mut styles: Vec<CategoryStyle> = names
        .into_iter()
        .enumerate()
        .map(|(i, (name, count))| CategoryStyle {
            name: name.clone(),
            color: PALETTE[i % PALETTE.len()].to_string(),
            count: *count,
        })
        .collect();
    if let Some(count) = counts.get(UNCATEGORIZED) {
        styles.push(CategoryStyle {
            name: UNCATEGORIZED.to_string(),
            color: SENTINEL_COLOR.to_string(),
            count: *count,
        });
    }
    styles
}

/// Join a snapshot with its projection into a map document.
///
/// Every record needs coordinates and every coordinate needs a record.
pub fn build_map(
    snapshot: &Snapshot,
    projection: &Projection,
    config: &RenderConfig,
    citations: Option<&CitationIndex>,
) -> Result<MapDocument> {
    let coords = projection.by_id();
    if coords.len() != projection.len() {
        return Err(PapermapError::render("projection has repeated record ids"));
    }
    let known: HashSet<&str> = snapshot.ids().collect();
    if let Some(orphan) = projection.ids.iter().find(|id| !known.contains(id.as_str())) {
        return Err(PapermapError::render(format!(
            "projection has coordinates for unknown record '{orphan}'"
        )));
    }

    let max_citations = citations.map(|c| c.max_count()).unwrap_or(0);
    let mut category_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut points = Vec::with_capacity(snapshot.len());

    for rec in snapshot.records() {
        let [x, y] = *coords.get(rec.id.as_str()).ok_or_else(|| {
            PapermapError::render(format!("record '{}' has no coordinates", rec.id))
        })?;
        let category = rec.category().unwrap_or(UNCATEGORIZED).to_string();
        *category_counts.entry(category.clone()).or_default() += 1;

        let cited = citations.and_then(|c| c.cited_by(&rec.id));
        points.push(MapPoint {
            id: rec.id.clone(),
            x,
            y,
            label: truncate_chars(&rec.title, config.title_max_chars),
            authors: display_authors(&rec.authors),
            search_title: rec.title.to_lowercase(),
            search_authors: rec.authors.join(", ").to_lowercase(),
            title: rec.title.clone(),
            year: rec.year.unwrap_or(config.fallback_year),
            year_known: rec.year.is_some(),
            category,
            cluster_id: rec.cluster_id,
            cluster_label: rec.cluster_label.clone(),
            abstract_snippet: rec
                .abstract_text
                .as_deref()
                .map(|a| truncate_chars(a, config.abstract_max_chars)),
            link: rec.link.clone(),
            citations: cited,
            size: marker_size(&config.marker, cited, max_citations),
            color: String::new(),
        });
    }

    let categories = category_styles(&category_counts);
    let colors: BTreeMap<&str, &str> = categories
        .iter()
        .map(|c| (c.name.as_str(), c.color.as_str()))
        .collect();
    for point in &mut points {
        point.color = colors
            .get(point.category.as_str())
            .copied()
            .unwrap_or(SENTINEL_COLOR)
            .to_string();
    }

    let years = points.iter().map(|p| p.year);
    let year_min = years.clone().min().unwrap_or(config.fallback_year);
    let year_max = years.max().unwrap_or(config.fallback_year);

    let subtitle = config.subtitle.clone().unwrap_or_else(|| {
        format!(
            "{} papers across {} research areas",
            points.len(),
            categories.len()
        )
    });

    Ok(MapDocument {
        title: config.title.clone(),
        subtitle,
        config: config.clone(),
        year_min,
        year_max,
        categories,
        points,
    })
}

/// Corpus statistics written next to the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSummary {
    pub total_papers: usize,
    pub categories: BTreeMap<String, usize>,
    pub clusters: usize,
    /// Range over papers with a known year.
    pub year_range: Option<(i32, i32)>,
    pub with_links: usize,
    pub generated_at: DateTime<Utc>,
}

pub fn summarize(doc: &MapDocument) -> MapSummary {
    let known_years = doc.points.iter().filter(|p| p.year_known).map(|p| p.year);
    let year_range = known_years
        .clone()
        .min()
        .zip(known_years.max());
    let clusters: HashSet<i64> = doc.points.iter().filter_map(|p| p.cluster_id).collect();

    MapSummary {
        total_papers: doc.points.len(),
        categories: doc
            .categories
            .iter()
            .map(|c| (c.name.clone(), c.count))
            .collect(),
        clusters: clusters.len(),
        year_range,
        with_links: doc.points.iter().filter(|p| p.link.is_some()).count(),
        generated_at: Utc::now(),
    }
}

/// Render the map and write it with its summary, each atomically.
pub fn write_map(doc: &MapDocument, html_path: &Path, summary_path: &Path) -> Result<MapSummary> {
    let html = render_html(doc)?;
    persistence::atomic_write(html_path, html.as_bytes())?;
    let summary = summarize(doc);
    persistence::atomic_write_json(summary_path, &summary)?;
    info!(
        path = %html_path.display(),
        points = doc.points.len(),
        categories = doc.categories.len(),
        bytes = html.len(),
        "Map written"
    );
    Ok(summary)
}
