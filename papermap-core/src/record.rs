//! The paper record schema shared by every pipeline stage.
//!
//! A [`PaperRecord`] is built once, at the store boundary, from a
//! [`StoredPaper`](crate::store::StoredPaper). The derived keys
//! (`normalized_title`, `content_hash`) are computed there and never
//! recomputed downstream, so every stage compares the same keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// HDBSCAN's label for points that belong to no cluster.
pub const NOISE_CLUSTER: i64 = -1;

/// Category given to records whose cluster has no categorized members.
pub const UNCATEGORIZED: &str = "uncategorized";

/// A single research paper as carried through the pipeline snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: String,
    pub title: String,
    pub normalized_title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub abstract_text: Option<String>,
    pub summary: Option<String>,
    pub file_path: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub cluster_id: Option<i64>,
    pub cluster_label: Option<String>,
    pub macro_category: Option<String>,
    pub micro_topic: Option<String>,
    /// External link opened when the point is clicked (Drive URL).
    pub link: Option<String>,
    pub research_question: Option<String>,
    pub indexed_at: Option<DateTime<Utc>>,
    /// Position of the record in the store's read order.
    pub ingest_seq: u64,
}

/// Attributes that count towards a record's completeness score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityField {
    Abstract,
    Cluster,
    Link,
    Summary,
    MacroCategory,
    Authors,
    Year,
    ResearchQuestion,
}

impl QualityField {
    /// Every quality attribute, in scoring order.
    pub const ALL: [QualityField; 8] = [
        QualityField::Abstract,
        QualityField::Cluster,
        QualityField::Link,
        QualityField::Summary,
        QualityField::MacroCategory,
        QualityField::Authors,
        QualityField::Year,
        QualityField::ResearchQuestion,
    ];
}

impl PaperRecord {
    /// Whether the given quality attribute is populated on this record.
    pub fn has(&self, field: QualityField) -> bool {
        match field {
            QualityField::Abstract => is_populated(&self.abstract_text),
            QualityField::Cluster => self.cluster_id.is_some(),
            QualityField::Link => is_populated(&self.link),
            QualityField::Summary => is_populated(&self.summary),
            QualityField::MacroCategory => is_populated(&self.macro_category),
            QualityField::Authors => self.authors.iter().any(|a| !a.trim().is_empty()),
            QualityField::Year => self.year.is_some(),
            QualityField::ResearchQuestion => is_populated(&self.research_question),
        }
    }

    /// Number of populated quality attributes.
    pub fn completeness_score(&self) -> u32 {
        QualityField::ALL
            .iter()
            .filter(|field| self.has(**field))
            .count() as u32
    }

    /// The macro-category, treating blank strings as absent.
    pub fn category(&self) -> Option<&str> {
        self.macro_category
            .as_deref()
            .filter(|c| !c.trim().is_empty())
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding.len()
    }
}

fn is_populated(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Normalize a title for duplicate comparison.
///
/// Lowercases and drops every character outside `[a-z0-9]`, so punctuation,
/// whitespace and accents never distinguish two titles.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

/// Derive a content hash from a record's immutable source fields.
///
/// Used when the store carries no hash of its own.
pub fn derive_content_hash(title: &str, authors: &[String], abstract_text: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hasher.update([0x1f]);
    hasher.update(authors.join("\u{1e}").as_bytes());
    hasher.update([0x1f]);
    hasher.update(abstract_text.unwrap_or("").trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Format an author list for display: first three names, then "et al.".
pub fn display_authors(authors: &[String]) -> String {
    let shown: Vec<&str> = authors.iter().take(3).map(String::as_str).collect();
    let mut out = shown.join(", ");
    if authors.len() > 3 {
        out.push_str(" et al.");
    }
    out
}

/// Truncate to `max` characters, appending "..." when anything was cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::record;
    use super::*;

    #[test]
    fn test_normalize_title_strips_punctuation_and_case() {
        assert_eq!(
            normalize_title("Attention Is All You Need!"),
            "attentionisallyouneed"
        );
        assert_eq!(normalize_title("  GPT-4: A Report (v2) "), "gpt4areportv2");
        assert_eq!(normalize_title("???"), "");
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let authors = vec!["Ada Lovelace".to_string()];
        let a = derive_content_hash("Notes", &authors, Some("On the engine"));
        let b = derive_content_hash("Notes", &authors, Some("On the engine"));
        let c = derive_content_hash("Notes", &authors, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_completeness_counts_populated_fields() {
        let mut rec = record("r1", "A title", vec![1.0]);
        assert_eq!(rec.completeness_score(), 0);

        rec.abstract_text = Some("text".into());
        rec.cluster_id = Some(3);
        rec.year = Some(2021);
        assert_eq!(rec.completeness_score(), 3);

        // Blank strings and blank authors do not count.
        rec.link = Some("   ".into());
        rec.authors = vec![" ".into()];
        assert_eq!(rec.completeness_score(), 3);

        rec.authors = vec!["Grace Hopper".into()];
        rec.macro_category = Some("Systems".into());
        assert_eq!(rec.completeness_score(), 5);
    }

    #[test]
    fn test_category_ignores_blank() {
        let mut rec = record("r1", "A title", vec![1.0]);
        rec.macro_category = Some("".into());
        assert_eq!(rec.category(), None);
        rec.macro_category = Some("Vision".into());
        assert_eq!(rec.category(), Some("Vision"));
    }

    #[test]
    fn test_display_authors() {
        let two = vec!["A".to_string(), "B".to_string()];
        assert_eq!(display_authors(&two), "A, B");
        let four: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        assert_eq!(display_authors(&four), "A, B, C et al.");
        assert_eq!(display_authors(&[]), "");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdefgh", 3), "abc...");
        assert_eq!(truncate_chars("ééééé", 2), "éé...");
    }
}
