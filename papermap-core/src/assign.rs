//! Cluster and macro-category assignment.
//!
//! Two passes over a deduplicated snapshot:
//!
//! 1. Records without a cluster id get the id of the nearest cluster centroid
//!    by cosine similarity. Centroids are the mean member embedding of every
//!    cluster except noise (`-1`). Similarity ties go to the smallest id.
//! 2. Records without a macro-category get the plurality category among the
//!    categorized members of their cluster (ties go to the lexicographically
//!    smallest label), or [`UNCATEGORIZED`] when no member has one.
//!
//! Existing cluster ids and categories are never overwritten.

use crate::error::{PapermapError, Result};
use crate::record::{NOISE_CLUSTER, PaperRecord, UNCATEGORIZED};
use crate::snapshot::{Snapshot, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Cosine similarity between two vectors, 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Mean embedding per cluster, skipping noise and unassigned records.
pub fn compute_centroids(records: &[PaperRecord]) -> BTreeMap<i64, Vec<f32>> {
    let mut sums: BTreeMap<i64, (Vec<f64>, usize)> = BTreeMap::new();
    for rec in records {
        let Some(cluster) = rec.cluster_id.filter(|c| *c != NOISE_CLUSTER) else {
            continue;
        };
        let (sum, count) = sums
            .entry(cluster)
            .or_insert_with(|| (vec![0.0; rec.embedding.len()], 0));
        for (acc, v) in sum.iter_mut().zip(&rec.embedding) {
            *acc += f64::from(*v);
        }
        *count += 1;
    }
    sums.into_iter()
        .map(|(cluster, (sum, count))| {
            let n = count as f64;
            (cluster, sum.into_iter().map(|s| (s / n) as f32).collect())
        })
        .collect()
}

/// The most similar centroid. Ties keep the smallest cluster id.
pub fn nearest_centroid(
    embedding: &[f32],
    centroids: &BTreeMap<i64, Vec<f32>>,
) -> Option<(i64, f32)> {
    let mut best: Option<(i64, f32)> = None;
    for (&cluster, centroid) in centroids {
        let sim = cosine_similarity(embedding, centroid);
        if sim.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if sim <= top => {}
            _ => best = Some((cluster, sim)),
        }
    }
    best
}

/// Plurality label; ties go to the lexicographically smallest label.
pub fn plurality_category(counts: &BTreeMap<String, usize>) -> Option<&str> {
    let mut best: Option<(&str, usize)> = None;
    // BTreeMap iterates labels in ascending order, so `>` keeps the smallest on ties.
    for (label, &count) in counts {
        match best {
            Some((_, top)) if count <= top => {}
            _ => best = Some((label.as_str(), count)),
        }
    }
    best.map(|(label, _)| label)
}

/// A cluster id given to a previously unassigned record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub id: String,
    pub cluster_id: i64,
    pub similarity: f32,
}

/// How a cluster's category was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCategory {
    pub category: String,
    /// Members that already carried a category.
    pub categorized_members: usize,
    /// Members that received `category` in this run.
    pub filled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentReport {
    pub centroids: usize,
    pub assignments: Vec<ClusterAssignment>,
    pub categories: BTreeMap<i64, ClusterCategory>,
}

impl AssignmentReport {
    pub fn categories_filled(&self) -> usize {
        self.categories.values().map(|c| c.filled).sum()
    }
}

/// Assign clusters and categories, producing an assign snapshot.
pub fn assign(snapshot: &Snapshot) -> Result<(Snapshot, AssignmentReport)> {
    let mut records = snapshot.records().to_vec();
    let mut report = AssignmentReport::default();

    let unassigned: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.cluster_id.is_none())
        .map(|(idx, _)| idx)
        .collect();

    if !unassigned.is_empty() {
        let centroids = compute_centroids(&records);
        report.centroids = centroids.len();
        if centroids.is_empty() {
            return Err(PapermapError::EmptyClusterCentroid {
                record_ids: unassigned.iter().map(|&i| records[i].id.clone()).collect(),
            });
        }
        debug!(centroids = centroids.len(), "Cluster centroids computed");

        let mut labels: BTreeMap<i64, String> = BTreeMap::new();
        for rec in &records {
            if let (Some(cluster), Some(label)) = (rec.cluster_id, rec.cluster_label.as_ref()) {
                labels.entry(cluster).or_insert_with(|| label.clone());
            }
        }

        for idx in unassigned {
            let rec = &mut records[idx];
            let (cluster, similarity) = nearest_centroid(&rec.embedding, &centroids)
                .ok_or_else(|| PapermapError::EmptyClusterCentroid {
                    record_ids: vec![rec.id.clone()],
                })?;
            rec.cluster_id = Some(cluster);
            if rec.cluster_label.is_none() {
                rec.cluster_label = labels.get(&cluster).cloned();
            }
            report.assignments.push(ClusterAssignment {
                id: rec.id.clone(),
                cluster_id: cluster,
                similarity,
            });
        }
    }

    // Category votes come only from records that had a category on input.
    let mut votes: BTreeMap<i64, BTreeMap<String, usize>> = BTreeMap::new();
    for rec in &records {
        if let (Some(cluster), Some(category)) = (rec.cluster_id, rec.category()) {
            *votes
                .entry(cluster)
                .or_default()
                .entry(category.to_string())
                .or_default() += 1;
        }
    }

    for rec in &mut records {
        if rec.category().is_some() {
            continue;
        }
        let Some(cluster) = rec.cluster_id else {
            continue;
        };
        let entry = report.categories.entry(cluster).or_insert_with(|| {
            let counts = votes.get(&cluster);
            let category = counts
                .and_then(plurality_category)
                .unwrap_or(UNCATEGORIZED)
                .to_string();
            ClusterCategory {
                category,
                categorized_members: counts.map(|c| c.values().sum()).unwrap_or(0),
                filled: 0,
            }
        });
        rec.macro_category = Some(entry.category.clone());
        entry.filled += 1;
    }

    let sentinel_clusters: Vec<i64> = report
        .categories
        .iter()
        .filter(|(_, c)| c.categorized_members == 0)
        .map(|(id, _)| *id)
        .collect();
    if !sentinel_clusters.is_empty() {
        warn!(
            clusters = ?sentinel_clusters,
            "Clusters without categorized members, using '{UNCATEGORIZED}'"
        );
    }

    info!(
        records = records.len(),
        clusters_assigned = report.assignments.len(),
        categories_filled = report.categories_filled(),
        "Assignment complete"
    );
    Ok((Snapshot::new(Stage::Assign, records)?, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::record;
    use pretty_assertions::assert_eq;

    fn member(id: &str, emb: Vec<f32>, cluster: i64, cat: Option<&str>) -> PaperRecord {
        let mut r = record(id, &format!("Paper {id}"), emb);
        r.cluster_id = Some(cluster);
        r.macro_category = cat.map(String::from);
        r
    }

    fn dedup_snapshot(records: Vec<PaperRecord>) -> Snapshot {
        Snapshot::new(Stage::Dedup, records).unwrap()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_centroids_skip_noise() {
        let recs = vec![
            member("a", vec![1.0, 0.0], 3, None),
            member("b", vec![0.0, 1.0], 3, None),
            member("n", vec![5.0, 5.0], NOISE_CLUSTER, None),
            record("u", "Unassigned", vec![9.0, 9.0]),
        ];
        let centroids = compute_centroids(&recs);
        assert_eq!(centroids.len(), 1);
        assert_eq!(centroids[&3], vec![0.5, 0.5]);
    }

    #[test]
    fn test_nearest_centroid_ties_pick_smallest_id() {
        let centroids = BTreeMap::from([(7, vec![1.0, 0.0]), (2, vec![1.0, 0.0])]);
        assert_eq!(nearest_centroid(&[1.0, 0.0], &centroids).unwrap().0, 2);
    }

    #[test]
    fn test_plurality_ties_pick_smallest_label() {
        let counts = BTreeMap::from([("Vision".to_string(), 2), ("NLP".to_string(), 2)]);
        assert_eq!(plurality_category(&counts), Some("NLP"));
        let counts = BTreeMap::from([("Vision".to_string(), 3), ("NLP".to_string(), 2)]);
        assert_eq!(plurality_category(&counts), Some("Vision"));
        assert_eq!(plurality_category(&BTreeMap::new()), None);
    }

    #[test]
    fn test_unassigned_record_joins_nearest_cluster() {
        let mut k3 = member("k3a", vec![1.0, 0.0], 3, Some("Vision"));
        k3.cluster_label = Some("Image models".into());
        let recs = vec![
            k3,
            member("k3b", vec![0.9, 0.1], 3, Some("Vision")),
            member("k3c", vec![0.95, 0.0], 3, Some("NLP")),
            member("k5a", vec![0.0, 1.0], 5, Some("Theory")),
            record("C", "Unclustered", vec![0.8, 0.2]),
        ];
        let (out, report) = assign(&dedup_snapshot(recs)).unwrap();
        let c = out.get("C").unwrap();
        assert_eq!(c.cluster_id, Some(3));
        assert_eq!(c.macro_category.as_deref(), Some("Vision"));
        assert_eq!(c.cluster_label.as_deref(), Some("Image models"));
        assert_eq!(report.assignments.len(), 1);
        assert_eq!(report.categories[&3].categorized_members, 3);
        assert_eq!(report.categories[&3].filled, 1);
        assert_eq!(out.stage(), Stage::Assign);
    }

    #[test]
    fn test_cluster_without_categories_gets_sentinel() {
        let recs = vec![
            member("a", vec![1.0, 0.0], 9, None),
            member("b", vec![0.9, 0.1], 9, None),
            member("c", vec![0.0, 1.0], 4, Some("Theory")),
        ];
        let (out, report) = assign(&dedup_snapshot(recs)).unwrap();
        assert_eq!(out.get("a").unwrap().macro_category.as_deref(), Some(UNCATEGORIZED));
        assert_eq!(out.get("b").unwrap().macro_category.as_deref(), Some(UNCATEGORIZED));
        assert_eq!(out.get("c").unwrap().macro_category.as_deref(), Some("Theory"));
        assert_eq!(report.categories[&9].categorized_members, 0);
    }

    #[test]
    fn test_existing_assignments_are_kept() {
        let recs = vec![
            member("a", vec![1.0, 0.0], 1, Some("Keep")),
            member("b", vec![1.0, 0.0], 1, Some("Other")),
            member("c", vec![1.0, 0.0], 1, Some("Other")),
            member("n", vec![0.0, 1.0], NOISE_CLUSTER, None),
        ];
        let (out, report) = assign(&dedup_snapshot(recs)).unwrap();
        assert_eq!(out.get("a").unwrap().macro_category.as_deref(), Some("Keep"));
        assert_eq!(out.get("n").unwrap().cluster_id, Some(NOISE_CLUSTER));
        assert_eq!(out.get("n").unwrap().macro_category.as_deref(), Some(UNCATEGORIZED));
        assert!(report.assignments.is_empty());
    }

    #[test]
    fn test_no_centroids_is_an_error() {
        let recs = vec![
            member("n", vec![1.0], NOISE_CLUSTER, None),
            record("u1", "One", vec![1.0]),
            record("u2", "Two", vec![1.0]),
        ];
        let err = assign(&dedup_snapshot(recs)).unwrap_err();
        assert!(matches!(err, PapermapError::EmptyClusterCentroid { .. }));
        assert_eq!(err.record_ids(), vec!["u1", "u2"]);
    }
}
