//! Duplicate collapsing.
//!
//! Records are duplicates when they share a content hash or a normalized
//! title, and the relation is transitive: if A shares a hash with B and B
//! shares a title with C, all three form one group. Groups are built with a
//! union-find over record positions. Each group keeps exactly one record:
//!
//! 1. highest completeness score,
//! 2. then earliest `indexed_at` (records without one rank last),
//! 3. then smallest id.
//!
//! The rule never looks at input order, so the result does not depend on how
//! the store happened to return rows.

use crate::error::{PapermapError, Result};
use crate::record::PaperRecord;
use crate::snapshot::{Snapshot, Stage};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// A record id with its completeness score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredId {
    pub id: String,
    pub title: String,
    pub score: u32,
}

impl ScoredId {
    fn of(rec: &PaperRecord) -> Self {
        Self {
            id: rec.id.clone(),
            title: rec.title.clone(),
            score: rec.completeness_score(),
        }
    }
}

/// One collapsed group of duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub kept: ScoredId,
    pub dropped: Vec<ScoredId>,
}

/// Deletion log for a dedup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    pub input_records: usize,
    pub output_records: usize,
    pub groups: Vec<DuplicateGroup>,
}

impl DedupReport {
    pub fn dropped_count(&self) -> usize {
        self.groups.iter().map(|g| g.dropped.len()).sum()
    }
}

/// Disjoint-set forest over record positions.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index becomes the root so group order follows input order.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Order two records by preference; `Less` means `a` is kept over `b`.
pub fn preference(a: &PaperRecord, b: &PaperRecord) -> Ordering {
    b.completeness_score()
        .cmp(&a.completeness_score())
        .then_with(|| match (a.indexed_at, b.indexed_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Partition record positions into duplicate groups, in order of first member.
pub fn duplicate_groups(records: &[PaperRecord]) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::new(records.len());
    let mut by_hash: HashMap<&str, usize> = HashMap::new();
    let mut by_title: HashMap<&str, usize> = HashMap::new();

    for (idx, rec) in records.iter().enumerate() {
        if let Some(&first) = by_hash.get(rec.content_hash.as_str()) {
            uf.union(first, idx);
        } else {
            by_hash.insert(rec.content_hash.as_str(), idx);
        }
        if let Some(&first) = by_title.get(rec.normalized_title.as_str()) {
            uf.union(first, idx);
        } else {
            by_title.insert(rec.normalized_title.as_str(), idx);
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for idx in 0..records.len() {
        let root = uf.find(idx);
        groups.entry(root).or_default().push(idx);
    }
    groups.into_values().collect()
}

/// Check that no two records share a content hash or normalized title.
pub fn check_unique(records: &[PaperRecord]) -> Result<()> {
    let mut by_hash: HashMap<&str, &str> = HashMap::new();
    let mut by_title: HashMap<&str, &str> = HashMap::new();
    for rec in records {
        if let Some(other) = by_hash.insert(rec.content_hash.as_str(), rec.id.as_str()) {
            return Err(PapermapError::DuplicateInvariantViolation {
                key: format!("content hash {}", rec.content_hash),
                record_ids: vec![other.to_string(), rec.id.clone()],
            });
        }
        if let Some(other) = by_title.insert(rec.normalized_title.as_str(), rec.id.as_str()) {
            return Err(PapermapError::DuplicateInvariantViolation {
                key: format!("normalized title '{}'", rec.normalized_title),
                record_ids: vec![other.to_string(), rec.id.clone()],
            });
        }
    }
    Ok(())
}

/// Collapse duplicates, returning a dedup snapshot and the deletion log.
///
/// Surviving records keep their relative input order. The input snapshot is
/// left untouched.
pub fn deduplicate(snapshot: &Snapshot) -> Result<(Snapshot, DedupReport)> {
    let records = snapshot.records();
    let groups = duplicate_groups(records);

    let mut keep: HashSet<usize> = HashSet::with_capacity(groups.len());
    let mut report = DedupReport {
        input_records: records.len(),
        ..Default::default()
    };

    for members in &groups {
        let best = members
            .iter()
            .copied()
            .min_by(|&a, &b| preference(&records[a], &records[b]))
            .ok_or_else(|| PapermapError::DuplicateInvariantViolation {
                key: "empty duplicate group".into(),
                record_ids: Vec::new(),
            })?;
        keep.insert(best);

        if members.len() > 1 {
            let dropped: Vec<ScoredId> = members
                .iter()
                .filter(|&&idx| idx != best)
                .map(|&idx| ScoredId::of(&records[idx]))
                .collect();
            debug!(
                kept = %records[best].id,
                dropped = dropped.len(),
                "Collapsed duplicate group"
            );
            report.groups.push(DuplicateGroup {
                kept: ScoredId::of(&records[best]),
                dropped,
            });
        }
    }

    let survivors: Vec<PaperRecord> = records
        .iter()
        .enumerate()
        .filter(|(idx, _)| keep.contains(idx))
        .map(|(_, rec)| rec.clone())
        .collect();
    check_unique(&survivors)?;

    report.output_records = survivors.len();
    info!(
        input = report.input_records,
        output = report.output_records,
        groups = report.groups.len(),
        dropped = report.dropped_count(),
        "Deduplication complete"
    );

    Ok((Snapshot::new(Stage::Dedup, survivors)?, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::record;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn snapshot(records: Vec<PaperRecord>) -> Snapshot {
        Snapshot::new(Stage::Export, records).unwrap()
    }

    fn with_score(mut rec: PaperRecord, score: u32) -> PaperRecord {
        let fields: [fn(&mut PaperRecord); 8] = [
            |r: &mut PaperRecord| r.abstract_text = Some("abstract".into()),
            |r: &mut PaperRecord| r.cluster_id = Some(1),
            |r: &mut PaperRecord| r.link = Some("https://drive/x".into()),
            |r: &mut PaperRecord| r.summary = Some("summary".into()),
            |r: &mut PaperRecord| r.macro_category = Some("ML".into()),
            |r: &mut PaperRecord| r.authors = vec!["Turing".into()],
            |r: &mut PaperRecord| r.year = Some(2020),
            |r: &mut PaperRecord| r.research_question = Some("why?".into()),
        ];
        for set in fields.iter().take(score as usize) {
            set(&mut rec);
        }
        rec
    }

    #[test]
    fn test_more_complete_record_wins() {
        let mut a = with_score(record("A", "Same Paper", vec![1.0]), 3);
        let mut b = with_score(record("B", "Different Title", vec![1.0]), 5);
        a.content_hash = "H1".into();
        b.content_hash = "H1".into();

        let (out, report) = deduplicate(&snapshot(vec![a, b])).unwrap();
        assert_eq!(out.ids().collect::<Vec<_>>(), vec!["B"]);
        assert_eq!(out.stage(), Stage::Dedup);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].kept.score, 5);
        assert_eq!(report.groups[0].dropped[0].id, "A");
        assert_eq!(report.groups[0].dropped[0].score, 3);
    }

    #[test]
    fn test_title_match_is_normalized() {
        let a = record("a", "Deep Learning: A Survey", vec![1.0]);
        let b = record("b", "deep learning -- a survey", vec![1.0]);
        let c = record("c", "Unrelated", vec![1.0]);
        let (out, _) = deduplicate(&snapshot(vec![a, b, c])).unwrap();
        assert_eq!(out.ids().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_grouping_is_transitive() {
        // a~b by hash, b~c by title: one group of three.
        let mut a = record("a", "First", vec![1.0]);
        let mut b = record("b", "Second", vec![1.0]);
        let c = with_score(record("c", "second", vec![1.0]), 1);
        a.content_hash = "shared".into();
        b.content_hash = "shared".into();

        let (out, report) = deduplicate(&snapshot(vec![a, b, c])).unwrap();
        assert_eq!(out.ids().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].dropped.len(), 2);
    }

    #[test]
    fn test_tiebreak_prefers_earliest_index_then_id() {
        let mut early = record("z", "Tie", vec![1.0]);
        early.indexed_at = Some(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap());
        let mut late = record("a", "tie", vec![1.0]);
        late.indexed_at = Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        let undated = record("0", "TIE", vec![1.0]);

        let (out, _) = deduplicate(&snapshot(vec![undated, late, early])).unwrap();
        assert_eq!(out.ids().collect::<Vec<_>>(), vec!["z"]);

        let x = record("x", "Same", vec![1.0]);
        let y = record("y", "same", vec![1.0]);
        let (fwd, _) = deduplicate(&snapshot(vec![x.clone(), y.clone()])).unwrap();
        let (rev, _) = deduplicate(&snapshot(vec![y, x])).unwrap();
        assert_eq!(fwd.ids().collect::<Vec<_>>(), vec!["x"]);
        assert_eq!(rev.ids().collect::<Vec<_>>(), vec!["x"]);
    }

    #[test]
    fn test_survivors_keep_input_order() {
        let recs = vec![
            record("c", "Gamma", vec![1.0]),
            record("a", "Alpha", vec![1.0]),
            record("b", "alpha!", vec![1.0]),
            record("d", "Delta", vec![1.0]),
        ];
        let (out, _) = deduplicate(&snapshot(recs)).unwrap();
        assert_eq!(out.ids().collect::<Vec<_>>(), vec!["c", "a", "d"]);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let recs = vec![
            record("a", "One", vec![1.0]),
            record("b", "one", vec![1.0]),
            record("c", "Two", vec![1.0]),
        ];
        let (once, _) = deduplicate(&snapshot(recs)).unwrap();
        let (twice, report) = deduplicate(&once).unwrap();
        assert_eq!(once, twice);
        assert!(report.groups.is_empty());
    }

    #[test]
    fn test_check_unique_names_colliding_ids() {
        let mut a = record("a", "One", vec![1.0]);
        let mut b = record("b", "Two", vec![1.0]);
        a.content_hash = "h".into();
        b.content_hash = "h".into();
        let err = check_unique(&[a, b]).unwrap_err();
        assert_eq!(err.record_ids(), vec!["a", "b"]);
    }
}
