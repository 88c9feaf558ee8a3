//! Identity resolver
//!
//! Builds the submission id to RANDOM_ID map from diary and exit survey
//! self-reports. Exit survey links are layered over diary links, so the exit
//! survey wins any conflict.

use crate::error::PipelineError;
use crate::sources::SurveyRow;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

/// Canonical string form of a submission id
///
/// Surrounding whitespace is stripped and integral numbers that picked up a
/// fractional suffix on the way through a spreadsheet (`42.0`) lose it.
pub fn canonical_submission_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some((whole, fraction)) = trimmed.split_once('.') {
        let is_integral = !whole.is_empty()
            && whole.bytes().all(|b| b.is_ascii_digit())
            && !fraction.is_empty()
            && fraction.bytes().all(|b| b == b'0');
        if is_integral {
            return whole.to_string();
        }
    }
    trimmed.to_string()
}

/// Survey an identity link came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    Diary,
    ExitSurvey,
}

/// A resolved submission id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityLink {
    pub random_id: String,
    pub source: IdentitySource,
}

/// Submission id to participant map; at most one link per submission id
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    links: BTreeMap<String, IdentityLink>,
}

/// Counters describing how the identity map was built
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IdentityStats {
    pub diary_rows: usize,
    pub diary_rows_without_id: usize,
    pub diary_duplicate_tuples: usize,
    pub diary_links: usize,
    pub exit_rows: usize,
    pub exit_links: usize,
    /// Submission ids whose exit survey RANDOM_ID differs from the diary one
    pub conflicts_overridden: usize,
    pub merged_links: usize,
    pub participants: usize,
    /// Participants per submission-id count in the merged map
    pub submissions_per_participant: BTreeMap<usize, usize>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build links from diary rows
    ///
    /// Rows are deduplicated by the sorted tuple of their non-empty submission
    /// ids: only the first row reporting a given tuple contributes.
    pub fn from_diary(rows: &[SurveyRow]) -> (Self, IdentityStats) {
        let mut map = Self::new();
        let mut stats = IdentityStats {
            diary_rows: rows.len(),
            ..Default::default()
        };
        let mut seen_tuples: HashSet<Vec<String>> = HashSet::new();

        for row in rows {
            let Some(random_id) = row.random_id.as_deref() else {
                stats.diary_rows_without_id += 1;
                continue;
            };
            let ids = canonical_ids(row);
            if ids.is_empty() {
                continue;
            }

            let mut tuple_key = ids.clone();
            tuple_key.sort();
            if !seen_tuples.insert(tuple_key) {
                stats.diary_duplicate_tuples += 1;
                continue;
            }

            for id in ids {
                map.link(id, random_id, IdentitySource::Diary);
            }
        }

        stats.diary_links = map.len();
        (map, stats)
    }

    /// Build links from exit survey rows; later rows overwrite earlier ones
    pub fn from_exit(rows: &[SurveyRow]) -> Self {
        let mut map = Self::new();
        for row in rows {
            let Some(random_id) = row.random_id.as_deref() else {
                continue;
            };
            for id in canonical_ids(row) {
                map.link(id, random_id, IdentitySource::ExitSurvey);
            }
        }
        map
    }

    fn link(&mut self, submission_id: String, random_id: &str, source: IdentitySource) {
        self.links.insert(
            submission_id,
            IdentityLink {
                random_id: random_id.to_string(),
                source,
            },
        );
    }

    /// Layer `overrides` on top of this map, returning how many existing links
    /// changed participant
    pub fn overlay(&mut self, overrides: IdentityMap) -> usize {
        let mut conflicts = 0;
        for (submission_id, link) in overrides.links {
            if let Some(existing) = self.links.get(&submission_id) {
                if existing.random_id != link.random_id {
                    debug!(
                        %submission_id,
                        diary = %existing.random_id,
                        exit = %link.random_id,
                        "exit survey overrides diary mapping"
                    );
                    conflicts += 1;
                }
            }
            self.links.insert(submission_id, link);
        }
        conflicts
    }

    pub fn get(&self, submission_id: &str) -> Option<&IdentityLink> {
        self.links.get(&canonical_submission_id(submission_id))
    }

    /// Resolve a submission id to its RANDOM_ID
    pub fn resolve(&self, submission_id: &str) -> Result<&str, PipelineError> {
        self.get(submission_id)
            .map(|link| link.random_id.as_str())
            .ok_or_else(|| PipelineError::JoinMiss(canonical_submission_id(submission_id)))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IdentityLink)> {
        self.links.iter()
    }

    /// Sorted submission ids of each RANDOM_ID
    pub fn submission_ids_by_participant(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (submission_id, link) in &self.links {
            grouped
                .entry(link.random_id.as_str())
                .or_default()
                .push(submission_id.as_str());
        }
        grouped
    }

    /// Submission ids per RANDOM_ID
    pub fn submission_counts(&self) -> BTreeMap<&str, usize> {
        self.submission_ids_by_participant()
            .into_iter()
            .map(|(random_id, ids)| (random_id, ids.len()))
            .collect()
    }

    /// Number of participants having each submission-id count
    pub fn distribution(&self) -> BTreeMap<usize, usize> {
        let mut distribution = BTreeMap::new();
        for count in self.submission_counts().into_values() {
            *distribution.entry(count).or_insert(0) += 1;
        }
        distribution
    }

    pub fn participants(&self) -> BTreeSet<&str> {
        self.links.values().map(|l| l.random_id.as_str()).collect()
    }
}

fn canonical_ids(row: &SurveyRow) -> Vec<String> {
    row.submission_ids
        .iter()
        .map(|id| canonical_submission_id(id))
        .filter(|id| !id.is_empty())
        .collect()
}

/// Build the merged identity map from diary rows and optional exit rows
pub fn resolve_identities(
    diary: &[SurveyRow],
    exit: Option<&[SurveyRow]>,
) -> (IdentityMap, IdentityStats) {
    let (mut map, mut stats) = IdentityMap::from_diary(diary);

    if let Some(exit_rows) = exit {
        let exit_map = IdentityMap::from_exit(exit_rows);
        stats.exit_rows = exit_rows.len();
        stats.exit_links = exit_map.len();
        stats.conflicts_overridden = map.overlay(exit_map);
    }

    stats.merged_links = map.len();
    stats.participants = map.participants().len();
    stats.submissions_per_participant = map.distribution();
    info!(
        diary_links = stats.diary_links,
        exit_links = stats.exit_links,
        conflicts = stats.conflicts_overridden,
        merged = stats.merged_links,
        participants = stats.participants,
        distribution = ?stats.submissions_per_participant,
        "resolved identities"
    );
    (map, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    fn row(ids: &[&str], random_id: &str) -> SurveyRow {
        SurveyRow::new(ids.iter().copied(), Some(random_id))
    }

    #[test]
    fn test_canonical_submission_id() {
        assert_eq!(canonical_submission_id(" 42 "), "42");
        assert_eq!(canonical_submission_id("42.0"), "42");
        assert_eq!(canonical_submission_id("42.5"), "42.5");
        assert_eq!(canonical_submission_id("abc.00"), "abc.00");
        assert_eq!(canonical_submission_id("0042"), "0042");
    }

    #[test]
    fn test_exit_survey_wins_conflicts() {
        let diary = vec![row(&["42"], "RID_A")];
        let exit = vec![row(&["42"], "RID_B")];
        let (map, stats) = resolve_identities(&diary, Some(exit.as_slice()));

        assert_eq!(map.resolve("42").unwrap(), "RID_B");
        assert_eq!(map.get("42").unwrap().source, IdentitySource::ExitSurvey);
        assert_eq!(stats.conflicts_overridden, 1);
        assert_eq!(stats.merged_links, 1);
    }

    #[test]
    fn test_diary_tuple_dedup() {
        let diary = vec![
            row(&["11", "12"], "P001"),
            // Same tuple in a different order: ignored
            row(&["12", "11"], "P999"),
            // Overlapping but different tuple still contributes
            row(&["12", "13"], "P002"),
        ];
        let (map, stats) = IdentityMap::from_diary(&diary);

        assert_eq!(stats.diary_duplicate_tuples, 1);
        assert_eq!(map.resolve("11").unwrap(), "P001");
        assert_eq!(map.resolve("12").unwrap(), "P002");
        assert_eq!(map.resolve("13").unwrap(), "P002");
    }

    #[test]
    fn test_rows_without_random_id_are_skipped() {
        let diary = vec![SurveyRow::new(["77"], None), row(&["78"], "P001")];
        let (map, stats) = IdentityMap::from_diary(&diary);

        assert_eq!(stats.diary_rows_without_id, 1);
        assert!(map.get("77").is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_unmapped_lookup_is_join_miss() {
        let map = IdentityMap::new();
        let err = map.resolve(" 404 ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::JoinMiss);
    }

    #[test]
    fn test_resolve_tolerates_numeric_drift() {
        let (map, _) = IdentityMap::from_diary(&[row(&["42.0"], "P001")]);
        assert_eq!(map.resolve("42").unwrap(), "P001");
        assert_eq!(map.resolve(" 42.0").unwrap(), "P001");
    }

    #[test]
    fn test_distribution() {
        let diary = vec![row(&["1", "2"], "P001"), row(&["3"], "P002"), row(&["4"], "P003")];
        let (map, _) = IdentityMap::from_diary(&diary);

        assert_eq!(map.distribution(), BTreeMap::from([(1, 2), (2, 1)]));
        assert_eq!(map.submission_counts().get("P001"), Some(&2));
        assert_eq!(map.submission_ids_by_participant().get("P001"), Some(&vec!["1", "2"]));
    }

    #[test]
    fn test_stats_carry_distribution_of_merged_map() {
        let diary = vec![row(&["1"], "P001"), row(&["2"], "P002")];
        let exit = vec![row(&["2", "3"], "P001")];
        let (_, stats) = resolve_identities(&diary, Some(exit.as_slice()));

        assert_eq!(stats.participants, 1);
        assert_eq!(stats.submissions_per_participant, BTreeMap::from([(3, 1)]));
    }
}
