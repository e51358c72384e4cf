//! Normalized save report — the one shape every response site uses.

use serde::Serialize;

use crate::save::VerifiedSave;
use crate::traits::DuplicateMatchKey;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SkippedDuplicateReport {
    pub company_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_match_key: Option<DuplicateMatchKey>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FailedItemReport {
    pub company_name: String,
    pub error: String,
}

/// Saved/verified/unverified counts are surfaced distinctly: `saved` is the
/// verified count, `saved_write_count` is what the store accepted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SaveReport {
    pub saved: usize,
    pub saved_verified_count: usize,
    pub saved_write_count: usize,
    pub skipped: usize,
    pub failed: usize,
    pub saved_ids: Vec<String>,
    pub saved_ids_verified: Vec<String>,
    pub saved_ids_unverified: Vec<String>,
    pub saved_ids_write: Vec<String>,
    pub skipped_ids: Vec<String>,
    pub skipped_duplicates: Vec<SkippedDuplicateReport>,
    pub failed_items: Vec<FailedItemReport>,
    pub stopped_early: bool,
}

pub fn build_save_report(save: &VerifiedSave) -> SaveReport {
    let write_ids: Vec<String> = save.write.written.iter().map(|w| w.id.clone()).collect();

    SaveReport {
        saved: save.verified_ids.len(),
        saved_verified_count: save.verified_ids.len(),
        saved_write_count: write_ids.len(),
        skipped: save.write.skipped.len(),
        failed: save.write.failed.len(),
        saved_ids: save.verified_ids.clone(),
        saved_ids_verified: save.verified_ids.clone(),
        saved_ids_unverified: save.unverified_ids.clone(),
        saved_ids_write: write_ids,
        skipped_ids: save
            .write
            .skipped
            .iter()
            .filter_map(|s| s.duplicate_of_id.clone())
            .collect(),
        skipped_duplicates: save
            .write
            .skipped
            .iter()
            .map(|s| SkippedDuplicateReport {
                company_name: s.company_name.clone(),
                duplicate_of_id: s.duplicate_of_id.clone(),
                duplicate_match_key: s.matched_key,
                reason: s.reason.clone(),
            })
            .collect(),
        failed_items: save
            .write
            .failed
            .iter()
            .map(|f| FailedItemReport {
                company_name: f.company_name.clone(),
                error: f.error.clone(),
            })
            .collect(),
        stopped_early: save.write.stopped_early,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::{PersistedItem, SaveResult};

    #[test]
    fn verified_and_write_counts_stay_distinct() {
        let save = VerifiedSave {
            write: SaveResult {
                written: vec![
                    PersistedItem {
                        id: "a".to_string(),
                        company_name: "A".to_string(),
                        normalized_domain: "a.com".to_string(),
                        updated_existing: false,
                    },
                    PersistedItem {
                        id: "b".to_string(),
                        company_name: "B".to_string(),
                        normalized_domain: "b.com".to_string(),
                        updated_existing: false,
                    },
                ],
                ..Default::default()
            },
            verified_ids: vec!["a".to_string()],
            unverified_ids: vec!["b".to_string()],
        };

        let report = build_save_report(&save);
        assert_eq!(report.saved, 1);
        assert_eq!(report.saved_write_count, 2);
        assert_eq!(report.saved_ids_unverified, vec!["b"]);
    }
}
