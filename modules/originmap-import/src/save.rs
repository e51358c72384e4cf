//! Dedup and persistence.
//!
//! Dedupe only against active (non-soft-deleted) documents, in key order:
//! normalized domain, canonical URL variants, case-insensitive name. An
//! existing document is merge-updated when it belongs to the same session,
//! looks incomplete, or the caller explicitly allows updates; otherwise the
//! incoming entity is skipped as a duplicate.
//!
//! Writes go out in batches of 4; between batches the session stop marker
//! is checked and processing halts early when set. After the batch every
//! claimed-saved id is read back — a write only counts as verified when the
//! read succeeds and the document's missing-fields ledger is empty.
//!
//! Known gap: two concurrent sessions importing the same domain can both
//! pass `find_existing` and both write. The merge path carries no
//! optimistic concurrency token; document-level last-write-wins is the
//! accepted resolution.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use originmap_common::{
    canonical_url_for_domain, is_meaningful_string, to_normalized_domain, CompanyRecord,
    LogoStatus, RecordSource,
};

use crate::budget::BudgetTracker;
use crate::session::stop_marker_id;
use crate::traits::{
    DocumentStore, DuplicateMatchKey, ExistingCompany, LogoImporter, LogoRequest, UpsertResult,
};
use crate::upstream::{DEADLINE_SAFETY_BUFFER_MS, UPSTREAM_TIMEOUT_MARGIN_MS};

const WRITE_BATCH_SIZE: usize = 4;

/// Below this remaining budget the post-save logo import is skipped.
const LOGO_MIN_BUDGET_MS: u64 = 2_000;
const LOGO_BUDGET_FLOOR_MS: u64 = 5_000;
const LOGO_BUDGET_CAP_MS: u64 = 15_000;

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Persist entities without meaningful enrichment. Never overrides the
    /// company-URL-shortcut guard.
    pub save_stub: bool,
    /// Merge into complete existing documents too (explicit re-import).
    pub allow_update_existing: bool,
}

#[derive(Debug, Clone)]
pub struct PersistedItem {
    pub id: String,
    pub company_name: String,
    pub normalized_domain: String,
    pub updated_existing: bool,
}

#[derive(Debug, Clone)]
pub struct SkippedDuplicate {
    pub company_name: String,
    pub duplicate_of_id: Option<String>,
    pub matched_key: Option<DuplicateMatchKey>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct FailedItem {
    pub company_name: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct SaveResult {
    pub written: Vec<PersistedItem>,
    pub skipped: Vec<SkippedDuplicate>,
    pub failed: Vec<FailedItem>,
    pub stopped_early: bool,
}

/// Write-level counts plus read-after-write verification. `saved` counts
/// only verified writes — a saved count that silently includes
/// unverifiable writes is a correctness bug.
#[derive(Debug, Default)]
pub struct VerifiedSave {
    pub write: SaveResult,
    pub verified_ids: Vec<String>,
    pub unverified_ids: Vec<String>,
}

impl VerifiedSave {
    pub fn saved_verified_count(&self) -> usize {
        self.verified_ids.len()
    }

    pub fn saved_write_count(&self) -> usize {
        self.write.written.len()
    }
}

/// Resolve an entity to an existing stored document. Query order: exact
/// normalized domain, canonical URL equivalence, case-insensitive name.
/// First match wins; the result records which key matched.
pub async fn find_existing(
    store: &dyn DocumentStore,
    domain: &str,
    company_name: &str,
    canonical_url: &str,
) -> anyhow::Result<Option<ExistingCompany>> {
    let domain = domain.trim();
    if !domain.is_empty() && domain != "unknown" {
        if let Some(existing) = store.find_by_normalized_domain(domain).await? {
            return Ok(Some(existing));
        }
    }

    let variants = originmap_common::canonical_url_variants(canonical_url);
    if !variants.is_empty() {
        if let Some(existing) = store.find_by_canonical_urls(&variants).await? {
            return Ok(Some(existing));
        }
    }

    let name = company_name.trim().to_lowercase();
    if !name.is_empty() {
        if let Some(existing) = store.find_by_company_name(&name).await? {
            return Ok(Some(existing));
        }
    }

    Ok(None)
}

/// The meaningful-enrichment invariant: persist only entities with real
/// enrichment, or an attempted-with-reason marker for HQ/manufacturing/
/// reviews. Prevents accumulating empty placeholder rows.
pub fn has_meaningful_enrichment(record: &CompanyRecord) -> bool {
    let hq_attempted = is_meaningful_string(&record.headquarters_location)
        || (record.hq_unknown && record.hq_unknown_reason.is_some());
    let mfg_attempted = !record.manufacturing_locations.is_empty()
        || (record.mfg_unknown && record.mfg_unknown_reason.is_some());
    let reviews_attempted = !record.curated_reviews.is_empty()
        || record.review_count > 0
        || record
            .review_cursor
            .as_ref()
            .is_some_and(|c| c.exhausted || c.last_error.is_some());

    !record.industries.is_empty()
        || !record.keywords.is_empty()
        || hq_attempted
        || mfg_attempted
        || reviews_attempted
}

/// Merge an incoming (enforced) record into an existing document. Incoming
/// real values win; existing values survive where the incoming side only
/// has placeholders. Identity and creation time stay with the existing doc.
pub fn merge_company_docs(existing: &CompanyRecord, incoming: &CompanyRecord) -> CompanyRecord {
    let mut merged = incoming.clone();

    merged.id = existing.id.clone();
    merged.created_at = existing.created_at.or(incoming.created_at);

    if !is_meaningful_string(&merged.company_name) && is_meaningful_string(&existing.company_name) {
        merged.company_name = existing.company_name.clone();
        merged.company_name_unknown = false;
    }
    if !is_meaningful_string(&merged.website_url) && is_meaningful_string(&existing.website_url) {
        merged.website_url = existing.website_url.clone();
        merged.website_url_unknown = false;
    }
    if merged.industries.is_empty() && !existing.industries.is_empty() {
        merged.industries = existing.industries.clone();
        merged.industries_unknown = false;
    }
    if merged.keywords.is_empty() && !existing.keywords.is_empty() {
        merged.keywords = existing.keywords.clone();
        merged.product_keywords = existing.product_keywords.clone();
        merged.product_keywords_unknown = false;
    }
    if merged.tagline.trim().is_empty() && !existing.tagline.trim().is_empty() {
        merged.tagline = existing.tagline.clone();
        merged.tagline_unknown = false;
    }
    if !is_meaningful_string(&merged.headquarters_location)
        && is_meaningful_string(&existing.headquarters_location)
    {
        merged.headquarters_location = existing.headquarters_location.clone();
        merged.hq_unknown = existing.hq_unknown;
        merged.hq_unknown_reason = existing.hq_unknown_reason;
        merged.hq_lat = existing.hq_lat;
        merged.hq_lng = existing.hq_lng;
    }
    if merged.manufacturing_locations.is_empty() && !existing.manufacturing_locations.is_empty() {
        merged.manufacturing_locations = existing.manufacturing_locations.clone();
        merged.mfg_unknown = existing.mfg_unknown;
        merged.mfg_unknown_reason = existing.mfg_unknown_reason;
    }
    if merged.logo_url.is_none() && existing.logo_url.is_some() {
        merged.logo_url = existing.logo_url.clone();
        merged.logo_status = existing.logo_status;
    }

    // Reviews union, existing first, deduped by source URL.
    if !existing.curated_reviews.is_empty() {
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut reviews = Vec::new();
        for review in existing.curated_reviews.iter().chain(&merged.curated_reviews) {
            let key = originmap_common::normalize_url_for_compare(&review.source_url);
            if seen.insert(key) {
                reviews.push(review.clone());
            }
        }
        merged.curated_reviews = reviews;
        merged.review_count = merged.curated_reviews.len() as u32;
    }

    // Attempt counters never move backwards.
    for (field, count) in &existing.import_low_quality_attempts {
        let entry = merged.import_low_quality_attempts.entry(*field).or_insert(0);
        *entry = (*entry).max(*count);
    }
    for (field, request_id) in &existing.import_low_quality_attempts_meta {
        merged
            .import_low_quality_attempts_meta
            .entry(*field)
            .or_insert_with(|| request_id.clone());
    }

    merged
}

enum ItemOutcome {
    Saved(PersistedItem),
    Skipped(SkippedDuplicate),
    Failed(FailedItem),
}

async fn save_one(
    store: &Arc<dyn DocumentStore>,
    record: &CompanyRecord,
    session_id: &str,
    opts: &SaveOptions,
) -> ItemOutcome {
    let company_name = record.company_name.clone();

    let domain_source = [
        record.website_url.as_str(),
        record.canonical_url.as_str(),
        record.amazon_url.as_str(),
        record.normalized_domain.as_str(),
    ]
    .into_iter()
    .find(|s| !s.trim().is_empty())
    .unwrap_or_default();
    let normalized_domain = {
        let derived = to_normalized_domain(domain_source);
        if derived == "unknown" && !record.normalized_domain.trim().is_empty() {
            record.normalized_domain.clone()
        } else {
            derived
        }
    };

    let existing_summary = match find_existing(
        store.as_ref(),
        &normalized_domain,
        &company_name,
        &record.canonical_url,
    )
    .await
    {
        Ok(existing) => existing,
        Err(e) => {
            warn!(error = %e, company = company_name.as_str(), "dedup lookup failed");
            None
        }
    };

    let mut existing_doc: Option<CompanyRecord> = None;
    if let Some(summary) = &existing_summary {
        existing_doc = store
            .read_company(&summary.id, &summary.normalized_domain)
            .await
            .ok()
            .flatten();

        let same_session = existing_doc
            .as_ref()
            .and_then(|d| d.session_id.as_deref())
            .is_some_and(|sid| sid == session_id);
        let incomplete = existing_doc
            .as_ref()
            .is_some_and(CompanyRecord::looks_incomplete);

        let should_update = same_session || incomplete || opts.allow_update_existing;
        if !should_update {
            info!(
                company = company_name.as_str(),
                domain = normalized_domain.as_str(),
                "skipping duplicate company"
            );
            return ItemOutcome::Skipped(SkippedDuplicate {
                company_name,
                duplicate_of_id: Some(summary.id.clone()),
                matched_key: Some(summary.matched_key),
                reason: "duplicate".to_string(),
            });
        }
    }

    // Never persist a URL-shortcut stub without meaningful enrichment; the
    // save_stub flag must not override this.
    let is_url_shortcut = record.source == Some(RecordSource::CompanyUrlShortcut);
    if !has_meaningful_enrichment(record) && (is_url_shortcut || !opts.save_stub) {
        return ItemOutcome::Skipped(SkippedDuplicate {
            company_name,
            duplicate_of_id: None,
            matched_key: None,
            reason: "missing_enrichment".to_string(),
        });
    }

    if company_name.trim().is_empty() && record.website_url.trim().is_empty() {
        return ItemOutcome::Failed(FailedItem {
            company_name,
            error: "missing company_name and website_url".to_string(),
        });
    }

    let now = Utc::now();
    let mut doc = match &existing_doc {
        Some(existing) => merge_company_docs(existing, record),
        None => record.clone(),
    };

    let updated_existing = existing_doc.is_some();
    if doc.id.is_none() {
        doc.id = Some(format!("company_{}", Uuid::new_v4().simple()));
    }
    doc.normalized_domain = normalized_domain.clone();
    if normalized_domain != "unknown" {
        doc.canonical_url = canonical_url_for_domain(&normalized_domain);
    }
    doc.session_id = Some(session_id.to_string());
    if doc.created_at.is_none() {
        doc.created_at = Some(now);
    }
    doc.updated_at = Some(now);

    let id = doc.id.clone().unwrap_or_default();

    match store.upsert_company(&doc).await {
        Ok(UpsertResult::Written) => ItemOutcome::Saved(PersistedItem {
            id,
            company_name,
            normalized_domain,
            updated_existing,
        }),
        Ok(UpsertResult::Conflict) => ItemOutcome::Skipped(SkippedDuplicate {
            company_name,
            duplicate_of_id: None,
            matched_key: None,
            reason: "write_conflict".to_string(),
        }),
        Err(e) => ItemOutcome::Failed(FailedItem {
            company_name,
            error: e.to_string(),
        }),
    }
}

/// Persist a batch of enforced records. Batches of 4, sequential between
/// batches, with a stop-marker check before each batch after the first.
pub async fn save_companies(
    store: &Arc<dyn DocumentStore>,
    logo_importer: &Arc<dyn LogoImporter>,
    budget: &BudgetTracker,
    records: &[CompanyRecord],
    session_id: &str,
    opts: &SaveOptions,
) -> SaveResult {
    let mut result = SaveResult::default();

    for (batch_index, batch) in records.chunks(WRITE_BATCH_SIZE).enumerate() {
        if batch_index > 0 {
            match store.read_control_doc(&stop_marker_id(session_id)).await {
                Ok(Some(_)) => {
                    info!(
                        saved = result.written.len(),
                        "import stopped by user between batches"
                    );
                    result.stopped_early = true;
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "stop-marker check failed, continuing"),
            }
        }

        let outcomes =
            futures::future::join_all(batch.iter().map(|r| save_one(store, r, session_id, opts)))
                .await;

        for outcome in outcomes {
            match outcome {
                ItemOutcome::Saved(item) => {
                    import_logo_post_save(store, logo_importer, budget, &item).await;
                    result.written.push(item);
                }
                ItemOutcome::Skipped(item) => result.skipped.push(item),
                ItemOutcome::Failed(item) => {
                    warn!(
                        company = item.company_name.as_str(),
                        error = item.error.as_str(),
                        "failed to save company"
                    );
                    result.failed.push(item);
                }
            }
        }
    }

    result
}

/// Logo import runs after a successful persist and can never fail the
/// save. Skipped entirely when the remaining budget is critically low.
async fn import_logo_post_save(
    store: &Arc<dyn DocumentStore>,
    logo_importer: &Arc<dyn LogoImporter>,
    budget: &BudgetTracker,
    item: &PersistedItem,
) {
    let remaining = budget.remaining_ms();
    if remaining < LOGO_MIN_BUDGET_MS {
        return;
    }
    let budget_ms = remaining
        .saturating_sub(DEADLINE_SAFETY_BUFFER_MS + UPSTREAM_TIMEOUT_MARGIN_MS)
        .clamp(LOGO_BUDGET_FLOOR_MS, LOGO_BUDGET_CAP_MS);

    let logo = logo_importer
        .import_logo(
            LogoRequest {
                company_id: item.id.clone(),
                company_name: item.company_name.clone(),
                domain: item.normalized_domain.clone(),
                website_url: format!("https://{}", item.normalized_domain),
            },
            budget_ms,
        )
        .await;

    if logo.logo_url.is_none() && logo.logo_status != LogoStatus::Imported {
        return;
    }

    let Ok(Some(mut doc)) = store.read_company(&item.id, &item.normalized_domain).await else {
        return;
    };
    doc.logo_url = logo.logo_url;
    doc.logo_status = Some(logo.logo_status);
    doc.import_missing_fields
        .retain(|f| *f != originmap_common::RequiredField::Logo);
    doc.import_missing_reason
        .remove(&originmap_common::RequiredField::Logo);
    doc.import_warnings
        .retain(|w| w.field != originmap_common::RequiredField::Logo);
    if let Err(e) = store.upsert_company(&doc).await {
        warn!(company_id = item.id.as_str(), error = %e, "logo update write failed");
    }
}

/// Read every claimed-saved id back. Verified means the read succeeded AND
/// the document's missing-fields ledger is empty.
pub async fn verify_saved(store: &Arc<dyn DocumentStore>, write: SaveResult) -> VerifiedSave {
    let mut verified_ids = Vec::new();
    let mut unverified_ids = Vec::new();

    for batch in write.written.chunks(WRITE_BATCH_SIZE) {
        let reads = futures::future::join_all(
            batch
                .iter()
                .map(|item| store.read_company(&item.id, &item.normalized_domain)),
        )
        .await;

        for (item, read) in batch.iter().zip(reads) {
            match read {
                Ok(Some(doc)) if doc.import_missing_fields.is_empty() => {
                    verified_ids.push(item.id.clone())
                }
                Ok(_) => unverified_ids.push(item.id.clone()),
                Err(e) => {
                    warn!(company_id = item.id.as_str(), error = %e, "verification read failed");
                    unverified_ids.push(item.id.clone());
                }
            }
        }
    }

    VerifiedSave {
        write,
        verified_ids,
        unverified_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use originmap_common::{MissingReason, ReviewCursor};

    #[test]
    fn meaningful_enrichment_requires_substance() {
        let empty = CompanyRecord {
            company_name: "Acme".to_string(),
            website_url: "https://acme.com".to_string(),
            ..Default::default()
        };
        assert!(!has_meaningful_enrichment(&empty));

        let with_industries = CompanyRecord {
            industries: vec!["Soap".to_string()],
            ..empty.clone()
        };
        assert!(has_meaningful_enrichment(&with_industries));

        let with_attempted_hq = CompanyRecord {
            hq_unknown: true,
            hq_unknown_reason: Some(MissingReason::NotDisclosed),
            ..empty.clone()
        };
        assert!(has_meaningful_enrichment(&with_attempted_hq));

        let with_review_attempt = CompanyRecord {
            review_cursor: Some(ReviewCursor {
                exhausted: true,
                ..Default::default()
            }),
            ..empty
        };
        assert!(has_meaningful_enrichment(&with_review_attempt));
    }

    #[test]
    fn merge_keeps_existing_identity_and_fills_gaps() {
        let existing = CompanyRecord {
            id: Some("company_1".to_string()),
            company_name: "Acme".to_string(),
            website_url: "https://acme.com".to_string(),
            industries: vec!["Soap".to_string()],
            created_at: Some(chrono::Utc::now()),
            ..Default::default()
        };
        let incoming = CompanyRecord {
            company_name: "Acme".to_string(),
            website_url: "https://acme.com".to_string(),
            keywords: vec!["bar soap".to_string()],
            product_keywords: "bar soap".to_string(),
            ..Default::default()
        };

        let merged = merge_company_docs(&existing, &incoming);
        assert_eq!(merged.id.as_deref(), Some("company_1"));
        assert_eq!(merged.industries, vec!["Soap"]);
        assert_eq!(merged.keywords, vec!["bar soap"]);
        assert_eq!(merged.created_at, existing.created_at);
    }

    #[test]
    fn merge_never_decrements_attempt_counters() {
        let mut existing = CompanyRecord::default();
        existing
            .import_low_quality_attempts
            .insert(originmap_common::RequiredField::Industries, 2);

        let mut incoming = CompanyRecord::default();
        incoming
            .import_low_quality_attempts
            .insert(originmap_common::RequiredField::Industries, 1);

        let merged = merge_company_docs(&existing, &incoming);
        assert_eq!(
            merged
                .import_low_quality_attempts
                .get(&originmap_common::RequiredField::Industries),
            Some(&2)
        );
    }
}
