//! Deterministic seeds and seed validation.
//!
//! When the query is itself a company URL and discovery cannot complete
//! inline, the pipeline falls back to a minimal entity derived from the URL
//! instead of answering accepted/async. Seed validation guards the
//! skip-primary path: resuming downstream stages is only allowed for
//! entities that plausibly came out of a primary run.

use chrono::Utc;
use originmap_common::{
    company_name_from_url, has_non_placeholder_location_entry, is_meaningful_string,
    to_normalized_domain, CompanyRecord, MissingReason, RecordSource, SourceStage,
};

/// Build the deterministic seed for a company-URL import.
pub fn seed_from_company_url(raw_url: &str, session_id: &str) -> CompanyRecord {
    let normalized_domain = to_normalized_domain(raw_url);
    let website_url = if raw_url.contains("://") {
        raw_url.trim().to_string()
    } else {
        format!("https://{}", raw_url.trim())
    };

    CompanyRecord {
        company_name: company_name_from_url(raw_url),
        website_url,
        canonical_url: format!("https://{normalized_domain}/"),
        normalized_domain,
        hq_unknown: true,
        hq_unknown_reason: Some(MissingReason::SeedFromCompanyUrl),
        mfg_unknown: true,
        mfg_unknown_reason: Some(MissingReason::SeedFromCompanyUrl),
        source: Some(RecordSource::CompanyUrlShortcut),
        source_stage: Some(SourceStage::Seed),
        seed_ready: true,
        session_id: Some(session_id.to_string()),
        created_at: Some(Utc::now()),
        ..Default::default()
    }
}

/// Whether a supplied entity already carries genuine prior enrichment —
/// keywords, industries, HQ, manufacturing or reviews.
pub fn has_meaningful_seed_enrichment(record: &CompanyRecord) -> bool {
    !record.industries.is_empty()
        || !record.keywords.is_empty()
        || !record.product_keywords.trim().is_empty()
        || is_meaningful_string(&record.headquarters_location)
        || has_non_placeholder_location_entry(&record.manufacturing_locations)
        || !record.curated_reviews.is_empty()
        || record.review_count > 0
}

/// Whether an entity may seed a skip-primary run. Requires name +
/// website_url and one of: a stored id, an explicit seed marker, or genuine
/// prior enrichment. A bare company-URL shortcut stub is never valid.
pub fn is_valid_seed_company(record: &CompanyRecord) -> bool {
    if record.company_name.trim().is_empty() || record.website_url.trim().is_empty() {
        return false;
    }

    if let Some(id) = record.id.as_deref() {
        let id = id.trim();
        if !id.is_empty() && !id.starts_with("_import_") {
            return true;
        }
    }

    match record.source {
        Some(RecordSource::CompanyUrlShortcut) => {
            record.seed_ready || has_meaningful_seed_enrichment(record)
        }
        Some(_) => true,
        None => record.seed_ready || record.source_stage == Some(SourceStage::Primary),
    }
}
