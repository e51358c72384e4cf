//! Field-completeness enforcement.
//!
//! Pure: takes a record, returns a new record plus the warning ledger.
//! After enforcement every required field is a real value or an exact
//! sentinel (`"Unknown"` / `"Not disclosed"` / empty collection) with a
//! matching `import_missing_fields` entry.
//!
//! Retry bounding: `low_quality`/`not_found` outcomes increment a per-field
//! counter once per distinct request id. At the configured cap the reason is
//! promoted to its terminal variant and never retried again. Terminal and
//! `not_disclosed` reasons always override a prior `seed_from_company_url`
//! placeholder reason.

use std::collections::BTreeMap;

use originmap_common::{
    as_meaningful_string, has_non_placeholder_location_entry, is_meaningful_string,
    is_sentinel_string, sanitize_industries, sanitize_keywords, to_normalized_domain,
    CompanyRecord, ImportWarning, LogoStatus, MissingReason, QualityConfig, RequiredField,
    ReviewsStageStatus, Stage, NOT_DISCLOSED, UNKNOWN,
};

pub struct EnforcementContext<'a> {
    /// Distinct per-request id; attempt counters only advance when it
    /// changes between enforcement runs.
    pub request_id: Option<&'a str>,
    pub quality: &'a QualityConfig,
}

#[derive(Debug)]
pub struct Enforced {
    pub record: CompanyRecord,
    pub warnings: Vec<ImportWarning>,
}

struct Ledger {
    missing: Vec<RequiredField>,
    reasons: BTreeMap<RequiredField, MissingReason>,
    warnings: Vec<ImportWarning>,
}

impl Ledger {
    fn new(prior_reasons: &BTreeMap<RequiredField, MissingReason>) -> Self {
        Self {
            missing: Vec::new(),
            reasons: prior_reasons.clone(),
            warnings: Vec::new(),
        }
    }

    fn record(
        &mut self,
        field: RequiredField,
        reason: MissingReason,
        stage: Stage,
        retryable: bool,
        message: String,
    ) {
        if !self.missing.contains(&field) {
            self.missing.push(field);
        }

        // Final, terminal decisions override earlier seed placeholders —
        // seed_from_company_url must never survive after real extraction.
        let prev = self.reasons.get(&field).copied();
        let overwrite = match prev {
            None => true,
            Some(MissingReason::SeedFromCompanyUrl) => true,
            Some(_) => reason.is_terminal(),
        };
        if overwrite {
            self.reasons.insert(field, reason);
        }

        let entry = ImportWarning {
            field,
            missing_reason: reason,
            stage,
            retryable,
            terminal: reason.is_terminal(),
            message,
        };
        match self.warnings.iter_mut().find(|w| w.field == field) {
            Some(existing) => *existing = entry,
            None => self.warnings.push(entry),
        }
    }
}

struct PolicyVerdict {
    reason: MissingReason,
    retryable: bool,
    attempts: u32,
}

/// Bounded-retry policy for low_quality/not_found outcomes. Mutates the
/// record's attempt counters; once a field is terminal it stays terminal.
fn apply_low_quality_policy(
    record: &mut CompanyRecord,
    ledger: &Ledger,
    field: RequiredField,
    reason: MissingReason,
    ctx: &EnforcementContext<'_>,
) -> PolicyVerdict {
    let Some(terminal) = reason.terminal_variant() else {
        return PolicyVerdict {
            reason,
            retryable: reason.is_retryable(),
            attempts: 0,
        };
    };

    let prior = ledger.reasons.get(&field).copied();
    if matches!(
        prior,
        Some(MissingReason::LowQualityTerminal) | Some(MissingReason::NotFoundTerminal)
    ) {
        return PolicyVerdict {
            reason: prior.unwrap(),
            retryable: false,
            attempts: ctx.quality.low_quality_max_attempts,
        };
    }

    if let Some(request_id) = ctx.request_id.map(str::trim).filter(|id| !id.is_empty()) {
        let last = record
            .import_low_quality_attempts_meta
            .get(&field)
            .map(String::as_str);
        if last != Some(request_id) {
            *record.import_low_quality_attempts.entry(field).or_insert(0) += 1;
            record
                .import_low_quality_attempts_meta
                .insert(field, request_id.to_string());
        }
    }

    let attempts = record
        .import_low_quality_attempts
        .get(&field)
        .copied()
        .unwrap_or(0);

    if attempts >= ctx.quality.low_quality_max_attempts {
        PolicyVerdict {
            reason: terminal,
            retryable: false,
            attempts,
        }
    } else {
        PolicyVerdict {
            reason,
            retryable: true,
            attempts,
        }
    }
}

/// Enforce the required-fields contract on one record.
pub fn enforce_completeness(mut record: CompanyRecord, ctx: &EnforcementContext<'_>) -> Enforced {
    let mut ledger = Ledger::new(&record.import_missing_reason);

    if let Some(request_id) = ctx.request_id {
        record.import_request_id = Some(request_id.to_string());
    }

    // company_name
    if !is_meaningful_string(&record.company_name) {
        record.company_name = UNKNOWN.to_string();
        record.company_name_unknown = true;
        ledger.record(
            RequiredField::CompanyName,
            MissingReason::Missing,
            Stage::Primary,
            false,
            "company_name missing; set to placeholder 'Unknown'".to_string(),
        );
    } else {
        record.company_name_unknown = false;
    }

    // website_url
    if !is_meaningful_string(&record.website_url) {
        record.website_url = UNKNOWN.to_string();
        record.website_url_unknown = true;
        if record.normalized_domain.trim().is_empty() {
            record.normalized_domain = "unknown".to_string();
        }
        ledger.record(
            RequiredField::WebsiteUrl,
            MissingReason::Missing,
            Stage::Primary,
            false,
            "website_url missing; set to placeholder 'Unknown'".to_string(),
        );
    } else {
        record.website_url_unknown = false;
        if record.normalized_domain.trim().is_empty() {
            record.normalized_domain = to_normalized_domain(&record.website_url);
        }
    }

    // industries — quality gate
    let had_any_industries = record.industries.iter().any(|i| !i.trim().is_empty());
    let sanitized_industries = sanitize_industries(&record.industries);
    if sanitized_industries.is_empty() {
        record.industries = Vec::new();
        record.industries_unknown = true;

        let raw_reason = if had_any_industries {
            MissingReason::LowQuality
        } else {
            MissingReason::NotFound
        };
        let verdict =
            apply_low_quality_policy(&mut record, &ledger, RequiredField::Industries, raw_reason, ctx);
        let message = if had_any_industries {
            format!(
                "industries present but low-quality; cleared (attempt {})",
                verdict.attempts
            )
        } else {
            "industries missing; left empty".to_string()
        };
        ledger.record(
            RequiredField::Industries,
            verdict.reason,
            Stage::Keywords,
            verdict.retryable,
            message,
        );
    } else {
        record.industries = sanitized_industries;
        record.industries_unknown = false;
    }

    // product_keywords — quality gate
    let stats = sanitize_keywords(&record.product_keywords, &record.keywords);
    if stats.sanitized_count() >= ctx.quality.min_sanitized_keywords {
        record.product_keywords = stats.sanitized.join(", ");
        record.keywords = stats.sanitized;
        record.product_keywords_unknown = false;
    } else {
        let had_any = stats.total_raw > 0;
        record.keywords = stats.sanitized;
        record.product_keywords = String::new();
        record.product_keywords_unknown = true;

        let raw_reason = if had_any {
            MissingReason::LowQuality
        } else {
            MissingReason::NotFound
        };
        let verdict = apply_low_quality_policy(
            &mut record,
            &ledger,
            RequiredField::ProductKeywords,
            raw_reason,
            ctx,
        );
        let message = if had_any {
            format!(
                "product_keywords low quality (raw={}, kept={}); cleared",
                stats.total_raw,
                record.keywords.len()
            )
        } else {
            "product_keywords missing; left empty".to_string()
        };
        ledger.record(
            RequiredField::ProductKeywords,
            verdict.reason,
            Stage::Keywords,
            verdict.retryable,
            message,
        );
    }

    // tagline — enrichment goal, tracked like required fields
    if is_meaningful_string(&record.tagline) {
        record.tagline_unknown = false;
    } else {
        record.tagline = String::new();
        record.tagline_unknown = true;
        ledger.record(
            RequiredField::Tagline,
            MissingReason::NotFound,
            Stage::Keywords,
            true,
            "tagline missing; left empty".to_string(),
        );
    }

    // headquarters_location — data wins over a stale unknown flag
    let hq_value = record.headquarters_location.trim().to_string();
    let hq_disclosed_never = record.hq_unknown_reason == Some(MissingReason::NotDisclosed)
        || is_sentinel_string(&hq_value);
    if as_meaningful_string(&hq_value).is_some() && !is_sentinel_string(&hq_value) {
        record.hq_unknown = false;
        if record.hq_unknown_reason == Some(MissingReason::SeedFromCompanyUrl) {
            record.hq_unknown_reason = None;
        }
    } else if hq_disclosed_never {
        record.headquarters_location = NOT_DISCLOSED.to_string();
        record.hq_unknown = true;
        record.hq_unknown_reason = Some(MissingReason::NotDisclosed);
        ledger.record(
            RequiredField::HeadquartersLocation,
            MissingReason::NotDisclosed,
            Stage::Location,
            false,
            "headquarters explicitly not disclosed".to_string(),
        );
    } else {
        record.headquarters_location = UNKNOWN.to_string();
        record.hq_unknown = true;
        let verdict = apply_low_quality_policy(
            &mut record,
            &ledger,
            RequiredField::HeadquartersLocation,
            MissingReason::NotFound,
            ctx,
        );
        // The doc-level marker keeps its provenance (e.g. the seed reason);
        // only a terminal decision replaces it. The ledger reason advances
        // independently.
        if record.hq_unknown_reason.is_none() || verdict.reason.is_terminal() {
            record.hq_unknown_reason = Some(verdict.reason);
        }
        ledger.record(
            RequiredField::HeadquartersLocation,
            verdict.reason,
            Stage::Location,
            verdict.retryable,
            "headquarters_location missing after seed/enrichment".to_string(),
        );
    }

    // manufacturing_locations
    record.manufacturing_locations = record
        .manufacturing_locations
        .iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if has_non_placeholder_location_entry(&record.manufacturing_locations) {
        record.mfg_unknown = false;
        if record.mfg_unknown_reason == Some(MissingReason::SeedFromCompanyUrl) {
            record.mfg_unknown_reason = None;
        }
    } else if record.mfg_unknown_reason == Some(MissingReason::NotDisclosed)
        || record.manufacturing_locations.iter().any(|l| is_sentinel_string(l))
    {
        record.manufacturing_locations = vec![NOT_DISCLOSED.to_string()];
        record.mfg_unknown = true;
        record.mfg_unknown_reason = Some(MissingReason::NotDisclosed);
        ledger.record(
            RequiredField::ManufacturingLocations,
            MissingReason::NotDisclosed,
            Stage::Location,
            false,
            "manufacturing locations explicitly not disclosed".to_string(),
        );
    } else {
        record.manufacturing_locations = Vec::new();
        record.mfg_unknown = true;
        let verdict = apply_low_quality_policy(
            &mut record,
            &ledger,
            RequiredField::ManufacturingLocations,
            MissingReason::NotFound,
            ctx,
        );
        if record.mfg_unknown_reason.is_none() || verdict.reason.is_terminal() {
            record.mfg_unknown_reason = Some(verdict.reason);
        }
        ledger.record(
            RequiredField::ManufacturingLocations,
            verdict.reason,
            Stage::Location,
            verdict.retryable,
            "manufacturing_locations missing after seed/enrichment".to_string(),
        );
    }

    // logo — real URL, or an explicit not-found
    let has_logo = record
        .logo_url
        .as_deref()
        .is_some_and(|u| !u.trim().is_empty());
    if !has_logo {
        record.logo_url = None;
        let status = record.logo_status.unwrap_or(LogoStatus::NotFoundOnSite);
        record.logo_status = Some(status);
        let (reason, retryable) = match status {
            LogoStatus::NotFoundOnSite => (MissingReason::NotFoundOnSite, false),
            _ => (MissingReason::NotFound, true),
        };
        ledger.record(
            RequiredField::Logo,
            reason,
            Stage::Primary,
            retryable,
            "logo_url missing; persisted as explicit not_found".to_string(),
        );
    }

    // curated_reviews — explicit defaults, never absent
    if record.review_count == 0 {
        record.review_count = record.curated_reviews.len() as u32;
    }
    if record.review_cursor.is_none() {
        record.review_cursor = Some(Default::default());
    }
    if record.reviews_stage_status.is_none() {
        record.reviews_stage_status = Some(ReviewsStageStatus::Pending);
    }
    if record.curated_reviews.is_empty() && record.review_count == 0 {
        let cursor_exhausted = record
            .review_cursor
            .as_ref()
            .is_some_and(|c| c.exhausted);
        // A single verified review is below the quality bar; keep exhausted
        // cursors retryable until the minimum viable count is met.
        let reason = if cursor_exhausted {
            MissingReason::ExhaustedRetryable
        } else {
            MissingReason::Missing
        };
        ledger.record(
            RequiredField::CuratedReviews,
            reason,
            Stage::Reviews,
            true,
            "no curated reviews yet".to_string(),
        );
    }

    record.import_missing_fields = ledger.missing.clone();
    record.import_missing_reason = ledger
        .missing
        .iter()
        .filter_map(|f| ledger.reasons.get(f).map(|r| (*f, *r)))
        .collect();
    record.import_warnings = ledger.warnings.clone();

    Enforced {
        record,
        warnings: ledger.warnings,
    }
}

/// Which required fields on a record still need enrichment — the reality
/// checks only, no mutation. Used for resume decisions.
pub fn compute_missing_fields(record: &CompanyRecord, quality: &QualityConfig) -> Vec<RequiredField> {
    let mut missing = Vec::new();

    if !is_meaningful_string(&record.company_name) {
        missing.push(RequiredField::CompanyName);
    }
    if !is_meaningful_string(&record.website_url) {
        missing.push(RequiredField::WebsiteUrl);
    }
    if sanitize_industries(&record.industries).is_empty() {
        missing.push(RequiredField::Industries);
    }
    let stats = sanitize_keywords(&record.product_keywords, &record.keywords);
    if stats.sanitized_count() < quality.min_sanitized_keywords {
        missing.push(RequiredField::ProductKeywords);
    }
    let hq = record.headquarters_location.trim();
    if !is_meaningful_string(hq) || is_sentinel_string(hq) {
        missing.push(RequiredField::HeadquartersLocation);
    }
    if !has_non_placeholder_location_entry(&record.manufacturing_locations) {
        missing.push(RequiredField::ManufacturingLocations);
    }
    if record.logo_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
        missing.push(RequiredField::Logo);
    }
    let incomplete_reviews = record.reviews_stage_status == Some(ReviewsStageStatus::Incomplete);
    if record.curated_reviews.is_empty() && (record.review_count == 0 || incomplete_reviews) {
        missing.push(RequiredField::CuratedReviews);
    }

    missing
}

/// Missing fields that are still worth retrying — terminal reasons drop out.
pub fn retryable_missing_fields(
    record: &CompanyRecord,
    quality: &QualityConfig,
) -> Vec<RequiredField> {
    compute_missing_fields(record, quality)
        .into_iter()
        .filter(|field| {
            record
                .import_missing_reason
                .get(field)
                .map_or(true, |reason| reason.is_retryable())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with<'a>(request_id: &'a str, quality: &'a QualityConfig) -> EnforcementContext<'a> {
        EnforcementContext {
            request_id: Some(request_id),
            quality,
        }
    }

    fn bare_record() -> CompanyRecord {
        CompanyRecord {
            company_name: "Acme".to_string(),
            website_url: "https://acme.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn placeholder_invariant_holds() {
        let quality = QualityConfig::default();
        let enforced = enforce_completeness(CompanyRecord::default(), &ctx_with("r1", &quality));
        let record = &enforced.record;

        assert_eq!(record.company_name, UNKNOWN);
        assert_eq!(record.website_url, UNKNOWN);
        assert!(record.industries.is_empty());
        assert_eq!(record.product_keywords, "");
        assert_eq!(record.headquarters_location, UNKNOWN);
        assert!(record.manufacturing_locations.is_empty());
        assert!(record.logo_url.is_none());

        for field in [
            RequiredField::CompanyName,
            RequiredField::WebsiteUrl,
            RequiredField::Industries,
            RequiredField::ProductKeywords,
            RequiredField::HeadquartersLocation,
            RequiredField::ManufacturingLocations,
            RequiredField::Logo,
            RequiredField::CuratedReviews,
        ] {
            assert!(
                record.import_missing_fields.contains(&field),
                "{field} should be ledgered"
            );
            assert!(record.import_missing_reason.contains_key(&field));
        }
    }

    #[test]
    fn real_values_are_untouched() {
        let quality = QualityConfig::default();
        let record = CompanyRecord {
            industries: vec!["Skincare".to_string()],
            product_keywords: "lavender soap, oat bar".to_string(),
            tagline: "Honest soap".to_string(),
            headquarters_location: "Portland, OR".to_string(),
            manufacturing_locations: vec!["Eugene, OR".to_string()],
            logo_url: Some("https://cdn.example/logo.png".to_string()),
            curated_reviews: vec![],
            review_count: 1,
            ..bare_record()
        };
        let enforced = enforce_completeness(record, &ctx_with("r1", &quality));
        assert_eq!(enforced.record.industries, vec!["Skincare"]);
        assert_eq!(enforced.record.headquarters_location, "Portland, OR");
        assert!(!enforced.record.hq_unknown);
        assert!(enforced
            .record
            .import_missing_fields
            .iter()
            .all(|f| *f == RequiredField::Tagline || *f != RequiredField::Industries));
    }

    #[test]
    fn terminal_promotion_after_three_distinct_requests() {
        let quality = QualityConfig::default();
        let mut record = CompanyRecord {
            industries: vec!["Shop By".to_string()],
            ..bare_record()
        };

        for (i, request) in ["r1", "r2"].iter().enumerate() {
            let enforced = enforce_completeness(record, &ctx_with(request, &quality));
            record = enforced.record;
            record.industries = vec!["Shop By".to_string()];
            assert_eq!(
                record.import_missing_reason.get(&RequiredField::Industries),
                Some(&MissingReason::LowQuality),
                "attempt {i} should stay retryable"
            );
        }

        let enforced = enforce_completeness(record, &ctx_with("r3", &quality));
        let record = enforced.record;
        assert_eq!(
            record.import_missing_reason.get(&RequiredField::Industries),
            Some(&MissingReason::LowQualityTerminal)
        );
        let warning = record
            .import_warnings
            .iter()
            .find(|w| w.field == RequiredField::Industries)
            .unwrap();
        assert!(!warning.retryable);
        assert!(warning.terminal);

        // A 4th report leaves it terminal without advancing the counter.
        let mut again = record.clone();
        again.industries = vec!["Shop By".to_string()];
        let enforced = enforce_completeness(again, &ctx_with("r4", &quality));
        assert_eq!(
            enforced.record.import_missing_reason.get(&RequiredField::Industries),
            Some(&MissingReason::LowQualityTerminal)
        );
        assert_eq!(
            enforced.record.import_low_quality_attempts.get(&RequiredField::Industries),
            Some(&3)
        );
    }

    #[test]
    fn same_request_id_does_not_double_count() {
        let quality = QualityConfig::default();
        let mut record = bare_record();
        for _ in 0..5 {
            let enforced = enforce_completeness(record, &ctx_with("r1", &quality));
            record = enforced.record;
        }
        assert_eq!(
            record.import_low_quality_attempts.get(&RequiredField::HeadquartersLocation),
            Some(&1)
        );
    }

    #[test]
    fn not_disclosed_overrides_seed_reason() {
        let quality = QualityConfig::default();
        let record = CompanyRecord {
            hq_unknown: true,
            hq_unknown_reason: Some(MissingReason::NotDisclosed),
            headquarters_location: String::new(),
            ..bare_record()
        };
        let mut with_seed_prior = record;
        with_seed_prior
            .import_missing_reason
            .insert(RequiredField::HeadquartersLocation, MissingReason::SeedFromCompanyUrl);

        let enforced = enforce_completeness(with_seed_prior, &ctx_with("r1", &quality));
        assert_eq!(enforced.record.headquarters_location, NOT_DISCLOSED);
        assert_eq!(
            enforced.record.import_missing_reason.get(&RequiredField::HeadquartersLocation),
            Some(&MissingReason::NotDisclosed)
        );
    }

    #[test]
    fn seed_reason_cleared_when_data_arrives() {
        let quality = QualityConfig::default();
        let record = CompanyRecord {
            hq_unknown: true,
            hq_unknown_reason: Some(MissingReason::SeedFromCompanyUrl),
            headquarters_location: "Lyon, France".to_string(),
            ..bare_record()
        };
        let enforced = enforce_completeness(record, &ctx_with("r1", &quality));
        assert!(!enforced.record.hq_unknown);
        assert_eq!(enforced.record.hq_unknown_reason, None);
    }

    #[test]
    fn exhausted_cursor_below_viable_stays_retryable() {
        let quality = QualityConfig::default();
        let record = CompanyRecord {
            review_cursor: Some(originmap_common::ReviewCursor {
                exhausted: true,
                ..Default::default()
            }),
            ..bare_record()
        };
        let enforced = enforce_completeness(record, &ctx_with("r1", &quality));
        assert_eq!(
            enforced.record.import_missing_reason.get(&RequiredField::CuratedReviews),
            Some(&MissingReason::ExhaustedRetryable)
        );
    }

    #[test]
    fn retryable_missing_excludes_terminal() {
        let quality = QualityConfig::default();
        let mut record = bare_record();
        record
            .import_missing_reason
            .insert(RequiredField::Industries, MissingReason::LowQualityTerminal);
        let retryable = retryable_missing_fields(&record, &quality);
        assert!(!retryable.contains(&RequiredField::Industries));
        assert!(retryable.contains(&RequiredField::HeadquartersLocation));
    }
}
