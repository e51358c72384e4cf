//! Review discovery, filtering and dedup.
//!
//! Candidates come from one Live Search call (≤10 considered). Filters, in
//! order: missing url/excerpt, disallowed source hosts (Amazon and Google
//! properties, YouTube excepted), self-domain references, content
//! fingerprint duplicates, duplicate source hosts. Unique hosts are
//! preferred; one duplicate-host candidate may be used as fallback when
//! fewer than two unique-host reviews survive. At most two reviews persist
//! per entity.
//!
//! The cursor distinguishes "exhausted" (a successful zero-candidate fetch)
//! from "fetch failed" (retryable). Only the former may set exhausted=true.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use grok_client::{
    extract_json_object, extract_response_text, ChatRequest, GrokResponse, SearchParameters,
};
use originmap_common::{
    host_of, is_same_domain, normalize_url_for_compare, CompanyRecord, CuratedReview,
    QualityConfig, ReviewCursor, ReviewsStageStatus,
};

use crate::budget::BudgetTracker;
use crate::upstream::{DEADLINE_SAFETY_BUFFER_MS, UPSTREAM_TIMEOUT_MARGIN_MS};

/// Candidates considered per fetch, regardless of how many came back.
const MAX_CANDIDATES_CONSIDERED: usize = 10;

/// Minimum remaining window to keep validating candidates.
const MIN_VALIDATION_WINDOW_MS: u64 = 9_000;

#[derive(Debug, Clone, Default)]
pub struct ReviewCandidate {
    pub source_name: String,
    pub source_url: String,
    pub title: String,
    pub excerpt: String,
    pub author: String,
    pub date: String,
    pub rating: Option<f64>,
}

#[derive(Debug, Default)]
pub struct FetchedReviews {
    pub candidates: Vec<ReviewCandidate>,
    /// Upstream's own exhaustion claim. Honored only on a clean parse.
    pub exhausted: bool,
    pub parse_error: bool,
}

pub fn reviews_request(company: &CompanyRecord) -> ChatRequest {
    let company_host = host_of(&company.website_url);
    let prompt = format!(
        r#"Find independent reviews about this company (or its products/services).

Company: {name}
Website: {website}
Industries: {industries}

Return EXACTLY a single JSON object: {{ "reviews": [...], "exhausted": boolean }}

Rules:
- Return up to 10 review objects; we keep at most 2 after validation.
- Prefer different source domains.
- If there are no results, set exhausted=true and reviews: [].
- Reviews MUST be independent (not the company's own domain).
- Reviews MUST NOT be sourced from Amazon or Google (amazon.*, amzn.to, google.*, g.co, goo.gl). YouTube is allowed.
- Each review object: source_name (optional), source_url (REQUIRED, direct link), title (optional), date (optional, YYYY-MM-DD), excerpt (REQUIRED, 1-2 sentences).
- Output JSON only."#,
        name = company.company_name,
        website = company.website_url,
        industries = company.industries.join(", "),
    );

    let mut search = SearchParameters::on();
    if !company_host.is_empty() {
        search = search.with_excluded_websites(vec![company_host]);
    }

    ChatRequest::structured(prompt, 0.2).with_search(search)
}

pub fn parse_review_candidates(response: &GrokResponse) -> FetchedReviews {
    let text = extract_response_text(&response.body);
    let Some(obj) = extract_json_object(&text) else {
        return FetchedReviews {
            parse_error: true,
            ..Default::default()
        };
    };

    let exhausted = obj.get("exhausted").and_then(Value::as_bool).unwrap_or(false);
    let candidates = obj
        .get("reviews")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| {
            let obj = r.as_object()?;
            let get = |keys: &[&str]| -> String {
                keys.iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_str))
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            };
            Some(ReviewCandidate {
                source_name: get(&["source_name", "source"]),
                source_url: get(&["source_url", "url"]),
                title: get(&["title", "headline"]),
                excerpt: get(&["excerpt", "text", "summary"]),
                author: get(&["author"]),
                date: get(&["date"]),
                rating: obj.get("rating").and_then(Value::as_f64),
            })
        })
        .collect();

    FetchedReviews {
        candidates,
        exhausted,
        parse_error: false,
    }
}

/// Amazon and Google properties are disallowed review sources; YouTube is
/// the one Google-owned exception.
pub fn is_disallowed_review_host(url: &str) -> bool {
    let host = host_of(url);
    if host.is_empty() {
        return true;
    }

    if host == "youtube.com" || host.ends_with(".youtube.com") || host == "youtu.be" {
        return false;
    }

    let amazon = host == "amzn.to"
        || host.ends_with(".amzn.to")
        || host == "amazon.com"
        || host.ends_with(".amazon.com")
        || host.contains("amazon.");
    let google = host == "g.co"
        || host.ends_with(".g.co")
        || host == "goo.gl"
        || host.ends_with(".goo.gl")
        || host == "google.com"
        || host.ends_with(".google.com")
        || host.ends_with(".google");

    amazon || google
}

/// Content fingerprint: normalized url + title + author + date + rating +
/// excerpt prefix. Same review syndicated at the same URL dedups across
/// fetches.
pub fn review_fingerprint(candidate: &ReviewCandidate) -> String {
    let excerpt_prefix: String = candidate.excerpt.to_lowercase().chars().take(160).collect();
    let base = [
        normalize_url_for_compare(&candidate.source_url),
        candidate.title.trim().to_lowercase(),
        candidate.author.trim().to_lowercase(),
        candidate.date.trim().to_string(),
        candidate.rating.map(|r| r.to_string()).unwrap_or_default(),
        excerpt_prefix,
    ]
    .join("|");

    hex::encode(Sha256::digest(base.as_bytes()))
}

#[derive(Debug, Default)]
pub struct ReviewSelection {
    pub kept: Vec<CuratedReview>,
    pub considered: usize,
    pub rejected: usize,
    pub duplicate_host_used_as_fallback: bool,
    pub time_budget_exhausted: bool,
}

/// Run the filter chain over fetched candidates. `existing` fingerprints
/// (from reviews already on the record) are excluded.
pub fn select_reviews(
    candidates: &[ReviewCandidate],
    company_website_url: &str,
    existing: &[CuratedReview],
    quality: &QualityConfig,
    budget: Option<&BudgetTracker>,
) -> ReviewSelection {
    let company_host = host_of(company_website_url);
    let cap = quality.max_reviews_per_company;

    let mut selection = ReviewSelection {
        considered: candidates.len().min(MAX_CANDIDATES_CONSIDERED),
        ..Default::default()
    };

    let mut seen_fingerprints: std::collections::HashSet<String> = existing
        .iter()
        .map(|r| {
            review_fingerprint(&ReviewCandidate {
                source_url: r.source_url.clone(),
                title: r.title.clone(),
                excerpt: r.excerpt.clone(),
                date: r.date.clone().unwrap_or_default(),
                ..Default::default()
            })
        })
        .collect();
    let mut kept_hosts: std::collections::HashSet<String> =
        existing.iter().map(|r| host_of(&r.source_url)).collect();
    let mut deferred_duplicates: Vec<(ReviewCandidate, String)> = Vec::new();

    for candidate in candidates.iter().take(MAX_CANDIDATES_CONSIDERED) {
        // Stay inside the handler budget; better to keep 0-2 than time out.
        if let Some(budget) = budget {
            let floor = DEADLINE_SAFETY_BUFFER_MS + UPSTREAM_TIMEOUT_MARGIN_MS + MIN_VALIDATION_WINDOW_MS;
            if budget.remaining_ms() < floor {
                selection.time_budget_exhausted = true;
                break;
            }
        }

        if candidate.source_url.is_empty() || candidate.excerpt.is_empty() {
            selection.rejected += 1;
            continue;
        }
        if is_disallowed_review_host(&candidate.source_url) {
            selection.rejected += 1;
            continue;
        }

        let review_host = host_of(&candidate.source_url);
        if !company_host.is_empty() && is_same_domain(&review_host, &company_host) {
            selection.rejected += 1;
            continue;
        }

        let fingerprint = review_fingerprint(candidate);
        if !seen_fingerprints.insert(fingerprint) {
            selection.rejected += 1;
            continue;
        }

        if !review_host.is_empty() && kept_hosts.contains(&review_host) {
            // Prefer unique sources, but don't fail the import when a
            // company only has one credible source.
            selection.rejected += 1;
            deferred_duplicates.push((candidate.clone(), review_host));
            continue;
        }

        kept_hosts.insert(review_host);
        selection.kept.push(to_curated(candidate));
        if selection.kept.len() + existing.len() >= cap {
            break;
        }
    }

    if selection.kept.len() + existing.len() < quality.reviews_min_viable {
        if let Some((candidate, _)) = deferred_duplicates.into_iter().next() {
            selection.kept.push(to_curated(&candidate));
            selection.duplicate_host_used_as_fallback = true;
        }
    }

    selection
}

fn to_curated(candidate: &ReviewCandidate) -> CuratedReview {
    let source_name = if candidate.source_name.is_empty() {
        let host = host_of(&candidate.source_url);
        if host.is_empty() {
            "Unknown Source".to_string()
        } else {
            host
        }
    } else {
        candidate.source_name.clone()
    };

    CuratedReview {
        id: format!("review_{}", Uuid::new_v4().simple()),
        source_name,
        source_url: candidate.source_url.clone(),
        title: candidate.title.clone(),
        excerpt: candidate.excerpt.clone(),
        date: (!candidate.date.is_empty()).then(|| candidate.date.clone()),
        created_at: Utc::now(),
        imported_via: "grok_import".to_string(),
        show_to_users: true,
    }
}

/// Apply one fetch outcome to the record: merge kept reviews, advance the
/// cursor, set the stage status.
pub fn apply_review_fetch(
    record: &mut CompanyRecord,
    fetched: &FetchedReviews,
    selection: ReviewSelection,
) {
    let now = Utc::now();
    let prev_cursor = record.review_cursor.clone().unwrap_or_default();

    record.curated_reviews.extend(selection.kept);
    record.review_count = record.curated_reviews.len() as u32;

    // Only a successful zero-candidate fetch may mark the cursor exhausted.
    let exhausted = !fetched.parse_error && fetched.exhausted && fetched.candidates.is_empty();

    let status = if fetched.parse_error {
        ReviewsStageStatus::UpstreamUnreachable
    } else if selection.time_budget_exhausted {
        ReviewsStageStatus::TimedOut
    } else if record.curated_reviews.is_empty() {
        if fetched.candidates.is_empty() {
            ReviewsStageStatus::Empty
        } else {
            ReviewsStageStatus::NoValidReviewsFound
        }
    } else {
        ReviewsStageStatus::Ok
    };

    let succeeded = !fetched.parse_error;
    record.review_cursor = Some(ReviewCursor {
        last_offset: prev_cursor.last_offset + fetched.candidates.len() as u32,
        total_fetched: prev_cursor.total_fetched + fetched.candidates.len() as u32,
        exhausted: exhausted || prev_cursor.exhausted,
        last_attempt_at: Some(now),
        last_success_at: if succeeded {
            Some(now)
        } else {
            prev_cursor.last_success_at
        },
        last_error: if fetched.parse_error {
            Some("reviews response parse error".to_string())
        } else {
            None
        },
        reviews_stage_status: Some(status),
    });
    record.reviews_stage_status = Some(status);

    if fetched.parse_error {
        warn!(
            company = record.company_name.as_str(),
            "review fetch unusable, cursor stays retryable"
        );
    } else {
        info!(
            company = record.company_name.as_str(),
            candidates = fetched.candidates.len(),
            kept = record.curated_reviews.len(),
            rejected = selection.rejected,
            "reviews selected"
        );
    }
}

/// Record an upstream fetch failure (HTTP error or typed stage error)
/// without touching exhaustion.
pub fn record_review_fetch_failure(record: &mut CompanyRecord, error: &str) {
    let prev = record.review_cursor.clone().unwrap_or_default();
    record.review_cursor = Some(ReviewCursor {
        last_attempt_at: Some(Utc::now()),
        last_error: Some(error.to_string()),
        reviews_stage_status: Some(ReviewsStageStatus::UpstreamUnreachable),
        ..prev
    });
    record.reviews_stage_status = Some(ReviewsStageStatus::UpstreamUnreachable);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(url: &str, excerpt: &str) -> ReviewCandidate {
        ReviewCandidate {
            source_url: url.to_string(),
            excerpt: excerpt.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn disallowed_hosts() {
        assert!(is_disallowed_review_host("https://www.amazon.com/product-reviews/x"));
        assert!(is_disallowed_review_host("https://amzn.to/abc"));
        assert!(is_disallowed_review_host("https://www.google.com/maps/reviews"));
        assert!(is_disallowed_review_host("https://goo.gl/xyz"));
        assert!(!is_disallowed_review_host("https://www.youtube.com/watch?v=1"));
        assert!(!is_disallowed_review_host("https://wirecutter.example/review"));
    }

    #[test]
    fn self_domain_references_are_rejected() {
        let quality = QualityConfig::default();
        let candidates = vec![
            candidate("https://blog.acme.com/our-soap", "great soap"),
            candidate("https://magazine.example/acme-review", "independent take"),
        ];
        let selection =
            select_reviews(&candidates, "https://acme.com", &[], &quality, None);
        assert_eq!(selection.kept.len(), 1);
        assert_eq!(selection.kept[0].source_url, "https://magazine.example/acme-review");
    }

    #[test]
    fn duplicate_hosts_are_capped_with_fallback() {
        let quality = QualityConfig::default();
        // 3 candidates share a host; only 1 kept from that host unless the
        // fallback applies.
        let candidates = vec![
            candidate("https://reviews.example/a", "first"),
            candidate("https://reviews.example/b", "second"),
            candidate("https://reviews.example/c", "third"),
        ];
        let selection = select_reviews(&candidates, "https://acme.com", &[], &quality, None);
        // One unique-host keep, then one duplicate-host fallback because
        // fewer than 2 unique-host reviews were found.
        assert_eq!(selection.kept.len(), 2);
        assert!(selection.duplicate_host_used_as_fallback);
    }

    #[test]
    fn cap_is_two_reviews() {
        let quality = QualityConfig::default();
        let candidates: Vec<ReviewCandidate> = (0..10)
            .map(|i| candidate(&format!("https://site{i}.example/review"), "text"))
            .collect();
        let selection = select_reviews(&candidates, "https://acme.com", &[], &quality, None);
        assert_eq!(selection.kept.len(), 2);
        assert!(!selection.duplicate_host_used_as_fallback);
    }

    #[test]
    fn fingerprint_dedups_identical_candidates() {
        let quality = QualityConfig::default();
        let candidates = vec![
            candidate("https://a.example/review", "same text"),
            candidate("https://a.example/review/", "same text"),
            candidate("https://b.example/review", "other text"),
        ];
        let selection = select_reviews(&candidates, "https://acme.com", &[], &quality, None);
        assert_eq!(selection.kept.len(), 2);
    }

    #[test]
    fn missing_fields_are_rejected() {
        let quality = QualityConfig::default();
        let candidates = vec![
            candidate("", "excerpt but no url"),
            candidate("https://a.example/r", ""),
            candidate("https://b.example/r", "fine"),
        ];
        let selection = select_reviews(&candidates, "https://acme.com", &[], &quality, None);
        assert_eq!(selection.kept.len(), 1);
        assert_eq!(selection.rejected, 2);
    }

    #[test]
    fn only_successful_empty_fetch_sets_exhausted() {
        let mut record = CompanyRecord::default();

        // Parse failure: retryable, not exhausted.
        let failed = FetchedReviews {
            parse_error: true,
            exhausted: true,
            ..Default::default()
        };
        apply_review_fetch(&mut record, &failed, ReviewSelection::default());
        assert!(!record.review_cursor.as_ref().unwrap().exhausted);
        assert_eq!(
            record.reviews_stage_status,
            Some(ReviewsStageStatus::UpstreamUnreachable)
        );

        // Clean zero-candidate fetch: exhausted.
        let empty = FetchedReviews {
            exhausted: true,
            ..Default::default()
        };
        apply_review_fetch(&mut record, &empty, ReviewSelection::default());
        assert!(record.review_cursor.as_ref().unwrap().exhausted);
    }

    #[test]
    fn parse_candidates_reads_review_objects() {
        let response = GrokResponse {
            status: 200,
            request_id: None,
            body: serde_json::json!({
                "choices": [{ "message": { "content":
                    "{\"reviews\": [{\"source_url\": \"https://mag.example/r\", \"excerpt\": \"good\"}], \"exhausted\": false}"
                } }]
            }),
        };
        let fetched = parse_review_candidates(&response);
        assert!(!fetched.parse_error);
        assert_eq!(fetched.candidates.len(), 1);
        assert_eq!(fetched.candidates[0].source_url, "https://mag.example/r");
    }
}
