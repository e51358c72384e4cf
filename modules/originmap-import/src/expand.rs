//! Expansion stage: when the persisted count falls short of the requested
//! limit, one broader search call tops up the candidate pool. Expansion
//! results merge and persist exactly like primary results.

use grok_client::ChatRequest;
use originmap_common::{CompanyRecord, QualityConfig};

/// Expansion triggers when saved count < threshold% of the requested limit.
pub fn should_expand(saved_count: usize, limit: usize, quality: &QualityConfig) -> bool {
    if limit == 0 {
        return false;
    }
    (saved_count * 100) < (limit * quality.expand_threshold_pct as usize)
}

pub fn expansion_request(
    query: &str,
    limit: usize,
    known_domains: &[String],
) -> ChatRequest {
    let exclusions = if known_domains.is_empty() {
        String::new()
    } else {
        format!(
            "\nAlready found (do NOT repeat these): {}",
            known_domains.join(", ")
        )
    };

    let prompt = format!(
        r#"Broaden the search: find up to {limit} MORE companies related to this query, including adjacent product categories and smaller makers.

Search query: "{query}"{exclusions}

Return EXACTLY a JSON array of company objects with the same shape as before:
company_name, website_url, industries, product_keywords, tagline (optional),
headquarters_location (optional), manufacturing_locations (optional).

Only return the JSON array, no other text."#
    );
    ChatRequest::structured(prompt, 0.3)
}

/// Domains already held this run, for the exclusion list.
pub fn known_domains(records: &[CompanyRecord]) -> Vec<String> {
    let mut domains: Vec<String> = records
        .iter()
        .map(|r| r.normalized_domain.clone())
        .filter(|d| !d.is_empty() && d != "unknown")
        .collect();
    domains.sort();
    domains.dedup();
    domains
}
