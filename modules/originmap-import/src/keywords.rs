//! Keywords/industries enrichment stage.
//!
//! Entities run through two bounded LLM calls: a product-keyword list when
//! fewer than 10 keywords exist, and an industries/tagline classification
//! when industries are empty. Entity-level concurrency is 4. A per-entity
//! failure never aborts the batch; running out of budget defers the rest of
//! the stage.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::warn;

use grok_client::{extract_json_object, extract_response_text, ChatRequest, GrokResponse};
use originmap_common::{
    normalize_product_keywords, sanitize_industries, sanitize_keywords, CompanyRecord,
    QualityConfig, Stage,
};

use crate::upstream::{StageCallError, StageCaller, StageOutcome};

/// Entities already carrying this many keywords skip the keyword fetch.
const KEYWORDS_SUFFICIENT: usize = 10;

const ENTITY_CONCURRENCY: usize = 4;

/// Maximum industries adopted per entity.
const MAX_INDUSTRIES: usize = 6;

#[derive(Debug, Clone)]
pub struct StageWarning {
    pub stage: Stage,
    pub company_name: String,
    pub root_cause: String,
    pub retryable: bool,
}

#[derive(Debug, Default)]
pub struct StageReport {
    pub warnings: Vec<StageWarning>,
    /// Set when remaining budget cut the stage short; the untouched
    /// entities are the resume worker's problem.
    pub deferred: bool,
}

pub fn keywords_request(company: &CompanyRecord) -> ChatRequest {
    let prompt = format!(
        r#"You are generating a product keyword list for a company to power search and filtering.
Company:
- Name: {name}
- Website: {website}
- Short description/tagline (if available): {tagline}
Rules:
- Output ONLY a JSON object with a single field: "keywords".
- "keywords" must be an array of 15 to 25 short product phrases the company actually sells or makes.
- Use product-level specificity (e.g., "insulated cooler", "travel tumbler"), not vague categories.
- Do NOT include brand name, company name, marketing adjectives, or locations.
- Do NOT repeat near-duplicates.
Output JSON only: {{ "keywords": ["...", "..."] }}"#,
        name = company.company_name,
        website = company.website_url,
        tagline = company.tagline,
    );
    ChatRequest::structured(prompt, 0.2)
}

pub fn industries_request(company: &CompanyRecord) -> ChatRequest {
    let prompt = format!(
        r#"You are classifying a company into a small set of industries for search filtering.
Company:
- Name: {name}
- Website: {website}
- Products: {products}
Rules:
- Output ONLY valid JSON with two fields: "industries" and "tagline".
- "industries" must be an array of 1 to 6 short industry names (e.g., "Apparel", "Consumer Electronics", "Food & Beverage").
- "tagline" is one short sentence describing what the company makes, or "" if unknown.
- Do NOT include locations.
Output JSON only: {{ "industries": ["..."], "tagline": "..." }}"#,
        name = company.company_name,
        website = company.website_url,
        products = company.product_keywords,
    );
    ChatRequest::structured(prompt, 0.1)
}

pub fn parse_keyword_list(response: &GrokResponse) -> Vec<String> {
    let text = extract_response_text(&response.body);
    extract_json_object(&text)
        .and_then(|obj| obj.get("keywords").and_then(Value::as_array).cloned())
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_industries(response: &GrokResponse) -> (Vec<String>, String) {
    let text = extract_response_text(&response.body);
    let Some(obj) = extract_json_object(&text) else {
        return (Vec::new(), String::new());
    };
    let industries = obj
        .get("industries")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let tagline = obj
        .get("tagline")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    (industries, tagline)
}

fn needs_keywords(record: &CompanyRecord) -> bool {
    record.keywords.len() < KEYWORDS_SUFFICIENT
}

fn needs_industries(record: &CompanyRecord) -> bool {
    sanitize_industries(&record.industries).is_empty()
}

/// Enrich one entity. Returns warnings; `Err` only for the
/// insufficient-time case that should defer the whole stage.
async fn enrich_entity(
    caller: &StageCaller<'_>,
    record: &mut CompanyRecord,
    quality: &QualityConfig,
) -> Result<Vec<StageWarning>, StageCallError> {
    let mut warnings = Vec::new();

    if needs_keywords(record) {
        match caller.call_with_retry(Stage::Keywords, &keywords_request(record), None).await {
            Ok(StageOutcome::Continue(response)) if response.is_success() => {
                let raw = parse_keyword_list(&response);
                let stats = sanitize_keywords(&raw.join(", "), &[]);
                // Adopt a generated set only past the raw-count gate; a
                // thin list is low quality, not a replacement.
                if stats.sanitized_count() >= quality.min_raw_keywords {
                    let normalized = normalize_product_keywords(
                        &stats.sanitized,
                        &record.company_name,
                        &record.website_url,
                    );
                    record.keywords = normalized;
                    record.product_keywords = record.keywords.join(", ");
                }
            }
            Ok(StageOutcome::Continue(response)) => {
                warnings.push(StageWarning {
                    stage: Stage::Keywords,
                    company_name: record.company_name.clone(),
                    root_cause: format!("upstream_http_{}", response.status),
                    retryable: true,
                });
            }
            Ok(StageOutcome::Accepted(_)) => unreachable!("non-primary stages never accept"),
            Err(e @ StageCallError::InsufficientTime { .. }) => return Err(e),
            Err(e) => {
                warnings.push(StageWarning {
                    stage: Stage::Keywords,
                    company_name: record.company_name.clone(),
                    root_cause: e.to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
    }

    if needs_industries(record) {
        match caller.call_with_retry(Stage::Keywords, &industries_request(record), None).await {
            Ok(StageOutcome::Continue(response)) if response.is_success() => {
                let (raw_industries, tagline) = parse_industries(&response);
                let sanitized = sanitize_industries(&raw_industries);
                if !sanitized.is_empty() {
                    record.industries = sanitized.into_iter().take(MAX_INDUSTRIES).collect();
                    record.industries_unknown = false;
                }
                if record.tagline.trim().is_empty() && !tagline.is_empty() {
                    record.tagline = tagline;
                }
            }
            Ok(StageOutcome::Continue(response)) => {
                warnings.push(StageWarning {
                    stage: Stage::Keywords,
                    company_name: record.company_name.clone(),
                    root_cause: format!("upstream_http_{}", response.status),
                    retryable: true,
                });
            }
            Ok(StageOutcome::Accepted(_)) => unreachable!("non-primary stages never accept"),
            Err(e @ StageCallError::InsufficientTime { .. }) => return Err(e),
            Err(e) => {
                warnings.push(StageWarning {
                    stage: Stage::Keywords,
                    company_name: record.company_name.clone(),
                    root_cause: e.to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
    }

    Ok(warnings)
}

/// Run the stage over all entities with bounded concurrency.
pub async fn run_keywords_stage(
    caller: &StageCaller<'_>,
    records: &mut [CompanyRecord],
    quality: &QualityConfig,
) -> StageReport {
    let mut report = StageReport::default();

    let results: Vec<(usize, CompanyRecord, Result<Vec<StageWarning>, StageCallError>)> =
        stream::iter(records.iter().cloned().enumerate().map(|(idx, mut record)| async move {
            let result = enrich_entity(caller, &mut record, quality).await;
            (idx, record, result)
        }))
        .buffer_unordered(ENTITY_CONCURRENCY)
        .collect()
        .await;

    for (idx, record, result) in results {
        records[idx] = record;
        match result {
            Ok(warnings) => report.warnings.extend(warnings),
            Err(e) => {
                warn!(error = %e, "keywords stage out of budget, deferring remainder");
                report.deferred = true;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sufficient_keywords_skip_the_fetch() {
        let record = CompanyRecord {
            keywords: (0..10).map(|i| format!("widget {i}")).collect(),
            ..Default::default()
        };
        assert!(!needs_keywords(&record));

        let thin = CompanyRecord {
            keywords: vec!["widget".to_string()],
            ..Default::default()
        };
        assert!(needs_keywords(&thin));
    }

    #[test]
    fn junk_industries_still_need_enrichment() {
        let record = CompanyRecord {
            industries: vec!["Best Sellers".to_string(), "Shop".to_string()],
            ..Default::default()
        };
        assert!(needs_industries(&record));
    }

    #[test]
    fn keyword_list_parses_from_json_object() {
        let response = GrokResponse {
            status: 200,
            request_id: None,
            body: serde_json::json!({
                "choices": [{ "message": { "content": "{\"keywords\": [\"bar soap\", \"liquid soap\"]}" } }]
            }),
        };
        assert_eq!(parse_keyword_list(&response), vec!["bar soap", "liquid soap"]);
    }

    #[test]
    fn industries_parse_includes_tagline() {
        let response = GrokResponse {
            status: 200,
            request_id: None,
            body: serde_json::json!({
                "choices": [{ "message": { "content": "{\"industries\": [\"Soap\"], \"tagline\": \"Honest suds.\"}" } }]
            }),
        };
        let (industries, tagline) = parse_industries(&response);
        assert_eq!(industries, vec!["Soap"]);
        assert_eq!(tagline, "Honest suds.");
    }
}
