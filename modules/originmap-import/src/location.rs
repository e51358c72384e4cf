//! Location stage: geocoding plus one batched refinement call.
//!
//! Geocoding runs with bounded concurrency and a per-batch timeout; failures
//! downgrade gracefully and never abort the stage. When at least one entity
//! is missing HQ or manufacturing locations (or has low confidence), a
//! single refinement call covers all of them; results merge back by
//! case-insensitive company name, and only entities that actually changed
//! are re-geocoded.

use std::time::Duration;

use serde_json::Value;
use tracing::info;

use grok_client::{extract_json_array, extract_response_text, ChatRequest, GrokResponse};
use originmap_common::{
    is_meaningful_string, is_sentinel_string, normalize_country_in_location, CompanyRecord,
    LocationConfidence, Stage,
};

use crate::keywords::{StageReport, StageWarning};
use crate::traits::Geocoder;
use crate::upstream::{StageCallError, StageCaller, StageOutcome};

const GEOCODE_TIMEOUT: Duration = Duration::from_secs(5);
const GEOCODE_CONCURRENCY: usize = 4;

/// Geocode one entity's HQ and manufacturing strings, picking the first
/// successful HQ result as the primary lat/lng.
pub async fn geocode_record(geocoder: &dyn Geocoder, record: &mut CompanyRecord) {
    let hq_input: Vec<String> = Some(record.headquarters_location.trim().to_string())
        .filter(|s| is_meaningful_string(s) && !is_sentinel_string(s))
        .into_iter()
        .collect();

    let mfg_input: Vec<String> = record
        .manufacturing_locations
        .iter()
        .filter(|l| is_meaningful_string(l) && !is_sentinel_string(l))
        .cloned()
        .collect();

    if !hq_input.is_empty() {
        let results = geocoder
            .geocode_batch(&hq_input, GEOCODE_TIMEOUT, GEOCODE_CONCURRENCY)
            .await;
        if let Some(primary) = results.iter().flatten().next() {
            record.hq_lat = Some(primary.lat);
            record.hq_lng = Some(primary.lng);
        }
        record.headquarters_geocodes = results.into_iter().flatten().collect();
    }

    if !mfg_input.is_empty() {
        let results = geocoder
            .geocode_batch(&mfg_input, GEOCODE_TIMEOUT, GEOCODE_CONCURRENCY)
            .await;
        record.manufacturing_geocodes = results.into_iter().flatten().collect();
    }
}

/// Whether an entity qualifies for the batched refinement call.
pub fn needs_refinement(record: &CompanyRecord) -> bool {
    let hq = record.headquarters_location.trim();
    let hq_missing = !is_meaningful_string(hq) || is_sentinel_string(hq);
    let mfg_missing = record
        .manufacturing_locations
        .iter()
        .all(|l| !is_meaningful_string(l) || is_sentinel_string(l));
    hq_missing || mfg_missing || record.location_confidence == LocationConfidence::Low
}

pub fn refinement_request(records: &[&CompanyRecord]) -> ChatRequest {
    let roster = records
        .iter()
        .map(|r| format!("- {} ({})", r.company_name, r.website_url))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        r#"Research the headquarters and manufacturing locations for these companies:
{roster}

Return EXACTLY a JSON array; one object per company you found information for:
- company_name (string): must match a name from the list above
- headquarters_location (string): "City, Region, Country", or "Not disclosed" only if the company explicitly withholds it
- manufacturing_locations (array of strings)
- location_confidence (string): "low" | "medium" | "high"

Omit companies you found nothing for. Output JSON only."#
    );
    ChatRequest::structured(prompt, 0.1)
}

/// Merge refinement results back by case-insensitive company name.
/// Returns the indices of entities that actually changed.
pub fn apply_refinement(records: &mut [CompanyRecord], response: &GrokResponse) -> Vec<usize> {
    let text = extract_response_text(&response.body);
    let Some(array) = extract_json_array(&text) else {
        return Vec::new();
    };

    let mut updated = Vec::new();

    for item in array.as_array().into_iter().flatten() {
        let Some(obj) = item.as_object() else { continue };
        let Some(name) = obj.get("company_name").and_then(Value::as_str) else {
            continue;
        };
        let name_lower = name.trim().to_lowercase();

        let Some(idx) = records
            .iter()
            .position(|r| r.company_name.trim().to_lowercase() == name_lower)
        else {
            continue;
        };

        let mut changed = false;
        let record = &mut records[idx];

        if let Some(hq) = obj.get("headquarters_location").and_then(Value::as_str) {
            let hq = normalize_country_in_location(hq);
            if is_sentinel_string(&hq) {
                if record.headquarters_location.trim().is_empty()
                    || !is_meaningful_string(&record.headquarters_location)
                {
                    record.headquarters_location = hq;
                    record.hq_unknown = true;
                    record.hq_unknown_reason = Some(originmap_common::MissingReason::NotDisclosed);
                    changed = true;
                }
            } else if is_meaningful_string(&hq) && hq != record.headquarters_location {
                record.headquarters_location = hq;
                record.hq_unknown = false;
                record.hq_unknown_reason = None;
                changed = true;
            }
        }

        if let Some(locations) = obj.get("manufacturing_locations").and_then(Value::as_array) {
            let cleaned: Vec<String> = locations
                .iter()
                .filter_map(Value::as_str)
                .map(normalize_country_in_location)
                .filter(|l| is_meaningful_string(l))
                .collect();
            if !cleaned.is_empty() && cleaned != record.manufacturing_locations {
                record.manufacturing_locations = cleaned;
                record.mfg_unknown = false;
                record.mfg_unknown_reason = None;
                changed = true;
            }
        }

        if let Some(confidence) = obj
            .get("location_confidence")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value(Value::String(s.to_lowercase())).ok())
        {
            if record.location_confidence != confidence {
                record.location_confidence = confidence;
                changed = true;
            }
        }

        if changed {
            updated.push(idx);
        }
    }

    updated
}

/// Run the refinement half of the location stage: one batched call, merge,
/// re-geocode only what changed.
pub async fn run_location_refinement(
    caller: &StageCaller<'_>,
    geocoder: &dyn Geocoder,
    records: &mut [CompanyRecord],
) -> StageReport {
    let mut report = StageReport::default();

    let needing: Vec<&CompanyRecord> = records.iter().filter(|r| needs_refinement(r)).collect();
    if needing.is_empty() {
        return report;
    }
    let request = refinement_request(&needing);

    match caller.call_with_retry(Stage::Location, &request, None).await {
        Ok(StageOutcome::Continue(response)) if response.is_success() => {
            let updated = apply_refinement(records, &response);
            info!(refined = updated.len(), "location refinement merged");
            for idx in updated {
                geocode_record(geocoder, &mut records[idx]).await;
            }
        }
        Ok(StageOutcome::Continue(response)) => {
            report.warnings.push(StageWarning {
                stage: Stage::Location,
                company_name: String::new(),
                root_cause: format!("upstream_http_{}", response.status),
                retryable: true,
            });
        }
        Ok(StageOutcome::Accepted(_)) => unreachable!("non-primary stages never accept"),
        Err(StageCallError::InsufficientTime { .. }) => {
            report.deferred = true;
        }
        Err(e) => {
            report.warnings.push(StageWarning {
                stage: Stage::Location,
                company_name: String::new(),
                root_cause: e.to_string(),
                retryable: e.is_retryable(),
            });
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, hq: &str, mfg: &[&str]) -> CompanyRecord {
        CompanyRecord {
            company_name: name.to_string(),
            website_url: format!("https://{}.example", name.to_lowercase()),
            headquarters_location: hq.to_string(),
            manufacturing_locations: mfg.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn response_with(content: serde_json::Value) -> GrokResponse {
        GrokResponse {
            status: 200,
            request_id: None,
            body: serde_json::json!({
                "choices": [{ "message": { "content": content.to_string() } }]
            }),
        }
    }

    #[test]
    fn refinement_needed_for_missing_hq_or_mfg_or_low_confidence() {
        assert!(needs_refinement(&record("A", "", &["Hanoi, Vietnam"])));
        assert!(needs_refinement(&record("B", "Austin, TX", &[])));
        assert!(!needs_refinement(&record("C", "Austin, TX", &["Hanoi, Vietnam"])));

        let mut low = record("D", "Austin, TX", &["Hanoi, Vietnam"]);
        low.location_confidence = LocationConfidence::Low;
        assert!(needs_refinement(&low));
    }

    #[test]
    fn refinement_merges_by_case_insensitive_name() {
        let mut records = vec![
            record("Acme Soap", "", &[]),
            record("Other Co", "Boston, MA", &["Lowell, MA"]),
        ];
        let response = response_with(serde_json::json!([
            {
                "company_name": "ACME SOAP",
                "headquarters_location": "Portland, OR, United States",
                "manufacturing_locations": ["Eugene, OR"],
                "location_confidence": "high"
            },
            { "company_name": "Nobody Known" }
        ]));

        let updated = apply_refinement(&mut records, &response);
        assert_eq!(updated, vec![0]);
        assert_eq!(records[0].headquarters_location, "Portland, OR, USA");
        assert_eq!(records[0].manufacturing_locations, vec!["Eugene, OR"]);
        assert_eq!(records[0].location_confidence, LocationConfidence::High);
        // Untouched entity keeps its values.
        assert_eq!(records[1].headquarters_location, "Boston, MA");
    }

    #[test]
    fn refinement_not_disclosed_only_fills_gaps() {
        let mut records = vec![record("Acme", "Portland, OR", &[])];
        let response = response_with(serde_json::json!([
            { "company_name": "Acme", "headquarters_location": "Not disclosed" }
        ]));
        let updated = apply_refinement(&mut records, &response);
        // Real data is never downgraded to a sentinel.
        assert!(updated.is_empty());
        assert_eq!(records[0].headquarters_location, "Portland, OR");
    }

    #[test]
    fn unparseable_refinement_changes_nothing() {
        let mut records = vec![record("Acme", "", &[])];
        let response = GrokResponse {
            status: 200,
            request_id: None,
            body: serde_json::json!({ "choices": [{ "message": { "content": "no data" } }] }),
        };
        assert!(apply_refinement(&mut records, &response).is_empty());
    }
}
