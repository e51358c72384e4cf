//! Primary discovery stage: ask the LLM for candidate companies and
//! normalize its JSON into `CompanyRecord`s.

use serde_json::Value;
use tracing::warn;

use grok_client::{extract_json_array, extract_response_text, ChatRequest, GrokResponse};
use originmap_common::{
    canonical_url_for_domain, normalize_country_in_location, to_normalized_domain, Center,
    CompanyRecord, LocationConfidence, QueryType, RecordSource,
};

pub fn discovery_request(
    query: &str,
    query_type: QueryType,
    limit: usize,
    location: Option<&str>,
    center: Option<Center>,
) -> ChatRequest {
    let type_label = match query_type {
        QueryType::ProductKeyword => "product_keyword",
        QueryType::CompanyUrl => "company_url",
        QueryType::CompanyName => "company_name",
    };

    let location_line = match (location, center) {
        (Some(loc), _) => format!("\nPrefer companies near: {loc}"),
        (None, Some(c)) => format!("\nPrefer companies near lat/lng: {}, {}", c.lat, c.lng),
        _ => String::new(),
    };

    let prompt = format!(
        r#"You are a business research assistant. Find {limit} companies matching this search.

Search query: "{query}"
Search type: {type_label}{location_line}

Return EXACTLY a JSON array of company objects. Each object must have:
- company_name (string)
- website_url (string): the company's own website
- industries (array of strings)
- product_keywords (string): comma-separated concrete product phrases
- tagline (string, optional)
- headquarters_location (string, optional): "City, Region, Country"
- manufacturing_locations (array of strings, optional)
- amazon_url (string, optional)
- social (object, optional): {{linkedin, instagram, x, facebook, tiktok, youtube}}

Only return the JSON array, no other text."#
    );

    ChatRequest::structured(prompt, 0.1)
}

/// Parse discovery output into normalized records, capped at `limit`.
/// Unparseable responses yield an empty list — the caller decides whether
/// that is a no-results completion or an upstream failure.
pub fn parse_candidates(response: &GrokResponse, limit: usize, session_id: &str) -> Vec<CompanyRecord> {
    let text = extract_response_text(&response.body);
    let Some(array) = extract_json_array(&text) else {
        if !text.trim().is_empty() {
            let preview: String = text.chars().take(120).collect();
            warn!(preview = preview.as_str(), "discovery response had no JSON array");
        }
        return Vec::new();
    };

    array
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|v| normalize_candidate(v, session_id))
        .take(limit)
        .collect()
}

/// Map one raw candidate object onto a `CompanyRecord`. Candidates missing
/// both a name and a URL are dropped.
pub fn normalize_candidate(value: &Value, session_id: &str) -> Option<CompanyRecord> {
    let obj = value.as_object()?;

    let get_str = |keys: &[&str]| -> String {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .trim()
            .to_string()
    };

    let company_name = get_str(&["company_name", "name"]);
    let website_url = get_str(&["website_url", "url", "canonical_url"]);
    if company_name.is_empty() && website_url.is_empty() {
        return None;
    }

    let normalized_domain = to_normalized_domain(if website_url.is_empty() {
        &company_name
    } else {
        &website_url
    });

    let industries = string_list(obj.get("industries"));
    let keywords = string_list(obj.get("product_keywords"));

    let manufacturing_locations: Vec<String> = string_list(obj.get("manufacturing_locations"))
        .iter()
        .map(|l| normalize_country_in_location(l))
        .filter(|l| !l.is_empty())
        .collect();

    let social = obj
        .get("social")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.trim().to_string())))
                .filter(|(_, v)| !v.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(CompanyRecord {
        company_name,
        canonical_url: if normalized_domain == "unknown" {
            website_url.clone()
        } else {
            canonical_url_for_domain(&normalized_domain)
        },
        website_url,
        normalized_domain,
        industries,
        product_keywords: keywords.join(", "),
        keywords,
        tagline: get_str(&["tagline"]),
        headquarters_location: normalize_country_in_location(&get_str(&["headquarters_location"])),
        hq_lat: obj.get("hq_lat").and_then(Value::as_f64),
        hq_lng: obj.get("hq_lng").and_then(Value::as_f64),
        manufacturing_locations,
        amazon_url: get_str(&["amazon_url"]),
        social,
        red_flag: obj.get("red_flag").and_then(Value::as_bool).unwrap_or(false),
        red_flag_reason: get_str(&["red_flag_reason"]),
        location_confidence: obj
            .get("location_confidence")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value(Value::String(s.to_lowercase())).ok())
            .unwrap_or(LocationConfidence::Medium),
        source: Some(RecordSource::XaiImport),
        session_id: Some(session_id.to_string()),
        ..Default::default()
    })
}

/// Accept an array of strings or a delimited string; split, trim, dedup
/// case-insensitively.
fn string_list(value: Option<&Value>) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    match value {
        Some(Value::Array(values)) => {
            for v in values {
                if let Some(s) = v.as_str() {
                    items.extend(s.split([',', ';', '|']).map(str::trim).filter(|p| !p.is_empty()).map(String::from));
                }
            }
        }
        Some(Value::String(s)) => {
            items.extend(s.split([',', ';', '|']).map(str::trim).filter(|p| !p.is_empty()).map(String::from));
        }
        _ => {}
    }

    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.to_lowercase()));
    items
}
