//! The import endpoint.
//!
//! The transport layer always answers HTTP 200 — the hosting gateway
//! mangles non-200 bodies — so failures are encoded in-body with
//! `ok`/`http_status`/`root_cause`/`retryable`/`error_id`. Request and
//! session ids are echoed as headers for log correlation.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use originmap_common::{Center, CompanyRecord, QueryType, Stage};
use originmap_import::import::ImportRequest;

use crate::AppState;

pub async fn import_start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let request = match parse_request(&body, &params) {
        Ok(request) => request,
        Err(reject) => {
            return envelope(serde_json::json!({
                "ok": false,
                "http_status": 400,
                "root_cause": reject.root_cause,
                "retryable": false,
                "error_id": format!("err_{}", Uuid::new_v4().simple()),
                "stage_beacon": "request_parse",
                "message": reject.message,
            }));
        }
    };

    let response = state.importer.run(request).await;
    let value = match serde_json::to_value(&response) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "response serialization failed");
            serde_json::json!({
                "ok": false,
                "http_status": 500,
                "root_cause": "server_exception",
                "retryable": true,
                "error_id": format!("err_{}", Uuid::new_v4().simple()),
                "stage_beacon": "response_encode",
                "message": "response serialization failed",
            })
        }
    };

    envelope(value)
}

/// Wrap a body in the always-200 response with correlation headers.
fn envelope(body: Value) -> Response {
    let mut headers = HeaderMap::new();
    for (field, header) in [("request_id", "x-request-id"), ("session_id", "x-session-id")] {
        if let Some(value) = body.get(field).and_then(Value::as_str) {
            if let (Ok(name), Ok(value)) =
                (HeaderName::from_str(header), HeaderValue::from_str(value))
            {
                headers.insert(name, value);
            }
        }
    }

    (StatusCode::OK, headers, Json(body)).into_response()
}

#[derive(Debug)]
pub struct ParseRejection {
    pub root_cause: &'static str,
    pub message: String,
}

fn reject(root_cause: &'static str, message: impl Into<String>) -> ParseRejection {
    ParseRejection {
        root_cause,
        message: message.into(),
    }
}

/// Build an `ImportRequest` from the JSON body plus query-string knobs.
pub fn parse_request(
    body: &str,
    params: &HashMap<String, String>,
) -> Result<ImportRequest, ParseRejection> {
    let body: Value = if body.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(body)
            .map_err(|e| reject("invalid_json_body", format!("invalid JSON body: {e}")))?
    };
    if !body.is_object() {
        return Err(reject("invalid_json_body", "body must be a JSON object"));
    }

    let get_str = |key: &str| -> Option<String> {
        body.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let get_bool = |keys: &[&str]| -> bool {
        keys.iter()
            .filter_map(|k| body.get(*k))
            .any(|v| v.as_bool() == Some(true))
    };

    let query_types = parse_query_types(&body)?;

    let companies: Vec<CompanyRecord> = match body.get("companies") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| reject("invalid_request", format!("companies: {e}")))?,
    };

    let center = body.get("center").and_then(|c| {
        let lat = c.get("lat").and_then(Value::as_f64)?;
        let lng = c.get("lng").and_then(Value::as_f64)?;
        Some(Center { lat, lng })
    });

    let limit = body
        .get("limit")
        .and_then(Value::as_u64)
        .map(|n| n.clamp(1, 25) as usize)
        .unwrap_or(10);

    let max_stage = match params.get("max_stage").map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(
            Stage::from_str(raw).map_err(|e| reject("invalid_request", e))?,
        ),
    };

    let skip_stages = match params.get("skip_stages").map(String::as_str) {
        None | Some("") => Vec::new(),
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Stage::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| reject("invalid_request", e))?,
    };

    let parse_ms = |key: &str| -> Option<u64> {
        params.get(key).and_then(|v| v.parse().ok())
    };

    Ok(ImportRequest {
        query: get_str("query").unwrap_or_default(),
        location: get_str("location"),
        limit,
        query_types,
        companies,
        debug: get_bool(&["debug"]),
        dry_run: get_bool(&["dry_run", "dryRun"]),
        session_id: get_str("session_id"),
        center,
        max_stage,
        skip_stages,
        deadline_ms: parse_ms("deadline_ms"),
        stage_ms_primary: parse_ms("stage_ms_primary"),
        save_stub: get_bool(&["save_stub"]),
        allow_resume: body
            .get("allow_resume")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        expand_if_few: body
            .get("expand_if_few")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    })
}

/// `queryType` (single) and `queryTypes` (list) are both accepted; naming
/// both with different content is a caller bug, not a guess we should make.
fn parse_query_types(body: &Value) -> Result<Vec<QueryType>, ParseRejection> {
    let single = body
        .get("queryType")
        .and_then(Value::as_str)
        .map(parse_query_type)
        .transpose()?;

    let list: Option<Vec<QueryType>> = match body.get("queryTypes") {
        None | Some(Value::Null) => None,
        Some(Value::Array(values)) => Some(
            values
                .iter()
                .filter_map(Value::as_str)
                .map(parse_query_type)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(_) => return Err(reject("invalid_request", "queryTypes must be an array")),
    };

    match (single, list) {
        (Some(single), Some(list)) => {
            if list.contains(&single) {
                Ok(list)
            } else {
                Err(reject(
                    "ambiguous_query_type",
                    "queryType and queryTypes disagree",
                ))
            }
        }
        (Some(single), None) => Ok(vec![single]),
        (None, Some(list)) => Ok(list),
        (None, None) => Ok(Vec::new()),
    }
}

fn parse_query_type(raw: &str) -> Result<QueryType, ParseRejection> {
    match raw.trim().to_lowercase().as_str() {
        "product_keyword" => Ok(QueryType::ProductKeyword),
        "company_url" | "direct_url" => Ok(QueryType::CompanyUrl),
        "company_name" => Ok(QueryType::CompanyName),
        other => Err(reject(
            "invalid_request",
            format!("unknown query type: {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_params() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn minimal_body_parses_with_defaults() {
        let request = parse_request(r#"{"query": "organic soap"}"#, &no_params()).unwrap();
        assert_eq!(request.query, "organic soap");
        assert_eq!(request.limit, 10);
        assert!(request.allow_resume);
        assert!(request.expand_if_few);
        assert!(request.query_types.is_empty());
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = parse_request("{not json", &no_params()).unwrap_err();
        assert_eq!(err.root_cause, "invalid_json_body");
    }

    #[test]
    fn limit_clamps_into_range() {
        let request = parse_request(r#"{"limit": 500}"#, &no_params()).unwrap();
        assert_eq!(request.limit, 25);
        let request = parse_request(r#"{"limit": 0}"#, &no_params()).unwrap();
        assert_eq!(request.limit, 1);
    }

    #[test]
    fn conflicting_query_type_fields_are_ambiguous() {
        let body = r#"{"queryType": "company_url", "queryTypes": ["product_keyword"]}"#;
        let err = parse_request(body, &no_params()).unwrap_err();
        assert_eq!(err.root_cause, "ambiguous_query_type");

        let agreeing = r#"{"queryType": "company_url", "queryTypes": ["company_url"]}"#;
        let request = parse_request(agreeing, &no_params()).unwrap();
        assert_eq!(request.query_types, vec![QueryType::CompanyUrl]);
    }

    #[test]
    fn stage_knobs_come_from_the_query_string() {
        let mut params = HashMap::new();
        params.insert("max_stage".to_string(), "expand".to_string());
        params.insert("skip_stages".to_string(), "primary,reviews".to_string());
        params.insert("deadline_ms".to_string(), "12000".to_string());

        let request = parse_request("{}", &params).unwrap();
        assert_eq!(request.max_stage, Some(Stage::Expand));
        assert_eq!(request.skip_stages, vec![Stage::Primary, Stage::Reviews]);
        assert_eq!(request.deadline_ms, Some(12_000));
    }

    #[test]
    fn unknown_stage_name_is_rejected() {
        let mut params = HashMap::new();
        params.insert("max_stage".to_string(), "bogus".to_string());
        let err = parse_request("{}", &params).unwrap_err();
        assert_eq!(err.root_cause, "invalid_request");
    }

    #[test]
    fn dry_run_accepts_both_spellings() {
        assert!(parse_request(r#"{"dry_run": true}"#, &no_params()).unwrap().dry_run);
        assert!(parse_request(r#"{"dryRun": true}"#, &no_params()).unwrap().dry_run);
    }

    #[test]
    fn seeded_companies_deserialize() {
        let body = r#"{"companies": [{"id": "company_1", "company_name": "Acme", "website_url": "https://acme.com"}]}"#;
        let request = parse_request(body, &no_params()).unwrap();
        assert_eq!(request.companies.len(), 1);
        assert_eq!(request.companies[0].company_name, "Acme");
    }
}
