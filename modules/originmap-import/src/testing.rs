//! Test mocks for the import pipeline.
//!
//! Four mocks matching the four trait boundaries:
//! - MemoryStore (DocumentStore) — stateful in-memory document container
//! - MockUpstream (Upstream) — prompt-substring-keyed scripted replies
//! - FixedGeocoder (Geocoder) — address→coordinates table
//! - MockLogoImporter (LogoImporter) — fixed found/not-found outcome
//!
//! No network, no database. `cargo test` in seconds.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use grok_client::{ChatRequest, GrokCallError, GrokResponse, MessageRole};
use originmap_common::{CompanyRecord, GeocodedPlace, LogoStatus};

use crate::traits::{
    DocumentStore, DuplicateMatchKey, ExistingCompany, Geocoder, LogoImporter, LogoRequest,
    LogoResult, Upstream, UpsertResult,
};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    companies: Mutex<HashMap<String, CompanyRecord>>,
    control: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_company(self, record: CompanyRecord) -> Self {
        let id = record.id.clone().expect("seeded company needs an id");
        self.companies.lock().unwrap().insert(id, record);
        self
    }

    pub fn company_count(&self) -> usize {
        self.companies.lock().unwrap().len()
    }

    pub fn get_company(&self, id: &str) -> Option<CompanyRecord> {
        self.companies.lock().unwrap().get(id).cloned()
    }

    pub fn all_companies(&self) -> Vec<CompanyRecord> {
        let mut companies: Vec<CompanyRecord> =
            self.companies.lock().unwrap().values().cloned().collect();
        companies.sort_by(|a, b| a.id.cmp(&b.id));
        companies
    }

    pub fn get_control_doc(&self, id: &str) -> Option<Value> {
        self.control.lock().unwrap().get(id).cloned()
    }

    pub fn set_control_doc(&self, id: &str, doc: Value) {
        self.control.lock().unwrap().insert(id.to_string(), doc);
    }

    fn first_match<F>(&self, predicate: F, key: DuplicateMatchKey, value: &str) -> Option<ExistingCompany>
    where
        F: Fn(&CompanyRecord) -> bool,
    {
        let companies = self.companies.lock().unwrap();
        let mut matches: Vec<&CompanyRecord> = companies
            .values()
            .filter(|c| !c.is_deleted && predicate(c))
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches.first().map(|c| ExistingCompany {
            id: c.id.clone().unwrap_or_default(),
            normalized_domain: c.normalized_domain.clone(),
            matched_key: key,
            matched_value: value.to_string(),
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_by_normalized_domain(&self, domain: &str) -> Result<Option<ExistingCompany>> {
        Ok(self.first_match(
            |c| c.normalized_domain == domain,
            DuplicateMatchKey::NormalizedDomain,
            domain,
        ))
    }

    async fn find_by_canonical_urls(&self, variants: &[String]) -> Result<Option<ExistingCompany>> {
        Ok(self.first_match(
            |c| {
                variants.iter().any(|v| {
                    c.canonical_url == *v || c.website_url == *v || c.website_url == v.trim_end_matches('/')
                })
            },
            DuplicateMatchKey::CanonicalUrl,
            variants.first().map(String::as_str).unwrap_or_default(),
        ))
    }

    async fn find_by_company_name(&self, name_lower: &str) -> Result<Option<ExistingCompany>> {
        Ok(self.first_match(
            |c| c.company_name.to_lowercase() == name_lower,
            DuplicateMatchKey::CompanyName,
            name_lower,
        ))
    }

    async fn read_company(&self, id: &str, _domain_hint: &str) -> Result<Option<CompanyRecord>> {
        Ok(self.companies.lock().unwrap().get(id).cloned())
    }

    async fn upsert_company(&self, record: &CompanyRecord) -> Result<UpsertResult> {
        let id = record
            .id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("MemoryStore: company without id"))?;
        self.companies.lock().unwrap().insert(id, record.clone());
        Ok(UpsertResult::Written)
    }

    async fn read_control_doc(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.control.lock().unwrap().get(id).cloned())
    }

    async fn upsert_control_doc(&self, doc: &Value) -> Result<()> {
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("MemoryStore: control doc without id"))?;
        self.control
            .lock()
            .unwrap()
            .insert(id.to_string(), doc.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockUpstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum MockReply {
    /// 200 with the given text as the assistant message content.
    Content(String),
    /// HTTP status with an empty body.
    Status(u16),
    Timeout,
}

impl MockReply {
    pub fn json(value: Value) -> Self {
        MockReply::Content(value.to_string())
    }
}

struct MockRule {
    needle: String,
    replies: VecDeque<MockReply>,
    last: Option<MockReply>,
}

/// Scripted upstream. Rules match on a substring of the user message; each
/// matching call pops the next scripted reply, repeating the last one when
/// the script runs out.
#[derive(Default)]
pub struct MockUpstream {
    rules: Mutex<Vec<MockRule>>,
    calls: Mutex<Vec<String>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, reply: MockReply) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            if let Some(rule) = rules.iter_mut().find(|r| r.needle == needle) {
                rule.replies.push_back(reply);
            } else {
                rules.push(MockRule {
                    needle: needle.to_string(),
                    replies: VecDeque::from([reply]),
                    last: None,
                });
            }
        }
        self
    }

    /// User-message prompts seen, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn chat(
        &self,
        request: &ChatRequest,
        _timeout: Duration,
    ) -> Result<GrokResponse, GrokCallError> {
        let user_content = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(user_content.clone());

        let reply = {
            let mut rules = self.rules.lock().unwrap();
            let rule = rules
                .iter_mut()
                .find(|r| user_content.contains(&r.needle))
                .unwrap_or_else(|| panic!("MockUpstream: no rule matches prompt: {user_content}"));
            match rule.replies.pop_front() {
                Some(reply) => {
                    rule.last = Some(reply.clone());
                    reply
                }
                None => rule
                    .last
                    .clone()
                    .expect("MockUpstream: rule has no replies"),
            }
        };

        match reply {
            MockReply::Content(text) => Ok(GrokResponse {
                status: 200,
                request_id: Some("mock-req".to_string()),
                body: serde_json::json!({
                    "choices": [{ "message": { "content": text } }]
                }),
            }),
            MockReply::Status(status) => Ok(GrokResponse {
                status,
                request_id: Some("mock-req".to_string()),
                body: serde_json::json!({}),
            }),
            MockReply::Timeout => Err(GrokCallError::Timeout),
        }
    }
}

// ---------------------------------------------------------------------------
// FixedGeocoder
// ---------------------------------------------------------------------------

/// Address-table geocoder. Unregistered addresses resolve to `None`.
#[derive(Default)]
pub struct FixedGeocoder {
    table: HashMap<String, (f64, f64)>,
}

impl FixedGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, address: &str, lat: f64, lng: f64) -> Self {
        self.table.insert(address.to_string(), (lat, lng));
        self
    }
}

#[async_trait]
impl Geocoder for FixedGeocoder {
    async fn geocode_batch(
        &self,
        locations: &[String],
        _timeout: Duration,
        _concurrency: usize,
    ) -> Vec<Option<GeocodedPlace>> {
        locations
            .iter()
            .map(|address| {
                self.table.get(address.trim()).map(|(lat, lng)| GeocodedPlace {
                    address: address.clone(),
                    formatted: address.clone(),
                    lat: *lat,
                    lng: *lng,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockLogoImporter
// ---------------------------------------------------------------------------

pub struct MockLogoImporter {
    found: bool,
}

impl MockLogoImporter {
    /// Every lookup finds a logo at a deterministic URL.
    pub fn found() -> Self {
        Self { found: true }
    }

    pub fn not_found() -> Self {
        Self { found: false }
    }
}

#[async_trait]
impl LogoImporter for MockLogoImporter {
    async fn import_logo(&self, request: LogoRequest, _budget_ms: u64) -> LogoResult {
        if self.found {
            LogoResult {
                logo_url: Some(format!("https://logos.example/{}.png", request.domain)),
                logo_status: LogoStatus::Imported,
            }
        } else {
            LogoResult {
                logo_url: None,
                logo_status: LogoStatus::NotFoundOnSite,
            }
        }
    }
}
