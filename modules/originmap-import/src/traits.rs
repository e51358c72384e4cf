//! Trait abstractions for the import pipeline's external collaborators.
//!
//! DocumentStore hides the Cosmos container; Upstream hides the Grok
//! endpoint; Geocoder and LogoImporter hide their respective services.
//! These enable deterministic testing with the mocks in `testing.rs`:
//! no network, no database.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use grok_client::{ChatRequest, GrokCallError, GrokClient, GrokResponse};
use originmap_common::{CompanyRecord, GeocodedPlace, LogoStatus};

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// Which dedup key matched an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMatchKey {
    NormalizedDomain,
    CanonicalUrl,
    CompanyName,
}

/// Summary row returned by the dedup lookups — enough to decide
/// merge-vs-skip and to read the full document back.
#[derive(Debug, Clone)]
pub struct ExistingCompany {
    pub id: String,
    pub normalized_domain: String,
    pub matched_key: DuplicateMatchKey,
    pub matched_value: String,
}

/// Outcome of an upsert attempt. Conflicts are data, not faults — the save
/// loop counts them as skipped duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Written,
    Conflict,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    // --- Dedup lookups (non-soft-deleted documents only) ---

    /// Exact `normalized_domain` match.
    async fn find_by_normalized_domain(&self, domain: &str) -> Result<Option<ExistingCompany>>;

    /// Canonical URL equivalence over scheme × trailing-slash variants,
    /// checked against canonical_url/website_url/url.
    async fn find_by_canonical_urls(&self, variants: &[String]) -> Result<Option<ExistingCompany>>;

    /// Case-insensitive exact company-name match.
    async fn find_by_company_name(&self, name_lower: &str) -> Result<Option<ExistingCompany>>;

    // --- Company documents ---

    /// Point-read a company by id, trying partition-key candidates in order.
    async fn read_company(&self, id: &str, domain_hint: &str) -> Result<Option<CompanyRecord>>;

    /// Upsert a company document under its partition-key candidates.
    async fn upsert_company(&self, record: &CompanyRecord) -> Result<UpsertResult>;

    // --- Import control documents (sessions, resume, completion, stop) ---

    async fn read_control_doc(&self, id: &str) -> Result<Option<Value>>;

    async fn upsert_control_doc(&self, doc: &Value) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Upstream — the enrichment LLM
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Issue one bounded chat call. Non-2xx statuses come back in the
    /// response; only timeouts and transport failures are errors.
    async fn chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<GrokResponse, GrokCallError>;
}

#[async_trait]
impl Upstream for GrokClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<GrokResponse, GrokCallError> {
        self.post_chat(request, timeout).await
    }
}

// ---------------------------------------------------------------------------
// Geocoder
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Geocode a batch of address strings. Output order matches input;
    /// failed lookups are `None`. Never errors — geocoding failures
    /// downgrade gracefully.
    async fn geocode_batch(
        &self,
        locations: &[String],
        timeout: Duration,
        concurrency: usize,
    ) -> Vec<Option<GeocodedPlace>>;
}

#[async_trait]
impl Geocoder for geocode_client::GeocodeClient {
    async fn geocode_batch(
        &self,
        locations: &[String],
        timeout: Duration,
        concurrency: usize,
    ) -> Vec<Option<GeocodedPlace>> {
        let opts = geocode_client::GeocodeOptions {
            timeout,
            concurrency,
        };
        self.geocode_location_array(locations, &opts)
            .await
            .into_iter()
            .map(|geo| {
                geo.map(|g| GeocodedPlace {
                    address: g.address,
                    formatted: g.formatted,
                    lat: g.lat,
                    lng: g.lng,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// LogoImporter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LogoRequest {
    pub company_id: String,
    pub company_name: String,
    pub domain: String,
    pub website_url: String,
}

#[derive(Debug, Clone)]
pub struct LogoResult {
    pub logo_url: Option<String>,
    pub logo_status: LogoStatus,
}

#[async_trait]
pub trait LogoImporter: Send + Sync {
    /// Discover and import a company logo within the given budget.
    /// Must not error — logo failure can never block persistence.
    async fn import_logo(&self, request: LogoRequest, budget_ms: u64) -> LogoResult;
}

/// Used when no logo service is configured. Every lookup reports an
/// explicit not-found so the completeness ledger stays truthful.
pub struct DisabledLogoImporter;

#[async_trait]
impl LogoImporter for DisabledLogoImporter {
    async fn import_logo(&self, _request: LogoRequest, _budget_ms: u64) -> LogoResult {
        LogoResult {
            logo_url: None,
            logo_status: LogoStatus::NotFoundOnSite,
        }
    }
}
