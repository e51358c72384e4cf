use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Placeholder written into identity string fields that could not be resolved.
pub const UNKNOWN: &str = "Unknown";

/// Sentinel for fields the company explicitly does not disclose. Terminal —
/// never retried.
pub const NOT_DISCLOSED: &str = "Not disclosed";

// --- Stages ---

/// One named phase of enrichment, in fixed execution order. The derived
/// `Ord` IS the pipeline order — stage-gate comparisons rely on it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Primary,
    Keywords,
    Reviews,
    Location,
    Expand,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Primary,
        Stage::Keywords,
        Stage::Reviews,
        Stage::Location,
        Stage::Expand,
    ];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Primary => write!(f, "primary"),
            Stage::Keywords => write!(f, "keywords"),
            Stage::Reviews => write!(f, "reviews"),
            Stage::Location => write!(f, "location"),
            Stage::Expand => write!(f, "expand"),
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" => Ok(Stage::Primary),
            "keywords" => Ok(Stage::Keywords),
            "reviews" => Ok(Stage::Reviews),
            "location" => Ok(Stage::Location),
            "expand" => Ok(Stage::Expand),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

// --- Session ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Complete,
    Error,
    Timeout,
    Stalled,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Complete => write!(f, "complete"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Timeout => write!(f, "timeout"),
            SessionStatus::Stalled => write!(f, "stalled"),
        }
    }
}

/// Durable async unit for the primary stage when inline time ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Complete,
    Failed,
}

// --- Required fields + missing-reason taxonomy ---

/// Required fields in fixed enforcement precedence — the derived `Ord` is
/// the precedence order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RequiredField {
    CompanyName,
    WebsiteUrl,
    Industries,
    ProductKeywords,
    HeadquartersLocation,
    ManufacturingLocations,
    Logo,
    CuratedReviews,
    Tagline,
}

impl std::fmt::Display for RequiredField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequiredField::CompanyName => "company_name",
            RequiredField::WebsiteUrl => "website_url",
            RequiredField::Industries => "industries",
            RequiredField::ProductKeywords => "product_keywords",
            RequiredField::HeadquartersLocation => "headquarters_location",
            RequiredField::ManufacturingLocations => "manufacturing_locations",
            RequiredField::Logo => "logo",
            RequiredField::CuratedReviews => "curated_reviews",
            RequiredField::Tagline => "tagline",
        };
        write!(f, "{s}")
    }
}

/// Why a required field is missing. Terminal reasons are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    Missing,
    NotFound,
    LowQuality,
    NotDisclosed,
    LowQualityTerminal,
    NotFoundTerminal,
    NotFoundOnSite,
    Exhausted,
    ExhaustedRetryable,
    SeedFromCompanyUrl,
}

impl MissingReason {
    /// Non-retryable, even though the field still counts as missing.
    /// `LowQuality`/`NotFound` stay retryable; the attempt cap promotes
    /// them to the `*Terminal` variants.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissingReason::NotDisclosed
                | MissingReason::LowQualityTerminal
                | MissingReason::NotFoundTerminal
                | MissingReason::NotFoundOnSite
                | MissingReason::Exhausted
        )
    }

    pub fn is_retryable(self) -> bool {
        !self.is_terminal()
    }

    /// The terminal variant this reason promotes to once the attempt cap is
    /// reached, if it supports promotion.
    pub fn terminal_variant(self) -> Option<MissingReason> {
        match self {
            MissingReason::LowQuality => Some(MissingReason::LowQualityTerminal),
            MissingReason::NotFound => Some(MissingReason::NotFoundTerminal),
            _ => None,
        }
    }
}

impl std::fmt::Display for MissingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MissingReason::Missing => "missing",
            MissingReason::NotFound => "not_found",
            MissingReason::LowQuality => "low_quality",
            MissingReason::NotDisclosed => "not_disclosed",
            MissingReason::LowQualityTerminal => "low_quality_terminal",
            MissingReason::NotFoundTerminal => "not_found_terminal",
            MissingReason::NotFoundOnSite => "not_found_on_site",
            MissingReason::Exhausted => "exhausted",
            MissingReason::ExhaustedRetryable => "exhausted_retryable",
            MissingReason::SeedFromCompanyUrl => "seed_from_company_url",
        };
        write!(f, "{s}")
    }
}

/// Structured missing-field ledger entry persisted with the company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportWarning {
    pub field: RequiredField,
    pub missing_reason: MissingReason,
    pub stage: Stage,
    pub retryable: bool,
    pub terminal: bool,
    pub message: String,
}

// --- Reviews ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewsStageStatus {
    Pending,
    Ok,
    Incomplete,
    Empty,
    NoValidReviewsFound,
    UpstreamUnreachable,
    TimedOut,
    ClientBadRequest,
}

/// Tracks whether review discovery is exhausted (genuinely no more
/// candidates) vs. merely failed (retryable). Only a successful
/// zero-candidate fetch may set `exhausted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewCursor {
    pub last_offset: u32,
    pub total_fetched: u32,
    pub exhausted: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reviews_stage_status: Option<ReviewsStageStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedReview {
    pub id: String,
    pub source_name: String,
    pub source_url: String,
    #[serde(default)]
    pub title: String,
    pub excerpt: String,
    #[serde(default)]
    pub date: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub imported_via: String,
    #[serde(default = "default_true")]
    pub show_to_users: bool,
}

fn default_true() -> bool {
    true
}

// --- Logo ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoStatus {
    Pending,
    Imported,
    NotFoundOnSite,
    Skipped,
    Error,
}

// --- Geo ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeocodedPlace {
    pub address: String,
    pub formatted: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Center {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LocationConfidence {
    Low,
    #[default]
    Medium,
    High,
}

// --- Query types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    ProductKeyword,
    CompanyUrl,
    CompanyName,
}

// --- Record provenance ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    XaiImport,
    CompanyUrlShortcut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStage {
    Seed,
    Primary,
}

// --- CompanyRecord ---

/// One discovered/imported company — the unit of enrichment and persistence.
///
/// Placeholder discipline: after completeness enforcement, every required
/// field holds a real value or an exact sentinel (`"Unknown"` /
/// `"Not disclosed"` / empty collection) with a matching entry in
/// `import_missing_fields`. Never an absent required field on a persisted
/// record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub company_name: String,
    #[serde(default)]
    pub company_name_unknown: bool,
    pub website_url: String,
    #[serde(default)]
    pub website_url_unknown: bool,
    #[serde(default)]
    pub canonical_url: String,
    /// Primary dedup key: lower-cased host, `www.` stripped, `"unknown"`
    /// when underivable.
    #[serde(default)]
    pub normalized_domain: String,

    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub industries_unknown: bool,
    #[serde(default)]
    pub product_keywords: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub product_keywords_unknown: bool,
    #[serde(default)]
    pub tagline: String,
    #[serde(default)]
    pub tagline_unknown: bool,

    #[serde(default)]
    pub headquarters_location: String,
    #[serde(default)]
    pub hq_unknown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hq_unknown_reason: Option<MissingReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hq_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hq_lng: Option<f64>,
    #[serde(default)]
    pub headquarters_geocodes: Vec<GeocodedPlace>,

    #[serde(default)]
    pub manufacturing_locations: Vec<String>,
    #[serde(default)]
    pub mfg_unknown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfg_unknown_reason: Option<MissingReason>,
    #[serde(default)]
    pub manufacturing_geocodes: Vec<GeocodedPlace>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_status: Option<LogoStatus>,

    #[serde(default)]
    pub curated_reviews: Vec<CuratedReview>,
    #[serde(default)]
    pub review_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_cursor: Option<ReviewCursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviews_stage_status: Option<ReviewsStageStatus>,

    #[serde(default)]
    pub red_flag: bool,
    #[serde(default)]
    pub red_flag_reason: String,
    #[serde(default)]
    pub location_confidence: LocationConfidence,

    #[serde(default)]
    pub amazon_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub social: BTreeMap<String, String>,

    // Import bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_request_id: Option<String>,
    #[serde(default)]
    pub import_missing_fields: Vec<RequiredField>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub import_missing_reason: BTreeMap<RequiredField, MissingReason>,
    #[serde(default)]
    pub import_warnings: Vec<ImportWarning>,
    /// Per-field attempt counters for low-quality/not-found outcomes,
    /// incremented once per distinct request id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub import_low_quality_attempts: BTreeMap<RequiredField, u32>,
    /// Last request id counted per field — guards against double counting
    /// within one request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub import_low_quality_attempts_meta: BTreeMap<RequiredField, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RecordSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_stage: Option<SourceStage>,
    #[serde(default)]
    pub seed_ready: bool,
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CompanyRecord {
    /// Looks like a seed/placeholder row a later session should merge into
    /// rather than duplicate.
    pub fn looks_incomplete(&self) -> bool {
        self.seed_ready
            || self.source == Some(RecordSource::CompanyUrlShortcut)
            || self.source_stage == Some(SourceStage::Seed)
            || !self.import_missing_fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_pipeline_order() {
        assert!(Stage::Primary < Stage::Keywords);
        assert!(Stage::Keywords < Stage::Reviews);
        assert!(Stage::Reviews < Stage::Location);
        assert!(Stage::Location < Stage::Expand);
    }

    #[test]
    fn stage_round_trips_through_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.to_string().parse::<Stage>().unwrap(), stage);
        }
        assert!("bogus".parse::<Stage>().is_err());
    }

    #[test]
    fn terminal_reasons_are_not_retryable() {
        assert!(MissingReason::NotDisclosed.is_terminal());
        assert!(MissingReason::LowQualityTerminal.is_terminal());
        assert!(MissingReason::NotFoundTerminal.is_terminal());
        assert!(MissingReason::LowQuality.is_retryable());
        assert!(MissingReason::NotFound.is_retryable());
        assert!(MissingReason::ExhaustedRetryable.is_retryable());
        assert!(MissingReason::SeedFromCompanyUrl.is_retryable());
    }

    #[test]
    fn promotion_targets() {
        assert_eq!(
            MissingReason::LowQuality.terminal_variant(),
            Some(MissingReason::LowQualityTerminal)
        );
        assert_eq!(
            MissingReason::NotFound.terminal_variant(),
            Some(MissingReason::NotFoundTerminal)
        );
        assert_eq!(MissingReason::NotDisclosed.terminal_variant(), None);
    }

    #[test]
    fn seed_record_looks_incomplete() {
        let record = CompanyRecord {
            seed_ready: true,
            ..Default::default()
        };
        assert!(record.looks_incomplete());

        let complete = CompanyRecord::default();
        assert!(!complete.looks_incomplete());
    }
}
