//! Session/resume state machine.
//!
//! One control document per session, idempotently upserted on every stage
//! transition, plus three side markers: a resume job document for the
//! resume worker, a completion marker for status pollers, and a stop marker
//! the persistence loop checks between batches. Control documents live in
//! the `import` partition.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use originmap_common::{JobState, RequiredField, SessionStatus, Stage};

use crate::traits::DocumentStore;

pub const CONTROL_PARTITION: &str = "import";

pub fn session_doc_id(session_id: &str) -> String {
    format!("_import_session_{session_id}")
}

pub fn resume_doc_id(session_id: &str) -> String {
    format!("_import_resume_{session_id}")
}

pub fn completion_doc_id(session_id: &str) -> String {
    format!("_import_complete_{session_id}")
}

pub fn stop_marker_id(session_id: &str) -> String {
    format!("_import_stop_{session_id}")
}

pub fn primary_job_id(session_id: &str) -> String {
    format!("_import_primary_job_{session_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub code: String,
    pub message: String,
}

/// Per-entity resume bookkeeping: what is still missing, and which stages
/// already completed for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyMissing {
    pub company_id: String,
    pub missing_fields: Vec<RequiredField>,
    pub keywords_stage_completed: bool,
    pub reviews_stage_completed: bool,
    pub location_stage_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSessionDoc {
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub partition_key: String,
    pub session_id: String,
    pub request_id: String,
    pub status: SessionStatus,
    /// Last checkpoint reached; monotonically advancing diagnostics marker.
    pub stage_beacon: String,
    pub saved_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub saved_company_ids_verified: Vec<String>,
    pub saved_company_ids_unverified: Vec<String>,
    pub deferred_stages: Vec<Stage>,
    pub resume_needed: bool,
    pub missing_by_company: Vec<CompanyMissing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SessionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportSessionDoc {
    pub fn new(session_id: &str, request_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: session_doc_id(session_id),
            doc_type: "import_control".to_string(),
            partition_key: CONTROL_PARTITION.to_string(),
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            status: SessionStatus::Running,
            stage_beacon: "request_received".to_string(),
            saved_count: 0,
            skipped_count: 0,
            failed_count: 0,
            saved_company_ids_verified: Vec::new(),
            saved_company_ids_unverified: Vec::new(),
            deferred_stages: Vec::new(),
            resume_needed: false,
            missing_by_company: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance the checkpoint marker. Stages call this in pipeline order,
    /// so the beacon moves forward through a request.
    pub fn advance_beacon(&mut self, beacon: &str) {
        self.stage_beacon = beacon.to_string();
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStatus {
    InProgress,
    Queued,
    Complete,
    Stalled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeDoc {
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub partition_key: String,
    pub session_id: String,
    pub status: ResumeStatus,
    pub missing_by_company: Vec<CompanyMissing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SessionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable async unit for the primary stage when inline time ran out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryJobDoc {
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub partition_key: String,
    pub session_id: String,
    pub job_state: JobState,
    pub request_payload: Value,
    pub inline_budget_ms: u64,
    pub requested_deadline_ms: Option<u64>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrimaryJobDoc {
    pub fn queued(
        session_id: &str,
        request_payload: Value,
        inline_budget_ms: u64,
        requested_deadline_ms: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: primary_job_id(session_id),
            doc_type: "import_control".to_string(),
            partition_key: CONTROL_PARTITION.to_string(),
            session_id: session_id.to_string(),
            job_state: JobState::Queued,
            request_payload,
            inline_budget_ms,
            requested_deadline_ms,
            attempt: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FinalizeInputs {
    pub saved_write_count: usize,
    /// Entities with retryable missing fields remaining.
    pub missing_by_company: Vec<CompanyMissing>,
    /// Caller allows handing off to the resume worker.
    pub allow_resume: bool,
    /// Resume auth material (job secret / gateway key) is configured.
    pub resume_auth_configured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeDecision {
    /// All stages ran and nothing retryable is missing.
    Complete,
    /// Writes exist but required fields are incomplete: resume worker takes
    /// over, session stays running with resume_needed.
    ResumeQueued,
    /// Resume is needed but no auth material is configured — mark stalled
    /// rather than queue a job nobody can pick up.
    ResumeStalled,
    /// Writes exist, completion is impossible inline, and the caller
    /// disabled resuming: fail deterministically instead of leaving an
    /// ambiguous running state.
    RequiredFieldsMissing,
}

pub fn decide_finalization(inputs: &FinalizeInputs) -> FinalizeDecision {
    let incomplete = inputs
        .missing_by_company
        .iter()
        .any(|m| !m.missing_fields.is_empty());

    if !incomplete {
        return FinalizeDecision::Complete;
    }

    if inputs.saved_write_count > 0 && !inputs.allow_resume {
        return FinalizeDecision::RequiredFieldsMissing;
    }

    if inputs.resume_auth_configured {
        FinalizeDecision::ResumeQueued
    } else {
        FinalizeDecision::ResumeStalled
    }
}

// ---------------------------------------------------------------------------
// SessionStore — control-doc persistence
// ---------------------------------------------------------------------------

pub struct SessionStore {
    store: Arc<dyn DocumentStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Idempotent session upsert. Failures are logged, never raised — a
    /// bookkeeping write must not fail an import that already persisted
    /// entities.
    pub async fn upsert_session(&self, doc: &ImportSessionDoc) {
        match serde_json::to_value(doc) {
            Ok(value) => {
                if let Err(e) = self.store.upsert_control_doc(&value).await {
                    warn!(session_id = doc.session_id.as_str(), error = %e, "session doc upsert failed");
                }
            }
            Err(e) => warn!(error = %e, "session doc serialization failed"),
        }
    }

    pub async fn upsert_resume_doc(&self, doc: &ResumeDoc) {
        if let Ok(value) = serde_json::to_value(doc) {
            if let Err(e) = self.store.upsert_control_doc(&value).await {
                warn!(session_id = doc.session_id.as_str(), error = %e, "resume doc upsert failed");
            }
        }
    }

    pub async fn upsert_primary_job(&self, doc: &PrimaryJobDoc) {
        if let Ok(value) = serde_json::to_value(doc) {
            if let Err(e) = self.store.upsert_control_doc(&value).await {
                warn!(session_id = doc.session_id.as_str(), error = %e, "primary job upsert failed");
            }
        }
    }

    /// Completion marker: status pollers detect terminal state from this
    /// without racing the session doc.
    pub async fn write_completion_marker(&self, session_id: &str, saved_ids: &[String]) {
        let now = Utc::now();
        let doc = serde_json::json!({
            "id": completion_doc_id(session_id),
            "type": "import_control",
            "partition_key": CONTROL_PARTITION,
            "session_id": session_id,
            "completed_at": now,
            "saved": saved_ids.len(),
            "saved_ids": saved_ids,
        });
        if let Err(e) = self.store.upsert_control_doc(&doc).await {
            warn!(session_id, error = %e, "completion marker write failed");
        }
    }

    pub async fn is_stopped(&self, session_id: &str) -> bool {
        matches!(
            self.store.read_control_doc(&stop_marker_id(session_id)).await,
            Ok(Some(_))
        )
    }

    pub async fn load_session(&self, session_id: &str) -> Option<ImportSessionDoc> {
        match self.store.read_control_doc(&session_doc_id(session_id)).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_entry(fields: &[RequiredField]) -> CompanyMissing {
        CompanyMissing {
            company_id: "company_1".to_string(),
            missing_fields: fields.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn complete_when_nothing_missing() {
        let decision = decide_finalization(&FinalizeInputs {
            saved_write_count: 3,
            missing_by_company: vec![missing_entry(&[])],
            allow_resume: true,
            resume_auth_configured: true,
        });
        assert_eq!(decision, FinalizeDecision::Complete);
    }

    #[test]
    fn resume_queued_when_auth_is_configured() {
        let decision = decide_finalization(&FinalizeInputs {
            saved_write_count: 1,
            missing_by_company: vec![missing_entry(&[RequiredField::CuratedReviews])],
            allow_resume: true,
            resume_auth_configured: true,
        });
        assert_eq!(decision, FinalizeDecision::ResumeQueued);
    }

    #[test]
    fn resume_stalls_without_auth_material() {
        let decision = decide_finalization(&FinalizeInputs {
            saved_write_count: 1,
            missing_by_company: vec![missing_entry(&[RequiredField::Logo])],
            allow_resume: true,
            resume_auth_configured: false,
        });
        assert_eq!(decision, FinalizeDecision::ResumeStalled);
    }

    #[test]
    fn disabled_resume_fails_deterministically() {
        let decision = decide_finalization(&FinalizeInputs {
            saved_write_count: 2,
            missing_by_company: vec![missing_entry(&[RequiredField::Industries])],
            allow_resume: false,
            resume_auth_configured: true,
        });
        assert_eq!(decision, FinalizeDecision::RequiredFieldsMissing);
    }

    #[test]
    fn control_doc_ids_are_namespaced() {
        assert_eq!(session_doc_id("s1"), "_import_session_s1");
        assert_eq!(resume_doc_id("s1"), "_import_resume_s1");
        assert_eq!(completion_doc_id("s1"), "_import_complete_s1");
        assert_eq!(stop_marker_id("s1"), "_import_stop_s1");
        assert_eq!(primary_job_id("s1"), "_import_primary_job_s1");
    }
}
