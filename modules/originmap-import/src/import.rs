//! The import orchestrator.
//!
//! One request flows: validate → gate → budget → primary discovery (or
//! deterministic seed fallback) → keywords → geocode → reviews → location
//! refinement → completeness enforcement → save + verify → expansion →
//! session finalization. Running out of budget mid-pipeline defers the
//! remaining stages to the resume worker instead of failing the request.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use originmap_common::{
    looks_like_company_url_query, redact::redact_secrets, Center, CompanyRecord, QualityConfig,
    QueryType, SessionStatus, Stage,
};

use crate::budget::BudgetTracker;
use crate::completeness::{enforce_completeness, retryable_missing_fields, EnforcementContext};
use crate::discovery;
use crate::expand;
use crate::keywords::{self, StageWarning};
use crate::location;
use crate::report::{build_save_report, SaveReport};
use crate::reviews;
use crate::save::{self, SaveOptions, VerifiedSave};
use crate::seed;
use crate::session::{
    decide_finalization, CompanyMissing, FinalizeDecision, FinalizeInputs, ImportSessionDoc,
    PrimaryJobDoc, ResumeDoc, ResumeStatus, SessionError, SessionStore,
};
use crate::stage::{GateRejection, StageGate};
use crate::traits::{DocumentStore, Geocoder, LogoImporter, Upstream};
use crate::upstream::{
    fetch_beacon, StageCallError, StageCaller, StageOutcome, MIN_STAGE_REMAINING_MS,
};

const MAX_LIMIT: usize = 25;
const DEFAULT_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub query: String,
    pub location: Option<String>,
    pub limit: usize,
    pub query_types: Vec<QueryType>,
    /// Pre-seeded entities for skip-primary resumes.
    pub companies: Vec<CompanyRecord>,
    pub debug: bool,
    pub dry_run: bool,
    pub session_id: Option<String>,
    pub center: Option<Center>,
    pub max_stage: Option<Stage>,
    pub skip_stages: Vec<Stage>,
    pub deadline_ms: Option<u64>,
    pub stage_ms_primary: Option<u64>,
    pub save_stub: bool,
    pub allow_resume: bool,
    pub expand_if_few: bool,
}

impl Default for ImportRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            location: None,
            limit: DEFAULT_LIMIT,
            query_types: Vec::new(),
            companies: Vec::new(),
            debug: false,
            dry_run: false,
            session_id: None,
            center: None,
            max_stage: None,
            skip_stages: Vec::new(),
            deadline_ms: None,
            stage_ms_primary: None,
            save_stub: false,
            allow_resume: true,
            expand_if_few: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseWarning {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    pub root_cause: String,
    pub retryable: bool,
}

impl From<StageWarning> for ResponseWarning {
    fn from(w: StageWarning) -> Self {
        Self {
            stage: w.stage,
            company_name: (!w.company_name.is_empty()).then_some(w.company_name),
            root_cause: w.root_cause,
            retryable: w.retryable,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SuccessBody {
    pub ok: bool,
    pub session_id: String,
    pub request_id: String,
    pub status: SessionStatus,
    pub stage_beacon: String,
    pub companies: Vec<CompanyRecord>,
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub save_report: SaveReport,
    pub resume_needed: bool,
    pub deferred_stages: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_after_stage: Option<Stage>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResponseWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct AcceptedBody {
    pub ok: bool,
    pub accepted: bool,
    pub session_id: String,
    pub request_id: String,
    pub stage_beacon: String,
    pub reason: String,
    pub inline_budget_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_deadline_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct FailureBody {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub request_id: String,
    /// HTTP-equivalent status. The transport layer still answers 200.
    pub http_status: u16,
    pub root_cause: String,
    pub retryable: bool,
    pub error_id: String,
    pub stage_beacon: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ImportResponse {
    Success(Box<SuccessBody>),
    Accepted(AcceptedBody),
    Failure(FailureBody),
}

impl ImportResponse {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ImportResponse::Accepted(_))
    }
}

// ---------------------------------------------------------------------------
// Importer
// ---------------------------------------------------------------------------

pub struct Importer {
    store: Arc<dyn DocumentStore>,
    upstream: Arc<dyn Upstream>,
    geocoder: Arc<dyn Geocoder>,
    logo: Arc<dyn LogoImporter>,
    hard_cap_ms: u64,
    quality: QualityConfig,
    resume_auth_configured: bool,
}

struct RunState {
    session_id: String,
    request_id: String,
    budget: BudgetTracker,
    gate: StageGate,
    session: ImportSessionDoc,
    records: Vec<CompanyRecord>,
    warnings: Vec<ResponseWarning>,
    deferred: Vec<Stage>,
}

impl Importer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        upstream: Arc<dyn Upstream>,
        geocoder: Arc<dyn Geocoder>,
        logo: Arc<dyn LogoImporter>,
        hard_cap_ms: u64,
        quality: QualityConfig,
        resume_auth_configured: bool,
    ) -> Self {
        Self {
            store,
            upstream,
            geocoder,
            logo,
            hard_cap_ms,
            quality,
            resume_auth_configured,
        }
    }

    fn sessions(&self) -> SessionStore {
        SessionStore::new(self.store.clone())
    }

    pub async fn run(&self, request: ImportRequest) -> ImportResponse {
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        let session_id = request
            .session_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("sess_{}", Uuid::new_v4().simple()));

        match self.run_inner(&request, &session_id, &request_id).await {
            Ok(response) => response,
            Err(e) => {
                let error_id = format!("err_{}", Uuid::new_v4().simple());
                let message = redact_secrets(&e.to_string());
                error!(
                    session_id = session_id.as_str(),
                    error_id = error_id.as_str(),
                    message = message.as_str(),
                    "import failed with server exception"
                );

                let mut session = ImportSessionDoc::new(&session_id, &request_id);
                session.status = SessionStatus::Error;
                session.last_error = Some(SessionError {
                    code: "server_exception".to_string(),
                    message: message.clone(),
                });
                self.sessions().upsert_session(&session).await;

                ImportResponse::Failure(FailureBody {
                    ok: false,
                    session_id: Some(session_id),
                    request_id,
                    http_status: 500,
                    root_cause: "server_exception".to_string(),
                    retryable: true,
                    error_id,
                    stage_beacon: "server_exception".to_string(),
                    message,
                })
            }
        }
    }

    async fn run_inner(
        &self,
        request: &ImportRequest,
        session_id: &str,
        request_id: &str,
    ) -> anyhow::Result<ImportResponse> {
        let limit = request.limit.clamp(1, MAX_LIMIT);
        let query = request.query.trim().to_string();
        let query_types = if request.query_types.is_empty() {
            vec![QueryType::ProductKeyword]
        } else {
            request.query_types.clone()
        };
        let is_company_url_import = query_types.contains(&QueryType::CompanyUrl);

        let gate = StageGate::new(request.max_stage, request.skip_stages.iter().copied());

        // --- Fail-fast validation, before the budget clock matters ---

        if let Err(rejection) = gate.validate(&request.companies, request.dry_run) {
            return Ok(self.reject(session_id, request_id, rejection));
        }

        if !gate.skips_primary() && query.is_empty() {
            return Ok(client_error(
                session_id,
                request_id,
                400,
                "invalid_request",
                "query is required when the primary stage runs",
            ));
        }

        // A URL-shaped query without company_url intent is almost always a
        // caller bug; refuse rather than run a keyword search for a URL.
        if !query.is_empty() && looks_like_company_url_query(&query) && !is_company_url_import {
            return Ok(client_error(
                session_id,
                request_id,
                400,
                "query_looks_like_company_url",
                "query parses as a URL; set queryTypes=[\"company_url\"] to import it",
            ));
        }

        let budget = BudgetTracker::start(self.hard_cap_ms, request.deadline_ms);
        let sessions = self.sessions();

        let mut session = sessions
            .load_session(session_id)
            .await
            .unwrap_or_else(|| ImportSessionDoc::new(session_id, request_id));
        session.status = SessionStatus::Running;
        session.request_id = request_id.to_string();
        sessions.upsert_session(&session).await;

        let mut state = RunState {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            budget,
            gate,
            session,
            records: Vec::new(),
            warnings: Vec::new(),
            deferred: Vec::new(),
        };

        // --- Primary discovery ---

        if state.gate.should_run(Stage::Primary) {
            match self
                .run_primary(request, &mut state, &query, query_types[0], limit, is_company_url_import)
                .await?
            {
                PrimaryResult::Candidates(records) => state.records = records,
                PrimaryResult::Respond(response) => return Ok(response),
            }
        } else {
            state.records = request.companies.clone();
        }

        if state.gate.should_stop_after(Stage::Primary) {
            return self.finish(request, state, limit, Some(Stage::Primary)).await;
        }

        // --- Keywords / industries ---

        if state.gate.should_run(Stage::Keywords) {
            if state.budget.should_defer_stage(MIN_STAGE_REMAINING_MS) {
                state.deferred.push(Stage::Keywords);
            } else {
                state.session.advance_beacon(&fetch_beacon(Stage::Keywords));
                self.sessions().upsert_session(&state.session).await;

                let caller = StageCaller::new(self.upstream.as_ref(), &state.budget);
                let report =
                    keywords::run_keywords_stage(&caller, &mut state.records, &self.quality).await;
                state.warnings.extend(report.warnings.into_iter().map(Into::into));
                if report.deferred {
                    state.deferred.push(Stage::Keywords);
                }
            }
        }

        if state.gate.should_stop_after(Stage::Keywords) {
            return self.finish(request, state, limit, Some(Stage::Keywords)).await;
        }

        // --- Geocoding (ahead of reviews; refinement comes after) ---

        if state.gate.should_run(Stage::Location) && !state.budget.is_expired() {
            let sessions = self.sessions();
            for record in state.records.iter_mut() {
                if sessions.is_stopped(&state.session_id).await {
                    break;
                }
                location::geocode_record(self.geocoder.as_ref(), record).await;
            }
        }

        // --- Reviews ---

        if state.gate.should_run(Stage::Reviews) {
            self.run_reviews(&mut state).await;
        }

        if state.gate.should_stop_after(Stage::Reviews) {
            return self.finish(request, state, limit, Some(Stage::Reviews)).await;
        }

        // --- Location refinement ---

        if state.gate.should_run(Stage::Location) {
            if state.budget.should_defer_stage(MIN_STAGE_REMAINING_MS) {
                state.deferred.push(Stage::Location);
            } else {
                state.session.advance_beacon(&fetch_beacon(Stage::Location));
                self.sessions().upsert_session(&state.session).await;

                let caller = StageCaller::new(self.upstream.as_ref(), &state.budget);
                let report = location::run_location_refinement(
                    &caller,
                    self.geocoder.as_ref(),
                    &mut state.records,
                )
                .await;
                state.warnings.extend(report.warnings.into_iter().map(Into::into));
                if report.deferred {
                    state.deferred.push(Stage::Location);
                }
            }
        }

        if state.gate.should_stop_after(Stage::Location) {
            return self.finish(request, state, limit, Some(Stage::Location)).await;
        }

        self.finish(request, state, limit, None).await
    }

    async fn run_primary(
        &self,
        request: &ImportRequest,
        state: &mut RunState,
        query: &str,
        query_type: QueryType,
        limit: usize,
        is_company_url_import: bool,
    ) -> anyhow::Result<PrimaryResult> {
        state.session.advance_beacon(&fetch_beacon(Stage::Primary));
        self.sessions().upsert_session(&state.session).await;

        let discovery_request = discovery::discovery_request(
            query,
            query_type,
            limit,
            request.location.as_deref(),
            request.center,
        );

        let caller = StageCaller::new(self.upstream.as_ref(), &state.budget);
        let outcome = caller
            .call_with_retry(Stage::Primary, &discovery_request, request.stage_ms_primary)
            .await;

        match outcome {
            Ok(StageOutcome::Continue(response)) if response.is_success() => {
                let candidates =
                    discovery::parse_candidates(&response, limit, &state.session_id);
                info!(count = candidates.len(), "primary discovery returned candidates");

                if candidates.is_empty() {
                    // A clean zero-result discovery completes the session.
                    let sessions = self.sessions();
                    state.session.status = SessionStatus::Complete;
                    state.session.advance_beacon("discovery_empty");
                    sessions.upsert_session(&state.session).await;
                    sessions
                        .write_completion_marker(&state.session_id, &[])
                        .await;

                    return Ok(PrimaryResult::Respond(ImportResponse::Success(Box::new(
                        SuccessBody {
                            ok: true,
                            session_id: state.session_id.clone(),
                            request_id: state.request_id.clone(),
                            status: SessionStatus::Complete,
                            stage_beacon: state.session.stage_beacon.clone(),
                            companies: Vec::new(),
                            saved: 0,
                            skipped: 0,
                            failed: 0,
                            save_report: SaveReport::default(),
                            resume_needed: false,
                            deferred_stages: Vec::new(),
                            stopped_after_stage: None,
                            dry_run: request.dry_run,
                            warnings: Vec::new(),
                            debug: None,
                        },
                    ))));
                }

                Ok(PrimaryResult::Candidates(candidates))
            }
            Ok(StageOutcome::Continue(response)) => {
                // Upstream answered with an error status and nothing has
                // been persisted yet: request-level failure.
                let error_id = format!("err_{}", Uuid::new_v4().simple());
                state.session.status = SessionStatus::Error;
                state.session.last_error = Some(SessionError {
                    code: "upstream_unreachable".to_string(),
                    message: format!("upstream HTTP {}", response.status),
                });
                self.sessions().upsert_session(&state.session).await;

                Ok(PrimaryResult::Respond(ImportResponse::Failure(FailureBody {
                    ok: false,
                    session_id: Some(state.session_id.clone()),
                    request_id: state.request_id.clone(),
                    http_status: 502,
                    root_cause: "upstream_unreachable".to_string(),
                    retryable: true,
                    error_id,
                    stage_beacon: state.session.stage_beacon.clone(),
                    message: format!("discovery upstream returned HTTP {}", response.status),
                })))
            }
            Ok(StageOutcome::Accepted(signal)) => {
                if is_company_url_import {
                    // Company-URL imports never answer accepted/async —
                    // fall back to the deterministic seed and continue.
                    info!(reason = %signal.reason, "primary accepted; using company-url seed fallback");
                    return Ok(PrimaryResult::Candidates(vec![seed::seed_from_company_url(
                        query,
                        &state.session_id,
                    )]));
                }

                let payload = serde_json::json!({
                    "query": query,
                    "query_type": query_type,
                    "limit": limit,
                    "location": request.location,
                });
                let job = PrimaryJobDoc::queued(
                    &state.session_id,
                    payload,
                    signal.inline_budget_ms,
                    state.budget.requested_ms(),
                );
                let sessions = self.sessions();
                sessions.upsert_primary_job(&job).await;
                state.session.advance_beacon(&signal.stage_beacon);
                sessions.upsert_session(&state.session).await;

                Ok(PrimaryResult::Respond(ImportResponse::Accepted(AcceptedBody {
                    ok: true,
                    accepted: true,
                    session_id: state.session_id.clone(),
                    request_id: state.request_id.clone(),
                    stage_beacon: signal.stage_beacon,
                    reason: signal.reason.to_string(),
                    inline_budget_ms: signal.inline_budget_ms,
                    requested_deadline_ms: state.budget.requested_ms(),
                })))
            }
            Err(StageCallError::InvalidPayload(message)) => Ok(PrimaryResult::Respond(
                client_error(
                    &state.session_id,
                    &state.request_id,
                    400,
                    "client_bad_request",
                    &message,
                ),
            )),
            Err(e) => {
                let error_id = format!("err_{}", Uuid::new_v4().simple());
                state.session.status = SessionStatus::Error;
                state.session.last_error = Some(SessionError {
                    code: "upstream_unreachable".to_string(),
                    message: e.to_string(),
                });
                self.sessions().upsert_session(&state.session).await;

                Ok(PrimaryResult::Respond(ImportResponse::Failure(FailureBody {
                    ok: false,
                    session_id: Some(state.session_id.clone()),
                    request_id: state.request_id.clone(),
                    http_status: 502,
                    root_cause: "upstream_unreachable".to_string(),
                    retryable: e.is_retryable(),
                    error_id,
                    stage_beacon: state.session.stage_beacon.clone(),
                    message: e.to_string(),
                })))
            }
        }
    }

    /// Reviews run per entity, sequentially — each is a Live Search call —
    /// with a budget check before every entity.
    async fn run_reviews(&self, state: &mut RunState) {
        state.session.advance_beacon(&fetch_beacon(Stage::Reviews));
        self.sessions().upsert_session(&state.session).await;

        for idx in 0..state.records.len() {
            if state.budget.should_defer_stage(MIN_STAGE_REMAINING_MS) {
                if !state.deferred.contains(&Stage::Reviews) {
                    state.deferred.push(Stage::Reviews);
                }
                break;
            }
            if self.sessions().is_stopped(&state.session_id).await {
                break;
            }

            let record = &mut state.records[idx];
            if record.curated_reviews.len() >= self.quality.max_reviews_per_company {
                continue;
            }
            if record.company_name.trim().is_empty() || record.website_url.trim().is_empty() {
                state.warnings.push(ResponseWarning {
                    stage: Stage::Reviews,
                    company_name: Some(record.company_name.clone()),
                    root_cause: "client_bad_request".to_string(),
                    retryable: false,
                });
                continue;
            }

            let request = reviews::reviews_request(record);
            let caller = StageCaller::new(self.upstream.as_ref(), &state.budget);
            match caller.call_with_retry(Stage::Reviews, &request, None).await {
                Ok(StageOutcome::Continue(response)) if response.is_success() => {
                    let fetched = reviews::parse_review_candidates(&response);
                    let selection = reviews::select_reviews(
                        &fetched.candidates,
                        &record.website_url,
                        &record.curated_reviews,
                        &self.quality,
                        Some(&state.budget),
                    );
                    reviews::apply_review_fetch(record, &fetched, selection);
                }
                Ok(StageOutcome::Continue(response)) => {
                    reviews::record_review_fetch_failure(
                        record,
                        &format!("upstream HTTP {}", response.status),
                    );
                    state.warnings.push(ResponseWarning {
                        stage: Stage::Reviews,
                        company_name: Some(record.company_name.clone()),
                        root_cause: format!("upstream_http_{}", response.status),
                        retryable: true,
                    });
                }
                Ok(StageOutcome::Accepted(_)) => unreachable!("non-primary stages never accept"),
                Err(StageCallError::InsufficientTime { .. }) => {
                    if !state.deferred.contains(&Stage::Reviews) {
                        state.deferred.push(Stage::Reviews);
                    }
                    break;
                }
                Err(e) => {
                    reviews::record_review_fetch_failure(record, &e.to_string());
                    state.warnings.push(ResponseWarning {
                        stage: Stage::Reviews,
                        company_name: Some(record.company_name.clone()),
                        root_cause: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }
    }

    /// Shared tail: enforce completeness, persist + verify, optionally
    /// expand, finalize the session, build the response.
    async fn finish(
        &self,
        request: &ImportRequest,
        mut state: RunState,
        limit: usize,
        stopped_after: Option<Stage>,
    ) -> anyhow::Result<ImportResponse> {
        let sessions = self.sessions();

        // Completeness enforcement — pure, per record.
        let ctx = EnforcementContext {
            request_id: Some(&state.request_id),
            quality: &self.quality,
        };
        let drained = std::mem::take(&mut state.records);
        state.records = drained
            .into_iter()
            .map(|record| enforce_completeness(record, &ctx).record)
            .collect();

        // Persistence.
        let save_opts = SaveOptions {
            save_stub: request.save_stub,
            allow_update_existing: state.gate.skips_primary()
                || request.query_types.contains(&QueryType::CompanyUrl),
        };

        let mut verified = if request.dry_run {
            VerifiedSave::default()
        } else {
            state.session.advance_beacon("save_companies");
            sessions.upsert_session(&state.session).await;

            let write = save::save_companies(
                &self.store,
                &self.logo,
                &state.budget,
                &state.records,
                &state.session_id,
                &save_opts,
            )
            .await;
            save::verify_saved(&self.store, write).await
        };

        // Expansion — one broader call when the yield was thin.
        if stopped_after.is_none()
            && state.gate.should_run(Stage::Expand)
            && request.expand_if_few
            && !request.dry_run
            && expand::should_expand(verified.saved_write_count(), limit, &self.quality)
        {
            if state.budget.should_defer_stage(MIN_STAGE_REMAINING_MS) {
                state.deferred.push(Stage::Expand);
            } else {
                self.run_expansion(request, &mut state, limit, &save_opts, &mut verified)
                    .await;
            }
        }

        // Session finalization.
        let missing_by_company = self.collect_missing(&state, &verified);
        let decision = decide_finalization(&FinalizeInputs {
            saved_write_count: verified.saved_write_count(),
            missing_by_company: missing_by_company.clone(),
            allow_resume: request.allow_resume,
            resume_auth_configured: self.resume_auth_configured,
        });

        let save_report = build_save_report(&verified);
        state.session.saved_count = save_report.saved;
        state.session.skipped_count = save_report.skipped;
        state.session.failed_count = save_report.failed;
        state.session.saved_company_ids_verified = save_report.saved_ids_verified.clone();
        state.session.saved_company_ids_unverified = save_report.saved_ids_unverified.clone();
        state.session.deferred_stages = state.deferred.clone();
        state.session.missing_by_company = missing_by_company.clone();

        let now = chrono::Utc::now();
        let mut resume_needed = false;
        let mut status = SessionStatus::Running;

        match decision {
            FinalizeDecision::Complete => {
                if stopped_after.is_some() {
                    // Reaching max_stage cleanly ends the response, not the
                    // session — a later call continues it.
                    state.session.advance_beacon("stopped_after_stage");
                } else {
                    status = SessionStatus::Complete;
                    state.session.status = status;
                    state.session.advance_beacon("enrichment_complete");
                    sessions
                        .write_completion_marker(&state.session_id, &save_report.saved_ids)
                        .await;
                }
            }
            FinalizeDecision::ResumeQueued => {
                resume_needed = true;
                state.session.resume_needed = true;
                state.session.advance_beacon("enrichment_partial");
                sessions
                    .upsert_resume_doc(&ResumeDoc {
                        id: crate::session::resume_doc_id(&state.session_id),
                        doc_type: "import_control".to_string(),
                        partition_key: crate::session::CONTROL_PARTITION.to_string(),
                        session_id: state.session_id.clone(),
                        status: ResumeStatus::Queued,
                        missing_by_company,
                        last_error: None,
                        created_at: now,
                        updated_at: now,
                    })
                    .await;
            }
            FinalizeDecision::ResumeStalled => {
                resume_needed = true;
                status = SessionStatus::Stalled;
                state.session.status = status;
                state.session.resume_needed = true;
                state.session.last_error = Some(SessionError {
                    code: "resume_auth_missing".to_string(),
                    message: "resume needed but no internal job secret or gateway key is configured"
                        .to_string(),
                });
                sessions
                    .upsert_resume_doc(&ResumeDoc {
                        id: crate::session::resume_doc_id(&state.session_id),
                        doc_type: "import_control".to_string(),
                        partition_key: crate::session::CONTROL_PARTITION.to_string(),
                        session_id: state.session_id.clone(),
                        status: ResumeStatus::Stalled,
                        missing_by_company,
                        last_error: state.session.last_error.clone(),
                        created_at: now,
                        updated_at: now,
                    })
                    .await;
            }
            FinalizeDecision::RequiredFieldsMissing => {
                status = SessionStatus::Error;
                state.session.status = status;
                state.session.last_error = Some(SessionError {
                    code: "REQUIRED_FIELDS_MISSING".to_string(),
                    message: "required fields incomplete within the inline budget and resuming is disabled"
                        .to_string(),
                });
                sessions.upsert_session(&state.session).await;

                return Ok(ImportResponse::Failure(FailureBody {
                    ok: false,
                    session_id: Some(state.session_id.clone()),
                    request_id: state.request_id.clone(),
                    http_status: 422,
                    root_cause: "required_fields_missing".to_string(),
                    retryable: false,
                    error_id: format!("err_{}", Uuid::new_v4().simple()),
                    stage_beacon: state.session.stage_beacon.clone(),
                    message: "persisted entities are missing required fields and allow_resume=false"
                        .to_string(),
                }));
            }
        }

        sessions.upsert_session(&state.session).await;

        let debug = request.debug.then(|| {
            serde_json::json!({
                "remaining_budget_ms": state.budget.remaining_ms(),
                "elapsed_ms": state.budget.elapsed_ms(),
                "hard_cap_ms": state.budget.hard_cap_ms(),
                "record_count": state.records.len(),
                "deferred_stages": state.deferred.clone(),
            })
        });

        Ok(ImportResponse::Success(Box::new(SuccessBody {
            ok: true,
            session_id: state.session_id,
            request_id: state.request_id,
            status,
            stage_beacon: state.session.stage_beacon.clone(),
            companies: state.records,
            saved: save_report.saved,
            skipped: save_report.skipped,
            failed: save_report.failed,
            save_report,
            resume_needed,
            deferred_stages: state.deferred,
            stopped_after_stage: stopped_after,
            dry_run: request.dry_run,
            warnings: state.warnings,
            debug,
        })))
    }

    async fn run_expansion(
        &self,
        request: &ImportRequest,
        state: &mut RunState,
        limit: usize,
        save_opts: &SaveOptions,
        verified: &mut VerifiedSave,
    ) {
        state.session.advance_beacon(&fetch_beacon(Stage::Expand));
        self.sessions().upsert_session(&state.session).await;

        let known = expand::known_domains(&state.records);
        let expansion_request = expand::expansion_request(&request.query, limit, &known);
        let caller = StageCaller::new(self.upstream.as_ref(), &state.budget);

        match caller.call_with_retry(Stage::Expand, &expansion_request, None).await {
            Ok(StageOutcome::Continue(response)) if response.is_success() => {
                let ctx = EnforcementContext {
                    request_id: Some(&state.request_id),
                    quality: &self.quality,
                };
                let extra: Vec<CompanyRecord> =
                    discovery::parse_candidates(&response, limit, &state.session_id)
                        .into_iter()
                        .filter(|c| !known.contains(&c.normalized_domain))
                        .map(|c| enforce_completeness(c, &ctx).record)
                        .collect();

                if extra.is_empty() {
                    return;
                }

                let write = save::save_companies(
                    &self.store,
                    &self.logo,
                    &state.budget,
                    &extra,
                    &state.session_id,
                    save_opts,
                )
                .await;
                let extra_verified = save::verify_saved(&self.store, write).await;

                state.records.extend(extra);
                verified.write.written.extend(extra_verified.write.written);
                verified.write.skipped.extend(extra_verified.write.skipped);
                verified.write.failed.extend(extra_verified.write.failed);
                verified.verified_ids.extend(extra_verified.verified_ids);
                verified.unverified_ids.extend(extra_verified.unverified_ids);
            }
            Ok(StageOutcome::Continue(response)) => {
                state.warnings.push(ResponseWarning {
                    stage: Stage::Expand,
                    company_name: None,
                    root_cause: format!("upstream_http_{}", response.status),
                    retryable: true,
                });
            }
            Ok(StageOutcome::Accepted(_)) => unreachable!("non-primary stages never accept"),
            Err(StageCallError::InsufficientTime { .. }) => {
                state.deferred.push(Stage::Expand);
            }
            Err(e) => {
                warn!(error = %e, "expansion fetch failed");
                state.warnings.push(ResponseWarning {
                    stage: Stage::Expand,
                    company_name: None,
                    root_cause: e.to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
    }

    fn collect_missing(&self, state: &RunState, verified: &VerifiedSave) -> Vec<CompanyMissing> {
        let keywords_done = !state.deferred.contains(&Stage::Keywords);
        let reviews_done = !state.deferred.contains(&Stage::Reviews);
        let location_done = !state.deferred.contains(&Stage::Location);

        verified
            .write
            .written
            .iter()
            .filter_map(|item| {
                let record = state.records.iter().find(|r| {
                    r.id.as_deref() == Some(item.id.as_str())
                        || r.normalized_domain == item.normalized_domain
                })?;
                Some(CompanyMissing {
                    company_id: item.id.clone(),
                    missing_fields: retryable_missing_fields(record, &self.quality),
                    keywords_stage_completed: keywords_done,
                    reviews_stage_completed: reviews_done,
                    location_stage_completed: location_done,
                })
            })
            .collect()
    }

    fn reject(&self, session_id: &str, request_id: &str, rejection: GateRejection) -> ImportResponse {
        match rejection {
            GateRejection::MissingSeedCompanies => ImportResponse::Failure(FailureBody {
                ok: false,
                session_id: Some(session_id.to_string()),
                request_id: request_id.to_string(),
                http_status: 409,
                root_cause: "missing_seed_companies".to_string(),
                retryable: true,
                error_id: format!("err_{}", Uuid::new_v4().simple()),
                stage_beacon: "request_validation".to_string(),
                message: "skip_stages excludes primary but no valid seed companies were supplied"
                    .to_string(),
            }),
            GateRejection::NonTerminalCapWithoutDryRun(stage) => client_error(
                session_id,
                request_id,
                400,
                "invalid_request",
                &format!("max_stage={stage} requires dry_run — results would not persist"),
            ),
        }
    }
}

enum PrimaryResult {
    Candidates(Vec<CompanyRecord>),
    Respond(ImportResponse),
}

fn client_error(
    session_id: &str,
    request_id: &str,
    http_status: u16,
    root_cause: &str,
    message: &str,
) -> ImportResponse {
    ImportResponse::Failure(FailureBody {
        ok: false,
        session_id: Some(session_id.to_string()),
        request_id: request_id.to_string(),
        http_status,
        root_cause: root_cause.to_string(),
        retryable: false,
        error_id: format!("err_{}", Uuid::new_v4().simple()),
        stage_beacon: "request_validation".to_string(),
        message: message.to_string(),
    })
}
