//! End-to-end import flows against the in-memory mocks.

use std::sync::Arc;

use serde_json::json;

use originmap_common::{MissingReason, QualityConfig, QueryType, SessionStatus, Stage};
use originmap_import::import::{ImportRequest, ImportResponse, Importer};
use originmap_import::session;
use originmap_import::testing::{
    FixedGeocoder, MemoryStore, MockLogoImporter, MockReply, MockUpstream,
};
use originmap_import::traits::LogoImporter;

const HARD_CAP_MS: u64 = 25_000;

struct Harness {
    store: Arc<MemoryStore>,
    upstream: Arc<MockUpstream>,
    importer: Importer,
}

fn harness(upstream: MockUpstream, geocoder: FixedGeocoder, logo_found: bool) -> Harness {
    harness_with(upstream, geocoder, logo_found, true, HARD_CAP_MS)
}

fn harness_with(
    upstream: MockUpstream,
    geocoder: FixedGeocoder,
    logo_found: bool,
    resume_auth: bool,
    hard_cap_ms: u64,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let upstream = Arc::new(upstream);
    let logo: Arc<dyn LogoImporter> = if logo_found {
        Arc::new(MockLogoImporter::found())
    } else {
        Arc::new(MockLogoImporter::not_found())
    };

    let importer = Importer::new(
        store.clone(),
        upstream.clone(),
        Arc::new(geocoder),
        logo,
        hard_cap_ms,
        QualityConfig::default(),
        resume_auth,
    );

    Harness {
        store,
        upstream,
        importer,
    }
}

fn company_json(name: &str, domain: &str) -> serde_json::Value {
    json!({
        "company_name": name,
        "website_url": format!("https://{domain}"),
        "industries": ["Skincare"],
        "product_keywords": "lavender soap, oat bar, shea butter bar, bath bomb, \
            lip balm, hand cream, foot scrub, body butter, soap dish, travel tin, \
            gift box, exfoliating bar",
        "tagline": "Honest small-batch soap",
        "headquarters_location": "Portland, OR",
        "manufacturing_locations": ["Eugene, OR"],
    })
}

fn reviews_reply() -> MockReply {
    MockReply::json(json!({
        "reviews": [
            { "source_url": "https://soapmag.example/review", "excerpt": "A standout bar.", "source_name": "Soap Magazine" },
            { "source_url": "https://cleanliving.example/tested", "excerpt": "Held up in testing.", "source_name": "Clean Living" }
        ],
        "exhausted": false
    }))
}

fn success(response: ImportResponse) -> originmap_import::import::SuccessBody {
    match response {
        ImportResponse::Success(body) => *body,
        other => panic!("expected success, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Scenario: product_keyword query, ample budget — everything inline.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn product_keyword_import_completes_inline() {
    let discovery = json!([
        company_json("Acme Soap", "acmesoap.com"),
        company_json("Bubble Works", "bubbleworks.com"),
        company_json("Suds & Co", "sudsco.com"),
        company_json("Lather Lab", "latherlab.com"),
        company_json("Pure Bars", "purebars.com"),
    ]);

    let upstream = MockUpstream::new()
        .on("business research assistant", MockReply::json(discovery))
        .on("Find independent reviews", reviews_reply());

    let geocoder = FixedGeocoder::new()
        .on("Portland, OR", 45.52, -122.67)
        .on("Eugene, OR", 44.05, -123.09);

    let h = harness(upstream, geocoder, true);

    let response = h
        .importer
        .run(ImportRequest {
            query: "organic soap".to_string(),
            limit: 5,
            query_types: vec![QueryType::ProductKeyword],
            ..Default::default()
        })
        .await;

    let body = success(response);
    assert!(body.ok);
    assert_eq!(body.saved, 5);
    assert_eq!(body.save_report.saved_ids.len(), 5);
    assert!(!body.resume_needed);
    assert_eq!(body.status, SessionStatus::Complete);
    assert!(body.deferred_stages.is_empty());

    // All five persisted, each with coordinates, a logo, and two reviews.
    assert_eq!(h.store.company_count(), 5);
    for company in h.store.all_companies() {
        assert_eq!(company.hq_lat, Some(45.52));
        assert!(company.logo_url.is_some());
        assert_eq!(company.curated_reviews.len(), 2);
        assert!(company.import_missing_fields.is_empty());
    }

    // Completion marker written.
    assert!(h
        .store
        .get_control_doc(&session::completion_doc_id(&body.session_id))
        .is_some());
}

// ---------------------------------------------------------------------------
// Scenario: company_url import with the discovery upstream timing out —
// never accepted; the deterministic seed persists instead.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn company_url_timeout_falls_back_to_seed() {
    let upstream = MockUpstream::new()
        .on("business research assistant", MockReply::Timeout)
        .on("product keyword list", MockReply::json(json!({ "keywords": [] })))
        .on("classifying a company", MockReply::json(json!({ "industries": [], "tagline": "" })))
        .on(
            "Find independent reviews",
            MockReply::json(json!({ "reviews": [], "exhausted": true })),
        )
        .on("Research the headquarters", MockReply::json(json!([])));

    let h = harness(upstream, FixedGeocoder::new(), false);

    let response = h
        .importer
        .run(ImportRequest {
            query: "acme-example.com".to_string(),
            limit: 1,
            query_types: vec![QueryType::CompanyUrl],
            ..Default::default()
        })
        .await;

    assert!(!response.is_accepted());
    let body = success(response);
    assert!(body.resume_needed);
    assert_eq!(body.status, SessionStatus::Running);

    assert_eq!(h.store.company_count(), 1);
    let seed = h.store.all_companies().remove(0);
    assert_eq!(seed.company_name, "Acme-example");
    assert_eq!(seed.normalized_domain, "acme-example.com");
    assert_eq!(seed.hq_unknown_reason, Some(MissingReason::SeedFromCompanyUrl));

    // The write exists but the seed is incomplete, so it cannot verify.
    assert_eq!(body.save_report.saved_write_count, 1);
    assert_eq!(body.save_report.saved_verified_count, 0);

    // Resume job queued for the missing fields.
    let resume = h
        .store
        .get_control_doc(&session::resume_doc_id(&body.session_id))
        .expect("resume doc");
    assert_eq!(resume["status"], "queued");
}

// ---------------------------------------------------------------------------
// Scenario: skip primary without seeds.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn skip_primary_without_seeds_is_rejected() {
    let h = harness(MockUpstream::new(), FixedGeocoder::new(), false);

    let response = h
        .importer
        .run(ImportRequest {
            query: "anything".to_string(),
            skip_stages: vec![Stage::Primary],
            companies: Vec::new(),
            ..Default::default()
        })
        .await;

    match response {
        ImportResponse::Failure(body) => {
            assert!(!body.ok);
            assert_eq!(body.root_cause, "missing_seed_companies");
            assert_eq!(body.http_status, 409);
            assert!(body.retryable);
        }
        other => panic!("expected failure, got {other:?}"),
    }

    assert_eq!(h.store.company_count(), 0);
    assert_eq!(h.upstream.call_count(), 0);
}

// ---------------------------------------------------------------------------
// Idempotent dedup: the same company imported in two sessions never creates
// two documents for the same normalized_domain.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_session_skips_or_merges_same_domain() {
    let discovery = json!([company_json("Acme Soap", "acmesoap.com")]);

    let upstream = MockUpstream::new()
        .on("business research assistant", MockReply::json(discovery.clone()))
        .on("business research assistant", MockReply::json(discovery))
        .on("Find independent reviews", reviews_reply())
        .on("Broaden the search", MockReply::json(json!([])));

    let geocoder = FixedGeocoder::new()
        .on("Portland, OR", 45.52, -122.67)
        .on("Eugene, OR", 44.05, -123.09);

    let h = harness(upstream, geocoder, true);

    let request = ImportRequest {
        query: "organic soap".to_string(),
        limit: 1,
        query_types: vec![QueryType::ProductKeyword],
        ..Default::default()
    };

    let first = success(h.importer.run(request.clone()).await);
    assert_eq!(first.saved, 1);
    assert_eq!(h.store.company_count(), 1);

    let second = success(h.importer.run(request).await);
    assert_eq!(h.store.company_count(), 1, "no duplicate document");
    assert_eq!(second.saved, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(
        second.save_report.skipped_duplicates[0].reason, "duplicate",
        "second import skips against the first"
    );
}

// ---------------------------------------------------------------------------
// Accepted/async: keyword import with no time for primary hands off to the
// queued job.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn keyword_import_timeout_answers_accepted() {
    let upstream = MockUpstream::new().on("business research assistant", MockReply::Timeout);
    let h = harness(upstream, FixedGeocoder::new(), false);

    let response = h
        .importer
        .run(ImportRequest {
            query: "organic soap".to_string(),
            query_types: vec![QueryType::ProductKeyword],
            ..Default::default()
        })
        .await;

    let ImportResponse::Accepted(body) = response else {
        panic!("expected accepted response");
    };
    assert!(body.accepted);
    assert_eq!(body.reason, "upstream_timeout");

    // Durable primary job queued for the worker.
    let job = h
        .store
        .get_control_doc(&session::primary_job_id(&body.session_id))
        .expect("primary job doc");
    assert_eq!(job["job_state"], "queued");
    assert_eq!(h.store.company_count(), 0);
}

// ---------------------------------------------------------------------------
// Resume disabled: persisted-but-incomplete fails deterministically.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn incomplete_with_resume_disabled_fails_deterministically() {
    let discovery = json!([{
        "company_name": "Mystery Makers",
        "website_url": "https://mysterymakers.example",
        "industries": ["Skincare"],
        "product_keywords": "mystery balm",
    }]);

    let upstream = MockUpstream::new()
        .on("business research assistant", MockReply::json(discovery))
        .on("product keyword list", MockReply::json(json!({ "keywords": [] })))
        .on("classifying a company", MockReply::json(json!({ "industries": [], "tagline": "" })))
        .on(
            "Find independent reviews",
            MockReply::json(json!({ "reviews": [], "exhausted": false })),
        )
        .on("Research the headquarters", MockReply::json(json!([])))
        .on("Broaden the search", MockReply::json(json!([])));

    let h = harness(upstream, FixedGeocoder::new(), false);

    let response = h
        .importer
        .run(ImportRequest {
            query: "mystery products".to_string(),
            limit: 1,
            query_types: vec![QueryType::ProductKeyword],
            allow_resume: false,
            ..Default::default()
        })
        .await;

    match response {
        ImportResponse::Failure(body) => {
            assert_eq!(body.root_cause, "required_fields_missing");
            assert!(!body.retryable);
        }
        other => panic!("expected deterministic failure, got {other:?}"),
    }

    // The entity itself was persisted before the failure was declared.
    assert_eq!(h.store.company_count(), 1);
}

// ---------------------------------------------------------------------------
// Missing resume auth: the resume record stalls instead of queueing forever.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_without_auth_material_stalls() {
    let discovery = json!([{
        "company_name": "Mystery Makers",
        "website_url": "https://mysterymakers.example",
        "industries": ["Skincare"],
        "product_keywords": "mystery balm",
    }]);

    let upstream = MockUpstream::new()
        .on("business research assistant", MockReply::json(discovery))
        .on("product keyword list", MockReply::json(json!({ "keywords": [] })))
        .on("classifying a company", MockReply::json(json!({ "industries": [], "tagline": "" })))
        .on(
            "Find independent reviews",
            MockReply::json(json!({ "reviews": [], "exhausted": false })),
        )
        .on("Research the headquarters", MockReply::json(json!([])))
        .on("Broaden the search", MockReply::json(json!([])));

    let h = harness_with(upstream, FixedGeocoder::new(), false, false, HARD_CAP_MS);

    let response = h
        .importer
        .run(ImportRequest {
            query: "mystery products".to_string(),
            limit: 1,
            query_types: vec![QueryType::ProductKeyword],
            ..Default::default()
        })
        .await;

    let body = success(response);
    assert!(body.resume_needed);
    assert_eq!(body.status, SessionStatus::Stalled);

    let resume = h
        .store
        .get_control_doc(&session::resume_doc_id(&body.session_id))
        .expect("resume doc");
    assert_eq!(resume["status"], "stalled");
    assert!(resume["last_error"]["message"]
        .as_str()
        .unwrap()
        .contains("no internal job secret"));
}

// ---------------------------------------------------------------------------
// Expansion: thin primary yield triggers one broader call.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn thin_yield_triggers_expansion() {
    let primary = json!([company_json("Acme Soap", "acmesoap.com")]);
    let expansion = json!([
        company_json("Bubble Works", "bubbleworks.com"),
        company_json("Suds & Co", "sudsco.com"),
    ]);

    let upstream = MockUpstream::new()
        .on("business research assistant", MockReply::json(primary))
        .on("Broaden the search", MockReply::json(expansion))
        .on("Find independent reviews", reviews_reply());

    let geocoder = FixedGeocoder::new()
        .on("Portland, OR", 45.52, -122.67)
        .on("Eugene, OR", 44.05, -123.09);

    let h = harness(upstream, geocoder, true);

    let body = success(
        h.importer
            .run(ImportRequest {
                query: "organic soap".to_string(),
                limit: 5,
                query_types: vec![QueryType::ProductKeyword],
                ..Default::default()
            })
            .await,
    );

    // 1 primary + 2 expansion entities persisted.
    assert_eq!(h.store.company_count(), 3);
    assert_eq!(body.save_report.saved_write_count, 3);
    assert!(h
        .upstream
        .calls()
        .iter()
        .any(|c| c.contains("Broaden the search")));
    // The exclusion list names the already-found domain.
    assert!(h
        .upstream
        .calls()
        .iter()
        .any(|c| c.contains("Broaden the search") && c.contains("acmesoap.com")));
}

// ---------------------------------------------------------------------------
// User-initiated stop: per-entity review/geocode work is skipped once the
// stop marker exists; already-written state is kept.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_marker_skips_per_entity_work() {
    let discovery = json!([company_json("Acme Soap", "acmesoap.com")]);
    let upstream = MockUpstream::new()
        .on("business research assistant", MockReply::json(discovery))
        .on("Research the headquarters", MockReply::json(json!([])))
        .on("Broaden the search", MockReply::json(json!([])));

    let h = harness(upstream, FixedGeocoder::new(), true);

    // The stop marker is set before the run (user aborted immediately).
    h.store.set_control_doc(
        &session::stop_marker_id("sess_stop"),
        json!({ "id": session::stop_marker_id("sess_stop"), "stopped": true }),
    );

    let body = success(
        h.importer
            .run(ImportRequest {
                query: "organic soap".to_string(),
                limit: 1,
                query_types: vec![QueryType::ProductKeyword],
                session_id: Some("sess_stop".to_string()),
                ..Default::default()
            })
            .await,
    );

    // Reviews were never fetched for the entity.
    assert!(h
        .upstream
        .calls()
        .iter()
        .all(|c| !c.contains("Find independent reviews")));
    // The first persistence batch still went through.
    assert_eq!(body.save_report.saved_write_count, 1);
}

// ---------------------------------------------------------------------------
// max_stage=primary with dry_run: gate stops the pipeline, nothing persists.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn max_stage_primary_dry_run_stops_early() {
    let discovery = json!([company_json("Acme Soap", "acmesoap.com")]);
    let upstream =
        MockUpstream::new().on("business research assistant", MockReply::json(discovery));

    let h = harness(upstream, FixedGeocoder::new(), false);

    let body = success(
        h.importer
            .run(ImportRequest {
                query: "organic soap".to_string(),
                limit: 5,
                query_types: vec![QueryType::ProductKeyword],
                max_stage: Some(Stage::Primary),
                dry_run: true,
                ..Default::default()
            })
            .await,
    );

    assert_eq!(body.stopped_after_stage, Some(Stage::Primary));
    assert!(body.dry_run);
    assert_eq!(h.store.company_count(), 0);
    // Only the discovery call ran.
    assert_eq!(h.upstream.call_count(), 1);
    // Session stays running — a later call may continue it.
    assert_eq!(body.status, SessionStatus::Running);
}

// ---------------------------------------------------------------------------
// Non-terminal max_stage without dry_run is refused up front.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_terminal_cap_without_dry_run_is_rejected() {
    let h = harness(MockUpstream::new(), FixedGeocoder::new(), false);

    let response = h
        .importer
        .run(ImportRequest {
            query: "organic soap".to_string(),
            max_stage: Some(Stage::Reviews),
            ..Default::default()
        })
        .await;

    match response {
        ImportResponse::Failure(body) => {
            assert_eq!(body.http_status, 400);
            assert_eq!(body.root_cause, "invalid_request");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(h.upstream.call_count(), 0);
}

// ---------------------------------------------------------------------------
// URL-shaped query without company_url intent is refused.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn url_query_without_company_url_type_is_rejected() {
    let h = harness(MockUpstream::new(), FixedGeocoder::new(), false);

    let response = h
        .importer
        .run(ImportRequest {
            query: "acme-example.com".to_string(),
            query_types: vec![QueryType::ProductKeyword],
            ..Default::default()
        })
        .await;

    match response {
        ImportResponse::Failure(body) => {
            assert_eq!(body.root_cause, "query_looks_like_company_url");
            assert_eq!(body.http_status, 400);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}
