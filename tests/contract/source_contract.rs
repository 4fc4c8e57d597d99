//! Contract every built-in source adapter must satisfy.
//!
//! Each adapter is driven over a static transport with a payload shaped like
//! its upstream's, then normalized through its descriptor.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use grantbridge_core::{
    default_adapters, FetchContext, FetchErrorKind, GrantSource, HttpClient, HttpResponse,
    NormalizeContext, SearchParams, Secret, SourceRegistry, StaticHttpClient, UtcDateTime,
};
use serde_json::json;

struct SourceCase {
    id: &'static str,
    payload: serde_json::Value,
    expected_records: usize,
}

fn source_cases() -> Vec<SourceCase> {
    vec![
        SourceCase {
            id: "grants_gov",
            payload: json!({ "errorcode": 0, "data": { "oppHits": [
                { "id": "1", "title": "Rural Health Outreach", "agencyName": "HRSA", "closeDate": "04/30/2025" },
                { "id": "2", "title": "Arts in Schools", "closeDate": "" },
                { "title": "missing id is skipped" }
            ]}}),
            expected_records: 2,
        },
        SourceCase {
            id: "candid",
            payload: json!({ "data": { "rows": [
                { "grant_key": "G-1", "title": "Arts Education Fund", "funder_name": "Example Foundation", "amount_usd": "$25,000" }
            ]}}),
            expected_records: 1,
        },
        SourceCase {
            id: "federal_register",
            payload: json!({ "results": [
                { "document_number": "2025-01234", "title": "Notice of Funding Opportunity", "agencies": [{ "name": "Department of Education" }] },
                { "document_number": "2025-01235", "title": "Another Notice" }
            ]}),
            expected_records: 2,
        },
    ]
}

fn adapter_for(id: &str, client: Arc<dyn HttpClient>) -> Arc<dyn GrantSource> {
    default_adapters(client)
        .into_iter()
        .find(|adapter| adapter.id().as_str() == id)
        .unwrap_or_else(|| panic!("no built-in adapter for '{id}'"))
}

fn discovered_at() -> UtcDateTime {
    UtcDateTime::parse("2025-03-01T12:00:00Z").expect("valid timestamp")
}

#[test]
fn every_built_in_adapter_has_a_valid_descriptor() {
    let registry = SourceRegistry::default_catalog();
    let client: Arc<dyn HttpClient> = Arc::new(StaticHttpClient::new(HttpResponse::ok_json("{}")));

    let adapter_ids = default_adapters(client)
        .iter()
        .map(|adapter| adapter.id().to_string())
        .collect::<BTreeSet<_>>();
    let descriptor_ids = registry
        .ids()
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>();

    assert_eq!(adapter_ids, descriptor_ids);
    registry.validate().expect("built-in descriptors validate");
}

#[tokio::test]
async fn fetch_then_normalize_yields_canonical_records_for_all_sources() {
    let registry = SourceRegistry::default_catalog();
    let credential = Secret::new("contract-key-0001");
    let params = SearchParams::new("health").with_limit(10).expect("valid limit");

    for case in source_cases() {
        let descriptor = registry.get(case.id).expect("descriptor exists");
        let client = Arc::new(StaticHttpClient::new(HttpResponse::ok_json(
            case.payload.to_string(),
        )));
        let adapter = adapter_for(case.id, client.clone());

        let payload = adapter
            .fetch(FetchContext {
                descriptor,
                params: &params,
                credential: descriptor.requires_credential.then_some(&credential),
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap_or_else(|error| panic!("source '{}' fetch failed: {error:?}", case.id));
        let records = adapter
            .normalize(
                &payload,
                NormalizeContext {
                    descriptor,
                    discovered_at: discovered_at(),
                },
            )
            .unwrap_or_else(|error| panic!("source '{}' normalize failed: {error:?}", case.id));

        assert_eq!(records.len(), case.expected_records, "source '{}': record count", case.id);
        assert_eq!(client.requests().len(), 1, "source '{}': one upstream call", case.id);

        let prefix = format!("{}:", case.id);
        let mut ids = BTreeSet::new();
        for record in &records {
            assert_eq!(record.source.as_str(), case.id);
            assert!(record.id.starts_with(&prefix), "source '{}': id {}", case.id, record.id);
            assert!(ids.insert(record.id.clone()), "source '{}': duplicate id", case.id);
            assert!(!record.title.is_empty());
            assert_eq!(record.source_url, descriptor.homepage);
            assert_eq!(record.discovered_at, discovered_at());
            record.validate().expect("normalized record is valid");
        }
    }
}

#[tokio::test]
async fn non_success_status_surfaces_as_a_status_error_for_all_sources() {
    let registry = SourceRegistry::default_catalog();
    let credential = Secret::new("contract-key-0001");
    let params = SearchParams::new("health");

    for case in source_cases() {
        let descriptor = registry.get(case.id).expect("descriptor exists");
        let client = Arc::new(StaticHttpClient::new(HttpResponse::with_status(
            503,
            "Service Unavailable",
        )));
        let adapter = adapter_for(case.id, client);

        let error = adapter
            .fetch(FetchContext {
                descriptor,
                params: &params,
                credential: Some(&credential),
                timeout: Duration::from_secs(5),
            })
            .await
            .expect_err("503 is an error");

        assert_eq!(error.kind(), FetchErrorKind::Status, "source '{}'", case.id);
        assert_eq!(error.status_code(), Some(503), "source '{}'", case.id);
    }
}

#[tokio::test]
async fn unreadable_body_surfaces_as_a_parse_error_for_all_sources() {
    let registry = SourceRegistry::default_catalog();
    let credential = Secret::new("contract-key-0001");
    let params = SearchParams::new("health");

    for case in source_cases() {
        let descriptor = registry.get(case.id).expect("descriptor exists");
        let client = Arc::new(StaticHttpClient::new(HttpResponse::ok_json("<html>maintenance</html>")));
        let adapter = adapter_for(case.id, client);

        let error = adapter
            .fetch(FetchContext {
                descriptor,
                params: &params,
                credential: Some(&credential),
                timeout: Duration::from_secs(5),
            })
            .await
            .expect_err("html is not json");

        assert_eq!(error.kind(), FetchErrorKind::Parse, "source '{}'", case.id);
    }
}
