use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::adapters::send_json;
use crate::data_source::{FetchContext, FetchError, FetchFuture, GrantSource};
use crate::http_client::{HttpClient, HttpRequest};
use crate::SourceId;

/// Statuses searched when the caller does not filter on `status`.
const DEFAULT_OPP_STATUSES: &str = "forecasted|posted";

/// Grants.gov `search2` adapter. Public, no credential.
#[derive(Clone)]
pub struct GrantsGovAdapter {
    http_client: Arc<dyn HttpClient>,
}

impl GrantsGovAdapter {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self { http_client }
    }

    fn request_body(ctx: &FetchContext<'_>) -> Value {
        let params = ctx.params;
        let mut body = Map::new();
        body.insert(String::from("keyword"), json!(params.query));
        body.insert(String::from("rows"), json!(params.limit));
        body.insert(
            String::from("oppStatuses"),
            json!(params.filter("status").unwrap_or(DEFAULT_OPP_STATUSES)),
        );
        for (filter, field) in [
            ("agency", "agencies"),
            ("category", "fundingCategories"),
            ("eligibility", "eligibilities"),
            ("instrument", "fundingInstruments"),
        ] {
            if let Some(value) = params.filter(filter) {
                body.insert(String::from(field), json!(value));
            }
        }
        Value::Object(body)
    }
}

impl GrantSource for GrantsGovAdapter {
    fn id(&self) -> SourceId {
        SourceId::parse("grants_gov").expect("built-in source id is valid")
    }

    fn fetch<'a>(&'a self, ctx: FetchContext<'a>) -> FetchFuture<'a> {
        Box::pin(async move {
            let request = HttpRequest::post(&ctx.descriptor.endpoint)
                .with_json_body(&Self::request_body(&ctx))
                .with_timeout(ctx.timeout);
            let payload = send_json(self.http_client.as_ref(), request).await?;

            // search2 reports application errors inside a 200 response.
            match payload.get("errorcode").and_then(Value::as_i64) {
                Some(0) | None => Ok(payload),
                Some(code) => Err(FetchError::transport(format!(
                    "grants.gov error code {code}: {}",
                    payload.get("msg").and_then(Value::as_str).unwrap_or("no message")
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::SearchParams;
    use crate::http_client::{HttpMethod, HttpResponse, StaticHttpClient};
    use crate::registry::SourceRegistry;
    use std::time::Duration;

    #[tokio::test]
    async fn posts_keyword_search_with_filters() {
        let client = Arc::new(StaticHttpClient::new(HttpResponse::ok_json(
            r#"{"errorcode":0,"msg":"ok","data":{"oppHits":[]}}"#,
        )));
        let adapter = GrantsGovAdapter::new(client.clone());
        let registry = SourceRegistry::default_catalog();
        let descriptor = registry.get("grants_gov").expect("grants_gov");
        let params = SearchParams::new("rural health")
            .with_filter("agency", "HHS")
            .expect("valid filter");

        adapter
            .fetch(FetchContext {
                descriptor,
                params: &params,
                credential: None,
                timeout: Duration::from_secs(3),
            })
            .await
            .expect("fetch succeeds");

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert_eq!(requests[0].timeout, Duration::from_secs(3));
        let body: Value =
            serde_json::from_str(requests[0].body.as_deref().expect("json body")).expect("json");
        assert_eq!(body["keyword"], "rural health");
        assert_eq!(body["agencies"], "HHS");
        assert_eq!(body["oppStatuses"], DEFAULT_OPP_STATUSES);
    }

    #[tokio::test]
    async fn embedded_error_code_is_a_failure() {
        let client = Arc::new(StaticHttpClient::new(HttpResponse::ok_json(
            r#"{"errorcode":7,"msg":"rate limit exceeded"}"#,
        )));
        let adapter = GrantsGovAdapter::new(client);
        let registry = SourceRegistry::default_catalog();
        let params = SearchParams::new("x");

        let error = adapter
            .fetch(FetchContext {
                descriptor: registry.get("grants_gov").expect("grants_gov"),
                params: &params,
                credential: None,
                timeout: Duration::from_secs(3),
            })
            .await
            .expect_err("error code surfaces");

        assert!(error.raw_message().contains("rate limit exceeded"));
    }
}
