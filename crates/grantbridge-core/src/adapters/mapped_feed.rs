use std::sync::Arc;

use crate::adapters::{send_json, with_query};
use crate::data_source::{FetchContext, FetchFuture, GrantSource};
use crate::http_client::{HttpAuth, HttpClient, HttpRequest};
use crate::SourceId;

/// Generic GET-and-map adapter for JSON feeds.
///
/// The query string is assembled from configured parameter names; the payload is
/// translated by the descriptor's field mapping, so a new feed needs only a
/// descriptor and one of these.
#[derive(Clone)]
pub struct MappedFeedAdapter {
    id: SourceId,
    http_client: Arc<dyn HttpClient>,
    query_param: String,
    limit_param: Option<String>,
    fixed_params: Vec<(String, String)>,
    forward_filters: bool,
    /// Header name carrying the resolved credential, for gated feeds.
    credential_header: Option<String>,
}

impl MappedFeedAdapter {
    pub fn new(id: SourceId, http_client: Arc<dyn HttpClient>, query_param: impl Into<String>) -> Self {
        Self {
            id,
            http_client,
            query_param: query_param.into(),
            limit_param: None,
            fixed_params: Vec::new(),
            forward_filters: false,
            credential_header: None,
        }
    }

    /// Federal Register document search, restricted to notices.
    pub fn federal_register(http_client: Arc<dyn HttpClient>) -> Self {
        Self::new(
            SourceId::parse("federal_register").expect("built-in source id is valid"),
            http_client,
            "conditions[term]",
        )
        .with_limit_param("per_page")
        .with_fixed_param("conditions[type][]", "NOTICE")
        .with_fixed_param("order", "newest")
    }

    pub fn with_limit_param(mut self, name: impl Into<String>) -> Self {
        self.limit_param = Some(name.into());
        self
    }

    pub fn with_fixed_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fixed_params.push((name.into(), value.into()));
        self
    }

    pub fn forwarding_filters(mut self) -> Self {
        self.forward_filters = true;
        self
    }

    pub fn with_credential_header(mut self, name: impl Into<String>) -> Self {
        self.credential_header = Some(name.into());
        self
    }

    fn url(&self, ctx: &FetchContext<'_>) -> String {
        let limit = ctx.params.limit.to_string();
        let mut pairs = Vec::new();
        if !ctx.params.query.is_empty() {
            pairs.push((self.query_param.as_str(), ctx.params.query.as_str()));
        }
        if let Some(name) = &self.limit_param {
            pairs.push((name.as_str(), limit.as_str()));
        }
        pairs.extend(
            self.fixed_params
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        );
        if self.forward_filters {
            pairs.extend(
                ctx.params
                    .filters
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            );
        }
        with_query(&ctx.descriptor.endpoint, pairs)
    }
}

impl GrantSource for MappedFeedAdapter {
    fn id(&self) -> SourceId {
        self.id.clone()
    }

    fn fetch<'a>(&'a self, ctx: FetchContext<'a>) -> FetchFuture<'a> {
        Box::pin(async move {
            let mut request = HttpRequest::get(self.url(&ctx)).with_timeout(ctx.timeout);
            if let (Some(name), Some(secret)) = (&self.credential_header, ctx.credential) {
                request = request.with_auth(&HttpAuth::Header {
                    name: name.clone(),
                    value: secret.clone(),
                });
            }
            send_json(self.http_client.as_ref(), request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::{NormalizeContext, SearchParams};
    use crate::http_client::{HttpResponse, StaticHttpClient};
    use crate::registry::SourceRegistry;
    use crate::{Secret, UtcDateTime};
    use std::time::Duration;

    #[tokio::test]
    async fn federal_register_fetch_and_default_normalize() {
        let client = Arc::new(StaticHttpClient::new(HttpResponse::ok_json(
            r#"{"count":1,"results":[{
                "document_number":"2025-01234",
                "title":"Notice of Funding Opportunity: Rural Broadband",
                "abstract":"Applications are invited.",
                "html_url":"https://www.federalregister.gov/d/2025-01234",
                "agencies":[{"name":"Rural Utilities Service"}]
            }]}"#,
        )));
        let adapter = MappedFeedAdapter::federal_register(client.clone());
        let registry = SourceRegistry::default_catalog();
        let descriptor = registry.get("federal_register").expect("federal_register");
        let params = SearchParams::new("broadband").with_limit(5).expect("valid");

        let payload = adapter
            .fetch(FetchContext {
                descriptor,
                params: &params,
                credential: None,
                timeout: Duration::from_secs(2),
            })
            .await
            .expect("fetch succeeds");
        let records = adapter
            .normalize(
                &payload,
                NormalizeContext {
                    descriptor,
                    discovered_at: UtcDateTime::parse("2025-02-01T00:00:00Z").expect("valid"),
                },
            )
            .expect("normalizes");

        let url = &client.requests()[0].url;
        assert!(url.contains("conditions%5Bterm%5D=broadband"));
        assert!(url.contains("per_page=5"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "federal_register:2025-01234");
        assert_eq!(records[0].funder.as_deref(), Some("Rural Utilities Service"));
        assert_eq!(records[0].tags, vec![String::from("federal_register")]);
    }

    #[tokio::test]
    async fn gated_feed_forwards_filters_and_sends_credential_header() {
        let client = Arc::new(StaticHttpClient::new(HttpResponse::ok_json(r#"{"results":[]}"#)));
        let adapter = MappedFeedAdapter::new(
            SourceId::parse("federal_register").expect("valid"),
            client.clone(),
            "q",
        )
        .forwarding_filters()
        .with_credential_header("X-Api-Key");
        let registry = SourceRegistry::default_catalog();
        let params = SearchParams::new("water")
            .with_filter("state", "VT")
            .expect("valid");
        let secret = Secret::new("feed-key-1234");

        adapter
            .fetch(FetchContext {
                descriptor: registry.get("federal_register").expect("federal_register"),
                params: &params,
                credential: Some(&secret),
                timeout: Duration::from_secs(2),
            })
            .await
            .expect("fetch succeeds");

        let request = &client.requests()[0];
        assert!(request.url.contains("q=water"));
        assert!(request.url.contains("state=VT"));
        assert_eq!(
            request.headers.get("x-api-key").map(String::as_str),
            Some("feed-key-1234")
        );
    }

    #[tokio::test]
    async fn server_error_surfaces_as_status_failure() {
        let client = Arc::new(StaticHttpClient::new(HttpResponse::with_status(
            503,
            "Service Unavailable",
        )));
        let adapter = MappedFeedAdapter::federal_register(client);
        let registry = SourceRegistry::default_catalog();
        let params = SearchParams::new("x");

        let error = adapter
            .fetch(FetchContext {
                descriptor: registry.get("federal_register").expect("federal_register"),
                params: &params,
                credential: None,
                timeout: Duration::from_secs(2),
            })
            .await
            .expect_err("503 surfaces");

        assert_eq!(error.status_code(), Some(503));
    }
}
