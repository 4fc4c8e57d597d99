//! Built-in upstream adapters.

mod candid;
mod grants_gov;
mod mapped_feed;

use std::sync::Arc;

pub use candid::CandidAdapter;
pub use grants_gov::GrantsGovAdapter;
pub use mapped_feed::MappedFeedAdapter;

use crate::data_source::{FetchError, GrantSource, RawPayload};
use crate::http_client::{HttpClient, HttpRequest};

/// Adapters for every source in [`SourceRegistry::default_catalog`](crate::SourceRegistry::default_catalog).
pub fn default_adapters(http_client: Arc<dyn HttpClient>) -> Vec<Arc<dyn GrantSource>> {
    vec![
        Arc::new(GrantsGovAdapter::new(Arc::clone(&http_client))),
        Arc::new(CandidAdapter::new(Arc::clone(&http_client))),
        Arc::new(MappedFeedAdapter::federal_register(http_client)),
    ]
}

/// Executes a request and decodes a JSON body.
///
/// Non-success statuses become [`FetchError::status`] carrying the raw body; the
/// orchestrator sanitizes it before anything is surfaced.
pub(crate) async fn send_json(
    http_client: &dyn HttpClient,
    request: HttpRequest,
) -> Result<RawPayload, FetchError> {
    let response = http_client.execute(request).await?;
    if !response.is_success() {
        return Err(FetchError::status(response.status, response.body));
    }
    serde_json::from_str(&response.body)
        .map_err(|error| FetchError::parse(format!("response body is not valid JSON: {error}")))
}

/// Appends url-encoded query pairs to `endpoint`.
pub(crate) fn with_query<'a, I>(endpoint: &str, pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let query = pairs
        .into_iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    if query.is_empty() {
        return endpoint.to_owned();
    }
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{separator}{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_are_encoded_and_appended() {
        let url = with_query(
            "https://example.test/search",
            [("conditions[term]", "rural health"), ("per_page", "5")],
        );

        assert_eq!(
            url,
            "https://example.test/search?conditions%5Bterm%5D=rural%20health&per_page=5"
        );
        assert_eq!(with_query("https://example.test/a?x=1", [("y", "2")]), "https://example.test/a?x=1&y=2");
        assert_eq!(with_query("https://example.test/a", []), "https://example.test/a");
    }
}
