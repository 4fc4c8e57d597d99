use std::sync::Arc;

use crate::adapters::{send_json, with_query};
use crate::data_source::{FetchContext, FetchError, FetchFuture, GrantSource};
use crate::http_client::{HttpAuth, HttpClient, HttpRequest};
use crate::SourceId;

const SUBSCRIPTION_KEY_HEADER: &str = "Subscription-Key";

/// Candid grants API adapter. Requires a subscription key.
#[derive(Clone)]
pub struct CandidAdapter {
    http_client: Arc<dyn HttpClient>,
}

impl CandidAdapter {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self { http_client }
    }
}

impl GrantSource for CandidAdapter {
    fn id(&self) -> SourceId {
        SourceId::parse("candid").expect("built-in source id is valid")
    }

    fn fetch<'a>(&'a self, ctx: FetchContext<'a>) -> FetchFuture<'a> {
        Box::pin(async move {
            let Some(credential) = ctx.credential else {
                return Err(FetchError::transport("candid call attempted without a credential"));
            };

            let limit = ctx.params.limit.to_string();
            let mut pairs = vec![("query", ctx.params.query.as_str()), ("limit", limit.as_str())];
            pairs.extend(
                ctx.params
                    .filters
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_str())),
            );

            let request = HttpRequest::get(with_query(&ctx.descriptor.endpoint, pairs))
                .with_auth(&HttpAuth::Header {
                    name: String::from(SUBSCRIPTION_KEY_HEADER),
                    value: credential.clone(),
                })
                .with_timeout(ctx.timeout);
            send_json(self.http_client.as_ref(), request).await
        })
    }
}
