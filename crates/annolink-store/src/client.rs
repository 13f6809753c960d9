//! HTTP client for the remote annotation repository.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, ETAG, IF_MATCH, LOCATION};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use annolink_core::document::{collection_items, has_next_page, raw_id};
use annolink_core::{
    defaults, AnnotationId, AnnotationStore, Error, ExistenceCheck, IdCanonicalizer, ListingPage,
    Result, StoredAnnotation, VersionToken,
};

use crate::config::StoreConfig;
use crate::error::to_annolink_error;

/// Media type the repository speaks.
const ANNOTATION_MEDIA_TYPE: &str =
    "application/ld+json; profile=\"http://www.w3.org/ns/anno.jsonld\"";

/// Client for a W3C annotation repository with ETag concurrency control.
pub struct RemoteStoreClient {
    client: Client,
    config: StoreConfig,
    canonicalizer: IdCanonicalizer,
}

impl RemoteStoreClient {
    /// Create a client; fails with `Error::Config` when the credential or
    /// base URL is missing.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            "Initializing annotation store client: url={}, container={}, timeout={}s",
            config.base_url, config.container, config.timeout_seconds
        );

        let canonicalizer = config.canonicalizer();
        Ok(Self {
            client,
            config,
            canonicalizer,
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(StoreConfig::from_env())
    }

    /// Get the current configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn container_url(&self) -> String {
        format!(
            "{}/{}",
            self.canonicalizer.base_url(),
            self.canonicalizer.container()
        )
    }

    /// URL of the server-side custom query for `target` and `motivation`.
    pub fn target_query_url(&self, target: &AnnotationId, motivation: &str) -> String {
        format!(
            "{}/services/{}/custom-query/{}:target={},motivationorpurpose={}",
            self.canonicalizer.base_url(),
            self.canonicalizer.container(),
            defaults::TARGET_MOTIVATION_QUERY,
            urlencoding::encode(target.as_str()),
            BASE64.encode(motivation)
        )
    }

    /// Attach the bearer credential and content negotiation headers.
    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let mut req = req.header(ACCEPT, ANNOTATION_MEDIA_TYPE);
        if let Some(ref token) = self.config.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Pass successful responses through, map everything else.
    async fn check(response: Response, context: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(to_annolink_error(status.as_u16(), context, &body))
    }

    fn version_of(headers: &HeaderMap) -> Option<VersionToken> {
        headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(VersionToken::new)
    }

    /// Build a stored record from a document, falling back to `fallback`
    /// when the document carries no id.
    fn stored(
        &self,
        document: JsonValue,
        fallback: Option<&AnnotationId>,
        version: Option<VersionToken>,
    ) -> Option<StoredAnnotation> {
        let id = raw_id(&document)
            .and_then(|raw| self.canonicalizer.canonicalize(raw))
            .or_else(|| fallback.cloned())?;
        Some(StoredAnnotation {
            id,
            document,
            version,
        })
    }

    fn items_to_stored(&self, payload: &JsonValue) -> Vec<StoredAnnotation> {
        collection_items(payload)
            .into_iter()
            .filter_map(|item| {
                let stored = self.stored(item, None, None);
                if stored.is_none() {
                    warn!("Skipping store item without id");
                }
                stored
            })
            .collect()
    }
}

#[async_trait]
impl AnnotationStore for RemoteStoreClient {
    fn canonicalizer(&self) -> &IdCanonicalizer {
        &self.canonicalizer
    }

    #[instrument(skip(self), fields(subsystem = "store", component = "http_client", op = "get", annotation_id = %id))]
    async fn get(&self, id: &AnnotationId) -> Result<StoredAnnotation> {
        let response = self
            .authorized(self.client.get(id.as_str()))
            .send()
            .await?;
        let response = Self::check(response, &format!("GET {}", id)).await?;
        let version = Self::version_of(response.headers());
        let document: JsonValue = response.json().await?;

        debug!(has_version = version.is_some(), "Fetched annotation");
        self.stored(document, Some(id), version)
            .ok_or_else(|| Error::Internal(format!("no id for {}", id)))
    }

    #[instrument(skip(self), fields(subsystem = "store", component = "http_client", op = "exists", target_id = %id))]
    async fn exists(&self, id: &AnnotationId) -> ExistenceCheck {
        let request = self
            .authorized(self.client.head(id.as_str()))
            .timeout(Duration::from_secs(self.config.exists_timeout_seconds));

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                ExistenceCheck::found(response.status().as_u16())
            }
            Ok(response) => {
                let status = response.status();
                trace!(status = status.as_u16(), "Target missing");
                ExistenceCheck::missing(Some(status.as_u16()), format!("HTTP {}", status))
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!(
                        "timed out after {}s",
                        self.config.exists_timeout_seconds
                    )
                } else {
                    format!("network error: {}", e)
                };
                debug!(reason = %reason, "Existence check failed");
                ExistenceCheck::missing(None, reason)
            }
        }
    }

    #[instrument(skip(self, document), fields(subsystem = "store", component = "http_client", op = "create"))]
    async fn create(&self, document: &JsonValue) -> Result<StoredAnnotation> {
        let url = format!("{}/", self.container_url());
        let response = self
            .authorized(self.client.post(&url))
            .header(CONTENT_TYPE, ANNOTATION_MEDIA_TYPE)
            .json(document)
            .send()
            .await?;
        let response = Self::check(response, &format!("POST {}", url)).await?;

        let version = Self::version_of(response.headers());
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| self.canonicalizer.canonicalize(raw));
        let text = response.text().await?;
        let returned = if text.trim().is_empty() {
            document.clone()
        } else {
            serde_json::from_str(&text)?
        };

        let stored = self
            .stored(returned, location.as_ref(), version)
            .ok_or_else(|| Error::Internal("store did not return an id for the new annotation".into()))?;
        info!(annotation_id = %stored.id, "Created annotation");
        Ok(stored)
    }

    #[instrument(skip(self, document, version), fields(subsystem = "store", component = "http_client", op = "update", annotation_id = %id))]
    async fn update(
        &self,
        id: &AnnotationId,
        document: &JsonValue,
        version: &VersionToken,
    ) -> Result<StoredAnnotation> {
        let response = self
            .authorized(self.client.put(id.as_str()))
            .header(IF_MATCH, version.as_str())
            .header(CONTENT_TYPE, ANNOTATION_MEDIA_TYPE)
            .json(document)
            .send()
            .await?;
        let response = Self::check(response, &format!("PUT {}", id)).await?;

        let new_version = Self::version_of(response.headers());
        let text = response.text().await?;
        let returned = if text.trim().is_empty() {
            document.clone()
        } else {
            serde_json::from_str(&text)?
        };
        debug!("Updated annotation");
        self.stored(returned, Some(id), new_version)
            .ok_or_else(|| Error::Internal(format!("no id for {}", id)))
    }

    #[instrument(skip(self, version), fields(subsystem = "store", component = "http_client", op = "delete", annotation_id = %id))]
    async fn delete(&self, id: &AnnotationId, version: &VersionToken) -> Result<()> {
        let response = self
            .authorized(self.client.delete(id.as_str()))
            .header(IF_MATCH, version.as_str())
            .send()
            .await?;
        Self::check(response, &format!("DELETE {}", id)).await?;
        debug!("Deleted annotation");
        Ok(())
    }

    #[instrument(skip(self), fields(subsystem = "store", component = "http_client", op = "query_by_target", target_id = %target, motivation = motivation))]
    async fn query_by_target(
        &self,
        target: &AnnotationId,
        motivation: &str,
    ) -> Result<Vec<StoredAnnotation>> {
        let url = self.target_query_url(target, motivation);
        let response = self.authorized(self.client.get(&url)).send().await?;
        let response = Self::check(response, "GET custom-query").await?;
        let payload: JsonValue = response.json().await?;

        let items = self.items_to_stored(&payload);
        debug!(result_count = items.len(), "Target query complete");
        Ok(items)
    }

    #[instrument(skip(self), fields(subsystem = "store", component = "http_client", op = "list_page", page = page))]
    async fn list_page(&self, page: u32) -> Result<ListingPage> {
        let url = self.container_url();
        let response = self
            .authorized(self.client.get(&url))
            .query(&[("page", page)])
            .send()
            .await?;
        let response = Self::check(response, &format!("GET {}?page={}", url, page)).await?;
        let payload: JsonValue = response.json().await?;

        let items = self.items_to_stored(&payload);
        let has_next = !items.is_empty() && has_next_page(&payload);
        trace!(result_count = items.len(), has_next, "Listing page fetched");
        Ok(ListingPage { items, has_next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RemoteStoreClient {
        RemoteStoreClient::new(
            StoreConfig::new("https://store.example/w3c/", "maps").with_token("t"),
        )
        .unwrap()
    }

    #[test]
    fn test_new_requires_credential() {
        let result = RemoteStoreClient::new(StoreConfig::new("https://store.example", "maps"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_target_query_url() {
        let c = client();
        let target = AnnotationId::new("https://store.example/w3c/maps/abc");
        let url = c.target_query_url(&target, "linking");
        assert_eq!(
            url,
            "https://store.example/w3c/services/maps/custom-query/with-target-and-motivation-or-purpose:target=https%3A%2F%2Fstore.example%2Fw3c%2Fmaps%2Fabc,motivationorpurpose=bGlua2luZw=="
        );
    }

    #[test]
    fn test_container_url_has_no_double_slash() {
        assert_eq!(client().container_url(), "https://store.example/w3c/maps");
    }
}
