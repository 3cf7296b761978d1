use super::{
    DocumentFilter, DocumentId, DocumentPatch, DocumentRecord, DocumentRow, DocumentStore,
    ShareLink, StoreError,
};
use crate::util::validate_base_url;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::redirect::Policy;
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10MB

const DOCUMENTS_PATH: &str = "rest/v1/documents";
const SHARE_LINK_FUNCTION_PATH: &str = "functions/v1/generate-share-link";

#[derive(Serialize)]
struct ShareLinkRequest<'a> {
    document_id: &'a str,
    expiry_hours: u32,
}

#[derive(Deserialize)]
struct ShareLinkResponse {
    url: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct ClearShare {
    share_url: Option<String>,
    share_expires_at: Option<String>,
}

/// [`DocumentStore`] backed by the hosted REST gateway.
///
/// Reads go to `{base}/rest/v1/documents` with PostgREST-style filters;
/// share links are minted by the `generate-share-link` serverless function.
/// Every request is bounded by `timeout`; retrying is the caller's concern.
pub struct RestDocumentStore {
    client: reqwest::Client,
    base: Url,
    api_key: SecretString,
    access_token: Option<SecretString>,
    timeout: Duration,
}

impl std::fmt::Debug for RestDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestDocumentStore")
            .field("base", &self.base.as_str())
            .field("api_key", &"[REDACTED]")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Redirects are rare on the gateway; follow at most 3 and never downgrade
/// from HTTPS, since every request carries credentials.
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        let downgrade = url.scheme() == "http"
            && attempt.previous().iter().any(|prev| prev.scheme() == "https");
        if downgrade {
            return attempt.error("Refusing redirect from HTTPS to HTTP");
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

/// HTTP client tuned for the document gateway.
pub fn build_client() -> Result<reqwest::Client, StoreError> {
    reqwest::Client::builder()
        .redirect(redirect_policy())
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(StoreError::Network)
}

impl RestDocumentStore {
    /// Create a store for `base_url`.
    ///
    /// The base URL must be HTTPS; plain HTTP is accepted only for localhost
    /// so tests can point the store at a local mock server.
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: SecretString,
        access_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let mut base = validate_base_url(base_url).map_err(|e| match e {
            crate::util::UrlValidationError::Insecure => StoreError::InsecureBaseUrl,
            other => StoreError::InvalidUrl(other.to_string()),
        })?;

        // Url::join drops the last path segment unless it ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client,
            base,
            api_key,
            access_token,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        self.base
            .join(path)
            .map_err(|e| StoreError::InvalidUrl(e.to_string()))
    }

    fn documents_url(&self, filters: &[(&str, String)]) -> Result<Url, StoreError> {
        let mut url = self.endpoint(DOCUMENTS_PATH)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            for (key, value) in filters {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let bearer = self
            .access_token
            .as_ref()
            .unwrap_or(&self.api_key)
            .expose_secret()
            .to_string();
        self.client
            .request(method, url)
            .header("apikey", self.api_key.expose_secret())
            .header("Authorization", format!("Bearer {}", bearer))
    }

    /// Send `request` and read its body, all within the store's timeout.
    async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>, StoreError> {
        tokio::time::timeout(self.timeout, Self::exchange(request))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout.as_secs()))?
    }

    async fn exchange(request: RequestBuilder) -> Result<Vec<u8>, StoreError> {
        let response = request.send().await.map_err(StoreError::Network)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(StoreError::RateLimited);
        }
        if !status.is_success() {
            return Err(StoreError::HttpStatus(status.as_u16()));
        }

        read_limited_bytes(response, MAX_RESPONSE_SIZE).await
    }

    async fn list(&self, filters: Vec<(&str, String)>) -> Result<Vec<DocumentRecord>, StoreError> {
        let url = self.documents_url(&filters)?;
        tracing::debug!(url = %url, "Listing documents");

        let body = self.send(self.request(Method::GET, url)).await?;
        let rows: Vec<DocumentRow> =
            serde_json::from_slice(&body).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(rows.into_iter().map(DocumentRow::into_record).collect())
    }

    /// PATCH a single document row, failing with `NotFound` when no row matched.
    async fn patch<T: Serialize + ?Sized>(&self, id: &DocumentId, body: &T) -> Result<(), StoreError> {
        let url = self.documents_url(&[("id", format!("eq.{}", id))])?;
        let payload = serde_json::to_vec(body).map_err(|e| StoreError::Decode(e.to_string()))?;

        tracing::debug!(document = %id, "Patching document");
        let response = self
            .send(
                self.request(Method::PATCH, url)
                    .header("Content-Type", "application/json")
                    .header("Prefer", "return=representation")
                    .body(payload),
            )
            .await?;

        let rows: Vec<serde_json::Value> =
            serde_json::from_slice(&response).map_err(|e| StoreError::Decode(e.to_string()))?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for RestDocumentStore {
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut filters = vec![("is_archived", format!("eq.{}", filter.archived))];
        if filter.favorites_only {
            filters.push(("is_favorite", "eq.true".to_string()));
        }
        if let Some(pet_id) = &filter.pet_id {
            filters.push(("pet_id", format!("eq.{}", pet_id)));
        }
        filters.push(("order", "created_at.desc".to_string()));
        self.list(filters).await
    }

    async fn list_archived_documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        self.list(vec![
            ("is_archived", "eq.true".to_string()),
            ("order", "created_at.desc".to_string()),
        ])
        .await
    }

    async fn update_bookmark(&self, id: &DocumentId, value: bool) -> Result<(), StoreError> {
        self.patch(id, &DocumentPatch::bookmark(value)).await
    }

    async fn generate_share_link(
        &self,
        id: &DocumentId,
        expiry_hours: u32,
    ) -> Result<ShareLink, StoreError> {
        let url = self.endpoint(SHARE_LINK_FUNCTION_PATH)?;
        let payload = serde_json::to_vec(&ShareLinkRequest {
            document_id: id.as_str(),
            expiry_hours,
        })
        .map_err(|e| StoreError::Decode(e.to_string()))?;

        tracing::debug!(document = %id, expiry_hours, "Requesting share link");
        let body = self
            .send(
                self.request(Method::POST, url)
                    .header("Content-Type", "application/json")
                    .body(payload),
            )
            .await?;

        let link: ShareLinkResponse =
            serde_json::from_slice(&body).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(ShareLink {
            url: link.url,
            expires_at: link.expires_at,
        })
    }

    async fn remove_share_link(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.patch(
            id,
            &ClearShare {
                share_url: None,
                share_expires_at: None,
            },
        )
        .await
    }

    async fn update_document_fields(
        &self,
        id: &DocumentId,
        patch: &DocumentPatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        self.patch(id, patch).await
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, StoreError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(StoreError::Decode(format!(
                "response too large ({} bytes, max {})",
                len, limit
            )));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(StoreError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(StoreError::Decode(format!("response exceeds {} bytes", limit)));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
