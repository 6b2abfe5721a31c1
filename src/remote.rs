//! Remote catalog API client
//!
//! Talks to a WooCommerce-style REST endpoint. The orchestrator only sees
//! the [`RemoteCatalog`] trait, so tests swap in a fake and the HTTP client
//! stays a thin payload/status translation layer.

use crate::config::{RemoteSettings, RetrySettings};
use crate::error::RemoteError;
use crate::models::UnifiedProduct;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;

/// The writes a sync run performs against the remote catalog.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Create a product, returning its remote id.
    async fn create_product(
        &self,
        product: &UnifiedProduct,
        category_id: Option<i64>,
        image_urls: &[String],
    ) -> Result<i64, RemoteError>;

    /// Update an existing product in place.
    async fn update_product(
        &self,
        remote_id: i64,
        product: &UnifiedProduct,
        category_id: Option<i64>,
        image_urls: &[String],
    ) -> Result<(), RemoteError>;

    /// Create a category under the given parent, returning its remote id.
    async fn create_category(&self, name: &str, parent_id: Option<i64>)
        -> Result<i64, RemoteError>;
}

/// Retry a remote call on retryable errors with capped exponential backoff.
pub async fn with_backoff<T, F, Fut>(retry: &RetrySettings, mut op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                attempt += 1;
                let delay = retry.backoff_delay(attempt);
                log::warn!(
                    "Remote call failed ({}), retry {}/{} in {}ms",
                    e,
                    attempt,
                    retry.max_retries,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: i64,
}

/// HTTP implementation over the configured endpoint.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
}

impl HttpCatalogClient {
    pub fn new(settings: &RemoteSettings) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            consumer_key: settings.consumer_key.clone(),
            consumer_secret: settings.consumer_secret.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<reqwest::Response, RemoteError> {
        let response = self
            .client
            .post(self.url(path))
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }

    async fn put_json(&self, path: &str, body: &Value) -> Result<reqwest::Response, RemoteError> {
        let response = self
            .client
            .put(self.url(path))
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

/// Map an HTTP status onto the error taxonomy the orchestrator retries on.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::AuthFailure),
        StatusCode::TOO_MANY_REQUESTS => Err(RemoteError::RateLimited),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::ValidationFailure(body))
        }
        s if s.is_server_error() => Err(RemoteError::Unavailable(s.as_u16())),
        s => Err(RemoteError::UnexpectedStatus(s.as_u16())),
    }
}

/// Minor units to a decimal string, the only price format the API accepts.
fn format_price(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, (cents % 100).abs())
}

fn product_payload(
    product: &UnifiedProduct,
    category_id: Option<i64>,
    image_urls: &[String],
) -> Value {
    let description = product
        .descriptions
        .values()
        .next()
        .cloned()
        .unwrap_or_default();

    let attributes: Vec<Value> = product
        .attributes
        .iter()
        .map(|(name, options)| {
            json!({
                "name": name,
                "visible": true,
                "options": options,
            })
        })
        .collect();

    let mut payload = json!({
        "name": product.title,
        "sku": product.sku,
        "type": "simple",
        "regular_price": format_price(product.price_cents),
        "description": description,
        "manage_stock": true,
        "stock_quantity": product.stock_quantity,
        "attributes": attributes,
        "images": image_urls.iter().map(|src| json!({ "src": src })).collect::<Vec<_>>(),
        "meta_data": [
            { "key": "_supplier", "value": product.supplier },
            { "key": "_currency", "value": product.currency },
        ],
    });
    if let Some(id) = category_id {
        payload["categories"] = json!([{ "id": id }]);
    }
    payload
}

#[async_trait]
impl RemoteCatalog for HttpCatalogClient {
    async fn create_product(
        &self,
        product: &UnifiedProduct,
        category_id: Option<i64>,
        image_urls: &[String],
    ) -> Result<i64, RemoteError> {
        let payload = product_payload(product, category_id, image_urls);
        let response = self.post_json("products", &payload).await?;
        let created: IdResponse = response.json().await?;
        log::debug!("Created product {} as remote id {}", product.sku, created.id);
        Ok(created.id)
    }

    async fn update_product(
        &self,
        remote_id: i64,
        product: &UnifiedProduct,
        category_id: Option<i64>,
        image_urls: &[String],
    ) -> Result<(), RemoteError> {
        let payload = product_payload(product, category_id, image_urls);
        self.put_json(&format!("products/{}", remote_id), &payload)
            .await?;
        log::debug!("Updated product {} (remote id {})", product.sku, remote_id);
        Ok(())
    }

    async fn create_category(
        &self,
        name: &str,
        parent_id: Option<i64>,
    ) -> Result<i64, RemoteError> {
        let mut payload = json!({ "name": name });
        if let Some(parent) = parent_id {
            payload["parent"] = json!(parent);
        }
        let response = self.post_json("products/categories", &payload).await?;
        let created: IdResponse = response.json().await?;
        log::info!("Created category '{}' as remote id {}", name, created.id);
        Ok(created.id)
    }
}
