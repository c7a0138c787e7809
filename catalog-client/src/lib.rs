#![deny(clippy::unwrap_used)]

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod error;
pub mod limiter;
pub mod retry;

pub use error::CatalogError;
pub use limiter::{AdaptiveLimiter, LimiterOptions, Permit};
pub use retry::RetryPolicy;

pub const PRODUCTS_PATH: &str = "/api/1.1/entity/ms.products";
pub const ACCESS_KEY_HEADER: &str = "access-key";
pub const FREQUENTLY_BOUGHT_FIELD: &str = "frequently_bought";
const METAFIELDS_FIELD: &str = "metafields";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub fallback_url: Option<String>,
    pub access_key: String,
    pub timeout: Duration,
    pub limiter: LimiterOptions,
    pub retry: RetryPolicy,
}

impl ClientOptions {
    pub fn new<S: Into<String>>(base_url: S, access_key: S) -> Self {
        Self {
            base_url: base_url.into(),
            fallback_url: None,
            access_key: access_key.into(),
            timeout: Duration::from_secs(20),
            limiter: LimiterOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// One page of the product listing.
#[derive(Debug, Clone)]
pub enum ProductPage {
    Products(Vec<Value>),
    /// The catalog refuses to page further (HTTP 406).
    LimitReached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub base_url: String,
    pub used_fallback: bool,
    /// Set when the catalog did not return what was written.
    pub warning: Option<String>,
}

#[async_trait]
pub trait CatalogPublisher: Send + Sync {
    async fn publish(
        &self,
        product_id: &str,
        skus: &[String],
        token: &CancellationToken,
    ) -> Result<PublishOutcome, CatalogError>;
}

/// HTTP client for the product catalog. Clones share one concurrency limiter.
#[derive(Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    limiter: AdaptiveLimiter,
    retry: RetryPolicy,
    timeout: Duration,
    base_url: String,
    fallback_url: Option<String>,
}

fn trim_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

impl CatalogClient {
    pub fn new(options: ClientOptions) -> Result<Self, CatalogError> {
        let base_url = trim_base(&options.base_url);
        if base_url.is_empty() {
            return Err(CatalogError::Config("catalog base url is empty".to_string()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCESS_KEY_HEADER,
            HeaderValue::from_str(options.access_key.trim())
                .map_err(|err| CatalogError::Config(format!("invalid access key: {err}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .use_rustls_tls()
            .default_headers(headers)
            .build()
            .map_err(CatalogError::Build)?;
        Ok(Self {
            http,
            limiter: AdaptiveLimiter::new(options.limiter),
            retry: options.retry,
            timeout: options.timeout,
            base_url,
            fallback_url: options
                .fallback_url
                .as_deref()
                .map(trim_base)
                .filter(|u| !u.is_empty()),
        })
    }

    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.limiter
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issues one call, retrying 429/503 and network failures. Any other
    /// status is handed back untouched.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        token: &CancellationToken,
    ) -> Result<Response, CatalogError> {
        let body = body.map(Value::to_string);
        let mut attempt = 0u32;
        loop {
            if token.is_cancelled() {
                return Err(CatalogError::Cancelled);
            }
            let permit = tokio::select! {
                permit = self.limiter.acquire() => permit,
                _ = token.cancelled() => return Err(CatalogError::Cancelled),
            };
            let mut req = self
                .http
                .request(method.clone(), url)
                .timeout(self.timeout);
            if let Some(body) = &body {
                req = req.body(body.clone());
            }
            let res = req.send().await;
            drop(permit);

            let delay = match res {
                Ok(resp) if retry::is_transient(resp.status()) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        self.limiter.record_throttled();
                    }
                    let retry_after = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(retry::parse_retry_after);
                    if attempt >= self.retry.max_retries {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(CatalogError::RetriesExhausted {
                            status,
                            body: truncate_body(&body),
                            attempts: attempt + 1,
                        });
                    }
                    let delay = self.retry.delay(attempt, retry_after);
                    log::warn!(
                        "{method} {url} responded {status}, retry {} in {}ms",
                        attempt + 1,
                        delay.as_millis()
                    );
                    delay
                }
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if attempt >= self.retry.max_retries {
                        return Err(CatalogError::Network {
                            source: err,
                            attempts: attempt + 1,
                        });
                    }
                    let delay = self.retry.delay(attempt, None);
                    log::warn!(
                        "{method} {url} failed: {err}, retry {} in {}ms",
                        attempt + 1,
                        delay.as_millis()
                    );
                    delay
                }
            };
            attempt += 1;
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = token.cancelled() => return Err(CatalogError::Cancelled),
            }
        }
    }

    async fn request_json(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        token: &CancellationToken,
    ) -> Result<Value, CatalogError> {
        let resp = self.request(method, url, body, token).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|source| CatalogError::Network {
            source,
            attempts: 1,
        })?;
        if !status.is_success() {
            return Err(CatalogError::Status {
                status,
                body: truncate_body(&text),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn get_product_at(
        &self,
        base_url: &str,
        product_id: &str,
        token: &CancellationToken,
    ) -> Result<Value, CatalogError> {
        let url = format!("{base_url}{PRODUCTS_PATH}/{product_id}");
        self.request_json(Method::GET, &url, None, token).await
    }

    pub async fn put_product_at(
        &self,
        base_url: &str,
        product_id: &str,
        product: &Value,
        token: &CancellationToken,
    ) -> Result<(), CatalogError> {
        let url = format!("{base_url}{PRODUCTS_PATH}/{product_id}");
        self.request_json(Method::PUT, &url, Some(product), token)
            .await
            .map(|_| ())
    }

    /// Lists products with ids after `since_id`.
    pub async fn list_products(
        &self,
        fields: &[&str],
        limit: usize,
        since_id: Option<&str>,
        token: &CancellationToken,
    ) -> Result<ProductPage, CatalogError> {
        let mut url = reqwest::Url::parse(&format!("{}{PRODUCTS_PATH}", self.base_url))
            .map_err(|err| CatalogError::Config(format!("invalid base url: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("fields", &fields.join(","));
            query.append_pair("limit", &limit.to_string());
            if let Some(since_id) = since_id {
                query.append_pair("since_id", since_id);
            }
        }
        let resp = self.request(Method::GET, url.as_str(), None, token).await?;
        let status = resp.status();
        if status == StatusCode::NOT_ACCEPTABLE {
            return Ok(ProductPage::LimitReached);
        }
        let text = resp.text().await.map_err(|source| CatalogError::Network {
            source,
            attempts: 1,
        })?;
        if !status.is_success() {
            return Err(CatalogError::Status {
                status,
                body: truncate_body(&text),
            });
        }
        match serde_json::from_str::<Value>(&text)? {
            Value::Array(products) => Ok(ProductPage::Products(products)),
            Value::Object(mut obj) => match obj.remove("data").or_else(|| obj.remove("products")) {
                Some(Value::Array(products)) => Ok(ProductPage::Products(products)),
                _ => Err(CatalogError::UnexpectedPayload(truncate_body(&text))),
            },
            _ => Err(CatalogError::UnexpectedPayload(truncate_body(&text))),
        }
    }

    async fn publish_at(
        &self,
        base_url: &str,
        product_id: &str,
        skus: &[String],
        token: &CancellationToken,
    ) -> Result<Option<String>, CatalogError> {
        let mut product = self.get_product_at(base_url, product_id, token).await?;
        splice_frequently_bought(&mut product, skus)?;
        self.put_product_at(base_url, product_id, &product, token)
            .await?;
        let stored = self.get_product_at(base_url, product_id, token).await?;
        let stored = read_frequently_bought(&stored);
        if stored.as_deref() == Some(skus) {
            Ok(None)
        } else {
            let warning = format!(
                "catalog returned {} for product {product_id} instead of {}",
                stored.map(|s| s.join(",")).unwrap_or_else(|| "nothing".to_string()),
                skus.join(",")
            );
            log::warn!("{warning}");
            Ok(Some(warning))
        }
    }
}

#[async_trait]
impl CatalogPublisher for CatalogClient {
    /// Read-modify-write of the product, primary base url first and the
    /// fallback after it.
    async fn publish(
        &self,
        product_id: &str,
        skus: &[String],
        token: &CancellationToken,
    ) -> Result<PublishOutcome, CatalogError> {
        let bases = std::iter::once((self.base_url.as_str(), false))
            .chain(self.fallback_url.as_deref().map(|u| (u, true)));
        let mut last_err = None;
        for (base_url, used_fallback) in bases {
            match self.publish_at(base_url, product_id, skus, token).await {
                Ok(warning) => {
                    return Ok(PublishOutcome {
                        base_url: base_url.to_string(),
                        used_fallback,
                        warning,
                    })
                }
                Err(CatalogError::Cancelled) => return Err(CatalogError::Cancelled),
                Err(err) => {
                    log::warn!("Unable to publish product {product_id} via {base_url}: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CatalogError::Config("no catalog url".to_string())))
    }
}

/// Writes `skus` under both the top-level and the metafields key, keeping the
/// rest of the product intact.
pub fn splice_frequently_bought(product: &mut Value, skus: &[String]) -> Result<(), CatalogError> {
    let Some(obj) = product.as_object_mut() else {
        return Err(CatalogError::UnexpectedPayload(
            "product payload is not a JSON object".to_string(),
        ));
    };
    let list = Value::from(skus.to_vec());
    obj.insert(FREQUENTLY_BOUGHT_FIELD.to_string(), list.clone());
    let metafields = obj
        .entry(METAFIELDS_FIELD)
        .or_insert_with(|| Value::Object(Default::default()));
    if !metafields.is_object() {
        *metafields = Value::Object(Default::default());
    }
    if let Some(metafields) = metafields.as_object_mut() {
        metafields.insert(FREQUENTLY_BOUGHT_FIELD.to_string(), list);
    }
    Ok(())
}

pub fn read_frequently_bought(product: &Value) -> Option<Vec<String>> {
    let list = product
        .get(FREQUENTLY_BOUGHT_FIELD)
        .or_else(|| product.get(METAFIELDS_FIELD)?.get(FREQUENTLY_BOUGHT_FIELD))?;
    match list {
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::String(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

fn truncate_body(text: &str) -> String {
    const MAX: usize = 500;
    let text = text.trim();
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
