//! Search index adapter: product documents in Elasticsearch and "more like this" lookups.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use goodsale_core::ProductRecord;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "goodsale-search";

pub const DEFAULT_INDEX: &str = "skus";

/// Documents per `_bulk` request.
const BULK_CHUNK: usize = 1000;

/// Hits requested per similarity query, before the caller drops self and truncates.
const SIMILAR_CANDIDATES: usize = 10;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search backend unreachable")]
    Transport(#[from] reqwest::Error),
    #[error("search backend returned {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("unexpected search response: {0}")]
    InvalidResponse(String),
}

/// Field layout of the product index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub text_fields: Vec<String>,
    pub keyword_fields: Vec<String>,
}

impl IndexSchema {
    pub fn products() -> Self {
        Self {
            text_fields: vec!["title".into(), "description".into()],
            keyword_fields: vec!["brand".into()],
        }
    }

    pub fn mappings(&self) -> JsonValue {
        let mut properties = serde_json::Map::new();
        for field in &self.text_fields {
            properties.insert(field.clone(), json!({ "type": "text" }));
        }
        for field in &self.keyword_fields {
            properties.insert(field.clone(), json!({ "type": "keyword" }));
        }
        json!({ "mappings": { "properties": properties } })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub indexed: usize,
    pub failed: usize,
    /// Records without a uid, never sent.
    pub skipped: usize,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create `name` with `schema` unless it already exists.
    async fn ensure_index(&self, name: &str, schema: &IndexSchema) -> Result<IndexStatus, SearchError>;

    /// Index records keyed by uid. Per-document and per-request failures are counted;
    /// an error is returned only when nothing could be delivered.
    async fn bulk_index(&self, records: &[ProductRecord]) -> Result<BulkReport, SearchError>;

    /// Ids of documents most similar to `uid`, best first. May include `uid` itself.
    async fn find_similar(&self, uid: Uuid) -> Result<Vec<Uuid>, SearchError>;
}

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub base_url: String,
    pub index: String,
    pub timeout: Duration,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            index: DEFAULT_INDEX.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// `_source` of one product document.
#[derive(Debug, Serialize)]
struct ProductDocument<'a> {
    title: Option<&'a str>,
    description: Option<&'a str>,
    brand: Option<&'a str>,
    seller_id: Option<i64>,
    seller_name: Option<&'a str>,
    first_image_url: Option<&'a str>,
    category_id: i64,
    features: &'a std::collections::BTreeMap<String, String>,
    price_before_discounts: Option<f64>,
    price_after_discounts: Option<f64>,
    discount: Option<f64>,
    currency: Option<&'a str>,
    barcode: Option<&'a str>,
    category_lvl_1: Option<&'a str>,
    category_lvl_2: Option<&'a str>,
    category_lvl_3: Option<&'a str>,
    category_remaining: Option<&'a str>,
}

impl<'a> From<&'a ProductRecord> for ProductDocument<'a> {
    fn from(record: &'a ProductRecord) -> Self {
        Self {
            title: record.title.as_deref(),
            description: record.description.as_deref(),
            brand: record.brand.as_deref(),
            seller_id: record.seller_id,
            seller_name: record.seller_name.as_deref(),
            first_image_url: record.image_url.as_deref(),
            category_id: record.category_id,
            features: &record.features,
            price_before_discounts: record.price_before,
            price_after_discounts: record.price_after,
            discount: record.discount_pct,
            currency: record.currency.as_deref(),
            barcode: record.barcode.as_deref(),
            category_lvl_1: record.breadcrumb.l1.as_deref(),
            category_lvl_2: record.breadcrumb.l2.as_deref(),
            category_lvl_3: record.breadcrumb.l3.as_deref(),
            category_remaining: record.breadcrumb.remaining.as_deref(),
        }
    }
}

fn bulk_body(index: &str, docs: &[(Uuid, &ProductRecord)]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for (uid, record) in docs {
        let action = json!({ "index": { "_index": index, "_id": uid.to_string() } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&ProductDocument::from(*record))?);
        body.push('\n');
    }
    Ok(body)
}

fn more_like_this_query(index: &str, uid: Uuid, fields: &[String]) -> JsonValue {
    json!({
        "size": SIMILAR_CANDIDATES,
        "_source": false,
        "query": {
            "more_like_this": {
                "fields": fields,
                "like": [{ "_index": index, "_id": uid.to_string() }],
                "min_term_freq": 1,
                "max_query_terms": 12
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
}

/// Elasticsearch-backed [`SearchIndex`] speaking the REST API directly.
#[derive(Debug, Clone)]
pub struct ElasticIndex {
    client: reqwest::Client,
    base_url: String,
    index: String,
    similarity_fields: Vec<String>,
}

impl ElasticIndex {
    pub fn new(config: ElasticConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building elasticsearch client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            index: config.index,
            similarity_fields: IndexSchema::products().text_fields,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SearchError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        Err(SearchError::HttpStatus {
            status: status.as_u16(),
            url,
            body,
        })
    }

    async fn send_bulk(&self, docs: &[(Uuid, &ProductRecord)]) -> Result<BulkReport, SearchError> {
        let body = bulk_body(&self.index, docs)
            .map_err(|e| SearchError::InvalidResponse(format!("encoding bulk body: {e}")))?;
        let resp = self
            .client
            .post(self.url("_bulk"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let parsed: BulkResponse = Self::check(resp).await?.json().await?;

        let mut report = BulkReport::default();
        let mut first_failure = None;
        for item in parsed.items.iter().flat_map(|entry| entry.values()) {
            match &item.error {
                Some(err) => {
                    report.failed += 1;
                    if first_failure.is_none() {
                        first_failure = Some((item.id.clone(), err.clone()));
                    }
                }
                None => report.indexed += 1,
            }
        }
        if parsed.errors || report.failed > 0 {
            warn!(
                failed = report.failed,
                first = ?first_failure,
                "bulk request had per-document failures"
            );
        }
        Ok(report)
    }

    async fn refresh(&self) -> Result<(), SearchError> {
        let resp = self
            .client
            .post(self.url(&format!("{}/_refresh", self.index)))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    async fn ensure_index(&self, name: &str, schema: &IndexSchema) -> Result<IndexStatus, SearchError> {
        let url = self.url(name);
        let head = self.client.head(&url).send().await?;
        match head.status() {
            status if status.is_success() => {
                debug!(index = name, "index already exists");
                return Ok(IndexStatus::AlreadyExists);
            }
            StatusCode::NOT_FOUND => {}
            status => {
                return Err(SearchError::HttpStatus {
                    status: status.as_u16(),
                    url,
                    body: String::new(),
                })
            }
        }

        let resp = self.client.put(&url).json(&schema.mappings()).send().await?;
        let status = resp.status();
        if status.is_success() {
            info!(index = name, "index created");
            return Ok(IndexStatus::Created);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            debug!(index = name, "index created concurrently");
            return Ok(IndexStatus::AlreadyExists);
        }
        Err(SearchError::HttpStatus {
            status: status.as_u16(),
            url,
            body,
        })
    }

    async fn bulk_index(&self, records: &[ProductRecord]) -> Result<BulkReport, SearchError> {
        let mut report = BulkReport::default();
        let docs = records
            .iter()
            .filter_map(|record| match record.uid {
                Some(uid) => Some((uid, record)),
                None => {
                    error!(source_id = record.source_id, "record without uid, not indexing");
                    report.skipped += 1;
                    None
                }
            })
            .collect::<Vec<_>>();

        if docs.is_empty() {
            warn!("no records to index");
            return Ok(report);
        }

        let mut delivered = 0usize;
        let mut last_error = None;
        for (n, chunk) in docs.chunks(BULK_CHUNK).enumerate() {
            match self.send_bulk(chunk).await {
                Ok(chunk_report) => {
                    delivered += 1;
                    report.indexed += chunk_report.indexed;
                    report.failed += chunk_report.failed;
                }
                Err(err) => {
                    warn!(chunk = n, documents = chunk.len(), error = ?err, "bulk chunk rejected, continuing");
                    report.failed += chunk.len();
                    last_error = Some(err);
                }
            }
        }
        if delivered == 0 {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        if let Err(err) = self.refresh().await {
            warn!(error = ?err, "index refresh failed, recent documents may not be searchable yet");
        }

        info!(
            index = %self.index,
            indexed = report.indexed,
            failed = report.failed,
            "bulk indexing finished"
        );
        Ok(report)
    }

    async fn find_similar(&self, uid: Uuid) -> Result<Vec<Uuid>, SearchError> {
        let query = more_like_this_query(&self.index, uid, &self.similarity_fields);
        let resp = self
            .client
            .post(self.url(&format!("{}/_search", self.index)))
            .json(&query)
            .send()
            .await?;
        let parsed: SearchResponse = Self::check(resp).await?.json().await?;

        let ids = parsed
            .hits
            .hits
            .into_iter()
            .filter_map(|hit| match Uuid::parse_str(&hit.id) {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(%uid, hit = %hit.id, "ignoring non-uuid document id");
                    None
                }
            })
            .collect();
        Ok(ids)
    }
}
