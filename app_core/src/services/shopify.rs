use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, LINK};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::contracts::{JobError, JobResult};
use crate::utils::http::{backoff_delay, is_retryable_status, retry_after, MAX_RETRIES, RateGate};

const API_VERSION: &str = "2024-04";
const FALLBACK_TIMEZONE: &str = "Europe/Berlin";
const FULL_SCAN_MAX_PAGES: usize = 100;

/// An active product as listed by the order-preserving collection endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ShopifyProduct {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub handle: String,
    #[serde(default, rename = "body_html")]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "tags_as_list")]
    pub tags: Vec<String>,
    #[serde(default, rename = "images")]
    images: Vec<Value>,
    #[serde(default, rename = "image")]
    image: Option<Value>,
}

impl ShopifyProduct {
    pub fn primary_image_url(&self) -> Option<String> {
        let from = |value: &Value| {
            value
                .get("src")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
        };
        self.images
            .first()
            .and_then(from)
            .or_else(|| self.image.as_ref().and_then(from))
    }
}

fn id_as_string<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("bad product id: {}", other))),
    }
}

fn tags_as_list<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()),
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()),
        _ => Ok(Vec::new()),
    }
}

/// One deduplicated order line for a tracked product.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLine {
    pub order_id: i64,
    pub line_item_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub quantity: i64,
    pub amount: Decimal,
}

/// Smart-collection metadata the replacement engine needs.
#[derive(Debug, Clone)]
pub struct CollectionDetails {
    pub id: String,
    pub title: String,
    pub sort_order: String,
    pub tag: Option<String>,
}

/// A product matched by tag query through the admin GraphQL API.
#[derive(Debug, Clone)]
pub struct TaggedProduct {
    pub gid: String,
    pub title: String,
    pub tags: Vec<String>,
}

/// Commerce-platform client. REST for listing and order search, GraphQL for
/// tag mutations, positions, reordering and inventory writes.
pub struct ShopifyClient {
    client: reqwest::Client,
    base_url: String,
    graphql_url: String,
    pub shop_domain: String,
    rate_gate: RateGate,
    collection_cache: tokio::sync::Mutex<HashMap<String, Vec<ShopifyProduct>>>,
    handle_cache: tokio::sync::Mutex<HashMap<String, Option<String>>>,
}

impl ShopifyClient {
    pub fn new(shop_domain: &str, access_token: &str) -> JobResult<Self> {
        let base = format!("https://{}/admin/api/{}", shop_domain, API_VERSION);
        Self::with_base_url(&base, shop_domain, access_token)
    }

    pub fn with_base_url(base_url: &str, shop_domain: &str, access_token: &str) -> JobResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Shopify-Access-Token",
            HeaderValue::from_str(access_token)
                .map_err(|_| JobError::validation("access token is not header-safe"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| JobError::fatal(format!("could not build commerce client: {}", e)))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            graphql_url: format!("{}/graphql.json", base_url),
            base_url,
            shop_domain: shop_domain.to_string(),
            client,
            rate_gate: RateGate::new(Duration::from_millis(500)),
            collection_cache: tokio::sync::Mutex::new(HashMap::new()),
            handle_cache: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// GET with retry, 429 handling and Link-header pagination cursor.
    async fn rest_get(
        &self,
        endpoint_or_url: &str,
        query: &[(&str, String)],
        silent_404: bool,
    ) -> JobResult<Option<(Value, Option<String>)>> {
        let url = if endpoint_or_url.starts_with("http") {
            endpoint_or_url.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint_or_url)
        };

        let mut retry_count = 0u32;
        loop {
            self.rate_gate.wait().await;

            let response = match self
                .client
                .request(Method::GET, &url)
                .query(query)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= MAX_RETRIES {
                        return Err(JobError::transient(format!("commerce request failed: {}", e)));
                    }
                    tokio::time::sleep(backoff_delay(retry_count)).await;
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(response.headers(), 2);
                log::warn!(target: "shopify", "rate limited, waiting {:?}", wait);
                retry_count += 1;
                if retry_count >= MAX_RETRIES {
                    return Err(JobError::transient("commerce rate limit persisted"));
                }
                tokio::time::sleep(wait).await;
                continue;
            }
            if is_retryable_status(status) {
                retry_count += 1;
                if retry_count >= MAX_RETRIES {
                    return Err(JobError::transient(format!("commerce error {}", status)));
                }
                tokio::time::sleep(backoff_delay(retry_count)).await;
                continue;
            }
            if status == StatusCode::NOT_FOUND {
                if !silent_404 {
                    log::warn!(target: "shopify", "not found: {}", url);
                }
                return Ok(None);
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(JobError::auth_expired("commerce access token rejected"));
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(JobError::validation(format!(
                    "commerce error {}: {}",
                    status,
                    text.chars().take(200).collect::<String>()
                )));
            }

            let next_url = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link);
            let body = response
                .json::<Value>()
                .await
                .map_err(|e| JobError::validation(format!("bad commerce response: {}", e)))?;
            return Ok(Some((body, next_url)));
        }
    }

    /// Executes a GraphQL document, retrying on throttling.
    async fn graphql(&self, query: &str, variables: Value) -> JobResult<Value> {
        let payload = json!({"query": query, "variables": variables});
        let mut retry_count = 0u32;

        loop {
            self.rate_gate.wait().await;

            let response = match self.client.post(&self.graphql_url).json(&payload).send().await {
                Ok(response) => response,
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= MAX_RETRIES {
                        return Err(JobError::transient(format!("graphql request failed: {}", e)));
                    }
                    tokio::time::sleep(backoff_delay(retry_count)).await;
                    continue;
                }
            };

            if is_retryable_status(response.status()) {
                retry_count += 1;
                if retry_count >= MAX_RETRIES {
                    return Err(JobError::transient(format!(
                        "graphql error {}",
                        response.status()
                    )));
                }
                tokio::time::sleep(backoff_delay(retry_count)).await;
                continue;
            }

            let body = response
                .json::<Value>()
                .await
                .map_err(|e| JobError::validation(format!("bad graphql response: {}", e)))?;

            if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
                let throttled = errors.iter().any(|e| e.to_string().contains("Throttled"));
                if throttled && retry_count < MAX_RETRIES {
                    retry_count += 1;
                    tokio::time::sleep(backoff_delay(retry_count)).await;
                    continue;
                }
                return Err(JobError::validation(format!("graphql errors: {:?}", errors)));
            }

            return Ok(body.get("data").cloned().unwrap_or(Value::Null));
        }
    }

    pub async fn test_connection(&self) -> bool {
        matches!(self.rest_get("shop.json", &[], false).await, Ok(Some(_)))
    }

    /// The shop's IANA timezone; all window bucketing runs in it.
    pub async fn shop_timezone(&self) -> Tz {
        let name = match self.rest_get("shop.json", &[], false).await {
            Ok(Some((body, _))) => body
                .pointer("/shop/iana_timezone")
                .and_then(|v| v.as_str())
                .unwrap_or(FALLBACK_TIMEZONE)
                .to_string(),
            _ => FALLBACK_TIMEZONE.to_string(),
        };
        name.parse().unwrap_or(chrono_tz::Europe::Berlin)
    }

    /// Active products of a collection, in display order. The endpoint
    /// preserves manual sort, unlike the collects listing. Cached per run.
    pub async fn collection_products(&self, collection_id: &str) -> JobResult<Vec<ShopifyProduct>> {
        {
            let cache = self.collection_cache.lock().await;
            if let Some(products) = cache.get(collection_id) {
                return Ok(products.clone());
            }
        }

        let endpoint = format!("collections/{}/products.json", collection_id);
        let mut products: Vec<ShopifyProduct> = Vec::new();
        let mut next: Option<String> = None;
        let mut first = true;

        loop {
            let result = if first {
                first = false;
                self.rest_get(&endpoint, &[("limit", "250".to_string())], false)
                    .await?
            } else {
                match &next {
                    Some(url) => self.rest_get(url, &[], false).await?,
                    None => break,
                }
            };

            let Some((body, next_url)) = result else {
                break;
            };
            let Some(items) = body.get("products").and_then(|v| v.as_array()) else {
                break;
            };
            for item in items {
                match serde_json::from_value::<ShopifyProduct>(item.clone()) {
                    Ok(product) if product.status == "active" => products.push(product),
                    Ok(_) => {}
                    Err(e) => log::warn!(target: "shopify", "skipping unparseable product: {}", e),
                }
            }
            next = next_url;
            if next.is_none() {
                break;
            }
        }

        let mut cache = self.collection_cache.lock().await;
        cache.insert(collection_id.to_string(), products.clone());
        Ok(products)
    }

    /// The `batch_index`-th `batch_size` slice of the ordered product list.
    pub async fn products_batch(
        &self,
        collection_id: &str,
        batch_index: usize,
        batch_size: usize,
    ) -> JobResult<Vec<ShopifyProduct>> {
        let all = self.collection_products(collection_id).await?;
        let start = batch_index * batch_size;
        if start >= all.len() {
            return Ok(Vec::new());
        }
        let end = (start + batch_size).min(all.len());
        Ok(all[start..end].to_vec())
    }

    /// Collection handle, trying custom then smart collections. 404s are
    /// expected along the way and stay quiet.
    pub async fn collection_handle(&self, collection_id: &str) -> JobResult<Option<String>> {
        {
            let cache = self.handle_cache.lock().await;
            if let Some(handle) = cache.get(collection_id) {
                return Ok(handle.clone());
            }
        }

        let mut handle = None;
        for (endpoint, key) in [
            (format!("custom_collections/{}.json", collection_id), "custom_collection"),
            (format!("smart_collections/{}.json", collection_id), "smart_collection"),
        ] {
            if let Some((body, _)) = self.rest_get(&endpoint, &[], true).await? {
                handle = body
                    .get(key)
                    .and_then(|c| c.get("handle"))
                    .and_then(|h| h.as_str())
                    .map(|h| h.to_string());
                if handle.is_some() {
                    break;
                }
            }
        }

        let mut cache = self.handle_cache.lock().await;
        cache.insert(collection_id.to_string(), handle.clone());
        Ok(handle)
    }

    fn storefront_base(&self, url_prefix: &str) -> String {
        let prefix = url_prefix.trim().trim_end_matches('/');
        if prefix.starts_with("http://") || prefix.starts_with("https://") {
            prefix.to_string()
        } else if prefix.contains('.') {
            format!("https://{}", prefix)
        } else {
            format!("https://{}", self.shop_domain)
        }
    }

    pub fn product_url(&self, handle: &str, url_prefix: &str) -> String {
        format!("{}/products/{}", self.storefront_base(url_prefix), handle)
    }

    pub fn collection_url(&self, handle: &str, page: usize, url_prefix: &str) -> String {
        let base = format!("{}/collections/{}", self.storefront_base(url_prefix), handle);
        if page > 1 {
            format!("{}?page={}", base, page)
        } else {
            base
        }
    }

    /// URL of the collection page a product sits on, or None when the handle
    /// cannot be resolved (callers fall back to the product URL).
    pub async fn collection_page_url(
        &self,
        collection_id: &str,
        product_index: usize,
        products_per_page: usize,
        url_prefix: &str,
    ) -> JobResult<Option<String>> {
        let Some(handle) = self.collection_handle(collection_id).await? else {
            return Ok(None);
        };
        let page = product_index / products_per_page.max(1) + 1;
        Ok(Some(self.collection_url(&handle, page, url_prefix)))
    }

    // ===== Order retrieval (sales tracker) =====

    /// All order lines for a product since the anchor, merged from three
    /// overlapping sources and deduplicated by `(order_id, line_item_id)`;
    /// the set union converges on the true quantities.
    pub async fn product_order_lines(
        &self,
        product_id: &str,
        since: DateTime<Utc>,
    ) -> JobResult<Vec<OrderLine>> {
        let mut seen: HashSet<(i64, i64)> = HashSet::new();
        let mut lines: Vec<OrderLine> = Vec::new();

        self.collect_orders_rest(product_id, since, &mut seen, &mut lines, None)
            .await?;
        self.collect_orders_rest(
            product_id,
            since,
            &mut seen,
            &mut lines,
            Some(FULL_SCAN_MAX_PAGES),
        )
        .await?;
        self.collect_orders_graphql(product_id, since, &mut seen, &mut lines)
            .await?;

        Ok(lines)
    }

    async fn collect_orders_rest(
        &self,
        product_id: &str,
        since: DateTime<Utc>,
        seen: &mut HashSet<(i64, i64)>,
        lines: &mut Vec<OrderLine>,
        max_pages: Option<usize>,
    ) -> JobResult<()> {
        let params = [
            ("status", "any".to_string()),
            ("limit", "250".to_string()),
            (
                "created_at_min",
                since.format("%Y-%m-%dT%H:%M:%S-00:00").to_string(),
            ),
        ];

        let mut next: Option<String> = None;
        let mut first = true;
        let mut pages = 0usize;

        loop {
            if let Some(max) = max_pages {
                if pages >= max {
                    break;
                }
            }

            let result = if first {
                first = false;
                self.rest_get("orders.json", &params, false).await?
            } else {
                match &next {
                    Some(url) => self.rest_get(url, &[], false).await?,
                    None => break,
                }
            };

            let Some((body, next_url)) = result else {
                break;
            };
            let Some(orders) = body.get("orders").and_then(|v| v.as_array()) else {
                break;
            };
            if orders.is_empty() {
                break;
            }

            for order in orders {
                let Some(order_id) = order.get("id").and_then(|v| v.as_i64()) else {
                    continue;
                };
                let occurred_at = order
                    .get("created_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc));

                for line_item in order
                    .get("line_items")
                    .and_then(|v| v.as_array())
                    .into_iter()
                    .flatten()
                {
                    let Some(line_item_id) = line_item.get("id").and_then(|v| v.as_i64()) else {
                        continue;
                    };
                    let line_product = line_item
                        .get("product_id")
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_default();
                    if line_product != product_id {
                        continue;
                    }
                    if !seen.insert((order_id, line_item_id)) {
                        continue;
                    }

                    let quantity = line_item.get("quantity").and_then(|v| v.as_i64()).unwrap_or(0);
                    let price = line_item
                        .get("price")
                        .and_then(|v| v.as_str())
                        .and_then(|s| Decimal::from_str_exact(s).ok())
                        .unwrap_or_default();
                    let Some(occurred_at) = occurred_at else {
                        continue;
                    };

                    lines.push(OrderLine {
                        order_id,
                        line_item_id,
                        occurred_at,
                        quantity,
                        amount: price * Decimal::from(quantity),
                    });
                }
            }

            pages += 1;
            next = next_url;
            if next.is_none() {
                break;
            }
        }

        Ok(())
    }

    async fn collect_orders_graphql(
        &self,
        product_id: &str,
        since: DateTime<Utc>,
        seen: &mut HashSet<(i64, i64)>,
        lines: &mut Vec<OrderLine>,
    ) -> JobResult<()> {
        let query = r#"
        query getProductOrders($productQuery: String!, $cursor: String) {
            orders(first: 50, after: $cursor, query: $productQuery) {
                edges {
                    cursor
                    node {
                        id
                        createdAt
                        lineItems(first: 100) {
                            edges {
                                node {
                                    id
                                    quantity
                                    product { id }
                                    originalTotalSet { shopMoney { amount } }
                                }
                            }
                        }
                    }
                }
                pageInfo { hasNextPage }
            }
        }
        "#;

        let product_gid = format!("gid://shopify/Product/{}", product_id);
        let product_query = format!(
            "product_id:{} created_at:>={}",
            product_id,
            since.format("%Y-%m-%d")
        );
        let mut cursor: Option<String> = None;

        loop {
            let data = self
                .graphql(
                    query,
                    json!({"productQuery": product_query, "cursor": cursor}),
                )
                .await?;

            let Some(edges) = data.pointer("/orders/edges").and_then(|v| v.as_array()) else {
                break;
            };

            for edge in edges {
                let node = &edge["node"];
                let Some(order_id) = gid_tail(node.get("id")) else {
                    continue;
                };
                let occurred_at = node
                    .get("createdAt")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc));

                for item_edge in node
                    .pointer("/lineItems/edges")
                    .and_then(|v| v.as_array())
                    .into_iter()
                    .flatten()
                {
                    let item = &item_edge["node"];
                    if item.pointer("/product/id").and_then(|v| v.as_str())
                        != Some(product_gid.as_str())
                    {
                        continue;
                    }
                    let Some(line_item_id) = gid_tail(item.get("id")) else {
                        continue;
                    };
                    if !seen.insert((order_id, line_item_id)) {
                        continue;
                    }
                    let Some(occurred_at) = occurred_at else {
                        continue;
                    };

                    let quantity = item.get("quantity").and_then(|v| v.as_i64()).unwrap_or(0);
                    let amount = item
                        .pointer("/originalTotalSet/shopMoney/amount")
                        .and_then(|v| v.as_str())
                        .and_then(|s| Decimal::from_str_exact(s).ok())
                        .unwrap_or_default();

                    lines.push(OrderLine {
                        order_id,
                        line_item_id,
                        occurred_at,
                        quantity,
                        amount,
                    });
                }
            }

            let has_next = data
                .pointer("/orders/pageInfo/hasNextPage")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !has_next {
                break;
            }
            cursor = edges
                .last()
                .and_then(|e| e.get("cursor"))
                .and_then(|c| c.as_str())
                .map(|c| c.to_string());
            if cursor.is_none() {
                break;
            }
        }

        Ok(())
    }

    // ===== Replacement engine operations (GraphQL) =====

    /// Collection metadata including the membership tag rule and sort order.
    pub async fn collection_details(&self, collection_id: &str) -> JobResult<CollectionDetails> {
        let query = r#"
        query getCollectionDetails($id: ID!) {
            collection(id: $id) {
                id
                title
                sortOrder
                ruleSet { rules { column relation condition } }
            }
        }
        "#;

        let data = self
            .graphql(query, json!({"id": collection_gid(collection_id)}))
            .await?;
        let collection = data
            .get("collection")
            .filter(|c| !c.is_null())
            .ok_or_else(|| JobError::not_found(format!("collection {} not found", collection_id)))?;

        let tag = collection
            .pointer("/ruleSet/rules")
            .and_then(|v| v.as_array())
            .and_then(|rules| {
                rules.iter().find_map(|rule| {
                    if rule.get("column").and_then(|v| v.as_str()) == Some("TAG")
                        && rule.get("relation").and_then(|v| v.as_str()) == Some("EQUALS")
                    {
                        rule.get("condition").and_then(|v| v.as_str()).map(String::from)
                    } else {
                        None
                    }
                })
            });

        Ok(CollectionDetails {
            id: collection_id.to_string(),
            title: collection
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            sort_order: collection
                .get("sortOrder")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            tag,
        })
    }

    /// Active products carrying a tag, for membership listing and the
    /// replacement queue.
    pub async fn products_by_tag(&self, tag: &str, limit: usize) -> JobResult<Vec<TaggedProduct>> {
        let query = r#"
        query getProductsByTag($query: String!, $first: Int!, $after: String) {
            products(first: $first, query: $query, after: $after) {
                edges {
                    node { id title tags status }
                    cursor
                }
                pageInfo { hasNextPage }
            }
        }
        "#;

        let mut products = Vec::new();
        let mut cursor: Option<String> = None;

        while products.len() < limit {
            let first = (limit - products.len()).min(250) as i64;
            let data = self
                .graphql(
                    query,
                    json!({
                        "query": format!("tag:{} AND status:active", tag),
                        "first": first,
                        "after": cursor,
                    }),
                )
                .await?;

            let Some(edges) = data.pointer("/products/edges").and_then(|v| v.as_array()) else {
                break;
            };
            for edge in edges {
                let node = &edge["node"];
                products.push(TaggedProduct {
                    gid: node.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    title: node
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    tags: node
                        .get("tags")
                        .and_then(|v| v.as_array())
                        .map(|tags| {
                            tags.iter()
                                .filter_map(|t| t.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                });
            }

            let has_next = data
                .pointer("/products/pageInfo/hasNextPage")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !has_next || edges.is_empty() {
                break;
            }
            cursor = edges
                .last()
                .and_then(|e| e.get("cursor"))
                .and_then(|c| c.as_str())
                .map(String::from);
        }

        Ok(products)
    }

    /// `(product_gid, position)` pairs in current display order.
    pub async fn collection_positions(&self, collection_id: &str) -> JobResult<Vec<(String, usize)>> {
        let query = r#"
        query getCollectionProducts($id: ID!, $first: Int!, $after: String) {
            collection(id: $id) {
                products(first: $first, sortKey: COLLECTION_DEFAULT, after: $after) {
                    edges {
                        node { id }
                        cursor
                    }
                    pageInfo { hasNextPage }
                }
            }
        }
        "#;

        let mut positions = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let data = self
                .graphql(
                    query,
                    json!({"id": collection_gid(collection_id), "first": 50, "after": cursor}),
                )
                .await?;

            let Some(edges) = data
                .pointer("/collection/products/edges")
                .and_then(|v| v.as_array())
            else {
                break;
            };
            for edge in edges {
                if let Some(gid) = edge.pointer("/node/id").and_then(|v| v.as_str()) {
                    positions.push((gid.to_string(), positions.len()));
                }
            }

            let has_next = data
                .pointer("/collection/products/pageInfo/hasNextPage")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !has_next || edges.is_empty() {
                break;
            }
            cursor = edges
                .last()
                .and_then(|e| e.get("cursor"))
                .and_then(|c| c.as_str())
                .map(String::from);
        }

        Ok(positions)
    }

    pub async fn update_product_tags(&self, product_id: &str, tags: &[String]) -> JobResult<()> {
        let mutation = r#"
        mutation updateProductTags($input: ProductInput!) {
            productUpdate(input: $input) {
                product { id tags }
                userErrors { field message }
            }
        }
        "#;

        let data = self
            .graphql(
                mutation,
                json!({
                    "input": {
                        "id": product_gid(product_id),
                        "tags": tags.join(", "),
                    }
                }),
            )
            .await?;

        check_user_errors(&data, "/productUpdate/userErrors", "tag update")
    }

    /// One reorder mutation; the platform processes it as an async job.
    pub async fn reorder_collection(
        &self,
        collection_id: &str,
        moves: &[crate::replacement_logic::PositionMove],
    ) -> JobResult<()> {
        if moves.is_empty() {
            return Ok(());
        }

        let mutation = r#"
        mutation reorderCollectionProducts($id: ID!, $moves: [MoveInput!]!) {
            collectionReorderProducts(id: $id, moves: $moves) {
                job { id done }
                userErrors { field message }
            }
        }
        "#;

        let move_inputs: Vec<Value> = moves
            .iter()
            .map(|m| {
                json!({
                    "id": product_gid(&m.product_gid),
                    "newPosition": m.new_position.to_string(),
                })
            })
            .collect();

        let data = self
            .graphql(
                mutation,
                json!({"id": collection_gid(collection_id), "moves": move_inputs}),
            )
            .await?;

        check_user_errors(&data, "/collectionReorderProducts/userErrors", "reorder")
    }

    /// Zeroes available stock at every location. The product stays active;
    /// used for replaced losers.
    pub async fn set_product_inventory_zero(&self, product_id: &str) -> JobResult<()> {
        let query = r#"
        query getProductInventory($id: ID!) {
            product(id: $id) {
                variants(first: 100) {
                    edges {
                        node {
                            id
                            inventoryItem {
                                id
                                inventoryLevels(first: 10) {
                                    edges {
                                        node {
                                            location { id }
                                            quantities(names: ["available"]) { name quantity }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        "#;

        let data = self
            .graphql(query, json!({"id": product_gid(product_id)}))
            .await?;
        let product = data
            .get("product")
            .filter(|p| !p.is_null())
            .ok_or_else(|| JobError::not_found(format!("product {} not found", product_id)))?;

        let mut quantities = Vec::new();
        for variant_edge in product
            .pointer("/variants/edges")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let inventory_item = &variant_edge["node"]["inventoryItem"];
            let Some(item_id) = inventory_item.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            for level_edge in inventory_item
                .pointer("/inventoryLevels/edges")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
            {
                let level = &level_edge["node"];
                let Some(location_id) = level.pointer("/location/id").and_then(|v| v.as_str())
                else {
                    continue;
                };
                let available = level
                    .get("quantities")
                    .and_then(|v| v.as_array())
                    .and_then(|qs| {
                        qs.iter()
                            .find(|q| q.get("name").and_then(|n| n.as_str()) == Some("available"))
                    })
                    .and_then(|q| q.get("quantity"))
                    .and_then(|q| q.as_i64())
                    .unwrap_or(0);
                if available > 0 {
                    quantities.push(json!({
                        "inventoryItemId": item_id,
                        "locationId": location_id,
                        "quantity": 0,
                    }));
                }
            }
        }

        if quantities.is_empty() {
            return Ok(());
        }

        let mutation = r#"
        mutation inventorySetQuantities($input: InventorySetQuantitiesInput!) {
            inventorySetQuantities(input: $input) {
                inventoryAdjustmentGroup { createdAt reason }
                userErrors { field message }
            }
        }
        "#;

        let data = self
            .graphql(
                mutation,
                json!({
                    "input": {
                        "name": "available",
                        "reason": "correction",
                        "quantities": quantities,
                    }
                }),
            )
            .await?;

        check_user_errors(&data, "/inventorySetQuantities/userErrors", "inventory zero")
    }
}

fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        if !link.contains("rel=\"next\"") {
            return None;
        }
        let start = link.find('<')? + 1;
        let end = link.find('>')?;
        (end > start).then(|| link[start..end].to_string())
    })
}

fn gid_tail(value: Option<&Value>) -> Option<i64> {
    value?.as_str()?.rsplit('/').next()?.parse().ok()
}

fn collection_gid(id: &str) -> String {
    if id.starts_with("gid://") {
        id.to_string()
    } else {
        format!("gid://shopify/Collection/{}", id)
    }
}

fn product_gid(id: &str) -> String {
    if id.starts_with("gid://") {
        id.to_string()
    } else {
        format!("gid://shopify/Product/{}", id)
    }
}

fn check_user_errors(data: &Value, pointer: &str, what: &str) -> JobResult<()> {
    let errors = data.pointer(pointer).and_then(|v| v.as_array());
    match errors {
        Some(errors) if !errors.is_empty() => Err(JobError::validation(format!(
            "{} failed: {:?}",
            what, errors
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::*;
    use httptest::responders::*;
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn client(server: &Server) -> ShopifyClient {
        ShopifyClient::with_base_url(&server.url_str(""), "shop.myshopify.com", "token").unwrap()
    }

    #[tokio::test]
    async fn test_shop_timezone_with_fallback() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/shop.json")).respond_with(
                json_encoded(json!({"shop": {"iana_timezone": "America/New_York"}})),
            ),
        );
        assert_eq!(client(&server).shop_timezone().await, chrono_tz::America::New_York);

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/shop.json"))
                .respond_with(json_encoded(json!({"shop": {}}))),
        );
        assert_eq!(client(&server).shop_timezone().await, chrono_tz::Europe::Berlin);
    }

    #[tokio::test]
    async fn test_collection_products_preserve_order_and_filter_active() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/collections/77/products.json",
            ))
            .respond_with(json_encoded(json!({"products": [
                {"id": 3, "title": "C", "handle": "c", "status": "active",
                 "images": [{"src": "https://cdn/c.jpg"}]},
                {"id": 1, "title": "A", "handle": "a", "status": "draft"},
                {"id": 2, "title": "B", "handle": "b", "status": "active", "tags": "QK, new"},
            ]}))),
        );

        let shopify = client(&server);
        let products = shopify.collection_products("77").await.unwrap();
        assert_eq!(
            products.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["3", "2"]
        );
        assert_eq!(products[0].primary_image_url().as_deref(), Some("https://cdn/c.jpg"));
        assert_eq!(products[1].tags, vec!["QK", "new"]);

        // Second call is served from the cache; the expectation above only
        // allows one hit.
        let again = shopify.collection_products("77").await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_products_batch_slices_in_order() {
        let server = Server::run();
        let products: Vec<Value> = (0..7)
            .map(|i| json!({"id": i, "title": format!("P{}", i), "handle": format!("p{}", i), "status": "active"}))
            .collect();
        server.expect(
            Expectation::matching(request::method_path("GET", "/collections/5/products.json"))
                .respond_with(json_encoded(json!({"products": products}))),
        );

        let shopify = client(&server);
        let batch = shopify.products_batch("5", 1, 3).await.unwrap();
        assert_eq!(batch.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["3", "4", "5"]);
        assert!(shopify.products_batch("5", 9, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_order_lines_merge_three_sources_without_duplicates() {
        let server = Server::run();
        // REST search and full scan both see order 100; GraphQL adds 200.
        server.expect(
            Expectation::matching(request::method_path("GET", "/orders.json"))
                .times(2)
                .respond_with(json_encoded(json!({"orders": [{
                    "id": 100,
                    "created_at": "2026-07-10T12:00:00Z",
                    "line_items": [
                        {"id": 1000, "product_id": 42, "quantity": 2, "price": "19.90"},
                        {"id": 1001, "product_id": 43, "quantity": 1, "price": "5.00"}
                    ]
                }]}))),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/graphql.json")).respond_with(
                json_encoded(json!({"data": {"orders": {
                    "edges": [{
                        "cursor": "c1",
                        "node": {
                            "id": "gid://shopify/Order/200",
                            "createdAt": "2026-07-11T09:00:00Z",
                            "lineItems": {"edges": [{
                                "node": {
                                    "id": "gid://shopify/LineItem/2000",
                                    "quantity": 1,
                                    "product": {"id": "gid://shopify/Product/42"},
                                    "originalTotalSet": {"shopMoney": {"amount": "19.90"}}
                                }
                            }]}
                        }
                    }],
                    "pageInfo": {"hasNextPage": false}
                }}})),
            ),
        );

        let shopify = client(&server);
        let since = Utc::now() - chrono::Duration::days(30);
        let lines = shopify.product_order_lines("42", since).await.unwrap();

        assert_eq!(lines.len(), 2);
        let total_quantity: i64 = lines.iter().map(|l| l.quantity).sum();
        assert_eq!(total_quantity, 3);
        let total: Decimal = lines.iter().map(|l| l.amount).sum();
        assert_eq!(total, Decimal::from_str_exact("59.70").unwrap());
    }

    #[tokio::test]
    async fn test_rate_limit_honors_retry_after() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/shop.json"))
                .times(2)
                .respond_with(cycle![
                    status_code(429).insert_header("Retry-After", "0"),
                    json_encoded(json!({"shop": {"iana_timezone": "UTC"}})),
                ]),
        );

        assert_eq!(client(&server).shop_timezone().await, chrono_tz::UTC);
    }

    #[tokio::test]
    async fn test_collection_details_extracts_tag_rule() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/graphql.json")).respond_with(
                json_encoded(json!({"data": {"collection": {
                    "id": "gid://shopify/Collection/9",
                    "title": "Berlin Drop",
                    "sortOrder": "MANUAL",
                    "ruleSet": {"rules": [
                        {"column": "TYPE", "relation": "EQUALS", "condition": "hoodie"},
                        {"column": "TAG", "relation": "EQUALS", "condition": "col-berlin"}
                    ]}
                }}})),
            ),
        );

        let details = client(&server).collection_details("9").await.unwrap();
        assert_eq!(details.sort_order, "MANUAL");
        assert_eq!(details.tag.as_deref(), Some("col-berlin"));
    }

    #[tokio::test]
    async fn test_update_product_tags_surfaces_user_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/graphql.json")).respond_with(
                json_encoded(json!({"data": {"productUpdate": {
                    "product": null,
                    "userErrors": [{"field": "tags", "message": "too many tags"}]
                }}})),
            ),
        );

        let err = client(&server)
            .update_product_tags("42", &["a".to_string()])
            .await
            .expect_err("must fail");
        assert!(err.message.contains("too many tags"));
    }

    #[tokio::test]
    async fn test_reorder_sends_string_positions() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/graphql.json"),
                request::body(matches(".*\"newPosition\":\"1\".*")),
            ])
            .respond_with(json_encoded(json!({"data": {"collectionReorderProducts": {
                "job": {"id": "gid://shopify/Job/1", "done": false},
                "userErrors": []
            }}}))),
        );

        let moves = vec![crate::replacement_logic::PositionMove {
            product_gid: "gid://shopify/Product/X".to_string(),
            new_position: 1,
        }];
        client(&server).reorder_collection("9", &moves).await.unwrap();
    }

    #[tokio::test]
    async fn test_inventory_zero_only_writes_nonzero_levels() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/graphql.json"))
                .times(2)
                .respond_with(cycle![
                    json_encoded(json!({"data": {"product": {"variants": {"edges": [{
                        "node": {"id": "gid://shopify/ProductVariant/1", "inventoryItem": {
                            "id": "gid://shopify/InventoryItem/11",
                            "inventoryLevels": {"edges": [
                                {"node": {"location": {"id": "gid://shopify/Location/1"},
                                          "quantities": [{"name": "available", "quantity": 4}]}},
                                {"node": {"location": {"id": "gid://shopify/Location/2"},
                                          "quantities": [{"name": "available", "quantity": 0}]}}
                            ]}
                        }}
                    }]}}}})),
                    json_encoded(json!({"data": {"inventorySetQuantities": {
                        "inventoryAdjustmentGroup": {"createdAt": "now", "reason": "correction"},
                        "userErrors": []
                    }}})),
                ]),
        );

        client(&server).set_product_inventory_zero("42").await.unwrap();
    }

    #[test]
    fn test_storefront_urls() {
        let server = Server::run();
        let shopify = client(&server);

        assert_eq!(
            shopify.product_url("blue-mug", ""),
            "https://shop.myshopify.com/products/blue-mug"
        );
        assert_eq!(
            shopify.product_url("blue-mug", "dresswithsoul.com"),
            "https://dresswithsoul.com/products/blue-mug"
        );
        assert_eq!(
            shopify.collection_url("drop", 1, "https://shop.example.com/"),
            "https://shop.example.com/collections/drop"
        );
        assert_eq!(
            shopify.collection_url("drop", 3, ""),
            "https://shop.myshopify.com/collections/drop?page=3"
        );
    }

    #[test]
    fn test_parse_next_link() {
        let header = r#"<https://x.test/orders.json?page_info=abc>; rel="previous", <https://x.test/orders.json?page_info=def>; rel="next""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://x.test/orders.json?page_info=def")
        );
        assert_eq!(parse_next_link(r#"<https://x.test>; rel="previous""#), None);
    }
}
