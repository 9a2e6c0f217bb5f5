use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::JobConfig;
use crate::contracts::{JobError, JobResult};
use crate::data_models::money::{amount_to_micros, micros_to_amount};
use crate::data_models::optimization::MetricsSnapshot;
use crate::utils::http::{backoff_delay, retry_after, MAX_RETRIES, RateGate};

const MAX_TITLE_LENGTH: usize = 100;
const MAX_DESCRIPTION_LENGTH: usize = 500;
/// Ad-platform error code for "video still transcoding".
const TRANSCODING_ERROR_CODE: i64 = 2945;

/// Serialises token refreshes per tenant: two tasks refreshing the same
/// tenant's token would otherwise race and invalidate each other.
static REFRESH_LOCKS: Lazy<std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

fn refresh_lock(tenant_id: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = REFRESH_LOCKS.lock().expect("refresh lock poisoned");
    locks
        .entry(tenant_id.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// New token set produced by a refresh; the pipeline persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: String,
}

/// Media source for pin creation.
#[derive(Debug, Clone)]
pub enum MediaSource {
    ImageUrl(String),
    ImageBase64 { content_type: String, data: String },
    VideoId { media_id: String, cover_image_url: Option<String> },
}

/// Outcome of an ad-promotion call; videos may still be transcoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdCreateOutcome {
    Created { ad_id: Option<String> },
    Transcoding,
}

/// Campaign and ad-group settings cloned from an original campaign into
/// winner campaigns.
#[derive(Debug, Clone, Default)]
pub struct OriginalCampaignSettings {
    pub objective_type: String,
    pub tracking_urls: Option<Value>,
    pub billable_event: String,
    pub bid_strategy_type: String,
    pub targeting_spec: Option<Value>,
    pub optimization_goal_metadata: Option<Value>,
    pub auto_targeting_enabled: bool,
    pub pacing_delivery_type: Option<String>,
}

/// Ads API v5 client with rate limiting, bounded retries and one automatic
/// token refresh on 401.
pub struct PinterestClient {
    client: reqwest::Client,
    base_url: String,
    tenant_id: String,
    access_token: tokio::sync::RwLock<String>,
    refresh_token: Option<String>,
    app_id: Option<String>,
    app_secret: Option<String>,
    rate_gate: RateGate,
    media_poll_interval: Duration,
    refreshed: std::sync::Mutex<Option<RefreshedTokens>>,
}

impl PinterestClient {
    pub fn new(
        config: &JobConfig,
        tenant_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> JobResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| JobError::fatal(format!("could not build ads client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.pinterest_api_base.clone(),
            tenant_id: tenant_id.to_string(),
            access_token: tokio::sync::RwLock::new(access_token.to_string()),
            refresh_token: refresh_token.map(|t| t.to_string()),
            app_id: config.pinterest_app_id.clone(),
            app_secret: config.pinterest_app_secret.clone(),
            rate_gate: RateGate::new(Duration::from_millis(500)),
            media_poll_interval: Duration::from_secs(10),
            refreshed: std::sync::Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub fn with_media_poll_interval(mut self, interval: Duration) -> Self {
        self.media_poll_interval = interval;
        self
    }

    /// Tokens refreshed during this run, if any; the caller persists them.
    pub fn take_refreshed_tokens(&self) -> Option<RefreshedTokens> {
        self.refreshed.lock().expect("refresh cell poisoned").take()
    }

    /// Refreshes the access token through the OAuth endpoint. Serialised per
    /// tenant; a concurrent refresh that already happened is reused.
    pub async fn refresh_access_token(&self) -> JobResult<RefreshedTokens> {
        let (Some(refresh_token), Some(app_id), Some(app_secret)) = (
            self.refresh_token.as_ref(),
            self.app_id.as_ref(),
            self.app_secret.as_ref(),
        ) else {
            return Err(JobError::auth_expired(
                "cannot refresh token: missing refresh token or app credentials",
            ));
        };

        let lock = refresh_lock(&self.tenant_id);
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(tokens) = self.refreshed.lock().expect("refresh cell poisoned").clone() {
            return Ok(tokens);
        }

        let response = self
            .client
            .post(format!("{}/oauth/token", self.base_url))
            .basic_auth(app_id, Some(app_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(JobError::auth_expired(format!(
                "token refresh failed ({}): {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| JobError::auth_expired(format!("bad token response: {}", e)))?;
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::auth_expired("token response without access_token"))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(3600);

        let tokens = RefreshedTokens {
            access_token: access_token.clone(),
            refresh_token: body
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            expires_at: (Utc::now() + chrono::Duration::seconds(expires_in)).to_rfc3339(),
        };

        *self.access_token.write().await = access_token;
        *self.refreshed.lock().expect("refresh cell poisoned") = Some(tokens.clone());
        log::info!(target: "pinterest", "access token refreshed");
        Ok(tokens)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> JobResult<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let mut retry_count = 0u32;
        let mut refreshed_once = false;

        loop {
            self.rate_gate.wait().await;

            let token = self.access_token.read().await.clone();
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(token)
                .query(query);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= MAX_RETRIES {
                        return Err(JobError::transient(format!("ads request failed: {}", e)));
                    }
                    tokio::time::sleep(backoff_delay(retry_count)).await;
                    continue;
                }
            };

            let status = response.status();
            match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    let wait = retry_after(response.headers(), 5);
                    log::warn!(target: "pinterest", "rate limited, waiting {:?}", wait);
                    retry_count += 1;
                    if retry_count >= MAX_RETRIES {
                        return Err(JobError::transient("ads rate limit persisted"));
                    }
                    tokio::time::sleep(wait).await;
                }
                StatusCode::UNAUTHORIZED => {
                    if refreshed_once || self.refresh_token.is_none() {
                        return Err(JobError::auth_expired("ads access token rejected"));
                    }
                    refreshed_once = true;
                    self.refresh_access_token().await?;
                }
                status if status.is_server_error() => {
                    retry_count += 1;
                    if retry_count >= MAX_RETRIES {
                        return Err(JobError::transient(format!("ads error {}", status)));
                    }
                    tokio::time::sleep(backoff_delay(retry_count)).await;
                }
                StatusCode::NOT_FOUND => {
                    return Err(JobError::not_found(format!("ads path not found: {}", path)));
                }
                status if !status.is_success() => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(JobError::validation(format!(
                        "ads error {}: {}",
                        status,
                        text.chars().take(300).collect::<String>()
                    )));
                }
                _ => {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| JobError::validation(format!("bad ads response: {}", e)));
                }
            }
        }
    }

    pub async fn test_connection(&self) -> bool {
        self.request(Method::GET, "user_account", &[], None).await.is_ok()
    }

    /// Boards of the connected account, following bookmarks.
    pub async fn boards(&self) -> JobResult<Vec<Value>> {
        let mut boards = Vec::new();
        let mut bookmark: Option<String> = None;

        loop {
            let mut query = vec![("page_size", "100".to_string())];
            if let Some(bookmark) = &bookmark {
                query.push(("bookmark", bookmark.clone()));
            }
            let body = self.request(Method::GET, "boards", &query, None).await?;

            if let Some(items) = body.get("items").and_then(|v| v.as_array()) {
                boards.extend(items.iter().cloned());
            }
            bookmark = body
                .get("bookmark")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string());
            if bookmark.is_none() {
                break;
            }
        }

        Ok(boards)
    }

    /// Creates an organic pin. Title and description are truncated to the
    /// platform limits by the caller.
    pub async fn create_pin(
        &self,
        board_id: &str,
        title: &str,
        description: &str,
        link: Option<&str>,
        media: MediaSource,
    ) -> JobResult<String> {
        let media_source = match media {
            MediaSource::ImageUrl(url) => json!({"source_type": "image_url", "url": url}),
            MediaSource::ImageBase64 { content_type, data } => json!({
                "source_type": "image_base64",
                "content_type": content_type,
                "data": data,
            }),
            MediaSource::VideoId { media_id, cover_image_url } => json!({
                "source_type": "video_id",
                "media_id": media_id,
                "cover_image_url": cover_image_url,
            }),
        };

        let mut body = json!({
            "board_id": board_id,
            "title": truncate(title, MAX_TITLE_LENGTH),
            "description": truncate(description, MAX_DESCRIPTION_LENGTH),
            "media_source": media_source,
        });
        if let Some(link) = link.filter(|l| !l.is_empty()) {
            body["link"] = json!(link);
        }

        let result = self.request(Method::POST, "pins", &[], Some(&body)).await?;
        result
            .get("id")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .ok_or_else(|| JobError::validation("pin creation returned no id"))
    }

    pub async fn ad_groups(&self, ad_account_id: &str, campaign_id: &str) -> JobResult<Vec<Value>> {
        let body = self
            .request(
                Method::GET,
                &format!("ad_accounts/{}/ad_groups", ad_account_id),
                &[("campaign_ids", campaign_id.to_string())],
                None,
            )
            .await?;
        Ok(body
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Default ad group used by the sync pipeline: automatic bidding,
    /// click-through billing, one-unit micro budget.
    pub async fn create_ad_group(
        &self,
        ad_account_id: &str,
        campaign_id: &str,
        name: &str,
    ) -> JobResult<Value> {
        let body = json!({
            "ad_account_id": ad_account_id,
            "campaign_id": campaign_id,
            "name": name,
            "status": "ACTIVE",
            "budget_in_micro_currency": 1_000_000,
            "bid_strategy_type": "AUTOMATIC_BID",
            "billable_event": "CLICKTHROUGH",
        });
        self.request(
            Method::POST,
            &format!("ad_accounts/{}/ad_groups", ad_account_id),
            &[],
            Some(&body),
        )
        .await
    }

    /// Existing ACTIVE ad group for the campaign, first one as fallback, or
    /// a freshly created default group.
    pub async fn get_or_create_ad_group(
        &self,
        ad_account_id: &str,
        campaign_id: &str,
        campaign_name: &str,
    ) -> JobResult<Option<String>> {
        let groups = self.ad_groups(ad_account_id, campaign_id).await?;

        if let Some(group) = groups
            .iter()
            .find(|g| g.get("status").and_then(|s| s.as_str()) == Some("ACTIVE"))
            .or_else(|| groups.first())
        {
            return Ok(group.get("id").and_then(|v| v.as_str()).map(|v| v.to_string()));
        }

        let created = self
            .create_ad_group(
                ad_account_id,
                campaign_id,
                &format!("{} - Auto Generated", campaign_name),
            )
            .await?;
        Ok(created.get("id").and_then(|v| v.as_str()).map(|v| v.to_string()))
    }

    /// Promotes a pin into an ad. The batch endpoint reports per-item
    /// exceptions; the video-transcoding code surfaces as `Transcoding` so
    /// the caller can wait and retry.
    pub async fn create_ad(
        &self,
        ad_account_id: &str,
        ad_group_id: &str,
        pin_id: &str,
        name: &str,
        creative_type: &str,
    ) -> JobResult<AdCreateOutcome> {
        let body = json!([{
            "ad_account_id": ad_account_id,
            "ad_group_id": ad_group_id,
            "creative_type": creative_type,
            "pin_id": pin_id,
            "name": name,
            "status": "ACTIVE",
        }]);

        let result = self
            .request(
                Method::POST,
                &format!("ad_accounts/{}/ads", ad_account_id),
                &[],
                Some(&body),
            )
            .await?;

        let Some(item) = result.get("items").and_then(|v| v.as_array()).and_then(|a| a.first())
        else {
            return Err(JobError::validation(format!(
                "unexpected ad API response: {}",
                result
            )));
        };

        if let Some(exceptions) = item.get("exceptions").and_then(|v| v.as_array()) {
            if !exceptions.is_empty() {
                let code = exceptions.first().and_then(|e| e.get("code")).and_then(|c| c.as_i64());
                if code == Some(TRANSCODING_ERROR_CODE) {
                    return Ok(AdCreateOutcome::Transcoding);
                }
                return Err(JobError::validation(format!(
                    "ad creation error: {:?}",
                    exceptions
                )));
            }
        }

        let data = item.get("data").unwrap_or(item);
        Ok(AdCreateOutcome::Created {
            ad_id: data.get("id").and_then(|v| v.as_str()).map(|v| v.to_string()),
        })
    }

    pub async fn pause_ad(&self, ad_account_id: &str, ad_id: &str) -> JobResult<()> {
        let body = json!([{
            "id": ad_id,
            "ad_account_id": ad_account_id,
            "status": "PAUSED",
        }]);
        self.request(
            Method::PATCH,
            &format!("ad_accounts/{}/ads", ad_account_id),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn campaigns(&self, ad_account_id: &str) -> JobResult<Vec<Value>> {
        let body = self
            .request(
                Method::GET,
                &format!("ad_accounts/{}/campaigns", ad_account_id),
                &[],
                None,
            )
            .await?;
        Ok(body
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn campaign(&self, ad_account_id: &str, campaign_id: &str) -> JobResult<Value> {
        self.request(
            Method::GET,
            &format!("ad_accounts/{}/campaigns/{}", ad_account_id, campaign_id),
            &[],
            None,
        )
        .await
    }

    pub async fn campaign_status(
        &self,
        ad_account_id: &str,
        campaign_id: &str,
    ) -> JobResult<Option<String>> {
        let campaign = self.campaign(ad_account_id, campaign_id).await?;
        Ok(campaign
            .get("status")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string()))
    }

    pub async fn update_campaign_status(
        &self,
        ad_account_id: &str,
        campaign_id: &str,
        status: &str,
    ) -> JobResult<()> {
        let body = json!([{
            "id": campaign_id,
            "ad_account_id": ad_account_id,
            "status": status,
        }]);
        self.request(
            Method::PATCH,
            &format!("ad_accounts/{}/campaigns", ad_account_id),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    /// Writes the daily budget in micro-currency.
    pub async fn update_campaign_budget(
        &self,
        ad_account_id: &str,
        campaign_id: &str,
        new_budget: Decimal,
    ) -> JobResult<()> {
        let body = json!([{
            "id": campaign_id,
            "ad_account_id": ad_account_id,
            "daily_spend_cap": amount_to_micros(new_budget),
        }]);
        self.request(
            Method::PATCH,
            &format!("ad_accounts/{}/campaigns", ad_account_id),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    /// Aggregated campaign metrics over the trailing `days` window.
    /// `spend = 0` yields `roas = 0`.
    pub async fn campaign_analytics(
        &self,
        ad_account_id: &str,
        campaign_id: &str,
        days: u32,
    ) -> JobResult<MetricsSnapshot> {
        let end = Utc::now().date_naive();
        let start = end - chrono::Duration::days(days as i64);
        let query = [
            ("campaign_ids", campaign_id.to_string()),
            ("start_date", start.format("%Y-%m-%d").to_string()),
            ("end_date", end.format("%Y-%m-%d").to_string()),
            (
                "columns",
                "SPEND_IN_MICRO_DOLLAR,TOTAL_CONVERSIONS,TOTAL_CONVERSIONS_VALUE_IN_MICRO_DOLLAR"
                    .to_string(),
            ),
            ("granularity", "TOTAL".to_string()),
        ];

        let body = self
            .request(
                Method::GET,
                &format!("ad_accounts/{}/campaigns/analytics", ad_account_id),
                &query,
                None,
            )
            .await?;

        let row = body
            .as_array()
            .and_then(|rows| rows.first())
            .cloned()
            .unwrap_or(Value::Null);

        let spend = row
            .get("SPEND_IN_MICRO_DOLLAR")
            .and_then(|v| v.as_i64())
            .map(micros_to_amount)
            .unwrap_or_default();
        let checkouts = row
            .get("TOTAL_CONVERSIONS")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let conversion_value = row
            .get("TOTAL_CONVERSIONS_VALUE_IN_MICRO_DOLLAR")
            .and_then(|v| v.as_i64())
            .map(micros_to_amount)
            .unwrap_or_default();

        let roas = if spend.is_zero() {
            Decimal::ZERO
        } else {
            (conversion_value / spend).round_dp(4)
        };

        Ok(MetricsSnapshot {
            spend,
            checkouts,
            roas,
        })
    }

    /// Fetches the campaign and ad-group settings a winner campaign clones.
    pub async fn original_campaign_settings(
        &self,
        ad_account_id: &str,
        campaign_id: &str,
        ad_group_id: Option<&str>,
    ) -> JobResult<OriginalCampaignSettings> {
        let campaign = self.campaign(ad_account_id, campaign_id).await?;

        let ad_group = match ad_group_id {
            Some(id) => self
                .request(
                    Method::GET,
                    &format!("ad_accounts/{}/ad_groups/{}", ad_account_id, id),
                    &[],
                    None,
                )
                .await
                .ok(),
            None => None,
        };
        let ad_group = match ad_group {
            Some(group) => Some(group),
            None => self
                .ad_groups(ad_account_id, campaign_id)
                .await?
                .into_iter()
                .next(),
        };

        let mut settings = OriginalCampaignSettings {
            objective_type: campaign
                .get("objective_type")
                .and_then(|v| v.as_str())
                .unwrap_or("WEB_CONVERSION")
                .to_string(),
            tracking_urls: campaign.get("tracking_urls").filter(|v| !v.is_null()).cloned(),
            billable_event: "IMPRESSION".to_string(),
            bid_strategy_type: "AUTOMATIC_BID".to_string(),
            auto_targeting_enabled: true,
            ..Default::default()
        };

        if let Some(group) = ad_group {
            settings.billable_event = group
                .get("billable_event")
                .and_then(|v| v.as_str())
                .unwrap_or("IMPRESSION")
                .to_string();
            settings.bid_strategy_type = group
                .get("bid_strategy_type")
                .and_then(|v| v.as_str())
                .unwrap_or("AUTOMATIC_BID")
                .to_string();
            settings.targeting_spec = group.get("targeting_spec").filter(|v| !v.is_null()).cloned();
            settings.optimization_goal_metadata = group
                .get("optimization_goal_metadata")
                .filter(|v| !v.is_null())
                .cloned();
            settings.auto_targeting_enabled = group
                .get("auto_targeting_enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            settings.pacing_delivery_type = group
                .get("pacing_delivery_type")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string());
        }

        Ok(settings)
    }

    fn first_batch_item(result: &Value, what: &str) -> JobResult<Value> {
        let Some(item) = result.get("items").and_then(|v| v.as_array()).and_then(|a| a.first())
        else {
            return Err(JobError::validation(format!(
                "unexpected {} API response: {}",
                what, result
            )));
        };
        if let Some(exceptions) = item.get("exceptions").and_then(|v| v.as_array()) {
            if !exceptions.is_empty() {
                return Err(JobError::validation(format!(
                    "{} creation error: {:?}",
                    what, exceptions
                )));
            }
        }
        if item.get("code").is_some() && item.get("data").is_none() {
            return Err(JobError::validation(format!("{} creation error: {}", what, item)));
        }
        Ok(item.get("data").unwrap_or(item).clone())
    }

    /// Creates a campaign cloning the original's objective and tracking.
    pub async fn create_campaign_from_template(
        &self,
        ad_account_id: &str,
        name: &str,
        daily_budget: Decimal,
        original: &OriginalCampaignSettings,
    ) -> JobResult<String> {
        let mut campaign = json!({
            "ad_account_id": ad_account_id,
            "name": name,
            "status": "ACTIVE",
            "objective_type": original.objective_type,
            "daily_spend_cap": amount_to_micros(daily_budget),
            "is_campaign_budget_optimization": true,
        });
        if let Some(tracking_urls) = &original.tracking_urls {
            campaign["tracking_urls"] = tracking_urls.clone();
        }

        let result = self
            .request(
                Method::POST,
                &format!("ad_accounts/{}/campaigns", ad_account_id),
                &[],
                Some(&json!([campaign])),
            )
            .await?;

        let data = Self::first_batch_item(&result, "campaign")?;
        data.get("id")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .ok_or_else(|| JobError::validation("campaign creation returned no id"))
    }

    /// Creates an ad group cloning the original's bidding and targeting.
    pub async fn create_ad_group_from_template(
        &self,
        ad_account_id: &str,
        campaign_id: &str,
        name: &str,
        original: &OriginalCampaignSettings,
    ) -> JobResult<String> {
        let mut ad_group = json!({
            "ad_account_id": ad_account_id,
            "campaign_id": campaign_id,
            "name": name,
            "status": "ACTIVE",
            "billable_event": original.billable_event,
            "bid_strategy_type": original.bid_strategy_type,
            "auto_targeting_enabled": original.auto_targeting_enabled,
        });
        if let Some(targeting_spec) = &original.targeting_spec {
            ad_group["targeting_spec"] = targeting_spec.clone();
        }
        if let Some(goal) = &original.optimization_goal_metadata {
            ad_group["optimization_goal_metadata"] = goal.clone();
        }
        if let Some(pacing) = &original.pacing_delivery_type {
            ad_group["pacing_delivery_type"] = json!(pacing);
        }

        let result = self
            .request(
                Method::POST,
                &format!("ad_accounts/{}/ad_groups", ad_account_id),
                &[],
                Some(&json!([ad_group])),
            )
            .await?;

        let data = Self::first_batch_item(&result, "ad group")?;
        data.get("id")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .ok_or_else(|| JobError::validation("ad group creation returned no id"))
    }

    /// Uploads video bytes through the media API: register, multipart
    /// upload to the signed URL, poll until processing succeeds.
    pub async fn upload_video(&self, video_bytes: Vec<u8>) -> JobResult<String> {
        let register = self
            .request(
                Method::POST,
                "media",
                &[],
                Some(&json!({"media_type": "video"})),
            )
            .await?;

        let media_id = register
            .get("media_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::validation("media registration returned no media_id"))?
            .to_string();
        let upload_url = register
            .get("upload_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::validation("media registration returned no upload_url"))?
            .to_string();

        let mut form = reqwest::multipart::Form::new();
        if let Some(params) = register.get("upload_parameters").and_then(|v| v.as_object()) {
            for (key, value) in params {
                let text = value.as_str().map(|s| s.to_string()).unwrap_or_else(|| value.to_string());
                form = form.text(key.clone(), text);
            }
        }
        form = form.part(
            "file",
            reqwest::multipart::Part::bytes(video_bytes)
                .file_name("video.mp4")
                .mime_str("video/mp4")
                .map_err(|e| JobError::validation(format!("bad mime: {}", e)))?,
        );

        let upload_response = self
            .client
            .post(&upload_url)
            .multipart(form)
            .timeout(Duration::from_secs(300))
            .send()
            .await?;
        if !upload_response.status().is_success() {
            return Err(JobError::transient(format!(
                "video upload failed: {}",
                upload_response.status()
            )));
        }

        // Poll processing status with a bounded budget.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
        loop {
            let status_body = self
                .request(Method::GET, &format!("media/{}", media_id), &[], None)
                .await?;
            match status_body.get("status").and_then(|v| v.as_str()) {
                Some("succeeded") => return Ok(media_id),
                Some("failed") => {
                    return Err(JobError::validation(format!(
                        "video processing failed: {}",
                        status_body
                    )))
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(JobError::transient("video processing timed out"));
            }
            tokio::time::sleep(self.media_poll_interval).await;
        }
    }
}

fn truncate(text: &str, max_length: usize) -> String {
    crate::utils::text::truncate_text(text, max_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::*;
    use httptest::responders::*;
    use httptest::{Expectation, Server};

    fn config_for(server: &Server) -> JobConfig {
        JobConfig {
            supabase_url: "http://unused".to_string(),
            supabase_service_key: "k".to_string(),
            pinterest_app_id: Some("app-id".to_string()),
            pinterest_app_secret: Some("app-secret".to_string()),
            openai_api_key: None,
            google_api_key: None,
            creative_bucket: "winner-creatives".to_string(),
            pinterest_api_base: server.url_str("").trim_end_matches('/').to_string(),
            openai_api_base: "http://unused".to_string(),
            genai_api_base: "http://unused".to_string(),
            run_budget: Duration::from_secs(1800),
            settle_delay: Duration::from_secs(0),
        }
    }

    fn client(server: &Server) -> PinterestClient {
        PinterestClient::new(&config_for(server), "t1", "old-token", Some("refresh-tok")).unwrap()
    }

    #[tokio::test]
    async fn test_401_triggers_single_refresh_and_retry() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/oauth/token"))
                .respond_with(json_encoded(serde_json::json!({
                    "access_token": "new-token",
                    "refresh_token": "new-refresh",
                    "expires_in": 3600
                }))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/user_account"))
                .times(2)
                .respond_with(cycle![
                    status_code(401),
                    json_encoded(serde_json::json!({"username": "shop"})),
                ]),
        );

        let pinterest = client(&server);
        assert!(pinterest.test_connection().await);

        let refreshed = pinterest.take_refreshed_tokens().unwrap();
        assert_eq!(refreshed.access_token, "new-token");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("new-refresh"));
        // Taken once, gone after.
        assert!(pinterest.take_refreshed_tokens().is_none());
    }

    #[tokio::test]
    async fn test_401_without_refresh_token_surfaces_auth_expired() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/user_account"))
                .respond_with(status_code(401)),
        );

        let pinterest =
            PinterestClient::new(&config_for(&server), "t1", "old-token", None).unwrap();
        let err = pinterest
            .request(Method::GET, "user_account", &[], None)
            .await
            .expect_err("must fail");
        assert_eq!(err.kind, crate::contracts::JobErrorKind::AuthExpired);
    }

    #[tokio::test]
    async fn test_create_pin_truncates_copy_and_sets_media() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/pins"),
                request::body(json_decoded(matches_pin_payload())),
            ])
            .respond_with(json_encoded(serde_json::json!({"id": "pin-1"}))),
        );

        let pinterest = client(&server);
        let long_title = "T".repeat(150);
        let pin_id = pinterest
            .create_pin(
                "board-1",
                &long_title,
                "desc",
                Some("https://shop.example.com/collections/drop"),
                MediaSource::ImageBase64 {
                    content_type: "image/jpeg".to_string(),
                    data: "QUJD".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(pin_id, "pin-1");
    }

    fn matches_pin_payload() -> impl Matcher<serde_json::Value> {
        struct M;
        impl std::fmt::Debug for M {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "matches_pin_payload")
            }
        }
        impl Matcher<serde_json::Value> for M {
            fn matches(
                &mut self,
                body: &serde_json::Value,
                _ctx: &mut ExecutionContext,
            ) -> bool {
                let title_ok = body["title"].as_str().map_or(false, |t| t.chars().count() <= 103);
                let media_ok = body["media_source"]["source_type"] == "image_base64";
                let link_ok = body["link"] == "https://shop.example.com/collections/drop";
                title_ok && media_ok && link_ok
            }

            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "matches_pin_payload")
            }
        }
        M
    }

    #[tokio::test]
    async fn test_create_ad_reports_transcoding_code() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/ad_accounts/acct/ads"))
                .times(2)
                .respond_with(cycle![
                    json_encoded(serde_json::json!({"items": [{
                        "exceptions": [{"code": 2945, "message": "media still processing"}]
                    }]})),
                    json_encoded(serde_json::json!({"items": [{
                        "data": {"id": "ad-9"}
                    }]})),
                ]),
        );

        let pinterest = client(&server);
        let first = pinterest
            .create_ad("acct", "ag-1", "pin-1", "Hoodie - Ad 1", "VIDEO")
            .await
            .unwrap();
        assert_eq!(first, AdCreateOutcome::Transcoding);

        let second = pinterest
            .create_ad("acct", "ag-1", "pin-1", "Hoodie - Ad 1", "VIDEO")
            .await
            .unwrap();
        assert_eq!(
            second,
            AdCreateOutcome::Created {
                ad_id: Some("ad-9".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_analytics_converts_micros_and_zero_spend_roas() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/ad_accounts/acct/campaigns/analytics"),
                request::query(url_decoded(contains(("granularity", "TOTAL")))),
                request::query(url_decoded(contains(("campaign_ids", "camp-1")))),
            ])
            .respond_with(json_encoded(serde_json::json!([{
                "SPEND_IN_MICRO_DOLLAR": 150_000_000i64,
                "TOTAL_CONVERSIONS": 5,
                "TOTAL_CONVERSIONS_VALUE_IN_MICRO_DOLLAR": 225_000_000i64
            }]))),
        );

        let pinterest = client(&server);
        let metrics = pinterest.campaign_analytics("acct", "camp-1", 14).await.unwrap();
        assert_eq!(metrics.spend, Decimal::from(150));
        assert_eq!(metrics.checkouts, 5);
        assert_eq!(metrics.roas, Decimal::from_str_exact("1.5").unwrap());

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/ad_accounts/acct/campaigns/analytics",
            ))
            .respond_with(json_encoded(serde_json::json!([]))),
        );
        let pinterest = client(&server);
        let metrics = pinterest.campaign_analytics("acct", "camp-1", 7).await.unwrap();
        assert_eq!(metrics.roas, Decimal::ZERO);
        assert_eq!(metrics.spend, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_get_or_create_ad_group_prefers_active() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/ad_accounts/acct/ad_groups"))
                .respond_with(json_encoded(serde_json::json!({"items": [
                    {"id": "ag-paused", "status": "PAUSED"},
                    {"id": "ag-active", "status": "ACTIVE"}
                ]}))),
        );

        let pinterest = client(&server);
        let ad_group = pinterest
            .get_or_create_ad_group("acct", "camp-1", "Campaign")
            .await
            .unwrap();
        assert_eq!(ad_group.as_deref(), Some("ag-active"));
    }

    #[tokio::test]
    async fn test_budget_update_writes_micro_currency() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PATCH", "/ad_accounts/acct/campaigns"),
                request::body(matches("\"daily_spend_cap\":100000000")),
            ])
            .respond_with(json_encoded(serde_json::json!({"items": []}))),
        );

        let pinterest = client(&server);
        pinterest
            .update_campaign_budget("acct", "camp-1", Decimal::from(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_video_upload_flow_polls_to_success() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/media")).respond_with(
                json_encoded(serde_json::json!({
                    "media_id": "media-7",
                    "upload_url": server.url_str("/signed-upload"),
                    "upload_parameters": {"key": "abc", "policy": "xyz"}
                })),
            ),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/signed-upload"))
                .respond_with(status_code(204)),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/media/media-7"))
                .times(2)
                .respond_with(cycle![
                    json_encoded(serde_json::json!({"status": "processing"})),
                    json_encoded(serde_json::json!({"status": "succeeded"})),
                ]),
        );

        let pinterest = client(&server).with_media_poll_interval(Duration::from_millis(10));
        let media_id = pinterest.upload_video(vec![0u8; 16]).await.unwrap();
        assert_eq!(media_id, "media-7");
    }

    #[tokio::test]
    async fn test_original_settings_fall_back_to_first_ad_group() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/ad_accounts/acct/campaigns/camp-1",
            ))
            .respond_with(json_encoded(serde_json::json!({
                "id": "camp-1",
                "objective_type": "WEB_CONVERSION",
                "tracking_urls": {"click": ["https://t.example.com"]}
            }))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/ad_accounts/acct/ad_groups"))
                .respond_with(json_encoded(serde_json::json!({"items": [{
                    "id": "ag-1",
                    "billable_event": "CLICKTHROUGH",
                    "bid_strategy_type": "MAX_BID",
                    "targeting_spec": {"GENDER": ["female"]},
                    "auto_targeting_enabled": false,
                    "pacing_delivery_type": "STANDARD"
                }]}))),
        );

        let pinterest = client(&server);
        let settings = pinterest
            .original_campaign_settings("acct", "camp-1", None)
            .await
            .unwrap();
        assert_eq!(settings.objective_type, "WEB_CONVERSION");
        assert_eq!(settings.billable_event, "CLICKTHROUGH");
        assert_eq!(settings.bid_strategy_type, "MAX_BID");
        assert!(!settings.auto_targeting_enabled);
        assert_eq!(settings.pacing_delivery_type.as_deref(), Some("STANDARD"));
        assert!(settings.targeting_spec.is_some());
        assert!(settings.tracking_urls.is_some());
    }
}
