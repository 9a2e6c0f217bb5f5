use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use itertools::Itertools;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::config::JobConfig;
use crate::contracts::{JobError, JobResult};
use crate::data_models::job_run::{JobRunStatus, JobRunSummary};
use crate::data_models::money::amount_to_f64;
use crate::data_models::optimization::{MetricsSnapshot, OptimizationRule, OptimizationSettings};
use crate::data_models::pinterest::{
    AdPlatformCampaign, PinterestAuth, PinterestSettings, PinterestSyncLog,
};
use crate::data_models::sales::ProductSales;
use crate::data_models::tenant::{CampaignBatchAssignment, Tenant, TenantRules};
use crate::data_models::winner::{WinnerCampaign, WinnerProduct, WinnerScalingSettings};
use crate::utils::http::{backoff_delay, is_retryable_status, retry_after, MAX_RETRIES};

/// Everything pipeline D and F need to know about a tenant's ad-platform
/// connection, resolved in one store round trip per tenant.
#[derive(Debug, Clone)]
pub struct AdTenantContext {
    pub tenant: Tenant,
    pub auth: PinterestAuth,
    pub ad_account_id: Option<String>,
    pub settings: PinterestSettings,
}

/// Store client over the PostgREST interface.
///
/// Consolidates the per-pipeline store wrappers into one service with typed
/// reads and writes; uniqueness constraints on the tables keep retried
/// writes idempotent.
pub struct SupabaseService {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl SupabaseService {
    pub fn new(config: &JobConfig) -> JobResult<Self> {
        Self::with_base_url(&config.supabase_url, &config.supabase_service_key)
    }

    pub fn with_base_url(base_url: &str, service_key: &str) -> JobResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(service_key)
                .map_err(|_| JobError::validation("service key is not header-safe"))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", service_key))
                .map_err(|_| JobError::validation("service key is not header-safe"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .map_err(|e| JobError::fatal(format!("could not build store client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        prefer: Option<&str>,
    ) -> JobResult<Value> {
        let mut retry_count = 0u32;

        loop {
            let mut builder = self.client.request(method.clone(), url).query(query);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            if let Some(prefer) = prefer {
                builder = builder.header("Prefer", prefer);
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= MAX_RETRIES {
                        return Err(JobError::fatal(format!("store unreachable: {}", e)));
                    }
                    tokio::time::sleep(backoff_delay(retry_count)).await;
                    continue;
                }
            };

            let status = response.status();
            if is_retryable_status(status) {
                let wait = retry_after(response.headers(), 2);
                retry_count += 1;
                if retry_count >= MAX_RETRIES {
                    return Err(JobError::transient(format!("store error {}", status)));
                }
                tokio::time::sleep(wait.max(backoff_delay(retry_count))).await;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(JobError::fatal(format!(
                    "store rejected service credentials ({})",
                    status
                )));
            }
            if status == StatusCode::NOT_FOUND {
                return Err(JobError::not_found(format!("store path not found: {}", url)));
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(JobError::validation(format!(
                    "store error {}: {}",
                    status,
                    text.chars().take(200).collect::<String>()
                )));
            }

            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            let text = response
                .text()
                .await
                .map_err(|e| JobError::validation(format!("bad store response: {}", e)))?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| JobError::validation(format!("bad store response: {}", e)));
        }
    }

    async fn select(&self, table: &str, query: &[(&str, String)]) -> JobResult<Vec<Value>> {
        let url = self.table_url(table);
        let value = self.request(Method::GET, &url, query, None, None).await?;
        match value {
            Value::Array(rows) => Ok(rows),
            other => Err(JobError::validation(format!(
                "expected row array from {}, got {}",
                table, other
            ))),
        }
    }

    async fn insert(&self, table: &str, body: Value) -> JobResult<Vec<Value>> {
        let url = self.table_url(table);
        let value = self
            .request(
                Method::POST,
                &url,
                &[],
                Some(&body),
                Some("return=representation"),
            )
            .await?;
        match value {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    async fn upsert(&self, table: &str, on_conflict: &str, body: Value) -> JobResult<()> {
        let url = self.table_url(table);
        self.request(
            Method::POST,
            &url,
            &[("on_conflict", on_conflict.to_string())],
            Some(&body),
            Some("resolution=merge-duplicates,return=minimal"),
        )
        .await?;
        Ok(())
    }

    async fn update(&self, table: &str, query: &[(&str, String)], body: Value) -> JobResult<()> {
        let url = self.table_url(table);
        self.request(Method::PATCH, &url, query, Some(&body), Some("return=minimal"))
            .await?;
        Ok(())
    }

    async fn delete(&self, table: &str, query: &[(&str, String)]) -> JobResult<()> {
        let url = self.table_url(table);
        self.request(Method::DELETE, &url, query, None, Some("return=minimal"))
            .await?;
        Ok(())
    }

    // ===== Job-run ledger =====

    /// Opens a `running` job-run row. Ledger failures are logged and
    /// swallowed; pipelines run without an id in that case.
    pub async fn open_job_run(&self, job_type: &str, metadata: Value) -> Option<String> {
        let body = json!({
            "job_type": job_type,
            "status": JobRunStatus::Running.as_str(),
            "started_at": Utc::now().to_rfc3339(),
            "metadata": metadata,
        });

        match self.insert("job_runs", body).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("id"))
                .and_then(|id| id.as_str())
                .map(|id| id.to_string()),
            Err(e) => {
                log::error!(target: "job_runs", "could not open job run: {}", e);
                None
            }
        }
    }

    pub async fn close_job_run(
        &self,
        job_id: Option<&str>,
        status: JobRunStatus,
        summary: &JobRunSummary,
    ) {
        let Some(job_id) = job_id else {
            return;
        };

        let mut body = json!({
            "status": status.as_str(),
            "completed_at": Utc::now().to_rfc3339(),
            "tenants_processed": summary.tenants_processed,
            "tenants_failed": summary.tenants_failed,
            "metadata": Value::Object(summary.metadata.clone()),
        });
        if !summary.error_log.is_empty() {
            body["error_log"] = Value::Array(summary.error_log.clone());
        }

        if let Err(e) = self
            .update("job_runs", &[("id", format!("eq.{}", job_id))], body)
            .await
        {
            log::error!(target: "job_runs", "could not close job run {}: {}", job_id, e);
        }
    }

    // ===== Tenants and assignments =====

    async fn tenants_by_ids(&self, ids: &[String]) -> JobResult<HashMap<String, Tenant>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .select(
                "tenants",
                &[
                    ("select", "*".to_string()),
                    ("id", format!("in.({})", ids.iter().join(","))),
                    ("is_active", "eq.true".to_string()),
                ],
            )
            .await?;

        let mut tenants = HashMap::new();
        for row in rows {
            let tenant: Tenant = serde_json::from_value(row)
                .map_err(|e| JobError::validation(format!("bad tenants row: {}", e)))?;
            tenant.validate()?;
            tenants.insert(tenant.id.clone(), tenant);
        }
        Ok(tenants)
    }

    /// Active tenants that have at least one campaign-batch assignment,
    /// paired with their assignments.
    pub async fn tenants_with_assignments(
        &self,
    ) -> JobResult<Vec<(Tenant, Vec<CampaignBatchAssignment>)>> {
        let rows = self
            .select("campaign_batch_assignments", &[("select", "*".to_string())])
            .await?;

        let mut by_tenant: HashMap<String, Vec<CampaignBatchAssignment>> = HashMap::new();
        for row in rows {
            let assignment: CampaignBatchAssignment = serde_json::from_value(row)
                .map_err(|e| {
                    JobError::validation(format!("bad campaign_batch_assignments row: {}", e))
                })?;
            by_tenant
                .entry(assignment.tenant_id.clone())
                .or_default()
                .push(assignment);
        }

        let tenant_ids: Vec<String> = by_tenant.keys().cloned().sorted().collect();
        let tenants = self.tenants_by_ids(&tenant_ids).await?;

        Ok(tenant_ids
            .into_iter()
            .filter_map(|id| {
                let tenant = tenants.get(&id)?.clone();
                let assignments = by_tenant.remove(&id)?;
                Some((tenant, assignments))
            })
            .collect())
    }

    pub async fn tenant_rules(&self, tenant_id: &str) -> JobResult<TenantRules> {
        let rows = self
            .select(
                "tenant_rules",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                ],
            )
            .await?;
        let row = rows.into_iter().next().ok_or_else(|| {
            JobError::validation(format!("tenant {} has no tenant_rules row", tenant_id))
        })?;
        let rules: TenantRules = serde_json::from_value(row)
            .map_err(|e| JobError::validation(format!("bad tenant_rules row: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    // ===== Product sales =====

    pub async fn product_sales(
        &self,
        tenant_id: &str,
        collection_id: &str,
        product_id: &str,
    ) -> JobResult<Option<ProductSales>> {
        let rows = self
            .select(
                "product_sales",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                    ("collection_id", format!("eq.{}", collection_id)),
                    ("product_id", format!("eq.{}", product_id)),
                ],
            )
            .await?;
        rows.into_iter()
            .next()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| JobError::validation(format!("bad product_sales row: {}", e)))
            })
            .transpose()
    }

    pub async fn sales_for_collection(
        &self,
        tenant_id: &str,
        collection_id: &str,
    ) -> JobResult<Vec<ProductSales>> {
        let rows = self
            .select(
                "product_sales",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                    ("collection_id", format!("eq.{}", collection_id)),
                ],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| JobError::validation(format!("bad product_sales row: {}", e)))
            })
            .collect()
    }

    pub async fn upsert_product_sales(&self, sales: &ProductSales) -> JobResult<()> {
        let body = serde_json::to_value(sales)?;
        self.upsert("product_sales", "tenant_id,collection_id,product_id", body)
            .await
    }

    /// Starts tracking a product freshly swapped into a collection: anchors
    /// `date_added_to_collection` at now with zeroed counters. The existing
    /// anchor survives if a row is already present.
    pub async fn start_tracking(
        &self,
        tenant_id: &str,
        collection_id: &str,
        product_id: &str,
        product_title: &str,
    ) -> JobResult<()> {
        if self
            .product_sales(tenant_id, collection_id, product_id)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        self.upsert(
            "product_sales",
            "tenant_id,collection_id,product_id",
            json!({
                "tenant_id": tenant_id,
                "collection_id": collection_id,
                "product_id": product_id,
                "product_title": product_title,
                "date_added_to_collection": now,
                "last_update": now,
            }),
        )
        .await
    }

    /// Rows with any sales in the widest trailing window; input for winner
    /// identification.
    pub async fn sales_with_recent_activity(&self, tenant_id: &str) -> JobResult<Vec<ProductSales>> {
        let rows = self
            .select(
                "product_sales",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                    ("last_14_days", "gt.0".to_string()),
                ],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| JobError::validation(format!("bad product_sales row: {}", e)))
            })
            .collect()
    }

    // ===== Ad-platform connection contexts =====

    async fn ad_context_for_tenants(&self, tenant_ids: &[String]) -> JobResult<Vec<AdTenantContext>> {
        let tenants = self.tenants_by_ids(tenant_ids).await?;
        let mut contexts = Vec::new();

        for tenant_id in tenant_ids {
            let Some(tenant) = tenants.get(tenant_id) else {
                continue;
            };

            let auth_rows = self
                .select(
                    "pinterest_auth",
                    &[
                        ("select", "*".to_string()),
                        ("tenant_id", format!("eq.{}", tenant_id)),
                        ("is_connected", "eq.true".to_string()),
                    ],
                )
                .await?;
            let Some(auth_row) = auth_rows.into_iter().next() else {
                log::info!(target: "store", "tenant {} has no ad-platform connection", tenant_id);
                continue;
            };
            let auth: PinterestAuth = serde_json::from_value(auth_row)
                .map_err(|e| JobError::validation(format!("bad pinterest_auth row: {}", e)))?;

            let account_rows = self
                .select(
                    "pinterest_ad_accounts",
                    &[
                        ("select", "*".to_string()),
                        ("tenant_id", format!("eq.{}", tenant_id)),
                        ("is_selected", "eq.true".to_string()),
                    ],
                )
                .await?;
            let ad_account_id = account_rows
                .first()
                .and_then(|row| row.get("pinterest_account_id"))
                .and_then(|v| v.as_str())
                .map(|v| v.to_string());

            let settings_rows = self
                .select(
                    "pinterest_settings",
                    &[
                        ("select", "*".to_string()),
                        ("tenant_id", format!("eq.{}", tenant_id)),
                    ],
                )
                .await?;
            let settings = settings_rows
                .into_iter()
                .next()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| JobError::validation(format!("bad pinterest_settings row: {}", e)))?
                .unwrap_or_default();

            contexts.push(AdTenantContext {
                tenant: tenant.clone(),
                auth,
                ad_account_id,
                settings,
            });
        }

        Ok(contexts)
    }

    /// Tenants with a connected ad-platform auth, for the ad-sync pipeline.
    pub async fn tenants_with_ad_connection(&self) -> JobResult<Vec<AdTenantContext>> {
        let rows = self
            .select(
                "pinterest_auth",
                &[
                    ("select", "tenant_id".to_string()),
                    ("is_connected", "eq.true".to_string()),
                ],
            )
            .await?;
        let ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("tenant_id").and_then(|v| v.as_str()))
            .map(|v| v.to_string())
            .sorted()
            .dedup()
            .collect();
        self.ad_context_for_tenants(&ids).await
    }

    /// Tenants whose flag is set in the given settings table
    /// (`optimization_settings` / `winner_scaling_settings`).
    pub async fn tenants_with_flag_enabled(&self, table: &str) -> JobResult<Vec<AdTenantContext>> {
        let rows = self
            .select(
                table,
                &[
                    ("select", "tenant_id".to_string()),
                    ("is_enabled", "eq.true".to_string()),
                ],
            )
            .await?;
        let ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("tenant_id").and_then(|v| v.as_str()))
            .map(|v| v.to_string())
            .sorted()
            .dedup()
            .collect();
        self.ad_context_for_tenants(&ids).await
    }

    pub async fn update_pinterest_tokens(
        &self,
        tenant_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<&str>,
    ) -> JobResult<()> {
        let mut body = json!({
            "access_token": access_token,
            "updated_at": Utc::now().to_rfc3339(),
        });
        if let Some(refresh_token) = refresh_token {
            body["refresh_token"] = json!(refresh_token);
        }
        if let Some(expires_at) = expires_at {
            body["expires_at"] = json!(expires_at);
        }
        self.update(
            "pinterest_auth",
            &[("tenant_id", format!("eq.{}", tenant_id))],
            body,
        )
        .await
    }

    // ===== Campaign mirror =====

    pub async fn campaigns_with_assignments(
        &self,
        tenant_id: &str,
    ) -> JobResult<Vec<(AdPlatformCampaign, Vec<CampaignBatchAssignment>)>> {
        let campaign_rows = self
            .select(
                "pinterest_campaigns",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                ],
            )
            .await?;

        let mut out = Vec::new();
        for row in campaign_rows {
            let campaign: AdPlatformCampaign = serde_json::from_value(row)
                .map_err(|e| JobError::validation(format!("bad pinterest_campaigns row: {}", e)))?;

            let assignment_rows = self
                .select(
                    "campaign_batch_assignments",
                    &[
                        ("select", "*".to_string()),
                        ("campaign_id", format!("eq.{}", campaign.id)),
                    ],
                )
                .await?;
            let assignments = assignment_rows
                .into_iter()
                .map(|row| {
                    serde_json::from_value(row).map_err(|e| {
                        JobError::validation(format!("bad campaign_batch_assignments row: {}", e))
                    })
                })
                .collect::<JobResult<Vec<CampaignBatchAssignment>>>()?;

            if !assignments.is_empty() {
                out.push((campaign, assignments));
            }
        }
        Ok(out)
    }

    pub async fn active_campaigns(&self, tenant_id: &str) -> JobResult<Vec<AdPlatformCampaign>> {
        let rows = self
            .select(
                "pinterest_campaigns",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                    ("status", "eq.ACTIVE".to_string()),
                ],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| JobError::validation(format!("bad pinterest_campaigns row: {}", e)))
            })
            .collect()
    }

    pub async fn campaign_by_id(&self, id: &str) -> JobResult<Option<AdPlatformCampaign>> {
        let rows = self
            .select(
                "pinterest_campaigns",
                &[("select", "*".to_string()), ("id", format!("eq.{}", id))],
            )
            .await?;
        rows.into_iter()
            .next()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| JobError::validation(format!("bad pinterest_campaigns row: {}", e)))
            })
            .transpose()
    }

    pub async fn update_campaign_budget(&self, id: &str, new_budget: Decimal) -> JobResult<()> {
        self.update(
            "pinterest_campaigns",
            &[("id", format!("eq.{}", id))],
            json!({"daily_budget": amount_to_f64(new_budget)}),
        )
        .await
    }

    pub async fn update_campaign_status(&self, id: &str, status: &str) -> JobResult<()> {
        self.update(
            "pinterest_campaigns",
            &[("id", format!("eq.{}", id))],
            json!({"status": status}),
        )
        .await
    }

    /// Mirrors ACTIVE platform campaigns into the store. `daily_spend_cap`
    /// arrives in micro-currency.
    pub async fn mirror_active_campaigns(
        &self,
        tenant_id: &str,
        ad_account_id: &str,
        platform_campaigns: &[Value],
    ) -> JobResult<usize> {
        let mut synced = 0usize;
        for campaign in platform_campaigns {
            if campaign.get("status").and_then(|s| s.as_str()) != Some("ACTIVE") {
                continue;
            }
            let Some(campaign_id) = campaign.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let daily_budget = campaign
                .get("daily_spend_cap")
                .and_then(|v| v.as_i64())
                .map(crate::data_models::money::micros_to_amount)
                .unwrap_or_default();

            self.upsert(
                "pinterest_campaigns",
                "tenant_id,pinterest_campaign_id",
                json!({
                    "tenant_id": tenant_id,
                    "pinterest_campaign_id": campaign_id,
                    "ad_account_id": ad_account_id,
                    "name": campaign.get("name").and_then(|v| v.as_str()).unwrap_or("Unnamed Campaign"),
                    "status": "ACTIVE",
                    "daily_budget": amount_to_f64(daily_budget),
                    "created_time": campaign.get("created_time").and_then(|v| v.as_i64()),
                }),
            )
            .await?;
            synced += 1;
        }
        Ok(synced)
    }

    /// One-shot cleanup when a campaign is observed PAUSED on the platform:
    /// drops the assignment's sales aggregates and the assignments, keeps
    /// the sync log as history. Returns (assignments, sales rows) deleted.
    pub async fn cleanup_paused_campaign(
        &self,
        tenant_id: &str,
        campaign_id: &str,
    ) -> JobResult<(usize, usize)> {
        let assignment_rows = self
            .select(
                "campaign_batch_assignments",
                &[
                    ("select", "id,collection_id".to_string()),
                    ("campaign_id", format!("eq.{}", campaign_id)),
                ],
            )
            .await?;

        let collection_ids: Vec<String> = assignment_rows
            .iter()
            .filter_map(|row| row.get("collection_id").and_then(|v| v.as_str()))
            .map(|v| v.to_string())
            .sorted()
            .dedup()
            .collect();

        let mut sales_deleted = 0usize;
        if !collection_ids.is_empty() {
            let sales_rows = self
                .select(
                    "product_sales",
                    &[
                        ("select", "product_id".to_string()),
                        ("tenant_id", format!("eq.{}", tenant_id)),
                        (
                            "collection_id",
                            format!("in.({})", collection_ids.iter().join(",")),
                        ),
                    ],
                )
                .await?;
            sales_deleted = sales_rows.len();
            if sales_deleted > 0 {
                self.delete(
                    "product_sales",
                    &[
                        ("tenant_id", format!("eq.{}", tenant_id)),
                        (
                            "collection_id",
                            format!("in.({})", collection_ids.iter().join(",")),
                        ),
                    ],
                )
                .await?;
            }
        }

        let assignments_deleted = assignment_rows.len();
        if assignments_deleted > 0 {
            self.delete(
                "campaign_batch_assignments",
                &[("campaign_id", format!("eq.{}", campaign_id))],
            )
            .await?;
        }

        Ok((assignments_deleted, sales_deleted))
    }

    // ===== Pin sync log =====

    pub async fn active_syncs_for_campaign(
        &self,
        tenant_id: &str,
        campaign_id: &str,
    ) -> JobResult<Vec<PinterestSyncLog>> {
        let rows = self
            .select(
                "pinterest_sync_log",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                    ("campaign_id", format!("eq.{}", campaign_id)),
                    ("success", "eq.true".to_string()),
                    ("paused", "eq.false".to_string()),
                ],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| JobError::validation(format!("bad pinterest_sync_log row: {}", e)))
            })
            .collect()
    }

    pub async fn is_product_synced(
        &self,
        tenant_id: &str,
        campaign_id: &str,
        product_id: &str,
    ) -> JobResult<bool> {
        let rows = self
            .select(
                "pinterest_sync_log",
                &[
                    ("select", "id".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                    ("campaign_id", format!("eq.{}", campaign_id)),
                    ("product_id", format!("eq.{}", product_id)),
                    ("success", "eq.true".to_string()),
                    ("paused", "eq.false".to_string()),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log_sync_result(
        &self,
        tenant_id: &str,
        campaign_id: &str,
        product_id: &str,
        board_id: &str,
        pin_id: Option<&str>,
        ad_id: Option<&str>,
        ad_group_id: Option<&str>,
        success: bool,
        error: Option<&str>,
    ) -> JobResult<()> {
        let body = json!({
            "tenant_id": tenant_id,
            "campaign_id": campaign_id,
            "product_id": product_id,
            "board_id": board_id,
            "pin_id": pin_id,
            "ad_id": ad_id,
            "ad_group_id": ad_group_id,
            "success": success,
            "error": error,
            "paused": false,
            "synced_at": Utc::now().to_rfc3339(),
        });
        self.insert("pinterest_sync_log", body).await?;
        Ok(())
    }

    pub async fn mark_sync_paused(
        &self,
        tenant_id: &str,
        campaign_id: &str,
        product_id: &str,
    ) -> JobResult<()> {
        self.update(
            "pinterest_sync_log",
            &[
                ("tenant_id", format!("eq.{}", tenant_id)),
                ("campaign_id", format!("eq.{}", campaign_id)),
                ("product_id", format!("eq.{}", product_id)),
                ("paused", "eq.false".to_string()),
            ],
            json!({"paused": true}),
        )
        .await
    }

    /// Most recent sync-log row for a product; locates the original campaign
    /// the winner scaler clones settings from.
    pub async fn latest_sync_for_product(
        &self,
        tenant_id: &str,
        product_id: &str,
    ) -> JobResult<Option<PinterestSyncLog>> {
        let rows = self
            .select(
                "pinterest_sync_log",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                    ("product_id", format!("eq.{}", product_id)),
                    ("success", "eq.true".to_string()),
                    ("order", "synced_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        rows.into_iter()
            .next()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| JobError::validation(format!("bad pinterest_sync_log row: {}", e)))
            })
            .transpose()
    }

    // ===== Optimizer =====

    pub async fn optimization_settings(
        &self,
        tenant_id: &str,
    ) -> JobResult<Option<OptimizationSettings>> {
        let rows = self
            .select(
                "optimization_settings",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                ],
            )
            .await?;
        rows.into_iter()
            .next()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| JobError::validation(format!("bad optimization_settings row: {}", e)))
            })
            .transpose()
    }

    pub async fn optimization_rules(&self, tenant_id: &str) -> JobResult<Vec<OptimizationRule>> {
        let rows = self
            .select(
                "optimization_rules",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                    ("is_enabled", "eq.true".to_string()),
                    ("order", "priority.desc".to_string()),
                ],
            )
            .await?;
        rows.iter().map(OptimizationRule::from_row).collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log_optimization_action(
        &self,
        tenant_id: &str,
        campaign_id: &str,
        rule_id: Option<&str>,
        action_taken: &str,
        old_budget: Decimal,
        new_budget: Decimal,
        old_status: Option<&str>,
        new_status: Option<&str>,
        metrics: &MetricsSnapshot,
        is_test_run: bool,
        error_message: Option<&str>,
    ) -> JobResult<()> {
        let body = json!({
            "tenant_id": tenant_id,
            "campaign_id": campaign_id,
            "rule_id": rule_id,
            "action_taken": action_taken,
            "old_budget": amount_to_f64(old_budget),
            "new_budget": amount_to_f64(new_budget),
            "old_status": old_status,
            "new_status": new_status,
            "metrics_snapshot": serde_json::to_value(metrics)?,
            "is_test_run": is_test_run,
            "error_message": error_message,
            "executed_at": Utc::now().to_rfc3339(),
        });
        self.insert("optimization_log", body).await?;
        Ok(())
    }

    // ===== Winner scaler =====

    pub async fn winner_scaling_settings(
        &self,
        tenant_id: &str,
    ) -> JobResult<Option<WinnerScalingSettings>> {
        let rows = self
            .select(
                "winner_scaling_settings",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                ],
            )
            .await?;
        rows.iter().next().map(WinnerScalingSettings::from_row).transpose()
    }

    /// Existing winners keyed by `(product_id, collection_id)`.
    pub async fn existing_winners(
        &self,
        tenant_id: &str,
    ) -> JobResult<HashMap<(String, String), WinnerProduct>> {
        let rows = self
            .select(
                "winner_products",
                &[
                    ("select", "*".to_string()),
                    ("tenant_id", format!("eq.{}", tenant_id)),
                ],
            )
            .await?;

        let mut winners = HashMap::new();
        for row in rows {
            let winner: WinnerProduct = serde_json::from_value(row)
                .map_err(|e| JobError::validation(format!("bad winner_products row: {}", e)))?;
            winners.insert(
                (winner.product_id.clone(), winner.collection_id.clone()),
                winner,
            );
        }
        Ok(winners)
    }

    pub async fn insert_winner(
        &self,
        tenant_id: &str,
        sales: &ProductSales,
        original_campaign_id: Option<&str>,
        buckets_passed: u32,
    ) -> JobResult<String> {
        let rows = self
            .insert(
                "winner_products",
                json!({
                    "tenant_id": tenant_id,
                    "product_id": sales.product_id,
                    "collection_id": sales.collection_id,
                    "product_title": sales.product_title,
                    "product_handle": sales.product_handle,
                    "collection_handle": sales.collection_handle,
                    "image_url": sales.image_url,
                    "is_active": true,
                    "sales_3d": sales.last_3_days,
                    "sales_7d": sales.last_7_days,
                    "sales_10d": sales.last_10_days,
                    "sales_14d": sales.last_14_days,
                    "buckets_passed": buckets_passed,
                    "original_campaign_id": original_campaign_id,
                    "identified_at": Utc::now().to_rfc3339(),
                }),
            )
            .await?;
        rows.first()
            .and_then(|row| row.get("id"))
            .and_then(|id| id.as_str())
            .map(|id| id.to_string())
            .ok_or_else(|| JobError::validation("winner_products insert returned no id"))
    }

    pub async fn update_winner_sales(
        &self,
        winner_id: &str,
        sales: &ProductSales,
        buckets_passed: u32,
    ) -> JobResult<()> {
        self.update(
            "winner_products",
            &[("id", format!("eq.{}", winner_id))],
            json!({
                "sales_3d": sales.last_3_days,
                "sales_7d": sales.last_7_days,
                "sales_10d": sales.last_10_days,
                "sales_14d": sales.last_14_days,
                "buckets_passed": buckets_passed,
            }),
        )
        .await
    }

    pub async fn winner_campaigns(&self, winner_id: &str) -> JobResult<Vec<WinnerCampaign>> {
        let rows = self
            .select(
                "winner_campaigns",
                &[
                    ("select", "*".to_string()),
                    ("winner_product_id", format!("eq.{}", winner_id)),
                ],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| JobError::validation(format!("bad winner_campaigns row: {}", e)))
            })
            .collect()
    }

    pub async fn insert_winner_campaign(&self, campaign: &WinnerCampaign) -> JobResult<String> {
        let rows = self
            .insert("winner_campaigns", serde_json::to_value(campaign)?)
            .await?;
        rows.first()
            .and_then(|row| row.get("id"))
            .and_then(|id| id.as_str())
            .map(|id| id.to_string())
            .ok_or_else(|| JobError::validation("winner_campaigns insert returned no id"))
    }

    pub async fn update_winner_campaign_status(&self, id: &str, status: &str) -> JobResult<()> {
        self.update(
            "winner_campaigns",
            &[("id", format!("eq.{}", id))],
            json!({"status": status}),
        )
        .await
    }

    /// Audit row in `winner_scaling_log`; failures are logged and swallowed
    /// so the audit trail never breaks the pipeline.
    pub async fn log_winner_action(
        &self,
        tenant_id: Option<&str>,
        winner_product_id: Option<&str>,
        action_type: &str,
        details: Value,
    ) {
        let body = json!({
            "tenant_id": tenant_id,
            "winner_product_id": winner_product_id,
            "action_type": action_type,
            "details": details,
            "executed_at": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.insert("winner_scaling_log", body).await {
            log::error!(target: "winner_scaling", "could not write audit row: {}", e);
        }
    }

    // ===== Object storage =====

    /// Uploads bytes to the public creative bucket and returns the stable
    /// public URL.
    pub async fn upload_to_storage(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> JobResult<String> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .header(AUTHORIZATION, format!("Bearer {}", self.service_key))
            .body(bytes)
            .timeout(Duration::from_secs(120))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(JobError::transient(format!(
                "storage upload failed ({}): {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        Ok(format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::*;
    use httptest::responders::*;
    use httptest::{Expectation, Server};

    fn service(server: &Server) -> SupabaseService {
        SupabaseService::with_base_url(&server.url_str(""), "service-key").unwrap()
    }

    #[tokio::test]
    async fn test_open_job_run_returns_id_and_swallow_on_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("POST"),
                request::path("/rest/v1/job_runs"),
                request::headers(contains(("apikey", "service-key"))),
            ])
            .respond_with(json_encoded(serde_json::json!([{"id": "run-1"}]))),
        );

        let db = service(&server);
        let id = db
            .open_job_run("sales_tracker", serde_json::json!({}))
            .await;
        assert_eq!(id.as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_close_job_run_patches_by_id() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("PATCH"),
                request::path("/rest/v1/job_runs"),
                request::query(url_decoded(contains(("id", "eq.run-1")))),
                request::body(json_decoded(all_of![
                    json_path_eq("$.status", "completed_with_errors"),
                    json_path_eq("$.tenants_failed", 1),
                ])),
            ])
            .respond_with(status_code(204)),
        );

        let db = service(&server);
        let mut summary = JobRunSummary::default();
        summary.record_tenant_failure(serde_json::json!({"tenant": "t1", "error": "boom"}));
        db.close_job_run(Some("run-1"), JobRunStatus::CompletedWithErrors, &summary)
            .await;
    }

    // json_decoded matcher helpers
    fn json_path_eq(path: &str, expected: impl Into<serde_json::Value>) -> JsonPathEq {
        JsonPathEq {
            path: path.trim_start_matches("$.").to_string(),
            expected: expected.into(),
        }
    }

    #[derive(Debug)]
    struct JsonPathEq {
        path: String,
        expected: serde_json::Value,
    }

    impl httptest::matchers::Matcher<serde_json::Value> for JsonPathEq {
        fn matches(
            &mut self,
            input: &serde_json::Value,
            _ctx: &mut httptest::matchers::ExecutionContext,
        ) -> bool {
            input.get(&self.path) == Some(&self.expected)
        }

        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "JsonPathEq({} == {})", self.path, self.expected)
        }
    }

    #[tokio::test]
    async fn test_upsert_product_sales_sets_conflict_target() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("POST"),
                request::path("/rest/v1/product_sales"),
                request::query(url_decoded(contains((
                    "on_conflict",
                    "tenant_id,collection_id,product_id"
                )))),
                request::headers(contains((
                    "prefer",
                    "resolution=merge-duplicates,return=minimal"
                ))),
            ])
            .respond_with(status_code(201)),
        );

        let db = service(&server);
        let sales: ProductSales = serde_json::from_value(serde_json::json!({
            "tenant_id": "t1",
            "collection_id": "c1",
            "product_id": "p1",
            "date_added_to_collection": "2026-07-01T00:00:00Z",
            "last_update": "2026-07-20T00:00:00Z"
        }))
        .unwrap();
        db.upsert_product_sales(&sales).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_errors_are_retried_then_fatal() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/rest/v1/tenant_rules"))
                .times(MAX_RETRIES as usize..)
                .respond_with(status_code(503)),
        );

        let db = service(&server);
        let err = db.tenant_rules("t1").await.expect_err("must fail");
        assert_eq!(err.kind, crate::contracts::JobErrorKind::TransientHttp);
    }

    #[tokio::test]
    async fn test_legacy_rule_rows_parse_via_from_row() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path("/rest/v1/optimization_rules"),
                request::query(url_decoded(contains(("is_enabled", "eq.true")))),
                request::query(url_decoded(contains(("order", "priority.desc")))),
            ])
            .respond_with(json_encoded(serde_json::json!([{
                "id": "r1",
                "tenant_id": "t1",
                "action_type": "pause",
                "conditions": [
                    {"metric": "spend", "operator": ">=", "value": 100}
                ]
            }]))),
        );

        let db = service(&server);
        let rules = db.optimization_rules("t1").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].condition_groups.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_sales_then_assignments_keeps_sync_log() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path("/rest/v1/campaign_batch_assignments"),
            ])
            .respond_with(json_encoded(serde_json::json!([
                {"id": "a1", "collection_id": "c1"},
                {"id": "a2", "collection_id": "c2"}
            ]))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path("/rest/v1/product_sales"),
                request::query(url_decoded(contains(("collection_id", "in.(c1,c2)")))),
            ])
            .respond_with(json_encoded(serde_json::json!([
                {"product_id": "p1"}, {"product_id": "p2"}, {"product_id": "p3"}
            ]))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method("DELETE"),
                request::path("/rest/v1/product_sales"),
            ])
            .respond_with(status_code(204)),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method("DELETE"),
                request::path("/rest/v1/campaign_batch_assignments"),
                request::query(url_decoded(contains(("campaign_id", "eq.camp-1")))),
            ])
            .respond_with(status_code(204)),
        );

        let db = service(&server);
        let (assignments, sales) = db.cleanup_paused_campaign("t1", "camp-1").await.unwrap();
        assert_eq!(assignments, 2);
        assert_eq!(sales, 3);
    }

    #[tokio::test]
    async fn test_storage_upload_returns_public_url() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("POST"),
                request::path("/storage/v1/object/winner-creatives/winner-images/a.png"),
                request::headers(contains(("content-type", "image/png"))),
            ])
            .respond_with(json_encoded(serde_json::json!({"Key": "ok"}))),
        );

        let db = service(&server);
        let url = db
            .upload_to_storage(
                "winner-creatives",
                "winner-images/a.png",
                vec![1, 2, 3],
                "image/png",
            )
            .await
            .unwrap();
        assert!(url.ends_with("/storage/v1/object/public/winner-creatives/winner-images/a.png"));
    }

    #[tokio::test]
    async fn test_start_tracking_preserves_existing_anchor() {
        let server = Server::run();
        // Existing row -> no upsert issued.
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path("/rest/v1/product_sales"),
            ])
            .respond_with(json_encoded(serde_json::json!([{
                "tenant_id": "t1",
                "collection_id": "c1",
                "product_id": "p1",
                "date_added_to_collection": "2026-01-01T00:00:00Z",
                "last_update": "2026-01-02T00:00:00Z"
            }]))),
        );

        let db = service(&server);
        db.start_tracking("t1", "c1", "p1", "Hoodie").await.unwrap();
    }
}
