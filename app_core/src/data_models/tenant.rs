use serde::{Deserialize, Serialize};

use crate::contracts::{JobError, JobResult};
use crate::invariants::{ensure_non_empty_trimmed, ensure_range_u32};

/// A tenant (one connected shop). Created by the web tier; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub shop_domain: String,
    pub access_token: String,
    #[serde(default)]
    pub is_active: bool,
}

impl Tenant {
    pub fn validate(&self) -> JobResult<()> {
        ensure_non_empty_trimmed(&self.id, "tenants.id")?;
        ensure_non_empty_trimmed(&self.shop_domain, "tenants.shop_domain")?;
        ensure_non_empty_trimmed(&self.access_token, "tenants.access_token")?;
        Ok(())
    }
}

/// Per-tenant lifecycle thresholds driving the replacement engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRules {
    pub tenant_id: String,
    pub start_phase_days: i64,
    pub post_phase_days: i64,
    #[serde(default)]
    pub min_sales_day7_delete: i64,
    #[serde(default = "default_replace_threshold")]
    pub min_sales_day7_replace: i64,
    #[serde(default)]
    pub avg3_ok: i64,
    #[serde(default)]
    pub avg7_ok: i64,
    #[serde(default)]
    pub avg10_ok: i64,
    #[serde(default)]
    pub avg14_ok: i64,
    #[serde(default = "default_min_ok_buckets")]
    pub min_ok_buckets: u32,
    #[serde(default = "default_loser_threshold")]
    pub loser_threshold: i64,
    #[serde(default = "default_queue_tag")]
    pub queue_tag: String,
    #[serde(default = "default_replace_tag_prefix")]
    pub replace_tag_prefix: String,
    #[serde(default = "default_true")]
    pub maintain_positions: bool,
    #[serde(default)]
    pub test_mode: bool,
}

impl TenantRules {
    pub fn validate(&self) -> JobResult<()> {
        if self.start_phase_days < 0 || self.post_phase_days < self.start_phase_days {
            return Err(JobError::validation(format!(
                "tenant_rules phase window is inconsistent: start={} post={}",
                self.start_phase_days, self.post_phase_days
            )));
        }
        ensure_range_u32(self.min_ok_buckets, 0, 4, "tenant_rules.min_ok_buckets")?;
        ensure_non_empty_trimmed(&self.queue_tag, "tenant_rules.queue_tag")?;
        Ok(())
    }
}

fn default_replace_threshold() -> i64 {
    1
}

fn default_min_ok_buckets() -> u32 {
    2
}

fn default_loser_threshold() -> i64 {
    5
}

fn default_queue_tag() -> String {
    "QK".to_string()
}

fn default_replace_tag_prefix() -> String {
    "replaced_".to_string()
}

fn default_true() -> bool {
    true
}

/// A commerce-platform collection the tenant elected to track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedCollection {
    pub tenant_id: String,
    pub collection_id: String,
    #[serde(default)]
    pub title: String,
}

/// Binds `(tenant, campaign, collection, batch_indices[])`; the driver of
/// the replacement and ad-sync pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignBatchAssignment {
    pub id: String,
    pub tenant_id: String,
    pub campaign_id: String,
    pub collection_id: String,
    #[serde(default)]
    pub batch_indices: Vec<u32>,
}
