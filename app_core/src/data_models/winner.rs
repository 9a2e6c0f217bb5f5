use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contracts::{JobError, JobResult};
use crate::invariants::ensure_range_u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreativeType {
    Video,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Product,
    Collection,
}

/// Per-tenant winner-scaling settings, including the four-bucket criteria
/// and separate campaign caps per creative modality.
#[derive(Debug, Clone, Serialize)]
pub struct WinnerScalingSettings {
    pub tenant_id: String,
    pub enabled: bool,
    pub sales_threshold_3d: i64,
    pub sales_threshold_7d: i64,
    pub sales_threshold_10d: i64,
    pub sales_threshold_14d: i64,
    pub min_buckets_required: u32,
    pub max_campaigns_per_winner_video: u32,
    pub max_campaigns_per_winner_image: u32,
    pub video_enabled: bool,
    pub image_enabled: bool,
    pub video_count: u32,
    pub image_count: u32,
    pub video_prompt: Option<String>,
    pub image_prompt: Option<String>,
    pub link_to_product: bool,
    pub link_to_collection: bool,
    pub daily_budget_per_campaign: Decimal,
}

#[derive(Deserialize)]
struct WinnerScalingSettingsRow {
    tenant_id: String,
    #[serde(default)]
    is_enabled: bool,
    #[serde(default = "default_t3")]
    sales_threshold_3d: i64,
    #[serde(default = "default_t7")]
    sales_threshold_7d: i64,
    #[serde(default = "default_t10")]
    sales_threshold_10d: i64,
    #[serde(default = "default_t14")]
    sales_threshold_14d: i64,
    #[serde(default = "default_min_buckets")]
    min_buckets_required: u32,
    #[serde(default)]
    max_campaigns_per_winner_video: Option<u32>,
    #[serde(default)]
    max_campaigns_per_winner_image: Option<u32>,
    /// Legacy single cap; split across modalities when the per-modality
    /// columns are absent.
    #[serde(default)]
    max_campaigns_per_winner: Option<u32>,
    #[serde(default = "default_true")]
    video_enabled: bool,
    #[serde(default = "default_true")]
    image_enabled: bool,
    #[serde(default = "default_video_count")]
    video_count: u32,
    #[serde(default = "default_image_count")]
    image_count: u32,
    #[serde(default)]
    video_prompt: Option<String>,
    #[serde(default)]
    image_prompt: Option<String>,
    #[serde(default = "default_true")]
    link_to_product: bool,
    #[serde(default = "default_true")]
    link_to_collection: bool,
    #[serde(default = "default_daily_budget")]
    daily_budget_per_campaign: Decimal,
}

impl WinnerScalingSettings {
    pub fn from_row(row: &Value) -> JobResult<Self> {
        let row: WinnerScalingSettingsRow = serde_json::from_value(row.clone())
            .map_err(|e| JobError::validation(format!("bad winner_scaling_settings row: {}", e)))?;

        ensure_range_u32(row.min_buckets_required, 1, 4, "min_buckets_required")?;

        let (max_video, max_image) =
            match (row.max_campaigns_per_winner_video, row.max_campaigns_per_winner_image) {
                (Some(video), Some(image)) => (video, image),
                (Some(video), None) => (video, default_split(row.max_campaigns_per_winner).1),
                (None, Some(image)) => (default_split(row.max_campaigns_per_winner).0, image),
                (None, None) => default_split(row.max_campaigns_per_winner),
            };

        Ok(Self {
            tenant_id: row.tenant_id,
            enabled: row.is_enabled,
            sales_threshold_3d: row.sales_threshold_3d,
            sales_threshold_7d: row.sales_threshold_7d,
            sales_threshold_10d: row.sales_threshold_10d,
            sales_threshold_14d: row.sales_threshold_14d,
            min_buckets_required: row.min_buckets_required,
            max_campaigns_per_winner_video: max_video,
            max_campaigns_per_winner_image: max_image,
            video_enabled: row.video_enabled,
            image_enabled: row.image_enabled,
            video_count: row.video_count,
            image_count: row.image_count,
            video_prompt: row.video_prompt,
            image_prompt: row.image_prompt,
            link_to_product: row.link_to_product,
            link_to_collection: row.link_to_collection,
            daily_budget_per_campaign: row.daily_budget_per_campaign,
        })
    }

    /// How many bucket thresholds the given sales snapshot passes.
    pub fn buckets_passed(&self, sales_3d: i64, sales_7d: i64, sales_10d: i64, sales_14d: i64) -> u32 {
        let mut passed = 0;
        if sales_3d >= self.sales_threshold_3d {
            passed += 1;
        }
        if sales_7d >= self.sales_threshold_7d {
            passed += 1;
        }
        if sales_10d >= self.sales_threshold_10d {
            passed += 1;
        }
        if sales_14d >= self.sales_threshold_14d {
            passed += 1;
        }
        passed
    }

    pub fn is_winner(&self, sales_3d: i64, sales_7d: i64, sales_10d: i64, sales_14d: i64) -> bool {
        self.buckets_passed(sales_3d, sales_7d, sales_10d, sales_14d) >= self.min_buckets_required
    }

    /// Enabled link types in creation order; product wins the fallback when
    /// nothing is enabled.
    pub fn link_types(&self) -> Vec<LinkType> {
        let mut links = Vec::new();
        if self.link_to_product {
            links.push(LinkType::Product);
        }
        if self.link_to_collection {
            links.push(LinkType::Collection);
        }
        if links.is_empty() {
            links.push(LinkType::Product);
        }
        links
    }
}

fn default_split(legacy_cap: Option<u32>) -> (u32, u32) {
    let cap = legacy_cap.unwrap_or(4);
    let video = cap / 2;
    (video, cap - video)
}

/// An identified high-performer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerProduct {
    pub id: String,
    pub tenant_id: String,
    pub product_id: String,
    pub collection_id: String,
    #[serde(default)]
    pub product_title: String,
    #[serde(default)]
    pub product_handle: Option<String>,
    #[serde(default)]
    pub collection_handle: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub sales_3d: i64,
    #[serde(default)]
    pub sales_7d: i64,
    #[serde(default)]
    pub sales_10d: i64,
    #[serde(default)]
    pub sales_14d: i64,
    #[serde(default)]
    pub buckets_passed: u32,
    #[serde(default)]
    pub original_campaign_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub identified_at: Option<DateTime<Utc>>,
}

/// One AI-generated creative asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedCreative {
    pub url: String,
    pub creative_type: CreativeType,
    pub model: String,
    #[serde(default)]
    pub prompt_used: Option<String>,
    #[serde(default)]
    pub pin_id: Option<String>,
}

/// A campaign spawned for a winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerCampaign {
    /// Absent until the store assigns one; never serialized back as null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tenant_id: String,
    pub winner_product_id: String,
    pub pinterest_campaign_id: String,
    #[serde(default)]
    pub pinterest_ad_group_id: Option<String>,
    pub campaign_name: String,
    pub creative_type: CreativeType,
    pub creative_count: u32,
    pub link_type: LinkType,
    pub status: String,
    #[serde(default)]
    pub generated_assets: Vec<GeneratedCreative>,
}

fn default_true() -> bool {
    true
}

fn default_t3() -> i64 {
    5
}

fn default_t7() -> i64 {
    10
}

fn default_t10() -> i64 {
    15
}

fn default_t14() -> i64 {
    20
}

fn default_min_buckets() -> u32 {
    3
}

fn default_video_count() -> u32 {
    2
}

fn default_image_count() -> u32 {
    4
}

fn default_daily_budget() -> Decimal {
    Decimal::from(10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(row: Value) -> WinnerScalingSettings {
        WinnerScalingSettings::from_row(&row).unwrap()
    }

    #[test]
    fn test_bucket_counting_matches_thresholds() {
        let s = settings(json!({
            "tenant_id": "t1",
            "is_enabled": true,
            "sales_threshold_3d": 5,
            "sales_threshold_7d": 10,
            "sales_threshold_10d": 15,
            "sales_threshold_14d": 20,
            "min_buckets_required": 3
        }));

        // 6 >= 5, 12 >= 10, 14 < 15, 25 >= 20 -> 3 buckets, winner
        assert_eq!(s.buckets_passed(6, 12, 14, 25), 3);
        assert!(s.is_winner(6, 12, 14, 25));
        assert!(!s.is_winner(6, 12, 14, 19));
    }

    #[test]
    fn test_legacy_single_cap_splits_across_modalities() {
        let s = settings(json!({
            "tenant_id": "t1",
            "max_campaigns_per_winner": 5
        }));
        assert_eq!(s.max_campaigns_per_winner_video, 2);
        assert_eq!(s.max_campaigns_per_winner_image, 3);

        let s = settings(json!({
            "tenant_id": "t1",
            "max_campaigns_per_winner_video": 1,
            "max_campaigns_per_winner_image": 6
        }));
        assert_eq!(s.max_campaigns_per_winner_video, 1);
        assert_eq!(s.max_campaigns_per_winner_image, 6);
    }

    #[test]
    fn test_min_buckets_out_of_range_is_rejected() {
        let err = WinnerScalingSettings::from_row(&json!({
            "tenant_id": "t1",
            "min_buckets_required": 0
        }))
        .expect_err("must fail");
        assert!(err.message.contains("min_buckets_required"));
    }

    #[test]
    fn test_link_types_fall_back_to_product() {
        let s = settings(json!({
            "tenant_id": "t1",
            "link_to_product": false,
            "link_to_collection": false
        }));
        assert_eq!(s.link_types(), vec![LinkType::Product]);

        let s = settings(json!({"tenant_id": "t1"}));
        assert_eq!(s.link_types(), vec![LinkType::Product, LinkType::Collection]);
    }
}
