use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-tenant OAuth token bundle for the ad platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinterestAuth {
    pub tenant_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_connected: bool,
}

impl PinterestAuth {
    /// Expired or within five minutes of expiring.
    pub fn expires_soon(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now >= expiry - Duration::minutes(5),
            None => false,
        }
    }
}

/// The ad account the tenant selected; exactly one is marked selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdAccountSelection {
    pub tenant_id: String,
    pub pinterest_account_id: String,
    #[serde(default)]
    pub is_selected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    ReplaceCampaign,
    WinnerCampaign,
}

impl Default for CampaignType {
    fn default() -> Self {
        CampaignType::ReplaceCampaign
    }
}

/// Mirrored ad-platform campaign metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdPlatformCampaign {
    pub id: String,
    pub tenant_id: String,
    pub pinterest_campaign_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub daily_budget: Decimal,
    #[serde(default)]
    pub campaign_type: CampaignType,
    /// Unix timestamp of creation on the ad platform, when known.
    #[serde(default)]
    pub created_time: Option<i64>,
}

impl AdPlatformCampaign {
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> Option<i64> {
        let created = DateTime::<Utc>::from_timestamp(self.created_time?, 0)?;
        Some((now - created).num_days())
    }
}

fn default_status() -> String {
    "ACTIVE".to_string()
}

/// Immutable record of one product-pin creation attempt.
///
/// At most one row per `(tenant, campaign, product)` has `paused = false`;
/// the store enforces this with a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinterestSyncLog {
    pub id: String,
    pub tenant_id: String,
    pub campaign_id: String,
    pub product_id: String,
    #[serde(default)]
    pub board_id: Option<String>,
    #[serde(default)]
    pub pin_id: Option<String>,
    #[serde(default)]
    pub ad_id: Option<String>,
    #[serde(default)]
    pub ad_group_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub synced_at: DateTime<Utc>,
    #[serde(default)]
    pub paused: bool,
}

/// Tenant-level pin publishing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinterestSettings {
    #[serde(default)]
    pub url_prefix: String,
    #[serde(default)]
    pub default_board_id: Option<String>,
    #[serde(default = "default_batch_size")]
    pub global_batch_size: usize,
    #[serde(default = "default_products_per_page")]
    pub products_per_page: usize,
}

impl Default for PinterestSettings {
    fn default() -> Self {
        Self {
            url_prefix: String::new(),
            default_board_id: None,
            global_batch_size: default_batch_size(),
            products_per_page: default_products_per_page(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_products_per_page() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry_window_is_five_minutes() {
        let now = Utc::now();
        let auth = PinterestAuth {
            tenant_id: "t1".into(),
            access_token: "tok".into(),
            refresh_token: Some("ref".into()),
            expires_at: Some(now + Duration::minutes(4)),
            is_connected: true,
        };
        assert!(auth.expires_soon(now));

        let auth = PinterestAuth {
            expires_at: Some(now + Duration::minutes(10)),
            ..auth
        };
        assert!(!auth.expires_soon(now));

        let auth = PinterestAuth {
            expires_at: None,
            ..auth
        };
        assert!(!auth.expires_soon(now));
    }

    #[test]
    fn test_campaign_age_from_created_time() {
        let campaign: AdPlatformCampaign = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "tenant_id": "t1",
            "pinterest_campaign_id": "999",
            "status": "ACTIVE",
            "created_time": Utc::now().timestamp() - 86_400 * 10
        }))
        .unwrap();

        assert_eq!(campaign.age_days(Utc::now()), Some(10));
        assert_eq!(campaign.campaign_type, CampaignType::ReplaceCampaign);
    }

    #[test]
    fn test_settings_defaults() {
        let settings: PinterestSettings = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(settings.global_batch_size, 50);
        assert_eq!(settings.products_per_page, 10);
        assert!(settings.default_board_id.is_none());
    }
}
