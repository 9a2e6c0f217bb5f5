use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-`(tenant, collection, product)` sales aggregate.
///
/// `date_added_to_collection` is the anchor: set once when the product is
/// first observed in the collection and never overwritten. `last_update`
/// only moves forward. The five counters are maintained by the sales
/// tracker; everything downstream (replacement, optimizer, winner scaler)
/// reads them from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSales {
    pub tenant_id: String,
    pub collection_id: String,
    pub product_id: String,
    #[serde(default)]
    pub product_title: String,
    #[serde(default)]
    pub product_handle: Option<String>,
    #[serde(default)]
    pub collection_handle: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    pub date_added_to_collection: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub first_7_days: i64,
    #[serde(default)]
    pub last_3_days: i64,
    #[serde(default)]
    pub last_7_days: i64,
    #[serde(default)]
    pub last_10_days: i64,
    #[serde(default)]
    pub last_14_days: i64,
    #[serde(default)]
    pub total_sales: Decimal,
    #[serde(default)]
    pub total_quantity: i64,
}

impl ProductSales {
    /// Whether the window counters are mutually consistent. The four
    /// trailing windows are nested, so the counts must be non-decreasing.
    pub fn windows_are_monotonic(&self) -> bool {
        self.last_3_days <= self.last_7_days
            && self.last_7_days <= self.last_10_days
            && self.last_10_days <= self.last_14_days
    }

    pub fn had_recent_sales(&self) -> bool {
        self.last_14_days > 0
    }
}
