use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

/// # NDOC
/// component: `sales_windows`
/// purpose: Pure bucketing of deduplicated order lines into the five sales
///   counters, using the shop's local calendar.
/// invariants:
///   - `first_7_days` counts lines inside `[anchor, anchor + 7d]`.
///   - `last_N_days` counts lines whose local date falls in the N days
///     immediately preceding the current local day; today is excluded so a
///     still-open day never reads as a dip.
///   - The four trailing windows are nested: last_3 <= last_7 <= last_10 <= last_14.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WindowCounters {
    pub first_7_days: i64,
    pub last_3_days: i64,
    pub last_7_days: i64,
    pub last_10_days: i64,
    pub last_14_days: i64,
}

/// Buckets `(occurred_at, quantity)` order lines. Callers must already have
/// deduplicated lines by `(order_id, line_item_id)`.
pub fn bucket_order_lines(
    lines: &[(DateTime<Utc>, i64)],
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
    shop_tz: Tz,
) -> WindowCounters {
    let mut counters = WindowCounters::default();
    let first_window_end = anchor + Duration::days(7);
    let today_local = now.with_timezone(&shop_tz).date_naive();

    for &(occurred_at, quantity) in lines {
        if occurred_at >= anchor && occurred_at <= first_window_end {
            counters.first_7_days += quantity;
        }

        let line_local = occurred_at.with_timezone(&shop_tz).date_naive();
        let days_before_today = (today_local - line_local).num_days();
        // 0 is today (excluded); 1 is yesterday, the newest counted day.
        if days_before_today < 1 {
            continue;
        }
        if days_before_today <= 3 {
            counters.last_3_days += quantity;
        }
        if days_before_today <= 7 {
            counters.last_7_days += quantity;
        }
        if days_before_today <= 10 {
            counters.last_10_days += quantity;
        }
        if days_before_today <= 14 {
            counters.last_14_days += quantity;
        }
    }

    counters
}
