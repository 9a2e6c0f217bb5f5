use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::data_models::sales::ProductSales;
use crate::data_models::tenant::TenantRules;

/// # NDOC
/// component: `replacement_logic`
/// purpose: Lifecycle state machine and replacement planning for tracked
///   collection products. Pure decisions only; the job executes them.
/// invariants:
///   - Phase boundaries are inclusive at the lower bound: a product exactly
///     `start_phase_days` old is Initial, exactly `post_phase_days` old is Post.
///   - Evaluation emits at most one action per product per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductPhase {
    TooNew,
    Initial,
    Post,
}

impl ProductPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductPhase::TooNew => "too_new",
            ProductPhase::Initial => "initial",
            ProductPhase::Post => "post",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductAction {
    Keep,
    Replace,
}

/// Decision for one product, with the human-readable audit reason.
#[derive(Debug, Clone)]
pub struct ProductAssessment {
    pub phase: ProductPhase,
    pub days_in_collection: i64,
    pub action: ProductAction,
    pub reason: String,
}

pub fn calculate_phase(rules: &TenantRules, date_added: DateTime<Utc>, now: DateTime<Utc>) -> (ProductPhase, i64) {
    let days_in_collection = (now - date_added).num_days();

    if days_in_collection < rules.start_phase_days {
        (ProductPhase::TooNew, days_in_collection)
    } else if days_in_collection < rules.post_phase_days {
        (ProductPhase::Initial, days_in_collection)
    } else {
        (ProductPhase::Post, days_in_collection)
    }
}

pub fn assess_product(rules: &TenantRules, sales: &ProductSales, now: DateTime<Utc>) -> ProductAssessment {
    let (phase, days_in_collection) = calculate_phase(rules, sales.date_added_to_collection, now);

    let (action, reason) = match phase {
        ProductPhase::TooNew => (
            ProductAction::Keep,
            format!(
                "too new ({} days < {})",
                days_in_collection, rules.start_phase_days
            ),
        ),
        ProductPhase::Initial => {
            let first_7 = sales.first_7_days;
            if first_7 <= rules.min_sales_day7_delete {
                (
                    ProductAction::Replace,
                    format!(
                        "initial: {} sales <= {} (delete)",
                        first_7, rules.min_sales_day7_delete
                    ),
                )
            } else if first_7 <= rules.min_sales_day7_replace {
                (
                    ProductAction::Replace,
                    format!(
                        "initial: {} sales <= {} (replace)",
                        first_7, rules.min_sales_day7_replace
                    ),
                )
            } else {
                (
                    ProductAction::Keep,
                    format!(
                        "initial: {} sales > {} (keep)",
                        first_7, rules.min_sales_day7_replace
                    ),
                )
            }
        }
        ProductPhase::Post => {
            let buckets = [
                (3, sales.last_3_days, rules.avg3_ok),
                (7, sales.last_7_days, rules.avg7_ok),
                (10, sales.last_10_days, rules.avg10_ok),
                (14, sales.last_14_days, rules.avg14_ok),
            ];

            let mut ok_buckets = 0u32;
            let mut details = Vec::with_capacity(4);
            for (days, sold, threshold) in buckets {
                if sold >= threshold {
                    ok_buckets += 1;
                    details.push(format!("{}d:{}>={}OK", days, sold, threshold));
                } else {
                    details.push(format!("{}d:{}<{}X", days, sold, threshold));
                }
            }

            let action = if ok_buckets >= rules.min_ok_buckets {
                ProductAction::Keep
            } else {
                ProductAction::Replace
            };
            (
                action,
                format!(
                    "post: {}/{} OK ({})",
                    ok_buckets,
                    rules.min_ok_buckets,
                    details.join(", ")
                ),
            )
        }
    };

    ProductAssessment {
        phase,
        days_in_collection,
        action,
        reason,
    }
}

/// A replaced product whose lifetime sales sit at or below the loser
/// threshold additionally gets its stock zeroed.
pub fn is_loser(rules: &TenantRules, total_sales: Decimal) -> bool {
    total_sales <= Decimal::from(rules.loser_threshold)
}

/// Dated archive tag carried by outgoing products, e.g. `replaced_28-07-2026`.
pub fn archive_tag(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}{}", prefix, now.format("%d-%m-%Y"))
}

/// Tag set for the outgoing product: drop the collection tag, add the
/// archive tag.
pub fn outgoing_tags(tags: &[String], collection_tag: &str, archive: &str) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .filter(|t| t.as_str() != collection_tag)
        .cloned()
        .collect();
    if !out.iter().any(|t| t == archive) {
        out.push(archive.to_string());
    }
    out
}

/// Tag set for the incoming candidate: drop the queue tag, add the
/// collection tag.
pub fn incoming_tags(tags: &[String], queue_tag: &str, collection_tag: &str) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .filter(|t| t.as_str() != queue_tag)
        .cloned()
        .collect();
    if !out.iter().any(|t| t == collection_tag) {
        out.push(collection_tag.to_string());
    }
    out
}

/// One reorder instruction for the collection mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionMove {
    pub product_gid: String,
    pub new_position: usize,
}

/// Pairs each incoming candidate with the outgoing product's original
/// position and keeps only the moves that change anything, sorted by target
/// position.
pub fn compute_position_moves(
    swaps: &[(String, usize)],
    current_positions: &HashMap<String, usize>,
) -> Vec<PositionMove> {
    let mut moves: Vec<PositionMove> = swaps
        .iter()
        .filter_map(|(product_gid, target)| {
            let current = current_positions.get(product_gid)?;
            if current == target {
                None
            } else {
                Some(PositionMove {
                    product_gid: product_gid.clone(),
                    new_position: *target,
                })
            }
        })
        .collect();

    moves.sort_by_key(|m| m.new_position);
    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn rules(overrides: serde_json::Value) -> TenantRules {
        let mut base = json!({
            "tenant_id": "t1",
            "start_phase_days": 7,
            "post_phase_days": 14,
            "min_sales_day7_delete": 0,
            "min_sales_day7_replace": 1,
            "avg3_ok": 2,
            "avg7_ok": 3,
            "avg10_ok": 4,
            "avg14_ok": 6,
            "min_ok_buckets": 2,
            "loser_threshold": 5
        });
        base.as_object_mut()
            .unwrap()
            .extend(overrides.as_object().unwrap().clone());
        serde_json::from_value(base).unwrap()
    }

    fn sales(days_in_collection: i64, first_7: i64, last: [i64; 4], now: DateTime<Utc>) -> ProductSales {
        serde_json::from_value(json!({
            "tenant_id": "t1",
            "collection_id": "c1",
            "product_id": "p1",
            "product_title": "Hoodie",
            "date_added_to_collection": (now - Duration::days(days_in_collection)).to_rfc3339(),
            "last_update": now.to_rfc3339(),
            "first_7_days": first_7,
            "last_3_days": last[0],
            "last_7_days": last[1],
            "last_10_days": last[2],
            "last_14_days": last[3]
        }))
        .unwrap()
    }

    #[test]
    fn test_initial_phase_zero_sales_is_replaced() {
        let now = Utc::now();
        let assessment = assess_product(&rules(json!({})), &sales(10, 0, [0, 0, 0, 0], now), now);
        assert_eq!(assessment.phase, ProductPhase::Initial);
        assert_eq!(assessment.action, ProductAction::Replace);
        assert!(assessment.reason.contains("delete"));
    }

    #[test]
    fn test_initial_phase_one_sale_is_replaced_as_replace() {
        let now = Utc::now();
        let assessment = assess_product(&rules(json!({})), &sales(10, 1, [0, 0, 0, 0], now), now);
        assert_eq!(assessment.action, ProductAction::Replace);
        assert!(assessment.reason.contains("(replace)"));
    }

    #[test]
    fn test_post_phase_two_ok_buckets_keeps() {
        // (3,4,3,5) vs (2,3,4,6): 3>=2 OK, 4>=3 OK, 3<4, 5<6 -> 2 OK -> keep
        let now = Utc::now();
        let assessment = assess_product(&rules(json!({})), &sales(20, 9, [3, 4, 3, 5], now), now);
        assert_eq!(assessment.phase, ProductPhase::Post);
        assert_eq!(assessment.action, ProductAction::Keep);
        assert!(assessment.reason.contains("2/2 OK"));
    }

    #[test]
    fn test_post_phase_one_ok_bucket_replaces() {
        let now = Utc::now();
        let assessment = assess_product(&rules(json!({})), &sales(20, 9, [3, 2, 3, 5], now), now);
        assert_eq!(assessment.action, ProductAction::Replace);
    }

    #[test]
    fn test_phase_boundaries_are_inclusive_at_lower_bound() {
        let now = Utc::now();
        let r = rules(json!({}));

        let (phase, days) = calculate_phase(&r, now - Duration::days(7), now);
        assert_eq!((phase, days), (ProductPhase::Initial, 7));

        let (phase, _) = calculate_phase(&r, now - Duration::days(6), now);
        assert_eq!(phase, ProductPhase::TooNew);

        let (phase, _) = calculate_phase(&r, now - Duration::days(14), now);
        assert_eq!(phase, ProductPhase::Post);
    }

    #[test]
    fn test_loser_threshold_is_inclusive() {
        let r = rules(json!({}));
        assert!(is_loser(&r, Decimal::from(5)));
        assert!(!is_loser(&r, Decimal::from_str_exact("5.01").unwrap()));
    }

    #[test]
    fn test_tag_swap_sets() {
        let outgoing = outgoing_tags(
            &["summer".into(), "col-berlin".into()],
            "col-berlin",
            "replaced_28-07-2026",
        );
        assert_eq!(outgoing, vec!["summer", "replaced_28-07-2026"]);

        let incoming = incoming_tags(&["QK".into(), "new".into()], "QK", "col-berlin");
        assert_eq!(incoming, vec!["new", "col-berlin"]);

        // Idempotent on re-application.
        let incoming_again = incoming_tags(&incoming, "QK", "col-berlin");
        assert_eq!(incoming_again, incoming);
    }

    #[test]
    fn test_archive_tag_uses_day_month_year() {
        let now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 7, 28, 10, 0, 0).unwrap();
        assert_eq!(archive_tag("replaced_", now), "replaced_28-07-2026");
    }

    #[test]
    fn test_position_moves_single_swap() {
        // Collection [A,B,C,D]; B replaced by X; smart collection re-evaluated
        // to [A,C,D,X]. One move puts X back at position 1.
        let current: HashMap<String, usize> = [
            ("gid://shopify/Product/A".to_string(), 0),
            ("gid://shopify/Product/C".to_string(), 1),
            ("gid://shopify/Product/D".to_string(), 2),
            ("gid://shopify/Product/X".to_string(), 3),
        ]
        .into_iter()
        .collect();
        let swaps = vec![("gid://shopify/Product/X".to_string(), 1)];

        let moves = compute_position_moves(&swaps, &current);
        assert_eq!(
            moves,
            vec![PositionMove {
                product_gid: "gid://shopify/Product/X".to_string(),
                new_position: 1
            }]
        );
    }

    #[test]
    fn test_position_moves_skip_correct_and_missing_products() {
        let current: HashMap<String, usize> =
            [("gid://shopify/Product/X".to_string(), 1)].into_iter().collect();
        let swaps = vec![
            ("gid://shopify/Product/X".to_string(), 1), // already correct
            ("gid://shopify/Product/Y".to_string(), 0), // vanished from collection
        ];

        assert!(compute_position_moves(&swaps, &current).is_empty());
    }

    #[test]
    fn test_position_moves_are_sorted_by_target() {
        let current: HashMap<String, usize> = [
            ("a".to_string(), 9),
            ("b".to_string(), 8),
        ]
        .into_iter()
        .collect();
        let swaps = vec![("a".to_string(), 5), ("b".to_string(), 2)];

        let moves = compute_position_moves(&swaps, &current);
        assert_eq!(moves[0].product_gid, "b");
        assert_eq!(moves[1].product_gid, "a");
    }
}
