use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contracts::{JobError, JobResult};
use crate::data_models::pinterest::{AdPlatformCampaign, CampaignType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Spend,
    Checkouts,
    Roas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "==")]
    Equal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleActionType {
    ScaleUp,
    ScaleDown,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionUnit {
    Amount,
    Percent,
}

/// Single condition in a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub metric: Metric,
    pub operator: Operator,
    #[serde(default)]
    pub value: Decimal,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// `AND` starts a new group at this condition; `OR` (or nothing)
    /// continues the current group.
    #[serde(default)]
    pub logic: Option<LogicOperator>,
}

/// A group of conditions that are OR'd together; groups AND between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub logic: Option<LogicOperator>,
}

/// Campaign metrics over one lookback period.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default)]
    pub spend: Decimal,
    #[serde(default)]
    pub checkouts: i64,
    #[serde(default)]
    pub roas: Decimal,
}

impl MetricsSnapshot {
    pub fn value(&self, metric: Metric) -> Decimal {
        match metric {
            Metric::Spend => self.spend,
            Metric::Checkouts => Decimal::from(self.checkouts),
            Metric::Roas => self.roas,
        }
    }
}

/// Tenant-level optimizer switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSettings {
    pub tenant_id: String,
    #[serde(default, rename = "is_enabled")]
    pub enabled: bool,
    #[serde(default, rename = "test_mode_enabled")]
    pub test_mode: bool,
    #[serde(default)]
    pub test_campaign_id: Option<String>,
    #[serde(default)]
    pub test_metrics: Option<MetricsSnapshot>,
}

/// A complete optimization rule.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRule {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub enabled: bool,
    pub priority: i64,
    pub condition_groups: Vec<ConditionGroup>,
    pub action_type: RuleActionType,
    pub action_value: Option<Decimal>,
    pub action_unit: Option<ActionUnit>,
    pub min_budget: Decimal,
    pub max_budget: Decimal,
    pub min_campaign_age_days: Option<i64>,
    pub max_campaign_age_days: Option<i64>,
    pub campaign_type: CampaignType,
}

#[derive(Deserialize)]
struct OptimizationRuleRow {
    id: String,
    tenant_id: String,
    #[serde(default)]
    name: String,
    #[serde(default = "default_true")]
    is_enabled: bool,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    condition_groups: Option<Vec<ConditionGroup>>,
    #[serde(default)]
    conditions: Option<Vec<RuleCondition>>,
    action_type: RuleActionType,
    #[serde(default)]
    action_value: Option<Decimal>,
    #[serde(default)]
    action_unit: Option<ActionUnit>,
    #[serde(default = "default_min_budget")]
    min_budget: Decimal,
    #[serde(default = "default_max_budget")]
    max_budget: Decimal,
    #[serde(default)]
    min_campaign_age_days: Option<i64>,
    #[serde(default)]
    max_campaign_age_days: Option<i64>,
    #[serde(default)]
    campaign_type: CampaignType,
}

impl OptimizationRule {
    /// Builds a rule from a store row.
    ///
    /// Two row shapes exist: the canonical nested `condition_groups` and the
    /// legacy flat `conditions` list. Flat rows become a single group so both
    /// shapes evaluate identically.
    pub fn from_row(row: &Value) -> JobResult<Self> {
        let row: OptimizationRuleRow = serde_json::from_value(row.clone())
            .map_err(|e| JobError::validation(format!("bad optimization_rules row: {}", e)))?;

        let condition_groups = match (row.condition_groups, row.conditions) {
            (Some(groups), _) if !groups.is_empty() => groups,
            (_, Some(conditions)) if !conditions.is_empty() => vec![ConditionGroup {
                conditions,
                logic: None,
            }],
            _ => Vec::new(),
        };

        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            enabled: row.is_enabled,
            priority: row.priority,
            condition_groups,
            action_type: row.action_type,
            action_value: row.action_value,
            action_unit: row.action_unit,
            min_budget: row.min_budget,
            max_budget: row.max_budget,
            min_campaign_age_days: row.min_campaign_age_days,
            max_campaign_age_days: row.max_campaign_age_days,
            campaign_type: row.campaign_type,
        })
    }

    pub fn all_conditions(&self) -> impl Iterator<Item = &RuleCondition> {
        self.condition_groups
            .iter()
            .flat_map(|group| group.conditions.iter())
    }

    /// The widest lookback any condition asks for; analytics are fetched once
    /// over this period.
    pub fn max_lookback_days(&self) -> u32 {
        self.all_conditions()
            .map(|c| c.lookback_days)
            .max()
            .unwrap_or(default_lookback_days())
    }

    /// Campaign-age bounds and the campaign-type filter gate applicability.
    pub fn applies_to(&self, campaign: &AdPlatformCampaign, now: DateTime<Utc>) -> bool {
        if self.campaign_type != campaign.campaign_type {
            return false;
        }
        let age = campaign.age_days(now);
        if let Some(min_age) = self.min_campaign_age_days {
            if age.map_or(true, |a| a < min_age) {
                return false;
            }
        }
        if let Some(max_age) = self.max_campaign_age_days {
            if age.map_or(true, |a| a > max_age) {
                return false;
            }
        }
        true
    }
}

fn default_lookback_days() -> u32 {
    7
}

fn default_true() -> bool {
    true
}

fn default_min_budget() -> Decimal {
    Decimal::new(500, 2)
}

fn default_max_budget() -> Decimal {
    Decimal::from(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn campaign(campaign_type: &str, age_days: i64) -> AdPlatformCampaign {
        serde_json::from_value(json!({
            "id": "c1",
            "tenant_id": "t1",
            "pinterest_campaign_id": "999",
            "status": "ACTIVE",
            "campaign_type": campaign_type,
            "created_time": Utc::now().timestamp() - age_days * 86_400
        }))
        .unwrap()
    }

    #[test]
    fn test_nested_groups_parse() {
        let rule = OptimizationRule::from_row(&json!({
            "id": "r1",
            "tenant_id": "t1",
            "name": "kill low roas",
            "priority": 10,
            "action_type": "pause",
            "condition_groups": [
                {"conditions": [
                    {"metric": "spend", "operator": ">=", "value": 100, "lookback_days": 7, "logic": "AND"}
                ]},
                {"conditions": [
                    {"metric": "checkouts", "operator": "<=", "value": 3, "logic": "OR"},
                    {"metric": "roas", "operator": "<", "value": 2.0}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(rule.condition_groups.len(), 2);
        assert_eq!(rule.max_lookback_days(), 7);
        assert!(rule.enabled);
        assert_eq!(rule.min_budget, Decimal::new(500, 2));
    }

    #[test]
    fn test_legacy_flat_conditions_become_single_group() {
        let rule = OptimizationRule::from_row(&json!({
            "id": "r2",
            "tenant_id": "t1",
            "action_type": "scale_up",
            "action_value": 10,
            "action_unit": "amount",
            "conditions": [
                {"metric": "roas", "operator": ">=", "value": 4.0, "lookback_days": 14}
            ]
        }))
        .unwrap();

        assert_eq!(rule.condition_groups.len(), 1);
        assert_eq!(rule.condition_groups[0].conditions.len(), 1);
        assert_eq!(rule.max_lookback_days(), 14);
    }

    #[test]
    fn test_missing_action_type_fails_loudly() {
        let err = OptimizationRule::from_row(&json!({
            "id": "r3",
            "tenant_id": "t1",
            "conditions": []
        }))
        .expect_err("must fail");
        assert!(err.message.contains("optimization_rules"));
    }

    #[test]
    fn test_age_bounds_and_type_gate_applicability() {
        let rule = OptimizationRule::from_row(&json!({
            "id": "r4",
            "tenant_id": "t1",
            "action_type": "pause",
            "campaign_type": "winner_campaign",
            "min_campaign_age_days": 3,
            "max_campaign_age_days": 30,
            "conditions": [{"metric": "spend", "operator": ">", "value": 0}]
        }))
        .unwrap();

        let now = Utc::now();
        assert!(rule.applies_to(&campaign("winner_campaign", 10), now));
        assert!(!rule.applies_to(&campaign("winner_campaign", 1), now));
        assert!(!rule.applies_to(&campaign("winner_campaign", 45), now));
        assert!(!rule.applies_to(&campaign("replace_campaign", 10), now));
    }

    #[test]
    fn test_metrics_snapshot_lookup() {
        let metrics: MetricsSnapshot = serde_json::from_value(json!({
            "spend": 150.5, "checkouts": 5, "roas": 1.5
        }))
        .unwrap();
        assert_eq!(metrics.value(Metric::Checkouts), Decimal::from(5));
        assert_eq!(
            metrics.value(Metric::Spend),
            Decimal::from_str_exact("150.5").unwrap()
        );
    }
}
