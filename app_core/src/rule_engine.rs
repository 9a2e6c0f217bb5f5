use rust_decimal::Decimal;

use crate::data_models::optimization::{
    ActionUnit, ConditionGroup, LogicOperator, MetricsSnapshot, Operator, OptimizationRule,
    RuleActionType, RuleCondition,
};

/// # NDOC
/// component: `rule_engine`
/// purpose: Deterministic evaluation of optimization rules against campaign
///   metrics, and budget-action planning.
/// invariants:
///   - Evaluation is total: same `(rules, metrics)` always selects the same
///     rule id or none.
///   - Groups combine with AND, conditions within a group with OR; both
///     short-circuit.

pub fn evaluate_single_condition(condition: &RuleCondition, metrics: &MetricsSnapshot) -> bool {
    let metric_value = metrics.value(condition.metric);
    let threshold = condition.value;

    match condition.operator {
        Operator::GreaterEqual => metric_value >= threshold,
        Operator::LessEqual => metric_value <= threshold,
        Operator::Greater => metric_value > threshold,
        Operator::Less => metric_value < threshold,
        Operator::Equal => metric_value == threshold,
    }
}

/// Splits a flat condition list into groups.
///
/// A condition's `logic` is the connective to the following condition:
/// `AND` closes the current group after it, `OR` (or nothing) keeps the next
/// condition in the same group. `[{spend>=100, AND}, {checkouts<=3, OR},
/// {roas<2.0}]` becomes `[spend>=100]` and `[checkouts<=3, roas<2.0]`.
pub fn linearize_conditions(conditions: &[RuleCondition]) -> Vec<ConditionGroup> {
    let mut groups = Vec::new();
    let mut current: Vec<RuleCondition> = Vec::new();

    for condition in conditions {
        current.push(condition.clone());
        if condition.logic == Some(LogicOperator::And) {
            groups.push(ConditionGroup {
                conditions: std::mem::take(&mut current),
                logic: Some(LogicOperator::And),
            });
        }
    }
    if !current.is_empty() {
        groups.push(ConditionGroup {
            conditions: current,
            logic: None,
        });
    }

    groups
}

/// AND over groups of OR'd conditions. Empty rules never match.
pub fn evaluate_groups(groups: &[ConditionGroup], metrics: &MetricsSnapshot) -> bool {
    if groups.iter().all(|g| g.conditions.is_empty()) {
        return false;
    }

    for group in groups {
        if group.conditions.is_empty() {
            continue;
        }
        let group_result = group
            .conditions
            .iter()
            .any(|condition| evaluate_single_condition(condition, metrics));
        if !group_result {
            return false;
        }
    }

    true
}

/// Convenience for legacy flat lists: linearize, then evaluate.
pub fn evaluate_conditions(conditions: &[RuleCondition], metrics: &MetricsSnapshot) -> bool {
    evaluate_groups(&linearize_conditions(conditions), metrics)
}

/// First matching rule by descending priority. Disabled rules are skipped;
/// applicability filters (campaign age, campaign type) are the caller's job.
pub fn find_matching_rule<'a>(
    rules: &'a [OptimizationRule],
    metrics: &MetricsSnapshot,
) -> Option<&'a OptimizationRule> {
    let mut sorted: Vec<&OptimizationRule> = rules.iter().collect();
    sorted.sort_by_key(|rule| std::cmp::Reverse(rule.priority));

    sorted
        .into_iter()
        .filter(|rule| rule.enabled)
        .find(|rule| evaluate_groups(&rule.condition_groups, metrics))
}

/// What a matched rule wants done to the campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Pause,
    SetBudget { new_budget: Decimal },
    Skip { reason: String },
}

/// Turns a matched rule into a concrete action against the current budget.
/// Scaling clamps to `[min_budget, max_budget]` and skips when the clamp
/// leaves the budget unchanged.
pub fn plan_action(rule: &OptimizationRule, current_budget: Decimal) -> PlannedAction {
    match rule.action_type {
        RuleActionType::Pause => PlannedAction::Pause,
        RuleActionType::ScaleDown | RuleActionType::ScaleUp => {
            let value = match rule.action_value {
                Some(value) => value,
                None => {
                    return PlannedAction::Skip {
                        reason: "rule has no action value".to_string(),
                    }
                }
            };

            let delta = match rule.action_unit.unwrap_or(ActionUnit::Amount) {
                ActionUnit::Amount => value,
                ActionUnit::Percent => current_budget * value / Decimal::from(100),
            };

            let new_budget = match rule.action_type {
                RuleActionType::ScaleDown => (current_budget - delta).max(rule.min_budget),
                _ => (current_budget + delta).min(rule.max_budget),
            }
            .round_dp(2);

            if new_budget == current_budget {
                let reason = match rule.action_type {
                    RuleActionType::ScaleDown => {
                        format!("no change, at minimum {}", rule.min_budget)
                    }
                    _ => format!("no change, at maximum {}", rule.max_budget),
                };
                PlannedAction::Skip { reason }
            } else {
                PlannedAction::SetBudget { new_budget }
            }
        }
    }
}
