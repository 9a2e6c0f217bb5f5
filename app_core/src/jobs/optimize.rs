use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::JobConfig;
use crate::contracts::{JobError, JobResult};
use crate::data_models::job_run::{JobRunStatus, JobRunSummary};
use crate::data_models::optimization::{MetricsSnapshot, OptimizationRule, OptimizationSettings};
use crate::data_models::pinterest::AdPlatformCampaign;
use crate::jobs::{record_budget_exceeded, record_tenant_result};
use crate::rule_engine::{find_matching_rule, plan_action, PlannedAction};
use crate::services::pinterest::PinterestClient;
use crate::services::supabase::{AdTenantContext, SupabaseService};

const JOB_TYPE: &str = "campaign_optimization";
const TENANT_CONCURRENCY: usize = 10;

#[derive(Default)]
struct Totals {
    campaigns_evaluated: AtomicU32,
    actions_taken: AtomicU32,
    cleanups: AtomicU32,
}

/// Budget-optimizer pipeline: refreshes the campaign mirror, evaluates the
/// tenant's rule groups over per-campaign metrics and adjusts budgets or
/// pauses campaigns. Every evaluation leaves an audit row.
pub async fn run(config: &JobConfig) -> JobResult<JobRunSummary> {
    let db = Arc::new(SupabaseService::new(config)?);
    let job_id = db
        .open_job_run(JOB_TYPE, json!({"started_at": Utc::now().to_rfc3339()}))
        .await;

    let tenants = match db.tenants_with_flag_enabled("optimization_settings").await {
        Ok(tenants) => tenants,
        Err(e) => {
            let mut summary = JobRunSummary::default();
            summary.record_error(e.to_log_entry(None));
            db.close_job_run(job_id.as_deref(), JobRunStatus::Failed, &summary)
                .await;
            return Err(e);
        }
    };

    let mut summary = JobRunSummary::default();
    if tenants.is_empty() {
        summary.set_metadata("message", json!("no tenants with optimization enabled"));
        db.close_job_run(job_id.as_deref(), JobRunStatus::Completed, &summary)
            .await;
        return Ok(summary);
    }

    let totals = Arc::new(Totals::default());
    let semaphore = Arc::new(Semaphore::new(TENANT_CONCURRENCY));
    let mut join_set = JoinSet::new();

    for context in tenants {
        let db = db.clone();
        let semaphore = semaphore.clone();
        let totals = totals.clone();
        let config = config.clone();

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let tenant_id = context.tenant.id.clone();
            let result = process_tenant(&config, &db, &context, &totals).await;
            (tenant_id, result)
        });
    }

    let drain = async {
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((tenant_id, result)) => record_tenant_result(&mut summary, &tenant_id, result),
                Err(e) => summary.record_error(json!({"error": e.to_string()})),
            }
        }
    };
    if tokio::time::timeout(config.run_budget, drain).await.is_err() {
        join_set.abort_all();
        record_budget_exceeded(&mut summary, JOB_TYPE);
    }

    summary.set_metadata(
        "campaigns_evaluated",
        json!(totals.campaigns_evaluated.load(Ordering::SeqCst)),
    );
    summary.set_metadata("actions_taken", json!(totals.actions_taken.load(Ordering::SeqCst)));
    summary.set_metadata("paused_cleanups", json!(totals.cleanups.load(Ordering::SeqCst)));
    summary.set_metadata("completed_at", json!(Utc::now().to_rfc3339()));

    let status = summary.final_status();
    db.close_job_run(job_id.as_deref(), status, &summary).await;
    Ok(summary)
}

async fn process_tenant(
    config: &JobConfig,
    db: &SupabaseService,
    context: &AdTenantContext,
    totals: &Totals,
) -> JobResult<()> {
    let tenant = &context.tenant;
    let Some(settings) = db.optimization_settings(&tenant.id).await? else {
        log::info!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "no optimization settings");
        return Ok(());
    };
    if !settings.enabled {
        return Ok(());
    }

    let rules = db.optimization_rules(&tenant.id).await?;
    if rules.is_empty() {
        log::info!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "no enabled rules");
        return Ok(());
    }

    let Some(ad_account_id) = context.ad_account_id.as_deref() else {
        return Err(JobError::validation(format!(
            "tenant {} has optimization enabled but no selected ad account",
            tenant.id
        )));
    };

    let pinterest = PinterestClient::new(
        config,
        &tenant.id,
        &context.auth.access_token,
        context.auth.refresh_token.as_deref(),
    )?;

    refresh_campaign_mirror(db, &pinterest, &tenant.id, ad_account_id, totals).await?;

    // Test mode narrows evaluation to the designated test campaign.
    let campaigns = if settings.test_mode {
        let Some(test_campaign_id) = settings.test_campaign_id.as_deref() else {
            log::info!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "test mode without test campaign");
            return Ok(());
        };
        match db.campaign_by_id(test_campaign_id).await? {
            Some(campaign) => vec![campaign],
            None => {
                log::warn!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "test campaign not found");
                return Ok(());
            }
        }
    } else {
        db.active_campaigns(&tenant.id).await?
    };

    log::info!(
        target: JOB_TYPE,
        tenant_id = tenant.id.as_str();
        "evaluating {} campaigns against {} rules",
        campaigns.len(),
        rules.len()
    );

    for campaign in &campaigns {
        if let Err(e) = process_campaign(
            db,
            &pinterest,
            &tenant.id,
            ad_account_id,
            campaign,
            &rules,
            &settings,
            totals,
        )
        .await
        {
            log::warn!(
                target: JOB_TYPE,
                tenant_id = tenant.id.as_str(),
                campaign = campaign.name.as_str();
                "campaign skipped: {}",
                e
            );
        }
    }

    if let Some(tokens) = pinterest.take_refreshed_tokens() {
        db.update_pinterest_tokens(
            &tenant.id,
            &tokens.access_token,
            tokens.refresh_token.as_deref(),
            Some(tokens.expires_at.as_str()),
        )
        .await?;
    }

    Ok(())
}

/// Pulls the platform campaign list, mirrors ACTIVE campaigns locally and
/// runs the one-shot cleanup for campaigns that transitioned to PAUSED.
async fn refresh_campaign_mirror(
    db: &SupabaseService,
    pinterest: &PinterestClient,
    tenant_id: &str,
    ad_account_id: &str,
    totals: &Totals,
) -> JobResult<()> {
    let platform_campaigns = pinterest.campaigns(ad_account_id).await?;
    db.mirror_active_campaigns(tenant_id, ad_account_id, &platform_campaigns)
        .await?;

    let platform_status: std::collections::HashMap<&str, &str> = platform_campaigns
        .iter()
        .filter_map(|c| {
            Some((
                c.get("id")?.as_str()?,
                c.get("status").and_then(|s| s.as_str())?,
            ))
        })
        .collect();

    for campaign in db.active_campaigns(tenant_id).await? {
        let Some(&status) = platform_status.get(campaign.pinterest_campaign_id.as_str()) else {
            continue;
        };
        if status == "ACTIVE" {
            continue;
        }

        log::info!(
            target: JOB_TYPE,
            tenant_id = tenant_id,
            campaign = campaign.name.as_str();
            "campaign is {} on the platform, cleaning up",
            status
        );
        db.update_campaign_status(&campaign.id, status).await?;
        let (assignments, sales) = db.cleanup_paused_campaign(tenant_id, &campaign.id).await?;
        if assignments > 0 || sales > 0 {
            totals.cleanups.fetch_add(1, Ordering::SeqCst);
            log::info!(
                target: JOB_TYPE,
                tenant_id = tenant_id;
                "cleaned up {} assignments, {} sales rows",
                assignments,
                sales
            );
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_campaign(
    db: &SupabaseService,
    pinterest: &PinterestClient,
    tenant_id: &str,
    ad_account_id: &str,
    campaign: &AdPlatformCampaign,
    rules: &[OptimizationRule],
    settings: &OptimizationSettings,
    totals: &Totals,
) -> JobResult<()> {
    totals.campaigns_evaluated.fetch_add(1, Ordering::SeqCst);
    let now = Utc::now();

    let applicable: Vec<OptimizationRule> = rules
        .iter()
        .filter(|rule| rule.applies_to(campaign, now))
        .cloned()
        .collect();

    // Metrics over the widest lookback any applicable condition wants.
    let metrics = if settings.test_mode {
        match &settings.test_metrics {
            Some(metrics) => metrics.clone(),
            None => MetricsSnapshot::default(),
        }
    } else {
        let lookback = applicable
            .iter()
            .map(|rule| rule.max_lookback_days())
            .max()
            .unwrap_or(7);
        pinterest
            .campaign_analytics(ad_account_id, &campaign.pinterest_campaign_id, lookback)
            .await?
    };

    let matched = find_matching_rule(&applicable, &metrics);

    let Some(rule) = matched else {
        log::info!(
            target: JOB_TYPE,
            tenant_id = tenant_id,
            campaign = campaign.name.as_str();
            "no rule matched"
        );
        db.log_optimization_action(
            tenant_id,
            &campaign.id,
            None,
            "no_rule_matched",
            campaign.daily_budget,
            campaign.daily_budget,
            None,
            None,
            &metrics,
            settings.test_mode,
            None,
        )
        .await?;
        return Ok(());
    };

    log::info!(
        target: JOB_TYPE,
        tenant_id = tenant_id,
        campaign = campaign.name.as_str(),
        rule = rule.name.as_str();
        "rule matched (priority {})",
        rule.priority
    );

    match plan_action(rule, campaign.daily_budget) {
        PlannedAction::Pause => {
            let result = pinterest
                .update_campaign_status(ad_account_id, &campaign.pinterest_campaign_id, "PAUSED")
                .await;
            match result {
                Ok(()) => {
                    db.update_campaign_status(&campaign.id, "PAUSED").await?;
                    // A rule pause is a PAUSED transition like any other.
                    let (assignments, sales) =
                        db.cleanup_paused_campaign(tenant_id, &campaign.id).await?;
                    if assignments > 0 || sales > 0 {
                        totals.cleanups.fetch_add(1, Ordering::SeqCst);
                    }
                    totals.actions_taken.fetch_add(1, Ordering::SeqCst);
                    db.log_optimization_action(
                        tenant_id,
                        &campaign.id,
                        Some(rule.id.as_str()),
                        "paused",
                        campaign.daily_budget,
                        campaign.daily_budget,
                        Some(campaign.status.as_str()),
                        Some("PAUSED"),
                        &metrics,
                        settings.test_mode,
                        None,
                    )
                    .await?;
                }
                Err(e) => {
                    db.log_optimization_action(
                        tenant_id,
                        &campaign.id,
                        Some(rule.id.as_str()),
                        "failed",
                        campaign.daily_budget,
                        campaign.daily_budget,
                        Some(campaign.status.as_str()),
                        Some("PAUSED"),
                        &metrics,
                        settings.test_mode,
                        Some(e.message.as_str()),
                    )
                    .await?;
                }
            }
        }
        PlannedAction::SetBudget { new_budget } => {
            let action_name = if new_budget > campaign.daily_budget {
                "scaled_up"
            } else {
                "scaled_down"
            };
            let result = pinterest
                .update_campaign_budget(ad_account_id, &campaign.pinterest_campaign_id, new_budget)
                .await;
            match result {
                Ok(()) => {
                    db.update_campaign_budget(&campaign.id, new_budget).await?;
                    totals.actions_taken.fetch_add(1, Ordering::SeqCst);
                    log::info!(
                        target: JOB_TYPE,
                        tenant_id = tenant_id,
                        campaign = campaign.name.as_str();
                        "budget {} -> {}",
                        campaign.daily_budget,
                        new_budget
                    );
                    db.log_optimization_action(
                        tenant_id,
                        &campaign.id,
                        Some(rule.id.as_str()),
                        action_name,
                        campaign.daily_budget,
                        new_budget,
                        None,
                        None,
                        &metrics,
                        settings.test_mode,
                        None,
                    )
                    .await?;
                }
                Err(e) => {
                    db.log_optimization_action(
                        tenant_id,
                        &campaign.id,
                        Some(rule.id.as_str()),
                        "failed",
                        campaign.daily_budget,
                        new_budget,
                        None,
                        None,
                        &metrics,
                        settings.test_mode,
                        Some(e.message.as_str()),
                    )
                    .await?;
                }
            }
        }
        PlannedAction::Skip { reason } => {
            log::info!(
                target: JOB_TYPE,
                tenant_id = tenant_id,
                campaign = campaign.name.as_str();
                "skipped: {}",
                reason
            );
            db.log_optimization_action(
                tenant_id,
                &campaign.id,
                Some(rule.id.as_str()),
                "skipped",
                campaign.daily_budget,
                campaign.daily_budget,
                None,
                None,
                &metrics,
                settings.test_mode,
                Some(reason.as_str()),
            )
            .await?;
        }
    }

    Ok(())
}
