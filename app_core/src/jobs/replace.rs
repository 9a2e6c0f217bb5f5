use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use itertools::Itertools;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::JobConfig;
use crate::contracts::{JobError, JobResult};
use crate::data_models::job_run::{JobRunStatus, JobRunSummary};
use crate::data_models::sales::ProductSales;
use crate::data_models::tenant::{CampaignBatchAssignment, Tenant, TenantRules};
use crate::jobs::{record_budget_exceeded, record_tenant_result};
use crate::replacement_logic::{
    archive_tag, assess_product, compute_position_moves, incoming_tags, is_loser, outgoing_tags,
    ProductAction,
};
use crate::services::shopify::{ShopifyClient, TaggedProduct};
use crate::services::supabase::SupabaseService;

const JOB_TYPE: &str = "replace_job";
const TENANT_CONCURRENCY: usize = 2;
/// Over-fetch on the queue tag so a few unusable candidates do not starve
/// the swap.
const QUEUE_OVERFETCH: usize = 10;

#[derive(Default)]
struct Totals {
    analyzed: AtomicU32,
    kept: AtomicU32,
    replaced: AtomicU32,
    losers: AtomicU32,
    positions_maintained: AtomicU32,
}

/// Replacement pipeline: evaluates every tracked product against the
/// tenant's lifecycle thresholds and swaps under-performers out, preserving
/// positions in manually sorted collections.
pub async fn run(config: &JobConfig) -> JobResult<JobRunSummary> {
    let db = Arc::new(SupabaseService::new(config)?);
    let job_id = db
        .open_job_run(JOB_TYPE, json!({"started_at": Utc::now().to_rfc3339()}))
        .await;

    let tenants = match db.tenants_with_assignments().await {
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
        summary.set_metadata("message", json!("no tenants with assignments"));
        db.close_job_run(job_id.as_deref(), JobRunStatus::Completed, &summary)
            .await;
        return Ok(summary);
    }

    let totals = Arc::new(Totals::default());
    let semaphore = Arc::new(Semaphore::new(TENANT_CONCURRENCY));
    let mut join_set = JoinSet::new();

    for (tenant, assignments) in tenants {
        let db = db.clone();
        let semaphore = semaphore.clone();
        let totals = totals.clone();
        let settle_delay = config.settle_delay;

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let tenant_id = tenant.id.clone();
            let result = process_tenant(&db, &tenant, &assignments, settle_delay, &totals).await;
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

    summary.set_metadata("products_analyzed", json!(totals.analyzed.load(Ordering::SeqCst)));
    summary.set_metadata("products_kept", json!(totals.kept.load(Ordering::SeqCst)));
    summary.set_metadata("products_replaced", json!(totals.replaced.load(Ordering::SeqCst)));
    summary.set_metadata("products_losers", json!(totals.losers.load(Ordering::SeqCst)));
    summary.set_metadata(
        "positions_maintained",
        json!(totals.positions_maintained.load(Ordering::SeqCst)),
    );
    summary.set_metadata("completed_at", json!(Utc::now().to_rfc3339()));

    let status = summary.final_status();
    db.close_job_run(job_id.as_deref(), status, &summary).await;
    Ok(summary)
}

async fn process_tenant(
    db: &SupabaseService,
    tenant: &Tenant,
    assignments: &[CampaignBatchAssignment],
    settle_delay: std::time::Duration,
    totals: &Totals,
) -> JobResult<()> {
    let rules = db.tenant_rules(&tenant.id).await?;
    let shopify = ShopifyClient::new(&tenant.shop_domain, &tenant.access_token)?;

    log::info!(
        target: JOB_TYPE,
        tenant_id = tenant.id.as_str(),
        test_mode = rules.test_mode;
        "processing tenant {}",
        tenant.name
    );

    let collection_ids: Vec<&str> = assignments
        .iter()
        .map(|a| a.collection_id.as_str())
        .sorted()
        .dedup()
        .collect();

    for collection_id in collection_ids {
        if let Err(e) =
            process_collection(db, &shopify, tenant, &rules, collection_id, settle_delay, totals)
                .await
        {
            log::warn!(
                target: JOB_TYPE,
                tenant_id = tenant.id.as_str(),
                collection_id = collection_id;
                "collection skipped: {}",
                e
            );
        }
    }

    Ok(())
}

async fn process_collection(
    db: &SupabaseService,
    shopify: &ShopifyClient,
    tenant: &Tenant,
    rules: &TenantRules,
    collection_id: &str,
    settle_delay: std::time::Duration,
    totals: &Totals,
) -> JobResult<()> {
    let details = shopify.collection_details(collection_id).await?;
    let Some(collection_tag) = details.tag.clone() else {
        return Err(JobError::validation(format!(
            "collection {} has no tag rule; cannot manage membership",
            collection_id
        )));
    };

    log::info!(
        target: JOB_TYPE,
        tenant_id = tenant.id.as_str(),
        collection_id = collection_id;
        "collection '{}' tag={} sort={}",
        details.title,
        collection_tag,
        details.sort_order
    );

    // Membership and current display order, snapshotted before any change.
    let members = shopify.products_by_tag(&collection_tag, 250).await?;
    let original_positions: HashMap<String, usize> = shopify
        .collection_positions(collection_id)
        .await?
        .into_iter()
        .collect();

    let sales_rows: HashMap<String, ProductSales> = db
        .sales_for_collection(&tenant.id, collection_id)
        .await?
        .into_iter()
        .map(|row| (row.product_id.clone(), row))
        .collect();

    let now = Utc::now();
    let mut to_replace: Vec<(&TaggedProduct, &ProductSales)> = Vec::new();

    for member in &members {
        totals.analyzed.fetch_add(1, Ordering::SeqCst);
        let product_id = numeric_id(&member.gid);

        let Some(sales) = sales_rows.get(&product_id) else {
            // First sighting in this collection: anchor now, evaluate next run.
            db.start_tracking(&tenant.id, collection_id, &product_id, &member.title)
                .await?;
            totals.kept.fetch_add(1, Ordering::SeqCst);
            continue;
        };

        let assessment = assess_product(rules, sales, now);
        log::info!(
            target: JOB_TYPE,
            tenant_id = tenant.id.as_str(),
            product_id = product_id.as_str(),
            phase = assessment.phase.as_str();
            "{}: {}",
            member.title,
            assessment.reason
        );

        match assessment.action {
            ProductAction::Keep => {
                totals.kept.fetch_add(1, Ordering::SeqCst);
            }
            ProductAction::Replace => to_replace.push((member, sales)),
        }
    }

    if to_replace.is_empty() {
        return Ok(());
    }

    // Keep replacement order stable: worst positions last.
    to_replace.sort_by_key(|(member, _)| {
        original_positions.get(&member.gid).copied().unwrap_or(usize::MAX)
    });

    let candidates = shopify
        .products_by_tag(&rules.queue_tag, to_replace.len() + QUEUE_OVERFETCH)
        .await?;
    if candidates.len() < to_replace.len() {
        log::warn!(
            target: JOB_TYPE,
            tenant_id = tenant.id.as_str();
            "not enough '{}' candidates: have {}, need {}",
            rules.queue_tag,
            candidates.len(),
            to_replace.len()
        );
    }

    // Phase 1: tag swap.
    let archive = archive_tag(&rules.replace_tag_prefix, now);
    let mut candidate_index = 0usize;
    let mut position_swaps: Vec<(String, usize)> = Vec::new();

    for (outgoing, sales) in &to_replace {
        let Some(candidate) = candidates.get(candidate_index) else {
            log::warn!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "queue exhausted");
            break;
        };

        if rules.test_mode {
            log::info!(
                target: JOB_TYPE,
                tenant_id = tenant.id.as_str();
                "[TEST] would replace '{}' with '{}'",
                outgoing.title,
                candidate.title
            );
            if let Some(position) = original_positions.get(&outgoing.gid) {
                position_swaps.push((candidate.gid.clone(), *position));
            }
            totals.replaced.fetch_add(1, Ordering::SeqCst);
            candidate_index += 1;
            continue;
        }

        let new_outgoing_tags = outgoing_tags(&outgoing.tags, &collection_tag, &archive);
        let new_incoming_tags = incoming_tags(&candidate.tags, &rules.queue_tag, &collection_tag);

        shopify
            .update_product_tags(&outgoing.gid, &new_outgoing_tags)
            .await?;
        shopify
            .update_product_tags(&candidate.gid, &new_incoming_tags)
            .await?;

        db.start_tracking(
            &tenant.id,
            collection_id,
            &numeric_id(&candidate.gid),
            &candidate.title,
        )
        .await?;

        if let Some(position) = original_positions.get(&outgoing.gid) {
            position_swaps.push((candidate.gid.clone(), *position));
        }

        totals.replaced.fetch_add(1, Ordering::SeqCst);
        log::info!(
            target: JOB_TYPE,
            tenant_id = tenant.id.as_str();
            "replaced '{}' with '{}'",
            outgoing.title,
            candidate.title
        );

        // A replaced product at or below the loser threshold also loses its
        // stock, at every location. It stays active.
        if is_loser(rules, sales.total_sales) {
            totals.losers.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = shopify.set_product_inventory_zero(&outgoing.gid).await {
                log::warn!(
                    target: JOB_TYPE,
                    tenant_id = tenant.id.as_str();
                    "could not zero inventory for '{}': {}",
                    outgoing.title,
                    e
                );
            }
        }

        candidate_index += 1;
    }

    // Phase 2: position restoration, manual-sort collections only. The
    // smart collection needs time to re-evaluate after the tag swap.
    if details.sort_order == "MANUAL" && rules.maintain_positions && !position_swaps.is_empty() {
        if rules.test_mode {
            log::info!(
                target: JOB_TYPE,
                tenant_id = tenant.id.as_str();
                "[TEST] would reorder {} products",
                position_swaps.len()
            );
            return Ok(());
        }

        log::info!(
            target: JOB_TYPE,
            tenant_id = tenant.id.as_str();
            "waiting {:?} for smart collection to settle",
            settle_delay
        );
        tokio::time::sleep(settle_delay).await;

        let current_positions: HashMap<String, usize> = shopify
            .collection_positions(collection_id)
            .await?
            .into_iter()
            .collect();
        let moves = compute_position_moves(&position_swaps, &current_positions);

        if moves.is_empty() {
            log::info!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "positions already correct");
        } else {
            shopify.reorder_collection(collection_id, &moves).await?;
            totals
                .positions_maintained
                .fetch_add(moves.len() as u32, Ordering::SeqCst);
            log::info!(
                target: JOB_TYPE,
                tenant_id = tenant.id.as_str();
                "restored {} positions",
                moves.len()
            );
        }
    }

    Ok(())
}

fn numeric_id(gid: &str) -> String {
    gid.rsplit('/').next().unwrap_or(gid).to_string()
}
