use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine as _;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::JobConfig;
use crate::contracts::{JobError, JobResult};
use crate::data_models::job_run::{JobRunStatus, JobRunSummary};
use crate::data_models::pinterest::AdPlatformCampaign;
use crate::data_models::tenant::CampaignBatchAssignment;
use crate::jobs::{record_budget_exceeded, record_tenant_result};
use crate::services::pinterest::{AdCreateOutcome, MediaSource, PinterestClient};
use crate::services::shopify::ShopifyClient;
use crate::services::supabase::{AdTenantContext, SupabaseService};
use crate::utils::images::normalize_to_pin_jpeg;
use crate::utils::text::{clean_html, truncate_text};

const JOB_TYPE: &str = "pinterest_sync_job";
const TENANT_CONCURRENCY: usize = 2;
/// Minimum pause between pin creations.
const PIN_THROTTLE: Duration = Duration::from_millis(500);
/// Minimum pause between ad-pause calls in the reverse sweep.
const PAUSE_THROTTLE: Duration = Duration::from_millis(300);

#[derive(Default)]
struct Totals {
    campaigns_processed: AtomicU32,
    pins_created: AtomicU32,
    pins_failed: AtomicU32,
    ads_paused: AtomicU32,
    ads_pause_failed: AtomicU32,
}

/// Ad-sync pipeline: creates pins and ads for new products in each
/// campaign's batches, then pauses ads of products that fell out.
pub async fn run(config: &JobConfig) -> JobResult<JobRunSummary> {
    let db = Arc::new(SupabaseService::new(config)?);
    let job_id = db
        .open_job_run(JOB_TYPE, json!({"started_at": Utc::now().to_rfc3339()}))
        .await;

    let tenants = match db.tenants_with_ad_connection().await {
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
        summary.set_metadata("message", json!("no tenants with ad-platform connection"));
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
        "campaigns_processed",
        json!(totals.campaigns_processed.load(Ordering::SeqCst)),
    );
    summary.set_metadata("pins_created", json!(totals.pins_created.load(Ordering::SeqCst)));
    summary.set_metadata("pins_failed", json!(totals.pins_failed.load(Ordering::SeqCst)));
    summary.set_metadata("ads_paused", json!(totals.ads_paused.load(Ordering::SeqCst)));
    summary.set_metadata(
        "ads_pause_failed",
        json!(totals.ads_pause_failed.load(Ordering::SeqCst)),
    );
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
    let Some(ad_account_id) = context.ad_account_id.as_deref() else {
        log::info!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "no selected ad account, skipping");
        return Ok(());
    };

    let shopify = ShopifyClient::new(&tenant.shop_domain, &tenant.access_token)?;
    if !shopify.test_connection().await {
        return Err(JobError::transient(format!(
            "cannot connect to commerce platform for {}",
            tenant.shop_domain
        )));
    }

    let pinterest = PinterestClient::new(
        config,
        &tenant.id,
        &context.auth.access_token,
        context.auth.refresh_token.as_deref(),
    )?;

    // Refresh proactively when the stored token is about to lapse.
    if context.auth.expires_soon(Utc::now()) {
        match pinterest.refresh_access_token().await {
            Ok(tokens) => {
                db.update_pinterest_tokens(
                    &tenant.id,
                    &tokens.access_token,
                    tokens.refresh_token.as_deref(),
                    Some(tokens.expires_at.as_str()),
                )
                .await?;
            }
            Err(e) => log::warn!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "token refresh failed: {}", e),
        }
    }

    // Board: configured default, else the first board on the account. A
    // tenant without boards is skipped, not failed.
    let board_id = match context.settings.default_board_id.clone() {
        Some(board_id) => board_id,
        None => {
            let boards = pinterest.boards().await?;
            match boards.first().and_then(|b| b.get("id")).and_then(|v| v.as_str()) {
                Some(board_id) => board_id.to_string(),
                None => {
                    log::info!(
                        target: JOB_TYPE,
                        tenant_id = tenant.id.as_str();
                        "no boards available, skipping tenant"
                    );
                    return Ok(());
                }
            }
        }
    };

    let campaigns = db.campaigns_with_assignments(&tenant.id).await?;
    let image_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| JobError::fatal(format!("could not build image client: {}", e)))?;

    for (campaign, assignments) in campaigns {
        if !campaign.is_active() {
            log::info!(
                target: JOB_TYPE,
                tenant_id = tenant.id.as_str(),
                campaign = campaign.name.as_str();
                "campaign not active, skipping"
            );
            continue;
        }

        let current_product_ids = sync_campaign_products(
            db,
            &shopify,
            &pinterest,
            &image_client,
            context,
            ad_account_id,
            &campaign,
            &assignments,
            &board_id,
            totals,
        )
        .await?;

        totals.campaigns_processed.fetch_add(1, Ordering::SeqCst);

        pause_removed_product_ads(
            db,
            &pinterest,
            ad_account_id,
            &tenant.id,
            &campaign,
            &current_product_ids,
            totals,
        )
        .await?;
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

/// Phase 1: create pins and ads for batch products not yet synced. Returns
/// every product id currently present in the campaign's batches.
#[allow(clippy::too_many_arguments)]
async fn sync_campaign_products(
    db: &SupabaseService,
    shopify: &ShopifyClient,
    pinterest: &PinterestClient,
    image_client: &reqwest::Client,
    context: &AdTenantContext,
    ad_account_id: &str,
    campaign: &AdPlatformCampaign,
    assignments: &[CampaignBatchAssignment],
    board_id: &str,
    totals: &Totals,
) -> JobResult<HashSet<String>> {
    let tenant_id = context.tenant.id.as_str();
    let batch_size = context.settings.global_batch_size;
    let mut current_product_ids = HashSet::new();

    let ad_group_id = pinterest
        .get_or_create_ad_group(ad_account_id, &campaign.pinterest_campaign_id, &campaign.name)
        .await
        .map_err(|e| {
            log::warn!(target: JOB_TYPE, tenant_id = tenant_id; "no ad group available: {}", e);
            e
        })
        .ok()
        .flatten();

    for assignment in assignments {
        for &batch_index in &assignment.batch_indices {
            let products = shopify
                .products_batch(&assignment.collection_id, batch_index as usize, batch_size)
                .await?;

            log::info!(
                target: JOB_TYPE,
                tenant_id = tenant_id,
                campaign = campaign.name.as_str(),
                collection_id = assignment.collection_id.as_str();
                "batch {}: {} products",
                batch_index,
                products.len()
            );

            for (index_in_batch, product) in products.iter().enumerate() {
                current_product_ids.insert(product.id.clone());

                if db
                    .is_product_synced(tenant_id, &campaign.id, &product.id)
                    .await?
                {
                    continue;
                }

                let Some(image_url) = product.primary_image_url() else {
                    totals.pins_failed.fetch_add(1, Ordering::SeqCst);
                    db.log_sync_result(
                        tenant_id,
                        &campaign.id,
                        &product.id,
                        board_id,
                        None,
                        None,
                        ad_group_id.as_deref(),
                        false,
                        Some("product has no images"),
                    )
                    .await?;
                    continue;
                };

                // Pin link: the collection page holding this product, with
                // the product URL as fallback.
                let product_index = batch_index as usize * batch_size + index_in_batch;
                let link = match shopify
                    .collection_page_url(
                        &assignment.collection_id,
                        product_index,
                        context.settings.products_per_page,
                        &context.settings.url_prefix,
                    )
                    .await?
                {
                    Some(url) => url,
                    None => shopify.product_url(&product.handle, &context.settings.url_prefix),
                };

                let media = match fetch_pin_image(image_client, &image_url).await {
                    Ok(data) => MediaSource::ImageBase64 {
                        content_type: "image/jpeg".to_string(),
                        data,
                    },
                    Err(e) => {
                        log::warn!(
                            target: JOB_TYPE,
                            tenant_id = tenant_id,
                            product_id = product.id.as_str();
                            "image processing failed, using original url: {}",
                            e
                        );
                        MediaSource::ImageUrl(image_url)
                    }
                };

                let description = truncate_text(&clean_html(&product.description), 500);
                let pin_result = pinterest
                    .create_pin(board_id, &product.title, &description, Some(link.as_str()), media)
                    .await;

                match pin_result {
                    Ok(pin_id) => {
                        let mut ad_id = None;
                        if let Some(ad_group_id) = ad_group_id.as_deref() {
                            let ad_name = format!("{} - Ad", truncate_text(&product.title, 50));
                            match pinterest
                                .create_ad(ad_account_id, ad_group_id, &pin_id, &ad_name, "REGULAR")
                                .await
                            {
                                Ok(AdCreateOutcome::Created { ad_id: id }) => ad_id = id,
                                Ok(AdCreateOutcome::Transcoding) => {
                                    log::warn!(target: JOB_TYPE, tenant_id = tenant_id; "unexpected transcoding state for image ad");
                                }
                                Err(e) => {
                                    log::warn!(
                                        target: JOB_TYPE,
                                        tenant_id = tenant_id,
                                        product_id = product.id.as_str();
                                        "pin created but ad failed: {}",
                                        e
                                    );
                                }
                            }
                        }

                        totals.pins_created.fetch_add(1, Ordering::SeqCst);
                        db.log_sync_result(
                            tenant_id,
                            &campaign.id,
                            &product.id,
                            board_id,
                            Some(pin_id.as_str()),
                            ad_id.as_deref(),
                            ad_group_id.as_deref(),
                            true,
                            None,
                        )
                        .await?;
                    }
                    Err(e) => {
                        totals.pins_failed.fetch_add(1, Ordering::SeqCst);
                        db.log_sync_result(
                            tenant_id,
                            &campaign.id,
                            &product.id,
                            board_id,
                            None,
                            None,
                            ad_group_id.as_deref(),
                            false,
                            Some(e.message.as_str()),
                        )
                        .await?;
                    }
                }

                tokio::time::sleep(PIN_THROTTLE).await;
            }
        }
    }

    Ok(current_product_ids)
}

/// Phase 2: pause ads of synced products no longer present in the batches.
async fn pause_removed_product_ads(
    db: &SupabaseService,
    pinterest: &PinterestClient,
    ad_account_id: &str,
    tenant_id: &str,
    campaign: &AdPlatformCampaign,
    current_product_ids: &HashSet<String>,
    totals: &Totals,
) -> JobResult<()> {
    let active_syncs = db.active_syncs_for_campaign(tenant_id, &campaign.id).await?;
    let removed: Vec<_> = active_syncs
        .iter()
        .filter(|sync| !current_product_ids.contains(&sync.product_id))
        .collect();

    if removed.is_empty() {
        return Ok(());
    }
    log::info!(
        target: JOB_TYPE,
        tenant_id = tenant_id,
        campaign = campaign.name.as_str();
        "{} removed products to pause",
        removed.len()
    );

    for sync in removed {
        match sync.ad_id.as_deref() {
            None => {
                // Pin without an ad: nothing to pause upstream, close the row.
                db.mark_sync_paused(tenant_id, &campaign.id, &sync.product_id)
                    .await?;
            }
            Some(ad_id) => match pinterest.pause_ad(ad_account_id, ad_id).await {
                Ok(()) => {
                    db.mark_sync_paused(tenant_id, &campaign.id, &sync.product_id)
                        .await?;
                    totals.ads_paused.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    totals.ads_pause_failed.fetch_add(1, Ordering::SeqCst);
                    log::warn!(
                        target: JOB_TYPE,
                        tenant_id = tenant_id,
                        product_id = sync.product_id.as_str();
                        "could not pause ad {}: {}",
                        ad_id,
                        e
                    );
                }
            },
        }
        tokio::time::sleep(PAUSE_THROTTLE).await;
    }

    Ok(())
}

/// Downloads and normalizes a product image into base64 pin format.
async fn fetch_pin_image(client: &reqwest::Client, image_url: &str) -> JobResult<String> {
    let response = client.get(image_url).send().await?;
    if !response.status().is_success() {
        return Err(JobError::transient(format!(
            "image download failed: {}",
            response.status()
        )));
    }
    let bytes = response.bytes().await?;
    let normalized = normalize_to_pin_jpeg(&bytes)?;
    Ok(general_purpose::STANDARD.encode(normalized))
}
