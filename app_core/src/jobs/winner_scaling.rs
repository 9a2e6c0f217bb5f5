use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::JobConfig;
use crate::contracts::{JobError, JobResult};
use crate::data_models::job_run::{JobRunStatus, JobRunSummary};
use crate::data_models::pinterest::PinterestSettings;
use crate::data_models::sales::ProductSales;
use crate::data_models::winner::{
    CreativeType, GeneratedCreative, LinkType, WinnerCampaign, WinnerScalingSettings,
};
use crate::jobs::{record_budget_exceeded, record_tenant_result};
use crate::services::ai_creative::AiCreativeService;
use crate::services::pinterest::{
    AdCreateOutcome, MediaSource, OriginalCampaignSettings, PinterestClient,
};
use crate::services::shopify::ShopifyClient;
use crate::services::supabase::{AdTenantContext, SupabaseService};
use crate::utils::text::truncate_text;

const JOB_TYPE: &str = "winner_scaling";
const TENANT_CONCURRENCY: usize = 5;
/// Grace period after creating a video pin before the first promotion try.
const TRANSCODE_INITIAL_WAIT: Duration = Duration::from_secs(15);
const TRANSCODE_RETRY_DELAY: Duration = Duration::from_secs(10);
const TRANSCODE_MAX_ATTEMPTS: u32 = 5;

#[derive(Default)]
struct Totals {
    winners_identified: AtomicU32,
    campaigns_created: AtomicU32,
    creatives_generated: AtomicU32,
    api_limits_hit: AtomicU32,
}

struct TenantRun<'a> {
    db: &'a SupabaseService,
    pinterest: &'a PinterestClient,
    shopify: &'a ShopifyClient,
    ai: &'a AiCreativeService,
    http: &'a reqwest::Client,
    settings: &'a WinnerScalingSettings,
    pin_settings: &'a PinterestSettings,
    tenant_id: &'a str,
    ad_account_id: &'a str,
    board_id: Option<String>,
    bucket: &'a str,
    totals: &'a Totals,
}

/// Everything needed to build destination URLs and creatives for one winner.
struct WinnerRef {
    winner_id: String,
    product_title: String,
    product_handle: Option<String>,
    collection_handle: Option<String>,
    image_url: Option<String>,
    position_in_collection: usize,
}

/// Winner-scaling pipeline: identifies winner products from the sales
/// aggregates, generates AI creatives and spawns campaigns cloning the
/// original campaign's targeting.
pub async fn run(config: &JobConfig) -> JobResult<JobRunSummary> {
    let db = Arc::new(SupabaseService::new(config)?);
    let job_id = db
        .open_job_run(JOB_TYPE, json!({"started_at": Utc::now().to_rfc3339()}))
        .await;
    db.log_winner_action(None, None, "job_started", json!({"job_id": job_id}))
        .await;

    let tenants = match db.tenants_with_flag_enabled("winner_scaling_settings").await {
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
        summary.set_metadata("message", json!("no tenants with winner scaling enabled"));
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
        "winners_identified",
        json!(totals.winners_identified.load(Ordering::SeqCst)),
    );
    summary.set_metadata(
        "campaigns_created",
        json!(totals.campaigns_created.load(Ordering::SeqCst)),
    );
    summary.set_metadata(
        "creatives_generated",
        json!(totals.creatives_generated.load(Ordering::SeqCst)),
    );
    summary.set_metadata("api_limits_hit", json!(totals.api_limits_hit.load(Ordering::SeqCst)));
    summary.set_metadata("completed_at", json!(Utc::now().to_rfc3339()));

    db.log_winner_action(
        None,
        None,
        "job_completed",
        json!({
            "winners_identified": totals.winners_identified.load(Ordering::SeqCst),
            "campaigns_created": totals.campaigns_created.load(Ordering::SeqCst),
            "creatives_generated": totals.creatives_generated.load(Ordering::SeqCst),
        }),
    )
    .await;

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
    let Some(settings) = db.winner_scaling_settings(&tenant.id).await? else {
        return Ok(());
    };
    if !settings.enabled {
        return Ok(());
    }

    let Some(ad_account_id) = context.ad_account_id.as_deref() else {
        return Err(JobError::validation(format!(
            "tenant {} has winner scaling enabled but no selected ad account",
            tenant.id
        )));
    };

    let products = db.sales_with_recent_activity(&tenant.id).await?;
    if products.is_empty() {
        log::info!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "no products with recent sales");
        return Ok(());
    }
    log::info!(
        target: JOB_TYPE,
        tenant_id = tenant.id.as_str();
        "{} products with recent sales",
        products.len()
    );

    let existing = db.existing_winners(&tenant.id).await?;

    let pinterest = PinterestClient::new(
        config,
        &tenant.id,
        &context.auth.access_token,
        context.auth.refresh_token.as_deref(),
    )?;
    let shopify = ShopifyClient::new(&tenant.shop_domain, &tenant.access_token)?;
    let ai = AiCreativeService::new(config)?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| JobError::fatal(format!("could not build download client: {}", e)))?;

    let board_id = match context.settings.default_board_id.clone() {
        Some(board_id) => Some(board_id),
        None => {
            let boards = pinterest.boards().await.unwrap_or_default();
            boards
                .first()
                .and_then(|b| b.get("id"))
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
        }
    };

    let run = TenantRun {
        db,
        pinterest: &pinterest,
        shopify: &shopify,
        ai: &ai,
        http: &http,
        settings: &settings,
        pin_settings: &context.settings,
        tenant_id: &tenant.id,
        ad_account_id,
        board_id,
        bucket: &config.creative_bucket,
        totals,
    };

    for product in &products {
        if let Err(e) = process_product(&run, product, &existing).await {
            log::warn!(
                target: JOB_TYPE,
                tenant_id = tenant.id.as_str(),
                product_id = product.product_id.as_str();
                "winner processing failed: {}",
                e
            );
            run.db
                .log_winner_action(
                    Some(tenant.id.as_str()),
                    None,
                    "error",
                    json!({"error_message": e.message, "product_id": product.product_id}),
                )
                .await;
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

async fn process_product(
    run: &TenantRun<'_>,
    product: &ProductSales,
    existing: &std::collections::HashMap<(String, String), crate::data_models::winner::WinnerProduct>,
) -> JobResult<()> {
    let settings = run.settings;
    let buckets_passed = settings.buckets_passed(
        product.last_3_days,
        product.last_7_days,
        product.last_10_days,
        product.last_14_days,
    );
    if !settings.is_winner(
        product.last_3_days,
        product.last_7_days,
        product.last_10_days,
        product.last_14_days,
    ) {
        return Ok(());
    }

    let key = (product.product_id.clone(), product.collection_id.clone());
    let winner_id = match existing.get(&key) {
        Some(winner) => {
            run.db
                .update_winner_sales(&winner.id, product, buckets_passed)
                .await?;
            if !winner.is_active {
                // Deactivated winners keep their refreshed snapshot but are
                // never re-activated.
                return Ok(());
            }
            log::info!(
                target: JOB_TYPE,
                tenant_id = run.tenant_id;
                "existing winner: {}",
                product.product_title
            );
            winner.id.clone()
        }
        None => {
            let original_campaign_id = original_platform_campaign_id(run, &product.product_id)
                .await?
                .map(|(pinterest_campaign_id, _)| pinterest_campaign_id);

            let winner_id = run
                .db
                .insert_winner(
                    run.tenant_id,
                    product,
                    original_campaign_id.as_deref(),
                    buckets_passed,
                )
                .await?;
            run.totals.winners_identified.fetch_add(1, Ordering::SeqCst);
            log::info!(
                target: JOB_TYPE,
                tenant_id = run.tenant_id;
                "new winner: {} ({}/4 buckets)",
                product.product_title,
                buckets_passed
            );
            run.db
                .log_winner_action(
                    Some(run.tenant_id),
                    Some(winner_id.as_str()),
                    "winner_identified",
                    json!({
                        "product_title": product.product_title,
                        "buckets_passed": buckets_passed,
                        "sales_3d": product.last_3_days,
                        "sales_7d": product.last_7_days,
                        "sales_10d": product.last_10_days,
                        "sales_14d": product.last_14_days,
                    }),
                )
                .await;
            winner_id
        }
    };

    // Reconcile with the platform before counting: a manually paused
    // campaign must count as inactive.
    let mut campaigns = run.db.winner_campaigns(&winner_id).await?;
    for campaign in campaigns.iter_mut() {
        if campaign.status != "ACTIVE" || campaign.pinterest_campaign_id.is_empty() {
            continue;
        }
        let platform_status = run
            .pinterest
            .campaign_status(run.ad_account_id, &campaign.pinterest_campaign_id)
            .await
            .unwrap_or(None);
        if let Some(status) = platform_status.filter(|s| s != "ACTIVE") {
            if let Some(id) = &campaign.id {
                run.db.update_winner_campaign_status(id, &status).await?;
            }
            campaign.status = status;
        }
    }

    let active_video = campaigns
        .iter()
        .filter(|c| c.status == "ACTIVE" && c.creative_type == CreativeType::Video)
        .count() as u32;
    let active_image = campaigns
        .iter()
        .filter(|c| c.status == "ACTIVE" && c.creative_type == CreativeType::Image)
        .count() as u32;

    let max_video = if settings.video_enabled {
        settings.max_campaigns_per_winner_video
    } else {
        0
    };
    let max_image = if settings.image_enabled {
        settings.max_campaigns_per_winner_image
    } else {
        0
    };
    let need_video = max_video.saturating_sub(active_video);
    let need_image = max_image.saturating_sub(active_image);

    if need_video == 0 && need_image == 0 {
        log::info!(
            target: JOB_TYPE,
            tenant_id = run.tenant_id;
            "at max campaigns (video {}/{}, image {}/{})",
            active_video,
            max_video,
            active_image,
            max_image
        );
        return Ok(());
    }

    // Campaign creation needs an original campaign to clone settings from.
    let Some((original_campaign_id, original_ad_group_id)) =
        original_platform_campaign_id(run, &product.product_id).await?
    else {
        run.db
            .log_winner_action(
                Some(run.tenant_id),
                Some(winner_id.as_str()),
                "error",
                json!({"error_message": "no original campaign found for product"}),
            )
            .await;
        return Ok(());
    };

    let original_settings = run
        .pinterest
        .original_campaign_settings(
            run.ad_account_id,
            &original_campaign_id,
            original_ad_group_id.as_deref(),
        )
        .await?;

    let winner_ref = resolve_winner_ref(run, &winner_id, product).await;

    if settings.video_enabled && settings.video_count > 0 && need_video > 0 {
        let result = run
            .ai
            .generate_videos(
                run.db,
                run.bucket,
                &winner_ref.product_title,
                winner_ref.image_url.as_deref(),
                settings.video_count,
                settings.video_prompt.as_deref(),
            )
            .await;
        if result.api_limit_reached {
            run.totals.api_limits_hit.fetch_add(1, Ordering::SeqCst);
            run.db
                .log_winner_action(
                    Some(run.tenant_id),
                    Some(winner_id.as_str()),
                    "api_limit_reached",
                    json!({"api": "video", "error": result.error_message}),
                )
                .await;
        }
        if !result.creatives.is_empty() {
            run.totals
                .creatives_generated
                .fetch_add(result.creatives.len() as u32, Ordering::SeqCst);
            create_campaigns_with_creatives(
                run,
                &winner_ref,
                result.creatives,
                CreativeType::Video,
                need_video,
                &original_settings,
            )
            .await?;
        }
    }

    if settings.image_enabled && settings.image_count > 0 && need_image > 0 {
        let result = run
            .ai
            .generate_images(
                run.db,
                run.bucket,
                &winner_ref.product_title,
                winner_ref.image_url.as_deref(),
                settings.image_count,
                settings.image_prompt.as_deref(),
            )
            .await;
        if result.api_limit_reached {
            run.totals.api_limits_hit.fetch_add(1, Ordering::SeqCst);
            run.db
                .log_winner_action(
                    Some(run.tenant_id),
                    Some(winner_id.as_str()),
                    "api_limit_reached",
                    json!({"api": "image", "error": result.error_message}),
                )
                .await;
        }
        if !result.creatives.is_empty() {
            run.totals
                .creatives_generated
                .fetch_add(result.creatives.len() as u32, Ordering::SeqCst);
            create_campaigns_with_creatives(
                run,
                &winner_ref,
                result.creatives,
                CreativeType::Image,
                need_image,
                &original_settings,
            )
            .await?;
        }
    }

    Ok(())
}

/// The platform campaign (and ad group) behind the most recent successful
/// pin sync of this product.
async fn original_platform_campaign_id(
    run: &TenantRun<'_>,
    product_id: &str,
) -> JobResult<Option<(String, Option<String>)>> {
    let Some(sync) = run.db.latest_sync_for_product(run.tenant_id, product_id).await? else {
        return Ok(None);
    };
    let Some(campaign) = run.db.campaign_by_id(&sync.campaign_id).await? else {
        return Ok(None);
    };
    Ok(Some((campaign.pinterest_campaign_id, sync.ad_group_id)))
}

/// Fills handles, image and position from the commerce platform, falling
/// back to whatever the sales row already carries.
async fn resolve_winner_ref(run: &TenantRun<'_>, winner_id: &str, product: &ProductSales) -> WinnerRef {
    let mut winner_ref = WinnerRef {
        winner_id: winner_id.to_string(),
        product_title: product.product_title.clone(),
        product_handle: product.product_handle.clone(),
        collection_handle: product.collection_handle.clone(),
        image_url: product.image_url.clone(),
        position_in_collection: 0,
    };

    if let Ok(products) = run.shopify.collection_products(&product.collection_id).await {
        if let Some(position) = products.iter().position(|p| p.id == product.product_id) {
            winner_ref.position_in_collection = position;
            let listed = &products[position];
            if !listed.handle.is_empty() {
                winner_ref.product_handle = Some(listed.handle.clone());
            }
            if let Some(image_url) = listed.primary_image_url() {
                winner_ref.image_url = Some(image_url);
            }
        }
    }
    if let Ok(Some(handle)) = run.shopify.collection_handle(&product.collection_id).await {
        winner_ref.collection_handle = Some(handle);
    }

    winner_ref
}

/// Spawns one campaign per enabled link type (A/B test when both are on),
/// bounded by the refill need for this creative modality.
async fn create_campaigns_with_creatives(
    run: &TenantRun<'_>,
    winner_ref: &WinnerRef,
    mut creatives: Vec<GeneratedCreative>,
    creative_type: CreativeType,
    max_campaigns: u32,
    original_settings: &OriginalCampaignSettings,
) -> JobResult<()> {
    let settings = run.settings;
    let mut created = 0u32;

    for link_type in settings.link_types() {
        if created >= max_campaigns {
            break;
        }

        let destination = match link_type {
            LinkType::Product => match &winner_ref.product_handle {
                Some(handle) => run.shopify.product_url(handle, &run.pin_settings.url_prefix),
                None => {
                    log::warn!(target: JOB_TYPE, tenant_id = run.tenant_id; "no product handle for product link");
                    continue;
                }
            },
            LinkType::Collection => match &winner_ref.collection_handle {
                Some(handle) => {
                    let page = winner_ref.position_in_collection
                        / run.pin_settings.products_per_page.max(1)
                        + 1;
                    run.shopify.collection_url(handle, page, &run.pin_settings.url_prefix)
                }
                None => {
                    log::warn!(target: JOB_TYPE, tenant_id = run.tenant_id; "no collection handle for collection link");
                    continue;
                }
            },
        };

        let creative_label = match creative_type {
            CreativeType::Video => format!("{}x Videos", creatives.len()),
            CreativeType::Image => format!("{}x Images", creatives.len()),
        };
        let link_label = match link_type {
            LinkType::Product => "Link to Product",
            LinkType::Collection => "Link to Collection",
        };
        let campaign_name = format!(
            "{} | {} | {}",
            truncate_text(&winner_ref.product_title, 50),
            creative_label,
            link_label
        );

        let campaign_id = run
            .pinterest
            .create_campaign_from_template(
                run.ad_account_id,
                &campaign_name,
                settings.daily_budget_per_campaign,
                original_settings,
            )
            .await?;
        let ad_group_id = run
            .pinterest
            .create_ad_group_from_template(
                run.ad_account_id,
                &campaign_id,
                &format!("{} - Ad Group", campaign_name),
                original_settings,
            )
            .await?;

        let mut pin_count = 0usize;
        for (index, creative) in creatives.iter_mut().enumerate() {
            match create_promoted_pin(run, &ad_group_id, creative, winner_ref, &destination, index)
                .await
            {
                Ok(pin_id) => {
                    creative.pin_id = Some(pin_id);
                    pin_count += 1;
                }
                Err(e) => {
                    log::warn!(
                        target: JOB_TYPE,
                        tenant_id = run.tenant_id;
                        "pin {} failed: {}",
                        index + 1,
                        e
                    );
                }
            }
        }

        if pin_count == 0 {
            run.db
                .log_winner_action(
                    Some(run.tenant_id),
                    Some(winner_ref.winner_id.as_str()),
                    "error",
                    json!({
                        "error_message": "no pins were created",
                        "pinterest_campaign_id": campaign_id,
                    }),
                )
                .await;
            continue;
        }

        let campaign = WinnerCampaign {
            id: None,
            tenant_id: run.tenant_id.to_string(),
            winner_product_id: winner_ref.winner_id.clone(),
            pinterest_campaign_id: campaign_id.clone(),
            pinterest_ad_group_id: Some(ad_group_id.clone()),
            campaign_name: campaign_name.clone(),
            creative_type,
            creative_count: creatives.len() as u32,
            link_type,
            status: "ACTIVE".to_string(),
            generated_assets: creatives.clone(),
        };
        run.db.insert_winner_campaign(&campaign).await?;

        created += 1;
        run.totals.campaigns_created.fetch_add(1, Ordering::SeqCst);
        run.db
            .log_winner_action(
                Some(run.tenant_id),
                Some(winner_ref.winner_id.as_str()),
                "campaign_created",
                json!({
                    "campaign_name": campaign_name,
                    "creative_type": creative_type,
                    "link_type": link_type,
                    "pinterest_campaign_id": campaign_id,
                    "pins_created": pin_count,
                }),
            )
            .await;
        log::info!(
            target: JOB_TYPE,
            tenant_id = run.tenant_id;
            "campaign created: {}",
            campaign_name
        );
    }

    Ok(())
}

/// Creates one organic pin for a creative and promotes it into an ad.
/// Video pins go through the media API and may need transcoding retries on
/// the promotion call.
async fn create_promoted_pin(
    run: &TenantRun<'_>,
    ad_group_id: &str,
    creative: &GeneratedCreative,
    winner_ref: &WinnerRef,
    destination: &str,
    index: usize,
) -> JobResult<String> {
    let Some(board_id) = run.board_id.as_deref() else {
        return Err(JobError::validation("no board available, cannot create pin"));
    };

    let description = format!("{} - discover now", winner_ref.product_title);

    let (media, ad_creative_type) = match creative.creative_type {
        CreativeType::Video => {
            let response = run.http.get(&creative.url).send().await?;
            if !response.status().is_success() {
                return Err(JobError::transient(format!(
                    "creative download failed: {}",
                    response.status()
                )));
            }
            let bytes = response.bytes().await?.to_vec();
            let media_id = run.pinterest.upload_video(bytes).await?;
            (
                MediaSource::VideoId {
                    media_id,
                    cover_image_url: winner_ref.image_url.clone(),
                },
                "VIDEO",
            )
        }
        CreativeType::Image => (MediaSource::ImageUrl(creative.url.clone()), "REGULAR"),
    };

    let pin_id = run
        .pinterest
        .create_pin(
            board_id,
            &winner_ref.product_title,
            &description,
            Some(destination),
            media,
        )
        .await?;

    if creative.creative_type == CreativeType::Video {
        tokio::time::sleep(TRANSCODE_INITIAL_WAIT).await;
    }

    let ad_name = format!("{} - Ad {}", truncate_text(&winner_ref.product_title, 50), index + 1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match run
            .pinterest
            .create_ad(run.ad_account_id, ad_group_id, &pin_id, &ad_name, ad_creative_type)
            .await?
        {
            AdCreateOutcome::Created { .. } => return Ok(pin_id),
            AdCreateOutcome::Transcoding if attempt < TRANSCODE_MAX_ATTEMPTS => {
                log::info!(
                    target: JOB_TYPE,
                    tenant_id = run.tenant_id;
                    "video still transcoding, retry {}/{}",
                    attempt + 1,
                    TRANSCODE_MAX_ATTEMPTS
                );
                tokio::time::sleep(TRANSCODE_RETRY_DELAY).await;
            }
            AdCreateOutcome::Transcoding => {
                return Err(JobError::transient(
                    "ad creation failed: video transcoding did not finish",
                ));
            }
        }
    }
}
