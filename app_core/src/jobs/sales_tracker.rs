use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use itertools::Itertools;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::JobConfig;
use crate::contracts::{JobError, JobResult};
use crate::data_models::job_run::{JobRunStatus, JobRunSummary};
use crate::data_models::sales::ProductSales;
use crate::data_models::tenant::{CampaignBatchAssignment, Tenant};
use crate::jobs::{record_budget_exceeded, record_tenant_result};
use crate::sales_windows::bucket_order_lines;
use crate::services::shopify::ShopifyClient;
use crate::services::supabase::SupabaseService;

const JOB_TYPE: &str = "sales_tracker";
const TENANT_CONCURRENCY: usize = 2;

/// Sales tracker pipeline: pulls order history for every product in the
/// tracked collections and rolls it into the per-product aggregates.
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
        log::info!(target: JOB_TYPE, "no tenants with campaign assignments");
        summary.set_metadata("message", json!("no tenants with assignments"));
        db.close_job_run(job_id.as_deref(), JobRunStatus::Completed, &summary)
            .await;
        return Ok(summary);
    }

    log::info!(target: JOB_TYPE, "processing {} tenants", tenants.len());

    let products_processed = Arc::new(AtomicU32::new(0));
    let products_failed = Arc::new(AtomicU32::new(0));

    let semaphore = Arc::new(Semaphore::new(TENANT_CONCURRENCY));
    let mut join_set = JoinSet::new();

    for (tenant, assignments) in tenants {
        let db = db.clone();
        let semaphore = semaphore.clone();
        let processed = products_processed.clone();
        let failed = products_failed.clone();

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let tenant_id = tenant.id.clone();
            let result = process_tenant(&db, &tenant, &assignments, &processed, &failed).await;
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
        "products_processed",
        json!(products_processed.load(Ordering::SeqCst)),
    );
    summary.set_metadata(
        "products_failed",
        json!(products_failed.load(Ordering::SeqCst)),
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
    products_processed: &AtomicU32,
    products_failed: &AtomicU32,
) -> JobResult<()> {
    log::info!(
        target: JOB_TYPE,
        tenant_id = tenant.id.as_str();
        "processing tenant {} with {} assignments",
        tenant.name,
        assignments.len()
    );

    let shopify = ShopifyClient::new(&tenant.shop_domain, &tenant.access_token)?;
    if !shopify.test_connection().await {
        return Err(JobError::transient(format!(
            "cannot connect to commerce platform for {}",
            tenant.shop_domain
        )));
    }

    let shop_tz = shopify.shop_timezone().await;
    log::info!(target: JOB_TYPE, tenant_id = tenant.id.as_str(); "shop timezone: {}", shop_tz);

    let collection_ids: Vec<&str> = assignments
        .iter()
        .map(|a| a.collection_id.as_str())
        .sorted()
        .dedup()
        .collect();

    for collection_id in collection_ids {
        if let Err(e) = process_collection(
            db,
            &shopify,
            tenant,
            collection_id,
            shop_tz,
            products_processed,
            products_failed,
        )
        .await
        {
            // Collection failures skip the collection, not the tenant.
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
    collection_id: &str,
    shop_tz: chrono_tz::Tz,
    products_processed: &AtomicU32,
    products_failed: &AtomicU32,
) -> JobResult<()> {
    let products = shopify.collection_products(collection_id).await?;
    log::info!(
        target: JOB_TYPE,
        tenant_id = tenant.id.as_str(),
        collection_id = collection_id;
        "{} active products",
        products.len()
    );
    if products.is_empty() {
        return Ok(());
    }

    let collection_handle = shopify.collection_handle(collection_id).await.ok().flatten();

    for product in &products {
        match track_product(
            db,
            shopify,
            tenant,
            collection_id,
            collection_handle.as_deref(),
            product,
            shop_tz,
        )
        .await
        {
            Ok(()) => {
                products_processed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                products_failed.fetch_add(1, Ordering::SeqCst);
                log::warn!(
                    target: JOB_TYPE,
                    tenant_id = tenant.id.as_str(),
                    product_id = product.id.as_str();
                    "product skipped: {}",
                    e
                );
            }
        }
    }

    Ok(())
}

async fn track_product(
    db: &SupabaseService,
    shopify: &ShopifyClient,
    tenant: &Tenant,
    collection_id: &str,
    collection_handle: Option<&str>,
    product: &crate::services::shopify::ShopifyProduct,
    shop_tz: chrono_tz::Tz,
) -> JobResult<()> {
    let now = Utc::now();
    let existing = db
        .product_sales(&tenant.id, collection_id, &product.id)
        .await?;

    // The anchor is set on first observation and never moves afterwards.
    let date_added = match &existing {
        Some(row) => row.date_added_to_collection,
        None => {
            log::info!(
                target: JOB_TYPE,
                tenant_id = tenant.id.as_str(),
                product_id = product.id.as_str();
                "first time tracking '{}'",
                product.title
            );
            now
        }
    };

    let lines = shopify.product_order_lines(&product.id, date_added).await?;
    let dated: Vec<(chrono::DateTime<Utc>, i64)> =
        lines.iter().map(|l| (l.occurred_at, l.quantity)).collect();
    let counters = bucket_order_lines(&dated, date_added, now, shop_tz);

    let total_quantity: i64 = lines.iter().map(|l| l.quantity).sum();
    let total_sales = lines.iter().map(|l| l.amount).sum();

    // last_update only moves forward.
    let last_update = existing
        .as_ref()
        .map(|row| row.last_update.max(now))
        .unwrap_or(now);

    let row = ProductSales {
        tenant_id: tenant.id.clone(),
        collection_id: collection_id.to_string(),
        product_id: product.id.clone(),
        product_title: product.title.clone(),
        product_handle: Some(product.handle.clone()).filter(|h| !h.is_empty()),
        collection_handle: collection_handle.map(|h| h.to_string()),
        image_url: product.primary_image_url(),
        date_added_to_collection: date_added,
        last_update,
        first_7_days: counters.first_7_days,
        last_3_days: counters.last_3_days,
        last_7_days: counters.last_7_days,
        last_10_days: counters.last_10_days,
        last_14_days: counters.last_14_days,
        total_sales,
        total_quantity,
    };

    debug_assert!(row.windows_are_monotonic());
    db.upsert_product_sales(&row).await
}
