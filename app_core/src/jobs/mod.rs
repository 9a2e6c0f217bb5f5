pub mod ad_sync;
pub mod optimize;
pub mod replace;
pub mod sales_tracker;
pub mod winner_scaling;

use serde_json::json;

use crate::data_models::job_run::JobRunSummary;

/// Records a joined tenant-task result into the run summary. Tenant
/// failures never propagate past this point.
pub(crate) fn record_tenant_result(
    summary: &mut JobRunSummary,
    tenant_id: &str,
    result: crate::contracts::JobResult<()>,
) {
    match result {
        Ok(()) => summary.record_tenant_success(),
        Err(e) => {
            log::error!(target: "jobs", tenant_id = tenant_id; "tenant failed: {}", e);
            summary.record_tenant_failure(e.to_log_entry(Some(tenant_id)));
        }
    }
}

/// Marks an exhausted run budget in the summary.
pub(crate) fn record_budget_exceeded(summary: &mut JobRunSummary, job_type: &str) {
    log::error!(target: job_type, "run budget exceeded, aborting remaining tenants");
    summary.record_error(json!({
        "error": "run budget exceeded",
        "kind": "timeout",
    }));
}
