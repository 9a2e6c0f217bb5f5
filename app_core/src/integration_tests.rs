//! End-to-end pipeline runs against a mocked store and ad platform.

use httptest::matchers::*;
use httptest::responders::*;
use httptest::{Expectation, Server};
use serde_json::json;

use crate::config::JobConfig;
use crate::jobs::optimize;

fn config_for(server: &Server) -> JobConfig {
    let base = server.url_str("").trim_end_matches('/').to_string();
    JobConfig {
        supabase_url: base.clone(),
        supabase_service_key: "service-key".to_string(),
        pinterest_app_id: None,
        pinterest_app_secret: None,
        openai_api_key: None,
        google_api_key: None,
        creative_bucket: "winner-creatives".to_string(),
        pinterest_api_base: format!("{}/ads", base),
        openai_api_base: base.clone(),
        genai_api_base: base,
        run_budget: std::time::Duration::from_secs(60),
        settle_delay: std::time::Duration::from_secs(0),
    }
}

/// One tenant, one ACTIVE campaign at 95, one scale-up rule (+10, cap 100):
/// the run must write 100 through to the platform in micro-currency, mirror
/// it locally, audit the action and close the job run clean.
#[tokio::test]
async fn optimizer_scales_budget_through_to_platform_and_audits() {
    let server = Server::run();

    // Job-run ledger.
    server.expect(
        Expectation::matching(request::method_path("POST", "/rest/v1/job_runs"))
            .respond_with(json_encoded(json!([{"id": "run-1"}]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("PATCH", "/rest/v1/job_runs"),
            request::query(url_decoded(contains(("id", "eq.run-1")))),
            request::body(matches("\"status\":\"completed\"")),
        ])
        .respond_with(status_code(204)),
    );

    // Tenant discovery: flag scan, tenant row, auth, ad account, settings.
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/rest/v1/optimization_settings"),
            request::query(url_decoded(contains(("select", "tenant_id")))),
            request::query(url_decoded(contains(("is_enabled", "eq.true")))),
        ])
        .respond_with(json_encoded(json!([{"tenant_id": "t1"}]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/rest/v1/tenants"),
            request::query(url_decoded(contains(("id", "in.(t1)")))),
        ])
        .respond_with(json_encoded(json!([{
            "id": "t1",
            "name": "Shop One",
            "shop_domain": "one.myshopify.com",
            "access_token": "shopify-token",
            "is_active": true
        }]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/rest/v1/pinterest_auth"),
            request::query(url_decoded(contains(("tenant_id", "eq.t1")))),
        ])
        .respond_with(json_encoded(json!([{
            "tenant_id": "t1",
            "access_token": "pin-token",
            "is_connected": true
        }]))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/rest/v1/pinterest_ad_accounts"))
            .respond_with(json_encoded(json!([{
                "tenant_id": "t1",
                "pinterest_account_id": "acct",
                "is_selected": true
            }]))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/rest/v1/pinterest_settings"))
            .respond_with(json_encoded(json!([]))),
    );

    // Tenant settings and rules.
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/rest/v1/optimization_settings"),
            request::query(url_decoded(contains(("select", "*")))),
        ])
        .respond_with(json_encoded(json!([{
            "tenant_id": "t1",
            "is_enabled": true,
            "test_mode_enabled": false
        }]))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/rest/v1/optimization_rules"))
            .respond_with(json_encoded(json!([{
                "id": "r-scale",
                "tenant_id": "t1",
                "name": "reward strong roas",
                "priority": 10,
                "action_type": "scale_up",
                "action_value": 10,
                "action_unit": "amount",
                "min_budget": 5,
                "max_budget": 100,
                "conditions": [
                    {"metric": "roas", "operator": ">=", "value": 2.0, "lookback_days": 7}
                ]
            }]))),
    );

    // Platform campaign list feeding the mirror refresh.
    server.expect(
        Expectation::matching(request::method_path("GET", "/ads/ad_accounts/acct/campaigns"))
            .respond_with(json_encoded(json!({"items": [{
                "id": "pc-1",
                "name": "Replace Campaign",
                "status": "ACTIVE",
                "daily_spend_cap": 95_000_000i64
            }]}))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", "/rest/v1/pinterest_campaigns"),
            request::query(url_decoded(contains((
                "on_conflict",
                "tenant_id,pinterest_campaign_id"
            )))),
        ])
        .respond_with(status_code(201)),
    );

    // The local mirror row, read once during the PAUSED sweep and once for
    // the evaluation list.
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/rest/v1/pinterest_campaigns"),
            request::query(url_decoded(contains(("status", "eq.ACTIVE")))),
        ])
        .times(2)
        .respond_with(json_encoded(json!([{
            "id": "c-1",
            "tenant_id": "t1",
            "pinterest_campaign_id": "pc-1",
            "name": "Replace Campaign",
            "status": "ACTIVE",
            "daily_budget": 95,
            "campaign_type": "replace_campaign"
        }]))),
    );

    // Analytics: roas 2.5 over 7 days -> the rule matches.
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/ads/ad_accounts/acct/campaigns/analytics"),
            request::query(url_decoded(contains(("campaign_ids", "pc-1")))),
            request::query(url_decoded(contains(("granularity", "TOTAL")))),
        ])
        .respond_with(json_encoded(json!([{
            "SPEND_IN_MICRO_DOLLAR": 40_000_000i64,
            "TOTAL_CONVERSIONS": 8,
            "TOTAL_CONVERSIONS_VALUE_IN_MICRO_DOLLAR": 100_000_000i64
        }]))),
    );

    // 95 + 10 clamps to the 100 cap: micro write-through, local mirror
    // update, audit row.
    server.expect(
        Expectation::matching(all_of![
            request::method_path("PATCH", "/ads/ad_accounts/acct/campaigns"),
            request::body(matches("\"daily_spend_cap\":100000000")),
        ])
        .respond_with(json_encoded(json!({"items": []}))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("PATCH", "/rest/v1/pinterest_campaigns"),
            request::query(url_decoded(contains(("id", "eq.c-1")))),
            request::body(matches("\"daily_budget\":100")),
        ])
        .respond_with(status_code(204)),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", "/rest/v1/optimization_log"),
            request::body(matches("\"action_taken\":\"scaled_up\"")),
            request::body(matches("\"rule_id\":\"r-scale\"")),
        ])
        .respond_with(json_encoded(json!([{"id": "log-1"}]))),
    );

    let summary = optimize::run(&config_for(&server)).await.unwrap();
    assert_eq!(summary.tenants_processed, 1);
    assert_eq!(summary.tenants_failed, 0);
    assert!(summary.error_log.is_empty());
    assert_eq!(summary.metadata["campaigns_evaluated"], json!(1));
    assert_eq!(summary.metadata["actions_taken"], json!(1));
}

/// A tenant whose store rows are broken is recorded in the job run and does
/// not fail the pipeline process.
#[tokio::test]
async fn optimizer_isolates_tenant_failures() {
    let server = Server::run();

    server.expect(
        Expectation::matching(request::method_path("POST", "/rest/v1/job_runs"))
            .respond_with(json_encoded(json!([{"id": "run-2"}]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("PATCH", "/rest/v1/job_runs"),
            request::body(matches("\"status\":\"completed_with_errors\"")),
            request::body(matches("\"tenants_failed\":1")),
        ])
        .respond_with(status_code(204)),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/rest/v1/optimization_settings"),
            request::query(url_decoded(contains(("select", "tenant_id")))),
        ])
        .respond_with(json_encoded(json!([{"tenant_id": "t-broken"}]))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/rest/v1/tenants"))
            .respond_with(json_encoded(json!([{
                "id": "t-broken",
                "name": "Broken",
                "shop_domain": "broken.myshopify.com",
                "access_token": "tok",
                "is_active": true
            }]))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/rest/v1/pinterest_auth"))
            .respond_with(json_encoded(json!([{
                "tenant_id": "t-broken",
                "access_token": "pin-token",
                "is_connected": true
            }]))),
    );
    // No selected ad account: optimization enabled without one is a
    // configuration error for this tenant.
    server.expect(
        Expectation::matching(request::method_path("GET", "/rest/v1/pinterest_ad_accounts"))
            .respond_with(json_encoded(json!([]))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/rest/v1/pinterest_settings"))
            .respond_with(json_encoded(json!([]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/rest/v1/optimization_settings"),
            request::query(url_decoded(contains(("select", "*")))),
        ])
        .respond_with(json_encoded(json!([{
            "tenant_id": "t-broken",
            "is_enabled": true
        }]))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/rest/v1/optimization_rules"))
            .respond_with(json_encoded(json!([{
                "id": "r1",
                "tenant_id": "t-broken",
                "action_type": "pause",
                "conditions": [{"metric": "spend", "operator": ">", "value": 0}]
            }]))),
    );

    let summary = optimize::run(&config_for(&server)).await.unwrap();
    assert_eq!(summary.tenants_processed, 0);
    assert_eq!(summary.tenants_failed, 1);
    assert_eq!(summary.error_log.len(), 1);
    assert_eq!(summary.error_log[0]["tenant"], "t-broken");
    assert_eq!(summary.error_log[0]["kind"], "validation");
}
