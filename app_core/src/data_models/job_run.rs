use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job-run completion states as persisted in `job_runs.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "completed",
            JobRunStatus::CompletedWithErrors => "completed_with_errors",
            JobRunStatus::Failed => "failed",
        }
    }
}

/// Counters accumulated while a pipeline runs, flushed into the job-run row
/// on close. Each pipeline stores its extra totals under `metadata`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct JobRunSummary {
    pub tenants_processed: u32,
    pub tenants_failed: u32,
    pub error_log: Vec<Value>,
    pub metadata: serde_json::Map<String, Value>,
}

impl JobRunSummary {
    pub fn record_tenant_success(&mut self) {
        self.tenants_processed += 1;
    }

    pub fn record_tenant_failure(&mut self, entry: Value) {
        self.tenants_failed += 1;
        self.error_log.push(entry);
    }

    pub fn record_error(&mut self, entry: Value) {
        self.error_log.push(entry);
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn final_status(&self) -> JobRunStatus {
        if self.tenants_failed == 0 && self.error_log.is_empty() {
            JobRunStatus::Completed
        } else {
            JobRunStatus::CompletedWithErrors
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization_matches_store_values() {
        assert_eq!(
            serde_json::to_value(JobRunStatus::CompletedWithErrors).unwrap(),
            "completed_with_errors"
        );
        assert_eq!(JobRunStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_summary_rolls_up_final_status() {
        let mut summary = JobRunSummary::default();
        summary.record_tenant_success();
        assert_eq!(summary.final_status(), JobRunStatus::Completed);

        summary.record_tenant_failure(serde_json::json!({"tenant": "t1", "error": "boom"}));
        assert_eq!(summary.final_status(), JobRunStatus::CompletedWithErrors);
        assert_eq!(summary.tenants_processed, 1);
        assert_eq!(summary.tenants_failed, 1);
        assert_eq!(summary.error_log.len(), 1);
    }
}
