use crate::contracts::JobError;

/// # NDOC
/// component: `app_core::invariants`
/// purpose: Shared invariant checks used by models and pipelines.
/// invariants:
///   - Validation helpers must return `JobError::validation` for caller-safe failures.
///   - Helpers must not perform I/O or mutate external state.
pub fn ensure_non_empty_trimmed(value: &str, field: &str) -> Result<(), JobError> {
    if value.trim().is_empty() {
        return Err(JobError::validation(format!("'{}' cannot be empty", field)));
    }
    Ok(())
}

/// # NDOC
/// component: `app_core::invariants`
/// purpose: Enforce an inclusive numeric bound with a caller-safe error.
/// invariants:
///   - `name` is used directly in error messages and should be stable.
pub fn ensure_range_u32(value: u32, min: u32, max: u32, name: &str) -> Result<(), JobError> {
    if value < min || value > max {
        return Err(JobError::validation(format!(
            "'{}' must be in range {}..={}",
            name, min, max
        )));
    }
    Ok(())
}

/// # NDOC
/// component: `app_core::invariants`
/// purpose: Extract a required string field from a store row.
pub fn require_str<'a>(
    row: &'a serde_json::Value,
    field: &str,
    table: &str,
) -> Result<&'a str, JobError> {
    row.get(field)
        .and_then(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            JobError::validation(format!("{} row is missing required field '{}'", table, field))
        })
}
