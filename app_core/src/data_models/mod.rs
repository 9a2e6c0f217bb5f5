pub mod job_run;
pub mod money;
pub mod optimization;
pub mod pinterest;
pub mod sales;
pub mod tenant;
pub mod winner;
