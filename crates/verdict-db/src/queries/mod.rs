//! Query functions, one module per table group.

pub mod job_events;
pub mod jobs;
pub mod texts;
