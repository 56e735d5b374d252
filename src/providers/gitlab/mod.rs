pub mod client;
pub mod types;

pub use client::{GitLabClient, RetryPolicy};
pub use types::{Job, Pipeline, PipelineSummary};
