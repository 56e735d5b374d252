pub mod gitlab;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use gitlab::{GitLabClient, Job, Pipeline, PipelineSummary};

pub type PipelineId = u64;

/// Page number and size for a list endpoint. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

/// One page of a listing.
///
/// `next_page` is `None` when the provider reports no further page; this is
/// the "no more pages" signal and is never an error.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page: Option<u32>,
}

/// Filter for listing a project's pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFilter {
    /// Only pipelines updated after this instant
    pub updated_after: DateTime<Utc>,
}

/// Job states requested when listing a pipeline's jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobScope {
    Failed,
    Success,
    Canceled,
    Skipped,
    Manual,
}

impl JobScope {
    /// States of jobs that will not change anymore.
    pub const FINISHED: [JobScope; 5] = [
        JobScope::Failed,
        JobScope::Success,
        JobScope::Canceled,
        JobScope::Skipped,
        JobScope::Manual,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobScope::Failed => "failed",
            JobScope::Success => "success",
            JobScope::Canceled => "canceled",
            JobScope::Skipped => "skipped",
            JobScope::Manual => "manual",
        }
    }
}

/// Read access to a CI provider's pipeline and job history.
///
/// Implementations are responsible for pacing their own outbound calls.
#[async_trait]
pub trait CiProvider: Send + Sync {
    /// Lists finished pipelines of a project, one page at a time.
    async fn list_pipelines(
        &self,
        project_id: &str,
        filter: &PipelineFilter,
        page: PageRequest,
    ) -> Result<Page<PipelineSummary>>;

    /// Fetches the full record of a single pipeline.
    async fn get_pipeline(&self, project_id: &str, pipeline_id: PipelineId) -> Result<Pipeline>;

    /// Lists the jobs of a pipeline restricted to `scope`, one page at a time.
    async fn list_pipeline_jobs(
        &self,
        project_id: &str,
        pipeline_id: PipelineId,
        scope: &[JobScope],
        page: PageRequest,
    ) -> Result<Page<Job>>;
}
