use log::{debug, info, warn};
use std::sync::Arc;

use super::paginate::PageWalker;
use super::spans;
use crate::providers::{CiProvider, Job, JobScope, Pipeline, PipelineId};
use crate::telemetry::{SpanContext, Tracer};

/// What happened to a single pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Pipeline span emitted together with `jobs` job spans
    Emitted { jobs: usize },
    /// Pipeline has no start or end time yet
    Unfinished,
    FetchFailed,
    Cancelled,
}

/// Turns one pipeline and its jobs into a trace.
#[derive(Clone)]
pub struct PipelineProcessor {
    provider: Arc<dyn CiProvider>,
    tracer: Tracer,
    per_page: u32,
}

impl PipelineProcessor {
    pub fn new(provider: Arc<dyn CiProvider>, tracer: Tracer, per_page: u32) -> Self {
        Self {
            provider,
            tracer,
            per_page,
        }
    }

    /// Emits the pipeline span and one child span per finished job.
    ///
    /// Never fails: problems are logged and reflected in the outcome.
    pub async fn process(&self, project_id: &str, pipeline_id: PipelineId) -> ProcessOutcome {
        let pipeline = match self.provider.get_pipeline(project_id, pipeline_id).await {
            Ok(pipeline) => pipeline,
            Err(e) if e.is_cancelled() => return ProcessOutcome::Cancelled,
            Err(e) => {
                warn!("Error getting project {project_id} pipeline {pipeline_id}: {e}");
                return ProcessOutcome::FetchFailed;
            }
        };

        let (Some(started_at), Some(finished_at)) = (pipeline.started_at, pipeline.finished_at)
        else {
            debug!("Skipping unfinished pipeline project={project_id} pipeline={pipeline_id}");
            return ProcessOutcome::Unfinished;
        };

        info!("processing pipeline {} finished at {finished_at}", pipeline.id);

        let mut span = self
            .tracer
            .start(spans::pipeline_span_name(&pipeline), started_at, None);
        spans::record_pipeline(&mut span, project_id, &pipeline);

        let jobs = self.emit_jobs(project_id, &pipeline, span.context()).await;

        // Ends only after every reachable job page was walked
        span.end(finished_at);

        ProcessOutcome::Emitted { jobs }
    }

    async fn emit_jobs(&self, project_id: &str, pipeline: &Pipeline, parent: &SpanContext) -> usize {
        let provider = self.provider.as_ref();
        let pipeline_id = pipeline.id;
        let mut pages = PageWalker::new(self.per_page, move |page| {
            provider.list_pipeline_jobs(project_id, pipeline_id, &JobScope::FINISHED, page)
        });

        let mut emitted = 0;
        loop {
            let jobs = match pages.next_page().await {
                Ok(Some(jobs)) => jobs,
                Ok(None) => break,
                Err(e) if e.is_cancelled() => {
                    debug!("Job listing cancelled project={project_id} pipeline={pipeline_id}");
                    break;
                }
                Err(e) => {
                    warn!(
                        "Error getting project {project_id} pipeline {pipeline_id} jobs page {} (request {}): {e}",
                        pages.current_page().unwrap_or(1),
                        pages.requests()
                    );
                    break;
                }
            };

            emitted += jobs
                .iter()
                .filter(|job| self.emit_job(job, parent))
                .count();
        }

        emitted
    }

    fn emit_job(&self, job: &Job, parent: &SpanContext) -> bool {
        let (Some(started_at), Some(finished_at)) = (job.started_at, job.finished_at) else {
            return false;
        };

        let mut span = self
            .tracer
            .start(spans::job_span_name(job), started_at, Some(parent));
        spans::record_job(&mut span, job);
        span.end(finished_at);

        true
    }
}
