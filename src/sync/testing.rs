use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{CITraceError, Result};
use crate::providers::gitlab::types::{Artifact, Commit, Runner, User};
use crate::providers::{
    CiProvider, Job, JobScope, Page, PageRequest, Pipeline, PipelineFilter, PipelineId,
    PipelineSummary,
};

pub(crate) fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
}

pub(crate) fn finished_pipeline(id: PipelineId) -> Pipeline {
    Pipeline {
        id,
        iid: id,
        project_id: 42,
        status: "success".to_string(),
        source: "push".to_string(),
        ref_: "main".to_string(),
        sha: "abc123".to_string(),
        before_sha: "000000".to_string(),
        tag: false,
        web_url: format!("https://gitlab.example.com/group/project/-/pipelines/{id}"),
        user: Some(User {
            id: 1,
            username: "alice".to_string(),
            name: "Alice".to_string(),
        }),
        created_at: Some(ts(9, 59)),
        updated_at: Some(ts(10, 30)),
        started_at: Some(ts(10, 0)),
        finished_at: Some(ts(10, 30)),
        duration: Some(1800),
        queued_duration: Some(5),
    }
}

pub(crate) fn finished_job(id: u64, status: &str) -> Job {
    Job {
        id,
        name: format!("job-{id}"),
        status: status.to_string(),
        stage: "test".to_string(),
        ref_: "main".to_string(),
        tag: false,
        allow_failure: false,
        failure_reason: None,
        commit: Some(Commit {
            id: "abc123".to_string(),
            short_id: "abc".to_string(),
        }),
        started_at: Some(ts(10, 1)),
        finished_at: Some(ts(10, 5)),
        duration: Some(240.0),
        queued_duration: Some(0.5),
        tag_list: vec!["docker".to_string()],
        artifacts: vec![Artifact {
            file_type: "trace".to_string(),
            filename: "job.log".to_string(),
            size: Some(512),
        }],
        runner: Some(Runner {
            id: 3,
            description: "shared-runner".to_string(),
            name: Some("runner-3".to_string()),
            is_shared: true,
        }),
        user: None,
        web_url: format!("https://gitlab.example.com/group/project/-/jobs/{id}"),
    }
}

type ListingObserver = Box<dyn Fn(&str, PageRequest) + Send + Sync>;

/// In-memory CI provider serving canned pipelines and jobs.
#[derive(Default)]
pub(crate) struct FakeProvider {
    listings: HashMap<String, Vec<PipelineSummary>>,
    pipelines: HashMap<PipelineId, Pipeline>,
    jobs: HashMap<PipelineId, Vec<Job>>,
    failing_job_pages: HashMap<PipelineId, u32>,
    failing_listings: HashMap<String, u32>,
    listing_observer: Option<ListingObserver>,
    fetch_delay: Option<Duration>,
    list_requests: Mutex<Vec<(String, PipelineFilter, PageRequest)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn with_pipeline(mut self, project_id: &str, pipeline: Pipeline) -> Self {
        self.listings
            .entry(project_id.to_string())
            .or_default()
            .push(PipelineSummary {
                id: pipeline.id,
                status: pipeline.status.clone(),
                ref_: pipeline.ref_.clone(),
                sha: pipeline.sha.clone(),
                source: pipeline.source.clone(),
                updated_at: pipeline.updated_at,
                web_url: pipeline.web_url.clone(),
            });
        self.pipelines.insert(pipeline.id, pipeline);
        self
    }

    pub(crate) fn with_jobs(mut self, pipeline_id: PipelineId, jobs: Vec<Job>) -> Self {
        self.jobs.insert(pipeline_id, jobs);
        self
    }

    /// Makes job listing fail from `page` onwards.
    pub(crate) fn failing_job_page(mut self, pipeline_id: PipelineId, page: u32) -> Self {
        self.failing_job_pages.insert(pipeline_id, page);
        self
    }

    pub(crate) fn failing_listing(self, project_id: &str) -> Self {
        self.failing_listing_page(project_id, 1)
    }

    /// Makes pipeline listing fail from `page` onwards.
    pub(crate) fn failing_listing_page(mut self, project_id: &str, page: u32) -> Self {
        self.failing_listings.insert(project_id.to_string(), page);
        self
    }

    /// Runs `observer` on every listing request, before it is answered.
    pub(crate) fn observe_listing(
        mut self,
        observer: impl Fn(&str, PageRequest) + Send + Sync + 'static,
    ) -> Self {
        self.listing_observer = Some(Box::new(observer));
        self
    }

    pub(crate) fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub(crate) fn list_requests(&self, project_id: &str) -> Vec<(PipelineFilter, PageRequest)> {
        self.list_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(project, _, _)| project == project_id)
            .map(|(_, filter, page)| (filter.clone(), *page))
            .collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn page_of<T: Clone>(items: &[T], request: PageRequest) -> Page<T> {
    let per_page = request.per_page as usize;
    let start = (request.page.saturating_sub(1) as usize) * per_page;
    let end = (start + per_page).min(items.len());

    Page {
        items: items.get(start..end).map(<[T]>::to_vec).unwrap_or_default(),
        next_page: (end < items.len()).then_some(request.page + 1),
    }
}

#[async_trait]
impl CiProvider for FakeProvider {
    async fn list_pipelines(
        &self,
        project_id: &str,
        filter: &PipelineFilter,
        page: PageRequest,
    ) -> Result<Page<PipelineSummary>> {
        self.list_requests
            .lock()
            .unwrap()
            .push((project_id.to_string(), filter.clone(), page));

        if let Some(observer) = &self.listing_observer {
            observer(project_id, page);
        }

        if self
            .failing_listings
            .get(project_id)
            .is_some_and(|failing| page.page >= *failing)
        {
            return Err(CITraceError::ApiAfterRetries {
                status: 502,
                retries: 5,
            });
        }

        let listing = self.listings.get(project_id).cloned().unwrap_or_default();
        Ok(page_of(&listing, page))
    }

    async fn get_pipeline(&self, _project_id: &str, pipeline_id: PipelineId) -> Result<Pipeline> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.pipelines
            .get(&pipeline_id)
            .cloned()
            .ok_or_else(|| CITraceError::Api {
                status: 404,
                message: "404 Not found".to_string(),
            })
    }

    async fn list_pipeline_jobs(
        &self,
        _project_id: &str,
        pipeline_id: PipelineId,
        scope: &[JobScope],
        page: PageRequest,
    ) -> Result<Page<Job>> {
        if self
            .failing_job_pages
            .get(&pipeline_id)
            .is_some_and(|failing| page.page >= *failing)
        {
            return Err(CITraceError::Api {
                status: 500,
                message: "500 Internal Server Error".to_string(),
            });
        }

        let jobs: Vec<Job> = self
            .jobs
            .get(&pipeline_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|job| scope.iter().any(|state| state.as_str() == job.status))
            .collect();

        Ok(page_of(&jobs, page))
    }
}
