use async_trait::async_trait;
use chrono::SecondsFormat;
use url::Url;

use super::core::GitLabClient;
use crate::error::{CITraceError, Result};
use crate::providers::gitlab::types::{Job, Pipeline, PipelineSummary};
use crate::providers::{CiProvider, JobScope, Page, PageRequest, PipelineFilter, PipelineId};

impl GitLabClient {
    fn endpoint(&self, project_id: &str, path: &str) -> Result<Url> {
        self.project_url(project_id)?
            .join(path)
            .map_err(|e| CITraceError::Config(format!("Invalid endpoint URL: {e}")))
    }

    fn pipelines_url(
        &self,
        project_id: &str,
        filter: &PipelineFilter,
        page: PageRequest,
    ) -> Result<Url> {
        let mut url = self.endpoint(project_id, "pipelines")?;
        url.query_pairs_mut()
            .append_pair("scope", "finished")
            .append_pair(
                "updated_after",
                &filter
                    .updated_after
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            // Ascending ids keep earlier pages stable while new pipelines arrive
            .append_pair("order_by", "id")
            .append_pair("sort", "asc")
            .append_pair("page", &page.page.to_string())
            .append_pair("per_page", &page.per_page.to_string());
        Ok(url)
    }

    fn jobs_url(
        &self,
        project_id: &str,
        pipeline_id: PipelineId,
        scope: &[JobScope],
        page: PageRequest,
    ) -> Result<Url> {
        let mut url = self.endpoint(project_id, &format!("pipelines/{pipeline_id}/jobs"))?;
        {
            let mut query = url.query_pairs_mut();
            for state in scope {
                query.append_pair("scope[]", state.as_str());
            }
            query
                .append_pair("page", &page.page.to_string())
                .append_pair("per_page", &page.per_page.to_string());
        }
        Ok(url)
    }
}

#[async_trait]
impl CiProvider for GitLabClient {
    async fn list_pipelines(
        &self,
        project_id: &str,
        filter: &PipelineFilter,
        page: PageRequest,
    ) -> Result<Page<PipelineSummary>> {
        let url = self.pipelines_url(project_id, filter, page)?;
        let (items, next_page) = self.get_json::<Vec<PipelineSummary>>(&url).await?;
        Ok(Page { items, next_page })
    }

    async fn get_pipeline(&self, project_id: &str, pipeline_id: PipelineId) -> Result<Pipeline> {
        let url = self.endpoint(project_id, &format!("pipelines/{pipeline_id}"))?;
        let (pipeline, _) = self.get_json::<Pipeline>(&url).await?;
        Ok(pipeline)
    }

    async fn list_pipeline_jobs(
        &self,
        project_id: &str,
        pipeline_id: PipelineId,
        scope: &[JobScope],
        page: PageRequest,
    ) -> Result<Page<Job>> {
        let url = self.jobs_url(project_id, pipeline_id, scope, page)?;
        let (items, next_page) = self.get_json::<Vec<Job>>(&url).await?;
        Ok(Page { items, next_page })
    }
}
